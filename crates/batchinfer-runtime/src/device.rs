use std::fmt;

use batchinfer_core::config::MILLI_GPU;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda { device_id: u32 },
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Cuda { .. })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

/// Counts the GPUs listed in a `CUDA_VISIBLE_DEVICES` value.
///
/// An empty value or a leading negative id hides every device.
pub fn parse_visible_devices(raw: &str) -> u32 {
    let mut n = 0u32;
    for id in raw.split(',').map(str::trim) {
        if id.is_empty() {
            continue;
        }
        if id.starts_with('-') {
            break;
        }
        n = n.saturating_add(1);
    }
    n
}

/// GPUs available to this run: the configured override, else `CUDA_VISIBLE_DEVICES`, else 0.
pub fn detect_gpus(configured: Option<u32>) -> u32 {
    if let Some(n) = configured {
        return n;
    }
    match std::env::var("CUDA_VISIBLE_DEVICES") {
        Ok(v) => parse_visible_devices(&v),
        Err(_) => 0,
    }
}

/// Devices granted to one worker and the milli-GPU units taken on each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    units: Vec<(u32, u32)>,
}

impl Grant {
    pub fn cpu() -> Self {
        Self { units: Vec::new() }
    }

    /// Device the worker's model is bound to (the first granted GPU).
    pub fn device(&self) -> Device {
        match self.units.first() {
            Some(&(device_id, _)) => Device::Cuda { device_id },
            None => Device::Cpu,
        }
    }

    pub fn device_ids(&self) -> Vec<u32> {
        self.units.iter().map(|&(id, _)| id).collect()
    }
}

/// Tracks free milli-GPU units per device and hands out per-worker grants.
///
/// Fractional shares are packed first-fit so several workers share one GPU; whole-GPU shares
/// take entirely free devices.
#[derive(Debug, Clone)]
pub struct GpuAllocator {
    free: Vec<u32>,
    share: u32,
}

impl GpuAllocator {
    /// `share` is the per-worker grant in milli-GPU units; 0 means CPU workers.
    pub fn new(num_gpus: u32, share: u32) -> Self {
        Self {
            free: vec![MILLI_GPU; num_gpus as usize],
            share,
        }
    }

    pub fn uses_gpu(&self) -> bool {
        self.share > 0
    }

    /// Workers that fit on an empty allocator, or `None` for CPU workers.
    pub fn capacity(&self) -> Option<usize> {
        if self.share == 0 {
            return None;
        }
        let gpus = self.free.len();
        if self.share <= MILLI_GPU {
            Some(gpus * (MILLI_GPU / self.share) as usize)
        } else {
            Some(gpus / self.share.div_ceil(MILLI_GPU) as usize)
        }
    }

    pub fn acquire(&mut self) -> Option<Grant> {
        if self.share == 0 {
            return Some(Grant::cpu());
        }
        if self.share <= MILLI_GPU {
            let idx = self.free.iter().position(|&f| f >= self.share)?;
            self.free[idx] -= self.share;
            return Some(Grant {
                units: vec![(idx as u32, self.share)],
            });
        }
        let whole = self.share.div_ceil(MILLI_GPU) as usize;
        let ids: Vec<usize> = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, &f)| f == MILLI_GPU)
            .map(|(i, _)| i)
            .take(whole)
            .collect();
        if ids.len() < whole {
            return None;
        }
        let mut units = Vec::with_capacity(whole);
        for i in ids {
            self.free[i] = 0;
            units.push((i as u32, MILLI_GPU));
        }
        Some(Grant { units })
    }

    pub fn release(&mut self, grant: &Grant) {
        for &(id, units) in &grant.units {
            if let Some(f) = self.free.get_mut(id as usize) {
                *f = (*f + units).min(MILLI_GPU);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_devices() {
        assert_eq!(parse_visible_devices("0,1,2"), 3);
        assert_eq!(parse_visible_devices(""), 0);
        assert_eq!(parse_visible_devices("1,-1,2"), 1);
        assert_eq!(parse_visible_devices("GPU-abc, GPU-def"), 2);
        assert_eq!(detect_gpus(Some(4)), 4);
    }

    #[test]
    fn fractional_shares_pack_first_fit() {
        // 0.4 GPU per worker on two GPUs: two workers per device.
        let mut alloc = GpuAllocator::new(2, 400);
        assert_eq!(alloc.capacity(), Some(4));
        let grants: Vec<Grant> = std::iter::from_fn(|| alloc.acquire()).take(10).collect();
        let devices: Vec<Device> = grants.iter().map(Grant::device).collect();
        assert_eq!(
            devices,
            vec![
                Device::Cuda { device_id: 0 },
                Device::Cuda { device_id: 0 },
                Device::Cuda { device_id: 1 },
                Device::Cuda { device_id: 1 },
            ]
        );
        alloc.release(&grants[1]);
        assert_eq!(
            alloc.acquire().map(|g| g.device()),
            Some(Device::Cuda { device_id: 0 })
        );
    }

    #[test]
    fn whole_gpu_shares_take_free_devices() {
        let mut alloc = GpuAllocator::new(3, 2000);
        assert_eq!(alloc.capacity(), Some(1));
        let g = alloc.acquire().unwrap();
        assert_eq!(g.device_ids(), vec![0, 1]);
        assert!(alloc.acquire().is_none());

        let mut mixed = GpuAllocator::new(2, 1000);
        let a = mixed.acquire().unwrap();
        let b = mixed.acquire().unwrap();
        assert_eq!(a.device(), Device::Cuda { device_id: 0 });
        assert_eq!(b.device(), Device::Cuda { device_id: 1 });
        assert!(mixed.acquire().is_none());
    }

    #[test]
    fn cpu_share_is_unlimited() {
        let mut alloc = GpuAllocator::new(0, 0);
        assert!(!alloc.uses_gpu());
        assert_eq!(alloc.capacity(), None);
        assert_eq!(alloc.acquire().map(|g| g.device()), Some(Device::Cpu));
    }
}
