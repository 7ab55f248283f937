//! Toy labeled image trees for demos and smoke tests.
//!
//! Each class is a solid colour with a little per-pixel noise, so a linear probe over the
//! channel means separates them perfectly.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use batchinfer_core::config::Normalization;
use image::{ImageFormat, Rgb, RgbImage};

use crate::linear::LinearProbeWeights;

pub const PALETTE: &[(&str, [u8; 3])] = &[
    ("red", [220, 30, 30]),
    ("green", [30, 200, 40]),
    ("blue", [30, 40, 220]),
    ("yellow", [230, 220, 40]),
    ("magenta", [210, 40, 200]),
    ("cyan", [40, 210, 220]),
    ("orange", [240, 140, 20]),
    ("gray", [128, 128, 128]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedSpec {
    pub classes: usize,
    pub images_per_class: usize,
    pub width: u32,
    pub height: u32,
    /// Max absolute per-channel noise.
    pub noise: u8,
    pub seed: u64,
}

impl Default for SeedSpec {
    fn default() -> Self {
        Self {
            classes: 2,
            images_per_class: 5,
            width: 64,
            height: 48,
            noise: 12,
            seed: 0x5eed,
        }
    }
}

impl SeedSpec {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (1..=PALETTE.len()).contains(&self.classes),
            "classes must be in 1..={}",
            PALETTE.len()
        );
        anyhow::ensure!(self.images_per_class > 0, "images_per_class must be > 0");
        anyhow::ensure!(self.width > 0 && self.height > 0, "image size must be > 0");
        Ok(())
    }

    pub fn class_names(&self) -> Vec<String> {
        PALETTE[..self.classes]
            .iter()
            .map(|(name, _)| (*name).to_string())
            .collect()
    }
}

/// xorshift64*; deterministic per seed.
struct Noise(u64);

impl Noise {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn jitter(&mut self, base: u8, amp: u8) -> u8 {
        if amp == 0 {
            return base;
        }
        let span = u64::from(amp) * 2 + 1;
        let delta = (self.next() % span) as i16 - i16::from(amp);
        (i16::from(base) + delta).clamp(0, 255) as u8
    }
}

fn synth_image(color: [u8; 3], spec: &SeedSpec, noise: &mut Noise) -> RgbImage {
    RgbImage::from_fn(spec.width, spec.height, |_, _| {
        Rgb([
            noise.jitter(color[0], spec.noise),
            noise.jitter(color[1], spec.noise),
            noise.jitter(color[2], spec.noise),
        ])
    })
}

/// Encoded PNGs keyed by relative path `<class>/<nnnnn>.png`.
pub fn seed_files(spec: &SeedSpec) -> Result<Vec<(String, Vec<u8>)>> {
    spec.validate()?;
    let mut noise = Noise::new(spec.seed);
    let mut out = Vec::with_capacity(spec.classes * spec.images_per_class);
    for &(name, color) in &PALETTE[..spec.classes] {
        for i in 0..spec.images_per_class {
            let img = synth_image(color, spec, &mut noise);
            let mut buf = Cursor::new(Vec::new());
            img.write_to(&mut buf, ImageFormat::Png)
                .with_context(|| format!("png encode failed: {name}/{i}"))?;
            out.push((format!("{name}/{i:05}.png"), buf.into_inner()));
        }
    }
    Ok(out)
}

pub fn write_local(root: &Path, files: &[(String, Vec<u8>)]) -> Result<()> {
    for (rel, bytes) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all failed: {}", parent.display()))?;
        }
        std::fs::write(&path, bytes)
            .with_context(|| format!("write failed: {}", path.display()))?;
    }
    Ok(())
}

/// Linear probe weights that classify the seeded colours, given the preprocessing
/// normalization.
pub fn probe_weights(spec: &SeedSpec, normalization: &Normalization) -> Result<LinearProbeWeights> {
    spec.validate()?;
    anyhow::ensure!(
        normalization.mean.len() == 3 && normalization.std.len() == 3,
        "seeded images are RGB; normalization must have 3 channels"
    );
    let prototypes = PALETTE[..spec.classes]
        .iter()
        .map(|(_, color)| {
            (0..3)
                .map(|c| (f32::from(color[c]) / 255.0 - normalization.mean[c]) / normalization.std[c])
                .collect()
        })
        .collect();
    LinearProbeWeights::nearest_prototype(prototypes, Some(spec.class_names()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_the_requested_tree() -> Result<()> {
        let spec = SeedSpec {
            classes: 3,
            images_per_class: 2,
            width: 8,
            height: 6,
            ..SeedSpec::default()
        };
        let files = seed_files(&spec)?;
        let rels: Vec<&str> = files.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(
            rels,
            vec![
                "red/00000.png",
                "red/00001.png",
                "green/00000.png",
                "green/00001.png",
                "blue/00000.png",
                "blue/00001.png"
            ]
        );
        let img = image::load_from_memory(&files[0].1)?.to_rgb8();
        assert_eq!(img.dimensions(), (8, 6));
        let px = img.get_pixel(3, 3);
        assert!(px[0] >= 220 - 12 && px[1] <= 30 + 12);
        Ok(())
    }

    #[test]
    fn seeding_is_deterministic() -> Result<()> {
        let spec = SeedSpec::default();
        assert_eq!(seed_files(&spec)?, seed_files(&spec)?);
        Ok(())
    }

    #[test]
    fn rejects_too_many_classes() {
        let spec = SeedSpec {
            classes: PALETTE.len() + 1,
            ..SeedSpec::default()
        };
        assert!(seed_files(&spec).is_err());
    }

    #[test]
    fn probe_weights_match_classes() -> Result<()> {
        let spec = SeedSpec {
            classes: 4,
            ..SeedSpec::default()
        };
        let w = probe_weights(&spec, &Normalization::imagenet())?;
        assert_eq!(w.num_classes, 4);
        assert_eq!(w.channels(), 3);
        assert_eq!(
            w.class_names.as_deref(),
            Some(&["red".to_string(), "green".into(), "blue".into(), "yellow".into()][..])
        );
        Ok(())
    }
}
