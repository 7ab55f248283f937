use anyhow::Result;
use batchinfer_core::types::Batch;

use crate::device::Device;

/// A loaded model bound to one device.
///
/// Kept synchronous; each worker thread owns exactly one instance and calls it directly.
pub trait Predictor: Send {
    /// Sets `predicted_class_index` on every record of `batch`. Records must not be added,
    /// removed or reordered.
    fn predict(&mut self, batch: &mut Batch) -> Result<()>;

    /// Number of classes the model emits, when known. Used to range-check predictions.
    fn num_classes(&self) -> Option<u32> {
        None
    }
}

/// Builds one [`Predictor`] per worker. Model loading happens in `create`.
pub trait PredictorFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn create(&self, device: &Device) -> Result<Box<dyn Predictor>>;

    /// Names indexed by class id, when the model carries them.
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }
}

/// Index of the largest value; ties resolve to the lowest index and NaNs are skipped.
/// `None` for empty input.
pub fn argmax(values: &[f32]) -> Option<usize> {
    if values.is_empty() {
        return None;
    }
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    Some(best.map_or(0, |(i, _)| i))
}
