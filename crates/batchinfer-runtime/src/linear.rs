//! Pure-Rust linear probe: global average pool, one affine layer, argmax.
//!
//! Weights live in a small JSON file:
//!
//! ```json
//! {"num_classes": 2, "weights": [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]], "bias": [0.0, 0.0],
//!  "class_names": ["red", "blue"]}
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use batchinfer_core::types::{Batch, Image};
use ndarray::{ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::predictor::{argmax, Predictor, PredictorFactory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearProbeWeights {
    pub num_classes: u32,
    /// `[num_classes][channels]`.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_names: Option<Vec<String>>,
}

impl LinearProbeWeights {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.num_classes > 0, "num_classes must be > 0");
        let n = self.num_classes as usize;
        anyhow::ensure!(
            self.weights.len() == n,
            "weights has {} rows, expected num_classes={n}",
            self.weights.len()
        );
        anyhow::ensure!(
            self.bias.len() == n,
            "bias has {} values, expected num_classes={n}",
            self.bias.len()
        );
        let channels = self.channels();
        anyhow::ensure!(channels > 0, "weights rows must be non-empty");
        for (i, row) in self.weights.iter().enumerate() {
            anyhow::ensure!(
                row.len() == channels,
                "weights row {i} has {} values, expected {channels}",
                row.len()
            );
            anyhow::ensure!(
                row.iter().all(|v| v.is_finite()),
                "weights row {i} has non-finite values"
            );
        }
        anyhow::ensure!(
            self.bias.iter().all(|v| v.is_finite()),
            "bias has non-finite values"
        );
        if let Some(names) = &self.class_names {
            anyhow::ensure!(
                names.len() == n,
                "class_names has {} entries, expected num_classes={n}",
                names.len()
            );
        }
        Ok(())
    }

    /// Nearest-prototype classifier: `w_k = p_k`, `b_k = -|p_k|^2 / 2`, so the argmax picks the
    /// prototype closest (in L2) to the pooled features.
    pub fn nearest_prototype(
        prototypes: Vec<Vec<f32>>,
        class_names: Option<Vec<String>>,
    ) -> Result<Self> {
        let bias = prototypes
            .iter()
            .map(|p| -0.5 * p.iter().map(|v| v * v).sum::<f32>())
            .collect();
        let w = Self {
            num_classes: u32::try_from(prototypes.len()).context("too many classes")?,
            weights: prototypes,
            bias,
            class_names,
        };
        w.validate()?;
        Ok(w)
    }

    pub fn channels(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let w: Self = serde_json::from_slice(bytes).context("invalid linear probe weights json")?;
        w.validate()?;
        Ok(w)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read weights failed: {}", path.display()))?;
        Self::from_json_bytes(&bytes).with_context(|| format!("weights: {}", path.display()))
    }

    /// `[C, H, W]` to class logits.
    pub fn logits(&self, tensor: ArrayView3<'_, f32>) -> Result<Vec<f32>> {
        let (c, _, _) = tensor.dim();
        anyhow::ensure!(
            c == self.channels(),
            "tensor has {c} channels, weights expect {}",
            self.channels()
        );
        let pooled: Vec<f32> = tensor
            .axis_iter(Axis(0))
            .map(|plane| plane.mean().unwrap_or(0.0))
            .collect();
        Ok(self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(&pooled).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect())
    }
}

pub struct LinearProbe {
    weights: Arc<LinearProbeWeights>,
}

impl LinearProbe {
    pub fn new(weights: Arc<LinearProbeWeights>) -> Self {
        Self { weights }
    }
}

impl Predictor for LinearProbe {
    fn predict(&mut self, batch: &mut Batch) -> Result<()> {
        for record in &mut batch.records {
            let Image::Tensor(t) = &record.image else {
                anyhow::bail!("sample_id {}: predictor needs a tensor", record.sample_id);
            };
            let logits = self
                .weights
                .logits(t.view())
                .with_context(|| format!("sample_id {}", record.sample_id))?;
            let idx = argmax(&logits).context("empty logits")?;
            record.predicted_class_index = Some(idx as u32);
        }
        Ok(())
    }

    fn num_classes(&self) -> Option<u32> {
        Some(self.weights.num_classes)
    }
}

#[derive(Clone)]
pub struct LinearProbeFactory {
    weights: Arc<LinearProbeWeights>,
}

impl LinearProbeFactory {
    pub fn new(weights: LinearProbeWeights) -> Result<Self> {
        weights.validate()?;
        Ok(Self {
            weights: Arc::new(weights),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::new(LinearProbeWeights::load(path)?)
    }
}

impl PredictorFactory for LinearProbeFactory {
    fn name(&self) -> &str {
        "linear-probe"
    }

    fn create(&self, device: &Device) -> Result<Box<dyn Predictor>> {
        if device.is_gpu() {
            tracing::debug!(%device, "linear probe runs on cpu; ignoring gpu grant");
        }
        Ok(Box::new(LinearProbe::new(self.weights.clone())))
    }

    fn class_names(&self) -> Option<Vec<String>> {
        self.weights.class_names.clone()
    }
}
