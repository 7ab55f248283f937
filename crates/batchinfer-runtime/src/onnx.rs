use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use batchinfer_core::types::{Batch, Image};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};

use crate::device::Device;
use crate::predictor::{argmax, Predictor, PredictorFactory};

/// ONNX image classifier: NCHW f32 in, `[N, num_classes]` logits out.
pub struct OnnxClassifier {
    session: Session,
    input_name: String,
    tensor_shape: [usize; 3],
    num_classes: Option<u32>,
}

impl OnnxClassifier {
    pub fn load(path: &Path, device: &Device, tensor_shape: [usize; 3]) -> Result<Self> {
        let builder = Session::builder()
            .context("failed to create ORT session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to configure ORT session builder")?;
        let builder = configure_session_builder(builder, device)?;
        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("failed to load ONNX model: {}", path.display()))?;

        ensure!(
            session.inputs.len() == 1,
            "expected a single-input classifier, model has {} inputs",
            session.inputs.len()
        );
        let input_name = session.inputs[0].name.clone();
        tracing::info!(
            model = %path.display(),
            %device,
            input = %input_name,
            "onnx model loaded"
        );
        Ok(Self {
            session,
            input_name,
            tensor_shape,
            num_classes: None,
        })
    }

    pub fn with_num_classes(mut self, num_classes: Option<u32>) -> Self {
        self.num_classes = num_classes;
        self
    }

    fn batch_input(&self, batch: &Batch) -> Result<Vec<f32>> {
        let [c, h, w] = self.tensor_shape;
        let per = c * h * w;
        let mut data = Vec::with_capacity(per * batch.len());
        for r in &batch.records {
            let Image::Tensor(t) = &r.image else {
                bail!("sample_id {}: predictor needs a tensor", r.sample_id);
            };
            ensure!(
                t.dim() == (c, h, w),
                "sample_id {}: tensor shape {:?} does not match {:?}",
                r.sample_id,
                t.dim(),
                self.tensor_shape
            );
            data.extend(t.iter().copied());
        }
        Ok(data)
    }
}

impl Predictor for OnnxClassifier {
    fn predict(&mut self, batch: &mut Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let n = batch.len();
        let [c, h, w] = self.tensor_shape;
        let data = self.batch_input(batch)?;
        let value = ort::value::Tensor::from_array((vec![n, c, h, w], data))?.into_dyn();
        let inputs = vec![(self.input_name.clone(), SessionInputValue::from(value))];
        let outputs = self.session.run(inputs)?;
        let (_, logits) = outputs
            .iter()
            .next()
            .context("model produced no outputs")?;
        let logits = logits.try_extract_array::<f32>()?;
        let shape = logits.shape().to_vec();
        ensure!(
            shape.len() == 2 && shape[0] == n,
            "expected logits of shape [{n}, num_classes], got {shape:?}"
        );
        if let Some(k) = self.num_classes {
            ensure!(
                shape[1] == k as usize,
                "model emits {} classes, expected {k}",
                shape[1]
            );
        }
        let logits = logits
            .into_dimensionality::<ndarray::Ix2>()
            .context("logits are not rank 2")?;

        for (record, row) in batch.records.iter_mut().zip(logits.rows()) {
            let row: Vec<f32> = row.iter().copied().collect();
            let idx = argmax(&row).context("empty logits row")?;
            record.predicted_class_index = Some(idx as u32);
        }
        Ok(())
    }

    fn num_classes(&self) -> Option<u32> {
        self.num_classes
    }
}

fn configure_session_builder(builder: SessionBuilder, device: &Device) -> Result<SessionBuilder> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda { device_id } => configure_cuda(builder, *device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder
            .with_execution_providers([ep])
            .context("failed to enable ORT CUDA execution provider")
    }
    #[cfg(not(feature = "cuda"))]
    {
        tracing::warn!(
            device_id,
            "gpu granted but batchinfer-runtime was built without the `cuda` feature; using cpu"
        );
        Ok(builder)
    }
}

pub struct OnnxClassifierFactory {
    model_path: PathBuf,
    tensor_shape: [usize; 3],
    class_names: Option<Vec<String>>,
}

impl OnnxClassifierFactory {
    pub fn new(model_path: PathBuf, tensor_shape: [usize; 3]) -> Self {
        Self {
            model_path,
            tensor_shape,
            class_names: None,
        }
    }

    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.class_names = Some(names);
        self
    }
}

impl PredictorFactory for OnnxClassifierFactory {
    fn name(&self) -> &str {
        "onnx"
    }

    fn create(&self, device: &Device) -> Result<Box<dyn Predictor>> {
        let num_classes = self.class_names.as_ref().map(|n| n.len() as u32);
        let model = OnnxClassifier::load(&self.model_path, device, self.tensor_shape)?
            .with_num_classes(num_classes);
        Ok(Box::new(model))
    }

    fn class_names(&self) -> Option<Vec<String>> {
        self.class_names.clone()
    }
}
