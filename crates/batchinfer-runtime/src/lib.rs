#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod device;
pub mod linear;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pipeline;
pub mod pool;
pub mod predictor;
pub mod preprocess;
pub mod seed;
pub mod writer;

pub use pipeline::{run_pipeline, Pipeline, RunMetrics, RunReport};
pub use predictor::{Predictor, PredictorFactory};
pub use preprocess::{ImagePreprocessor, Preprocessor};
