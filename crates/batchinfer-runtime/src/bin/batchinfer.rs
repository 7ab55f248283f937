#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, info_span, warn, Instrument};

use batchinfer_core::config::{
    ColorMode, ImageSpec, Normalization, Partitioning, PipelineConfig, PoolPolicy,
};
use batchinfer_core::labels::parse_labels_tsv;
use batchinfer_runtime::linear::LinearProbeFactory;
use batchinfer_runtime::{Pipeline, PredictorFactory, RunMetrics};

#[derive(Debug, Parser)]
#[command(name = "batchinfer", about = "Batch image classification into sharded Parquet")]
struct Args {
    /// Dataset root: `s3://bucket/prefix/` or a local directory of `<label>/<image>` files.
    #[arg(long, env = "BATCHINFER_SOURCE")]
    source: String,

    /// Output: local directory or `s3://bucket/prefix/`.
    #[arg(long, env = "BATCHINFER_DESTINATION")]
    destination: String,

    /// Directory under the source that holds the label directories.
    #[arg(long, env = "BATCHINFER_BASE_DIR", default_value = "")]
    base_dir: String,

    /// Name of the label column.
    #[arg(long, env = "BATCHINFER_LABEL_FIELD", default_value = "class")]
    label_field: String,

    #[arg(long, env = "BATCHINFER_IMAGE_HEIGHT", default_value_t = 256)]
    image_height: u32,

    #[arg(long, env = "BATCHINFER_IMAGE_WIDTH", default_value_t = 256)]
    image_width: u32,

    /// RGB | L | RGBA
    #[arg(long, env = "BATCHINFER_COLOR_MODE", default_value = "RGB")]
    color_mode: ColorMode,

    #[arg(long, env = "BATCHINFER_CROP_SIZE", default_value_t = 224)]
    crop_size: u32,

    /// Per-channel mean, comma separated (default: ImageNet).
    #[arg(long, env = "BATCHINFER_MEAN", value_delimiter = ',')]
    mean: Option<Vec<f32>>,

    /// Per-channel std, comma separated (default: ImageNet).
    #[arg(long, env = "BATCHINFER_STD", value_delimiter = ',')]
    std: Option<Vec<f32>>,

    #[arg(long, env = "BATCHINFER_BATCH_SIZE", default_value_t = 128)]
    batch_size: usize,

    /// N | fixed:N | bounded:MIN:MAX | unbounded:MIN
    #[arg(long, env = "BATCHINFER_POOL", default_value = "fixed:4")]
    pool: PoolPolicy,

    /// GPU share per worker: a fraction in (0, 1] or a whole number. 0 runs on CPU.
    #[arg(long, env = "BATCHINFER_GPUS_PER_WORKER", default_value_t = 0.0)]
    gpus_per_worker: f64,

    /// GPUs available (default: count from CUDA_VISIBLE_DEVICES).
    #[arg(long, env = "BATCHINFER_NUM_GPUS")]
    num_gpus: Option<u32>,

    #[arg(long, env = "BATCHINFER_NUM_SHARDS", default_value_t = 4)]
    num_shards: usize,

    #[arg(long, env = "BATCHINFER_PREFETCH_BATCHES", default_value_t = 2)]
    prefetch_batches: usize,

    #[arg(long, env = "BATCHINFER_PREPROCESS_CONCURRENCY", default_value_t = 4)]
    preprocess_concurrency: usize,

    #[arg(long, env = "BATCHINFER_MAX_QUEUE_BATCHES", default_value_t = 8)]
    max_queue_batches: usize,

    #[arg(long, env = "BATCHINFER_MAX_TASK_RETRIES", default_value_t = 3)]
    max_task_retries: u32,

    /// Linear probe weights (JSON).
    #[arg(long, env = "BATCHINFER_WEIGHTS")]
    weights: Option<PathBuf>,

    /// ONNX classifier (requires feature `onnx`).
    #[arg(long, env = "BATCHINFER_ONNX_MODEL", conflicts_with = "weights")]
    onnx_model: Option<PathBuf>,

    /// Class names in labels.tsv form; adds a `predicted_label` column.
    #[arg(long, env = "BATCHINFER_CLASS_NAMES")]
    class_names: Option<PathBuf>,

    /// Also write the run report JSON here.
    #[arg(long, env = "BATCHINFER_REPORT")]
    report: Option<PathBuf>,

    /// Periodically emit a metrics snapshot (0 disables).
    #[arg(long, env = "BATCHINFER_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 1000)]
    metrics_snapshot_interval_ms: u64,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut cfg = PipelineConfig::new(self.source.clone(), self.destination.clone());
        cfg.partitioning = Partitioning {
            base_dir: self.base_dir.clone(),
            field: self.label_field.clone(),
        };
        cfg.image = ImageSpec {
            height: self.image_height,
            width: self.image_width,
            mode: self.color_mode,
        };
        cfg.crop_size = self.crop_size;
        let imagenet = Normalization::imagenet();
        cfg.normalization = Normalization {
            mean: self.mean.clone().unwrap_or(imagenet.mean),
            std: self.std.clone().unwrap_or(imagenet.std),
        };
        cfg.batch_size = self.batch_size;
        cfg.pool = self.pool;
        cfg.gpus_per_worker = self.gpus_per_worker;
        cfg.num_gpus = self.num_gpus;
        cfg.num_shards = self.num_shards;
        cfg.prefetch_batches = self.prefetch_batches;
        cfg.preprocess_concurrency = self.preprocess_concurrency;
        cfg.max_queue_batches = self.max_queue_batches;
        cfg.max_task_retries = self.max_task_retries;
        cfg
    }
}

fn build_factory(args: &Args, cfg: &PipelineConfig) -> Result<Arc<dyn PredictorFactory>> {
    if let Some(path) = &args.weights {
        return Ok(Arc::new(LinearProbeFactory::load(path)?));
    }
    if let Some(path) = &args.onnx_model {
        #[cfg(feature = "onnx")]
        {
            let factory = batchinfer_runtime::onnx::OnnxClassifierFactory::new(
                path.clone(),
                cfg.tensor_shape(),
            );
            return Ok(Arc::new(factory));
        }
        #[cfg(not(feature = "onnx"))]
        {
            let _ = cfg;
            anyhow::bail!(
                "--onnx-model {} needs feature 'onnx' (cargo run -p batchinfer-runtime --features onnx --bin batchinfer)",
                path.display()
            );
        }
    }
    anyhow::bail!("no predictor configured: pass --weights or --onnx-model")
}

fn emit_metrics_snapshot(metrics: &RunMetrics) {
    let predict = metrics.pool.predict_time.snapshot();
    let preprocess = metrics.preprocess_time.snapshot();
    let decode = metrics.loader.decode_time.snapshot();
    tracing::info!(
        target: "batchinfer_metrics",
        listed_records = metrics.listed_records.get(),
        fetched_bytes_total = metrics.loader.fetched_bytes_total.get(),
        decoded_records_total = metrics.loader.decoded_records_total.get(),
        loaded_records_total = metrics.loaded_records_total.get(),
        preprocessed_records_total = metrics.preprocessed_records_total.get(),
        predicted_records_total = metrics.pool.records_predicted_total.get(),
        collected_records_total = metrics.collected_records_total.get(),
        written_records_total = metrics.written_records_total.get(),
        workers_current = metrics.pool.workers_current.get(),
        workers_high_water = metrics.pool.workers_high_water.get(),
        worker_restarts_total = metrics.pool.worker_restarts_total.get(),
        predict_failures_total = metrics.pool.predict_failures_total.get(),
        predict_avg_us = predict.avg_ns() / 1000,
        predict_max_us = predict.max_ns / 1000,
        preprocess_avg_us = preprocess.avg_ns() / 1000,
        decode_avg_us = decode.avg_ns() / 1000,
        decode_max_us = decode.max_ns / 1000,
        "metrics"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    batchinfer_observe::logging::init_tracing();
    let args = Args::parse();
    let cfg = args.pipeline_config();

    let span = info_span!(
        "batchinfer",
        source = %cfg.source,
        destination = %cfg.destination,
        pool = %cfg.pool,
        batch_size = cfg.batch_size,
        num_shards = cfg.num_shards,
    );

    async move {
        let factory = build_factory(&args, &cfg)?;
        let mut pipeline = Pipeline::new(cfg, factory)?;
        if let Some(path) = &args.class_names {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("read class names failed: {}", path.display()))?;
            pipeline = pipeline.with_class_names(parse_labels_tsv(&bytes)?);
        }
        let metrics = pipeline.metrics();

        let metrics_task = if args.metrics_snapshot_interval_ms > 0 {
            let interval_ms = std::cmp::max(1, args.metrics_snapshot_interval_ms);
            let metrics = metrics.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    emit_metrics_snapshot(&metrics);
                }
            }))
        } else {
            None
        };

        info!(config = ?pipeline.config(), "starting batch inference");
        let report = tokio::select! {
            res = pipeline.run() => res,
            _ = signal::ctrl_c() => {
                warn!("ctrl-c received; exiting");
                Err(anyhow::anyhow!("interrupted by ctrl-c before the run completed"))
            }
        };

        if let Some(task) = metrics_task {
            task.abort();
        }
        emit_metrics_snapshot(&metrics);

        let report = report?;
        let json = serde_json::to_string_pretty(&report)?;
        if let Some(path) = &args.report {
            tokio::fs::write(path, json.as_bytes())
                .await
                .with_context(|| format!("write report failed: {}", path.display()))?;
        }
        println!("{json}");
        Ok(())
    }
    .instrument(span)
    .await
}
