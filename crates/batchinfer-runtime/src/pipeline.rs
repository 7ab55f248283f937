use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use batchinfer_core::config::PipelineConfig;
use batchinfer_core::types::{Batch, Record};
use batchinfer_loader::{Dataset, LoaderMetrics, Location, ObjectStore};
use batchinfer_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::pool::{spawn_pool, PoolConfig, PoolMetrics};
use crate::predictor::PredictorFactory;
use crate::preprocess::{ImagePreprocessor, Preprocessor};
use crate::writer::{write_shards, ShardInfo, WriterConfig};

#[derive(Debug, Default)]
pub struct RunMetrics {
    pub listed_records: Gauge,
    pub loaded_records_total: Counter,
    pub loaded_batches_total: Counter,
    pub preprocessed_records_total: Counter,
    pub preprocessed_batches_total: Counter,
    pub collected_records_total: Counter,
    pub written_records_total: Counter,
    pub preprocess_time: DurationAgg,
    pub write_time: DurationAgg,
    pub loader: Arc<LoaderMetrics>,
    pub pool: Arc<PoolMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source: String,
    pub destination: String,
    pub predictor: String,
    pub records_listed: u64,
    pub records_loaded: u64,
    pub records_preprocessed: u64,
    pub records_predicted: u64,
    pub records_written: u64,
    pub bytes_fetched: u64,
    pub shards: Vec<ShardInfo>,
    pub workers_started: u64,
    pub worker_restarts: u64,
    pub peak_workers: u64,
    pub elapsed_ms: u64,
}

/// One batch-inference run: load, preprocess, predict, write.
pub struct Pipeline {
    cfg: PipelineConfig,
    preprocessor: Arc<dyn Preprocessor>,
    factory: Arc<dyn PredictorFactory>,
    class_names: Option<Vec<String>>,
    store: Option<ObjectStore>,
    metrics: Arc<RunMetrics>,
}

impl Pipeline {
    /// Uses [`ImagePreprocessor`] built from `cfg`; validates `cfg`.
    pub fn new(cfg: PipelineConfig, factory: Arc<dyn PredictorFactory>) -> Result<Self> {
        cfg.validate()?;
        let preprocessor = Arc::new(ImagePreprocessor::from_config(&cfg)?);
        Ok(Self {
            cfg,
            preprocessor,
            factory,
            class_names: None,
            store: None,
            metrics: Arc::new(RunMetrics::default()),
        })
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    /// Overrides the factory's class names for the `predicted_label` column.
    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.class_names = Some(names);
        self
    }

    pub fn with_store(mut self, store: ObjectStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metrics(&self) -> Arc<RunMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub async fn run(self) -> Result<RunReport> {
        let started = Instant::now();
        let cfg = &self.cfg;
        let metrics = self.metrics.clone();
        let source = Location::parse(&cfg.source).context("invalid source")?;
        let destination = Location::parse(&cfg.destination).context("invalid destination")?;
        let store = match self.store.clone() {
            Some(s) => s,
            None => ObjectStore::for_locations(&[&source, &destination]).await?,
        };

        let dataset = Dataset::discover(&source, &cfg.partitioning, cfg.image, store.clone())
            .await?
            .with_metrics(metrics.loader.clone())
            .with_decode_threads(cfg.preprocess_concurrency)?;
        let listed = dataset.len() as u64;
        metrics.listed_records.set(listed);

        let (load_rx, load_task) =
            dataset.spawn_batch_stream(cfg.batch_size, cfg.prefetch_batches, cfg.max_queue_batches);
        let (pre_tx, pre_rx) = mpsc::channel::<Batch>(cfg.max_queue_batches);
        let pre_task = tokio::spawn(preprocess_stage(
            self.preprocessor.clone(),
            load_rx,
            pre_tx,
            cfg.preprocess_concurrency,
            metrics.clone(),
        ));

        let (pred_tx, mut pred_rx) = mpsc::channel::<Batch>(cfg.max_queue_batches);
        let pool = spawn_pool(
            self.factory.clone(),
            PoolConfig::from_pipeline(cfg)?,
            pre_rx,
            pred_tx,
            metrics.pool.clone(),
        )
        .await
        .context("starting predictor pool")?;

        let mut predictions: Vec<Record> = Vec::with_capacity(dataset.len());
        while let Some(batch) = pred_rx.recv().await {
            metrics.collected_records_total.inc_by(batch.len() as u64);
            predictions.extend(batch);
        }

        load_task
            .await
            .map_err(anyhow::Error::from)?
            .context("loader")?;
        pre_task
            .await
            .map_err(anyhow::Error::from)?
            .context("preprocessor")?;
        pool.join().await.context("predictor pool")?;

        let loaded = metrics.loaded_records_total.get();
        let preprocessed = metrics.preprocessed_records_total.get();
        let predicted = predictions.len() as u64;
        check_count("loaded", listed, loaded)?;
        check_count("preprocessed", loaded, preprocessed)?;
        check_count("predicted", preprocessed, predicted)?;

        let class_names = self
            .class_names
            .clone()
            .or_else(|| self.factory.class_names());
        let writer_cfg = WriterConfig {
            destination: destination.clone(),
            num_shards: cfg.num_shards,
            label_field: cfg.partitioning.field.clone(),
            tensor_shape: cfg.tensor_shape(),
            class_names,
        };
        let shards = {
            let _timer = ScopedTimer::new(&metrics.write_time);
            write_shards(predictions, &writer_cfg, &store).await?
        };
        let written: u64 = shards.iter().map(|s| s.rows as u64).sum();
        metrics.written_records_total.inc_by(written);
        check_count("written", predicted, written)?;
        anyhow::ensure!(
            shards.len() == cfg.num_shards,
            "wrote {} shards, expected {}",
            shards.len(),
            cfg.num_shards
        );

        let report = RunReport {
            source: cfg.source.clone(),
            destination: cfg.destination.clone(),
            predictor: self.factory.name().to_string(),
            records_listed: listed,
            records_loaded: loaded,
            records_preprocessed: preprocessed,
            records_predicted: predicted,
            records_written: written,
            bytes_fetched: metrics.loader.fetched_bytes_total.get(),
            shards,
            workers_started: metrics.pool.workers_started_total.get(),
            worker_restarts: metrics.pool.worker_restarts_total.get(),
            peak_workers: metrics.pool.workers_high_water.get(),
            elapsed_ms: started.elapsed().as_millis().min(u64::MAX as u128) as u64,
        };
        tracing::info!(
            target: "batchinfer_proof",
            event = "run_complete",
            records = report.records_written,
            shards = report.shards.len() as u64,
            worker_restarts = report.worker_restarts,
            peak_workers = report.peak_workers,
            elapsed_ms = report.elapsed_ms,
            "run complete"
        );
        Ok(report)
    }
}

/// Convenience wrapper: default preprocessor, class names from the factory.
pub async fn run_pipeline(
    cfg: PipelineConfig,
    factory: Arc<dyn PredictorFactory>,
) -> Result<RunReport> {
    Pipeline::new(cfg, factory)?.run().await
}

fn check_count(stage: &str, expected: u64, actual: u64) -> Result<()> {
    anyhow::ensure!(
        expected == actual,
        "record count mismatch at {stage}: expected {expected}, got {actual}"
    );
    Ok(())
}

/// Runs up to `concurrency` batches through `preprocessor` on blocking threads. Output order is
/// completion order.
async fn preprocess_stage(
    preprocessor: Arc<dyn Preprocessor>,
    mut input: mpsc::Receiver<Batch>,
    output: mpsc::Sender<Batch>,
    concurrency: usize,
    metrics: Arc<RunMetrics>,
) -> Result<()> {
    let concurrency = concurrency.max(1);
    let mut joinset: tokio::task::JoinSet<Result<Batch>> = tokio::task::JoinSet::new();
    let mut input_open = true;

    loop {
        tokio::select! {
            biased;
            Some(res) = joinset.join_next(), if !joinset.is_empty() => {
                let batch = res.map_err(anyhow::Error::from)??;
                metrics.preprocessed_batches_total.inc();
                metrics.preprocessed_records_total.inc_by(batch.len() as u64);
                if output.send(batch).await.is_err() {
                    tracing::debug!("predictor pool stopped accepting batches; stopping preprocessor");
                    return Ok(());
                }
            }
            next = input.recv(), if input_open && joinset.len() < concurrency => {
                let Some(batch) = next else {
                    input_open = false;
                    continue;
                };
                metrics.loaded_batches_total.inc();
                metrics.loaded_records_total.inc_by(batch.len() as u64);
                let pre = preprocessor.clone();
                let m = metrics.clone();
                joinset.spawn_blocking(move || {
                    let _timer = ScopedTimer::new(&m.preprocess_time);
                    let span = batch.id_span();
                    pre.preprocess(batch)
                        .with_context(|| format!("preprocess failed (sample_ids {span:?})"))
                });
            }
            else => break,
        }
    }
    Ok(())
}
