//! Long-lived predictor workers.
//!
//! Each worker is a dedicated OS thread owning one model instance bound to one device. Workers
//! pull batches from a shared job queue and push predicted batches into the output channel;
//! both are bounded, so a slow writer stalls the workers and a slow pool stalls the dispatcher.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use batchinfer_core::config::{gpu_share_units, PipelineConfig, PoolPolicy};
use batchinfer_core::types::Batch;
use batchinfer_observe::metrics::{Counter, DurationAgg, Gauge};
use tokio::sync::{mpsc, oneshot, watch};

use crate::device::{detect_gpus, Device, GpuAllocator, Grant};
use crate::predictor::{Predictor, PredictorFactory};

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub policy: PoolPolicy,
    /// Per-worker GPU share in milli-GPU units (0 = CPU workers).
    pub gpu_share: u32,
    pub num_gpus: u32,
    /// Extra attempts per batch after the first failure.
    pub max_task_retries: u32,
    /// Capacity of the job queue feeding the workers.
    pub queue_batches: usize,
    /// When set, every batch must carry CHW tensors of this shape.
    pub tensor_shape: Option<[usize; 3]>,
}

impl PoolConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            policy: cfg.pool,
            gpu_share: gpu_share_units(cfg.gpus_per_worker)?,
            num_gpus: detect_gpus(cfg.num_gpus),
            max_task_retries: cfg.max_task_retries,
            queue_batches: cfg.max_queue_batches,
            tensor_shape: Some(cfg.tensor_shape()),
        })
    }
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub workers_started_total: Counter,
    pub worker_restarts_total: Counter,
    pub predict_failures_total: Counter,
    pub batches_predicted_total: Counter,
    pub records_predicted_total: Counter,
    pub workers_current: Gauge,
    pub workers_high_water: Gauge,
    pub predict_time: DurationAgg,
}

impl PoolMetrics {
    fn on_worker_up(&self) {
        self.workers_started_total.inc();
        let now = self.workers_current.add(1);
        self.workers_high_water.max(now);
    }

    fn on_worker_down(&self) {
        self.workers_current.sub(1);
    }
}

struct Shared {
    factory: Arc<dyn PredictorFactory>,
    jobs: Mutex<mpsc::Receiver<Batch>>,
    output: mpsc::Sender<Batch>,
    allocator: Mutex<GpuAllocator>,
    idle: AtomicUsize,
    starting: AtomicUsize,
    /// Workers whose model is built and whose thread has not exited.
    live: AtomicUsize,
    metrics: Arc<PoolMetrics>,
    abort: watch::Sender<bool>,
    first_error: Mutex<Option<anyhow::Error>>,
    max_task_retries: u32,
    tensor_shape: Option<[usize; 3]>,
}

impl Shared {
    fn fail(&self, err: anyhow::Error) {
        if let Ok(mut slot) = self.first_error.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.abort.send_replace(true);
    }

    fn aborted(&self) -> bool {
        *self.abort.borrow()
    }

    fn take_error(&self) -> Option<anyhow::Error> {
        self.first_error.lock().ok().and_then(|mut e| e.take())
    }

    fn release(&self, grant: &Grant) {
        if let Ok(mut alloc) = self.allocator.lock() {
            alloc.release(grant);
        }
    }
}

/// Handle to a running pool. Await [`PoolHandle::join`] once the input channel is closed.
pub struct PoolHandle {
    task: tokio::task::JoinHandle<Result<()>>,
    metrics: Arc<PoolMetrics>,
}

impl PoolHandle {
    pub fn metrics(&self) -> Arc<PoolMetrics> {
        self.metrics.clone()
    }

    pub async fn join(self) -> Result<()> {
        self.task.await.map_err(anyhow::Error::from)?
    }
}

/// Starts the pool's minimum workers, then spawns the dispatcher feeding them from `input`.
///
/// Fails if any of the minimum workers cannot be granted its device share or cannot build its
/// model. Predicted batches go to `output` in completion order.
pub async fn spawn_pool(
    factory: Arc<dyn PredictorFactory>,
    cfg: PoolConfig,
    input: mpsc::Receiver<Batch>,
    output: mpsc::Sender<Batch>,
    metrics: Arc<PoolMetrics>,
) -> Result<PoolHandle> {
    cfg.policy.validate()?;

    let mut gpu_share = cfg.gpu_share;
    if gpu_share > 0 && cfg.num_gpus == 0 {
        tracing::warn!(
            gpu_share_milli = gpu_share,
            "gpu share requested but no gpus available; workers fall back to cpu"
        );
        gpu_share = 0;
    }
    let allocator = GpuAllocator::new(cfg.num_gpus, gpu_share);
    let resource_limit = allocator.capacity().unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    let min_workers = cfg.policy.min_workers();
    let max_workers = cfg.policy.max_workers(resource_limit).max(min_workers);
    if let Some(cap) = allocator.capacity() {
        anyhow::ensure!(
            min_workers <= cap,
            "pool needs {min_workers} workers but gpu capacity only fits {cap} (gpus={}, share={}m)",
            cfg.num_gpus,
            gpu_share
        );
    }

    let (job_tx, job_rx) = mpsc::channel::<Batch>(cfg.queue_batches.max(1));
    let (abort_tx, abort_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        factory,
        jobs: Mutex::new(job_rx),
        output,
        allocator: Mutex::new(allocator),
        idle: AtomicUsize::new(0),
        starting: AtomicUsize::new(0),
        live: AtomicUsize::new(0),
        metrics: metrics.clone(),
        abort: abort_tx,
        first_error: Mutex::new(None),
        max_task_retries: cfg.max_task_retries,
        tensor_shape: cfg.tensor_shape,
    });

    let mut threads = Vec::with_capacity(max_workers.min(64));
    for worker_id in 0..min_workers {
        let (handle, ready) = start_worker(&shared, worker_id)?;
        threads.push(handle);
        ready
            .await
            .map_err(|_| anyhow::anyhow!("worker {worker_id} exited before reporting ready"))?
            .with_context(|| format!("worker {worker_id} failed to start"))?;
    }
    tracing::info!(
        target: "batchinfer_proof",
        event = "pool_started",
        factory = shared.factory.name(),
        policy = %cfg.policy,
        workers = min_workers as u64,
        max_workers = max_workers as u64,
        gpu_share_milli = gpu_share,
        num_gpus = cfg.num_gpus,
        "predictor pool started"
    );

    let dispatcher = Dispatcher {
        shared,
        job_tx,
        abort_rx,
        threads,
        elastic: cfg.policy.is_elastic(),
        max_workers,
        next_worker_id: min_workers,
    };
    let task = tokio::spawn(dispatcher.run(input));
    Ok(PoolHandle { task, metrics })
}

struct Dispatcher {
    shared: Arc<Shared>,
    job_tx: mpsc::Sender<Batch>,
    abort_rx: watch::Receiver<bool>,
    threads: Vec<std::thread::JoinHandle<()>>,
    elastic: bool,
    max_workers: usize,
    next_worker_id: usize,
}

impl Dispatcher {
    async fn run(mut self, mut input: mpsc::Receiver<Batch>) -> Result<()> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.abort_rx.changed() => break,
                b = input.recv() => match b {
                    Some(b) => b,
                    None => break,
                },
            };
            if self.elastic {
                self.maybe_grow();
            }
            tokio::select! {
                biased;
                _ = self.abort_rx.changed() => break,
                sent = self.job_tx.send(batch) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        let Dispatcher {
            shared,
            job_tx,
            threads,
            ..
        } = self;
        drop(job_tx);
        drop(input);
        tokio::task::spawn_blocking(move || {
            for t in threads {
                let _ = t.join();
            }
        })
        .await
        .map_err(anyhow::Error::from)?;

        if let Some(err) = shared.take_error() {
            return Err(err);
        }
        anyhow::ensure!(!shared.aborted(), "predictor pool aborted");
        Ok(())
    }

    /// Adds one worker when a batch is waiting, nobody is idle, and the policy allows it.
    /// Only live and starting workers count against the limit, so a worker that failed to
    /// build its model frees its slot.
    fn maybe_grow(&mut self) {
        self.threads.retain(|t| !t.is_finished());
        let starting = self.shared.starting.load(Ordering::Acquire);
        let live = self.shared.live.load(Ordering::Acquire);
        if live + starting >= self.max_workers
            || starting > 0
            || self.shared.idle.load(Ordering::Acquire) > 0
        {
            return;
        }
        let worker_id = self.next_worker_id;
        match start_worker(&self.shared, worker_id) {
            Ok((handle, ready)) => {
                self.next_worker_id += 1;
                self.threads.push(handle);
                let shared = self.shared.clone();
                let max_workers = self.max_workers;
                tokio::spawn(async move {
                    match ready.await {
                        Ok(Ok(())) => tracing::info!(
                            target: "batchinfer_proof",
                            event = "pool_scaled",
                            worker_id,
                            workers = shared.live.load(Ordering::Acquire) as u64,
                            max_workers = max_workers as u64,
                            "predictor pool grew"
                        ),
                        Ok(Err(err)) => {
                            tracing::warn!(worker_id, error = %err, "pool growth failed; slot freed")
                        }
                        Err(_) => tracing::warn!(worker_id, "pool growth worker exited early"),
                    }
                });
            }
            Err(err) => {
                tracing::debug!(error = %err, "pool growth skipped");
            }
        }
    }
}

/// Grants a device share and spawns the worker thread. The receiver resolves once the model is
/// built (or failed to build).
fn start_worker(
    shared: &Arc<Shared>,
    worker_id: usize,
) -> Result<(std::thread::JoinHandle<()>, oneshot::Receiver<Result<()>>)> {
    let grant = shared
        .allocator
        .lock()
        .map_err(|_| anyhow::anyhow!("gpu allocator mutex poisoned"))?
        .acquire()
        .with_context(|| format!("no gpu share available for worker {worker_id}"))?;

    let (ready_tx, ready_rx) = oneshot::channel();
    shared.starting.fetch_add(1, Ordering::AcqRel);
    let worker_shared = shared.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("batchinfer-worker-{worker_id}"))
        .spawn(move || {
            let shared = worker_shared;
            let device = grant.device();
            let predictor = match shared.factory.create(&device) {
                Ok(p) => {
                    shared.live.fetch_add(1, Ordering::AcqRel);
                    shared.starting.fetch_sub(1, Ordering::AcqRel);
                    shared.metrics.on_worker_up();
                    let _ = ready_tx.send(Ok(()));
                    p
                }
                Err(err) => {
                    tracing::warn!(worker_id, %device, error = %err, "worker failed to start");
                    shared.release(&grant);
                    shared.starting.fetch_sub(1, Ordering::AcqRel);
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            tracing::info!(
                target: "batchinfer_proof",
                event = "worker_started",
                worker_id,
                %device,
                "worker started"
            );
            let worker = Worker {
                id: worker_id,
                device,
                predictor: Some(predictor),
                shared: shared.clone(),
            };
            worker.run();
            shared.release(&grant);
            shared.live.fetch_sub(1, Ordering::AcqRel);
            shared.metrics.on_worker_down();
        });
    match spawned {
        Ok(handle) => Ok((handle, ready_rx)),
        Err(err) => {
            shared.starting.fetch_sub(1, Ordering::AcqRel);
            Err(anyhow::Error::from(err).context("failed to spawn worker thread"))
        }
    }
}

struct Worker {
    id: usize,
    device: Device,
    predictor: Option<Box<dyn Predictor>>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let Some(batch) = self.next_job() else {
                return;
            };
            if self.shared.aborted() {
                return;
            }
            let span = batch.id_span();
            let batch = match self.predict_with_retry(batch) {
                Ok(b) => b,
                Err(err) => {
                    let err = err.context(format!(
                        "worker {} failed batch (sample_ids {:?})",
                        self.id, span
                    ));
                    tracing::error!(worker_id = self.id, error = %format!("{err:#}"), "batch failed");
                    self.shared.fail(err);
                    return;
                }
            };
            self.shared.metrics.batches_predicted_total.inc();
            self.shared
                .metrics
                .records_predicted_total
                .inc_by(batch.len() as u64);
            if self.shared.output.blocking_send(batch).is_err() {
                self.shared
                    .fail(anyhow::anyhow!("prediction consumer closed before the pool finished"));
                return;
            }
        }
    }

    fn next_job(&self) -> Option<Batch> {
        self.shared.idle.fetch_add(1, Ordering::AcqRel);
        let job = match self.shared.jobs.lock() {
            Ok(mut rx) => rx.blocking_recv(),
            Err(_) => None,
        };
        self.shared.idle.fetch_sub(1, Ordering::AcqRel);
        job
    }

    /// Runs the batch, recreating the model after each failure, for at most
    /// `max_task_retries + 1` attempts.
    fn predict_with_retry(&mut self, mut batch: Batch) -> Result<Batch> {
        if let Some(shape) = self.shared.tensor_shape {
            batch.validate_tensors(shape)?;
        }
        let mut expected_ids = batch.sample_ids();
        expected_ids.sort_unstable();
        let attempts = self.shared.max_task_retries.saturating_add(1);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=attempts {
            if self.predictor.is_none() {
                match self.shared.factory.create(&self.device) {
                    Ok(p) => {
                        self.predictor = Some(p);
                        self.shared.metrics.worker_restarts_total.inc();
                        tracing::info!(
                            target: "batchinfer_proof",
                            event = "worker_restarted",
                            worker_id = self.id,
                            device = %self.device,
                            attempt,
                            "worker model recreated"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(worker_id = self.id, attempt, error = %err, "model recreate failed");
                        last_err = Some(err);
                        continue;
                    }
                }
            }
            let Some(predictor) = self.predictor.as_mut() else {
                continue;
            };

            batch.clear_predictions();
            let started = Instant::now();
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| predictor.predict(&mut batch)));
            self.shared.metrics.predict_time.record(started.elapsed());
            let result = match result {
                Ok(r) => r,
                Err(panic) => Err(anyhow::anyhow!(
                    "predictor panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            let num_classes = predictor.num_classes();
            match result.and_then(|()| check_output(&expected_ids, &batch, num_classes)) {
                Ok(()) => return Ok(batch),
                Err(err) => {
                    self.shared.metrics.predict_failures_total.inc();
                    tracing::warn!(
                        worker_id = self.id,
                        attempt,
                        attempts,
                        error = %format!("{err:#}"),
                        "predict failed; recreating model"
                    );
                    self.predictor = None;
                    last_err = Some(err);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow::anyhow!("no attempt ran"));
        Err(err.context(format!("predict failed after {attempts} attempts")))
    }
}

/// Same records out as in, each with an in-range prediction.
fn check_output(expected_ids: &[u64], out: &Batch, num_classes: Option<u32>) -> Result<()> {
    out.check_unique_ids()?;
    let mut ids = out.sample_ids();
    ids.sort_unstable();
    anyhow::ensure!(
        ids == expected_ids,
        "predictor returned {} records for {} inputs (or changed sample ids)",
        ids.len(),
        expected_ids.len()
    );
    out.validate_predictions(num_classes)?;
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchinfer_core::types::Record;
    use ndarray::Array3;

    struct Const(u32);

    impl Predictor for Const {
        fn predict(&mut self, batch: &mut Batch) -> Result<()> {
            for r in &mut batch.records {
                r.predicted_class_index = Some(self.0);
            }
            Ok(())
        }

        fn num_classes(&self) -> Option<u32> {
            Some(2)
        }
    }

    fn batch(ids: &[u64]) -> Batch {
        Batch::new(
            ids.iter()
                .map(|&id| Record::new(id, Array3::zeros((1, 1, 1)), "c"))
                .collect(),
        )
    }

    #[test]
    fn output_check_catches_dropped_and_out_of_range() {
        let mut out = batch(&[3, 1]);
        Const(1).predict(&mut out).unwrap();
        assert!(check_output(&[1, 3], &out, Some(2)).is_ok());
        assert!(check_output(&[1, 2, 3], &out, Some(2)).is_err());
        assert!(check_output(&[1, 3], &out, Some(1)).is_err());
        assert!(check_output(&[1], &batch(&[1]), None).is_err());
    }

    #[test]
    fn output_check_rejects_duplicated_records() {
        let mut out = batch(&[1, 1, 3]);
        Const(0).predict(&mut out).unwrap();
        let err = check_output(&[1, 1, 3], &out, Some(2)).unwrap_err();
        assert!(err.to_string().contains("more than once"), "{err}");
    }

    #[test]
    fn panic_payloads_are_readable() {
        let p = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(p.as_ref()), "boom 7");
    }
}
