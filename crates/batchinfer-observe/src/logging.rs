use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `BATCHINFER_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract:
/// - Proof events go to target `batchinfer_proof` with an `event` field naming what happened.
/// - Metric snapshots go to target `batchinfer_metrics`.
/// - Include `sample_id` (or the batch's first/last id) on any per-record failure.
/// - Include `worker_id` on any pool/worker event.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Like [`init_tracing`] but tolerates an already-installed subscriber (tests, embedding).
pub fn try_init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init()
        .is_ok()
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("BATCHINFER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
