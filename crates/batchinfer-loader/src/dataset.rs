use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use anyhow::{Context, Result};
use batchinfer_core::config::{ImageSpec, Partitioning};
use batchinfer_core::types::{Batch, Record};
use batchinfer_observe::metrics::{Counter, DurationAgg, ScopedTimer};
use rayon::prelude::*;
use tokio::sync::mpsc;

use crate::decode::decode_image;
use crate::listing::SourceEntry;
use crate::location::Location;
use crate::store::ObjectStore;

#[derive(Debug, Default)]
pub struct LoaderMetrics {
    pub fetched_bytes_total: Counter,
    pub decoded_records_total: Counter,
    pub loaded_batches_total: Counter,
    pub decode_time: DurationAgg,
}

/// A listed image tree. Listing is eager; bytes are fetched and decoded per batch.
#[derive(Clone)]
pub struct Dataset {
    source: Location,
    image: ImageSpec,
    entries: Arc<[SourceEntry]>,
    store: ObjectStore,
    decode_pool: Option<Arc<rayon::ThreadPool>>,
    metrics: Arc<LoaderMetrics>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("source", &self.source)
            .field("image", &self.image)
            .field("records", &self.entries.len())
            .finish()
    }
}

impl Dataset {
    /// Lists `source` and labels each image. An empty listing is an error.
    pub async fn discover(
        source: &Location,
        partitioning: &Partitioning,
        image: ImageSpec,
        store: ObjectStore,
    ) -> Result<Self> {
        let entries = store
            .list(source, partitioning)
            .await
            .with_context(|| format!("listing failed: {source:?}"))?;
        anyhow::ensure!(!entries.is_empty(), "no images found under {source:?}");
        let ds = Self::from_entries(source.clone(), image, entries, store);
        tracing::info!(
            target: "batchinfer_proof",
            event = "dataset_listed",
            source = ?ds.source,
            records = ds.len() as u64,
            classes = ds.labels().len() as u64,
            height = image.height,
            width = image.width,
            mode = %image.mode,
            "dataset listed"
        );
        Ok(ds)
    }

    pub fn from_entries(
        source: Location,
        image: ImageSpec,
        entries: Vec<SourceEntry>,
        store: ObjectStore,
    ) -> Self {
        Self {
            source,
            image,
            entries: Arc::from(entries),
            store,
            decode_pool: None,
            metrics: Arc::new(LoaderMetrics::default()),
        }
    }

    /// Decodes each batch on a dedicated rayon pool of `threads` threads (`<= 1` decodes
    /// sequentially on the blocking thread).
    pub fn with_decode_threads(mut self, threads: usize) -> Result<Self> {
        self.decode_pool = if threads > 1 {
            Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("batchinfer-decode-{i}"))
                    .build()
                    .context("failed to build decode thread pool")?,
            ))
        } else {
            None
        };
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    /// Records fetch and decode activity into `metrics` instead of a private set.
    pub fn with_metrics(mut self, metrics: Arc<LoaderMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<LoaderMetrics> {
        self.metrics.clone()
    }

    /// Distinct labels, sorted.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.entries.iter().map(|e| e.label.clone()).collect();
        labels.sort();
        labels.dedup();
        labels
    }

    /// Contiguous index ranges of at most `batch_size` entries; only the last may be short.
    pub fn partitions(&self, batch_size: usize) -> Vec<Range<usize>> {
        let batch_size = batch_size.max(1);
        (0..self.entries.len())
            .step_by(batch_size)
            .map(|start| start..(start + batch_size).min(self.entries.len()))
            .collect()
    }

    /// Fetches and decodes the entries in `range` into one batch of raw records.
    pub async fn load_batch(&self, range: Range<usize>) -> Result<Batch> {
        let entries = self
            .entries
            .get(range.clone())
            .with_context(|| format!("partition {range:?} out of bounds ({})", self.len()))?
            .to_vec();

        let mut payloads = Vec::with_capacity(entries.len());
        for entry in &entries {
            let bytes = self
                .store
                .read(&entry.location, entry.sample_id)
                .await
                .with_context(|| {
                    format!("sample_id {}: fetch failed: {}", entry.sample_id, entry.location)
                })?;
            self.metrics.fetched_bytes_total.inc_by(bytes.len() as u64);
            payloads.push(bytes);
        }

        let spec = self.image;
        let pool = self.decode_pool.clone();
        let metrics = self.metrics.clone();
        let records = tokio::task::spawn_blocking(move || -> Result<Vec<Record>> {
            let _timer = ScopedTimer::new(&metrics.decode_time);
            let decode_at = |(entry, bytes): (&SourceEntry, &Vec<u8>)| -> Result<Record> {
                let image = decode_image(bytes, &spec).with_context(|| {
                    format!(
                        "sample_id {}: decode failed: {}",
                        entry.sample_id, entry.location
                    )
                })?;
                Ok(Record::new(entry.sample_id, image, entry.label.clone()))
            };
            let pairs: Vec<(&SourceEntry, &Vec<u8>)> = entries.iter().zip(&payloads).collect();
            let decoded: Vec<Result<Record>> = match pool.as_deref() {
                Some(pool) if pairs.len() > 1 => {
                    pool.install(|| pairs.into_par_iter().map(decode_at).collect())
                }
                _ => pairs.into_iter().map(decode_at).collect(),
            };
            decoded.into_iter().collect()
        })
        .await
        .map_err(anyhow::Error::from)??;

        self.metrics.decoded_records_total.inc_by(records.len() as u64);
        self.metrics.loaded_batches_total.inc();
        Ok(Batch::new(records))
    }

    /// Spawns a producer streaming decoded batches in listing order.
    ///
    /// Up to `prefetch` batches are fetched and decoded concurrently; completed batches are
    /// reordered before sending. The channel holds at most `queue` batches, so a slow consumer
    /// stalls the producer.
    pub fn spawn_batch_stream(
        &self,
        batch_size: usize,
        prefetch: usize,
        queue: usize,
    ) -> (mpsc::Receiver<Batch>, tokio::task::JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel::<Batch>(queue.max(1));
        let ds = self.clone();
        let task = tokio::spawn(async move { ds.produce_batches(tx, batch_size, prefetch).await });
        (rx, task)
    }

    async fn produce_batches(
        &self,
        tx: mpsc::Sender<Batch>,
        batch_size: usize,
        prefetch: usize,
    ) -> Result<()> {
        let parts = self.partitions(batch_size);
        let prefetch = prefetch.max(1);
        if prefetch <= 1 {
            for range in parts {
                let batch = self.load_batch(range).await?;
                if tx.send(batch).await.is_err() {
                    tracing::debug!("batch consumer dropped; stopping loader");
                    return Ok(());
                }
            }
            return Ok(());
        }

        let mut joinset = tokio::task::JoinSet::new();
        let mut buffer: BTreeMap<usize, Batch> = BTreeMap::new();
        let mut next_to_send: usize = 0;
        let mut parts = parts.into_iter().enumerate();
        let mut pending = parts.next();

        while pending.is_some() || !joinset.is_empty() {
            while joinset.len() < prefetch {
                let Some((batch_idx, range)) = pending.take() else {
                    break;
                };
                let ds = self.clone();
                joinset.spawn(async move { (batch_idx, ds.load_batch(range).await) });
                pending = parts.next();
            }

            let Some(res) = joinset.join_next().await else {
                break;
            };
            let (batch_idx, batch) = res.map_err(anyhow::Error::from)?;
            buffer.insert(batch_idx, batch?);

            while let Some(batch) = buffer.remove(&next_to_send) {
                if tx.send(batch).await.is_err() {
                    tracing::debug!("batch consumer dropped; stopping loader");
                    return Ok(());
                }
                next_to_send = next_to_send.saturating_add(1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<SourceEntry> {
        (0..n)
            .map(|i| SourceEntry {
                sample_id: i as u64,
                location: format!("/nowhere/{i}.png"),
                rel: format!("c{}/{i}.png", i % 3),
                label: format!("c{}", i % 3),
            })
            .collect()
    }

    fn dataset(n: usize) -> Dataset {
        Dataset::from_entries(
            Location::Local("/nowhere".into()),
            ImageSpec::default(),
            entries(n),
            ObjectStore::local(),
        )
    }

    #[test]
    fn partitions_cover_every_entry_once() {
        let ds = dataset(10);
        let parts = ds.partitions(4);
        assert_eq!(parts, vec![0..4, 4..8, 8..10]);
        assert_eq!(dataset(8).partitions(4).len(), 2);
        assert_eq!(dataset(3).partitions(0), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn labels_are_distinct_and_sorted() {
        assert_eq!(dataset(7).labels(), vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn missing_file_names_the_sample() {
        let ds = dataset(2);
        let err = ds.load_batch(0..2).await.unwrap_err();
        assert!(format!("{err:#}").contains("sample_id 0"), "{err:#}");
    }
}
