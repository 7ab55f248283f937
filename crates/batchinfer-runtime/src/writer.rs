use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, FixedSizeListArray, Float32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use batchinfer_core::types::{Image, Record};
use batchinfer_loader::{Location, ObjectStore};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;

pub const IMAGE_COLUMN: &str = "image";
pub const PREDICTION_COLUMN: &str = "predicted_class_index";
pub const PREDICTED_LABEL_COLUMN: &str = "predicted_label";

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub destination: Location,
    pub num_shards: usize,
    /// Name of the label column (the partitioning field).
    pub label_field: String,
    pub tensor_shape: [usize; 3],
    /// Adds a `predicted_label` column when set.
    pub class_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardInfo {
    pub index: usize,
    pub path: String,
    pub rows: usize,
}

pub fn shard_file_name(index: usize) -> String {
    format!("shard-{index:05}.parquet")
}

/// Splits `len` rows into exactly `n` contiguous ranges whose sizes differ by at most one.
/// The first `len % n` ranges take the extra row.
pub fn shard_ranges(len: usize, n: usize) -> Vec<Range<usize>> {
    let n = n.max(1);
    let base = len / n;
    let extra = len % n;
    let mut out = Vec::with_capacity(n);
    let mut start = 0usize;
    for i in 0..n {
        let size = base + usize::from(i < extra);
        out.push(start..start + size);
        start += size;
    }
    out
}

pub fn output_schema(cfg: &WriterConfig) -> SchemaRef {
    let [c, h, w] = cfg.tensor_shape;
    let item = Arc::new(Field::new("item", DataType::Float32, false));
    let image = Field::new(
        IMAGE_COLUMN,
        DataType::FixedSizeList(item, (c * h * w) as i32),
        false,
    )
    .with_metadata(HashMap::from([("shape".to_string(), format!("{c},{h},{w}"))]));
    let mut fields = vec![
        image,
        Field::new(cfg.label_field.as_str(), DataType::Utf8, false),
        Field::new(PREDICTION_COLUMN, DataType::Int64, false),
    ];
    if cfg.class_names.is_some() {
        fields.push(Field::new(PREDICTED_LABEL_COLUMN, DataType::Utf8, true));
    }
    Arc::new(Schema::new(fields))
}

/// Builds one Arrow batch from predicted records, in the given order.
pub fn records_to_batch(records: &[Record], cfg: &WriterConfig) -> Result<RecordBatch> {
    let schema = output_schema(cfg);
    let [c, h, w] = cfg.tensor_shape;
    let per = c * h * w;

    let mut pixels: Vec<f32> = Vec::with_capacity(per * records.len());
    let mut labels: Vec<&str> = Vec::with_capacity(records.len());
    let mut preds: Vec<i64> = Vec::with_capacity(records.len());
    for r in records {
        let Image::Tensor(t) = &r.image else {
            anyhow::bail!("sample_id {}: image is not a preprocessed tensor", r.sample_id);
        };
        anyhow::ensure!(
            t.dim() == (c, h, w),
            "sample_id {}: tensor shape {:?} does not match {:?}",
            r.sample_id,
            t.dim(),
            cfg.tensor_shape
        );
        let pred = r
            .predicted_class_index
            .with_context(|| format!("sample_id {}: missing prediction", r.sample_id))?;
        pixels.extend(t.iter().copied());
        labels.push(r.class.as_str());
        preds.push(i64::from(pred));
    }

    let item = Arc::new(Field::new("item", DataType::Float32, false));
    let images = FixedSizeListArray::try_new(
        item,
        per as i32,
        Arc::new(Float32Array::from(pixels)),
        None,
    )
    .context("image column")?;
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(images),
        Arc::new(StringArray::from(labels)),
        Arc::new(Int64Array::from(preds.clone())),
    ];
    if let Some(names) = &cfg.class_names {
        let predicted: Vec<Option<&str>> = preds
            .iter()
            .map(|&p| names.get(p as usize).map(String::as_str))
            .collect();
        columns.push(Arc::new(StringArray::from(predicted)));
    }
    RecordBatch::try_new(schema, columns).context("assembling record batch")
}

/// Writes `records` as one Snappy-compressed Parquet file. Goes through a `.tmp` sibling and a
/// rename so readers never see a half-written shard.
pub fn write_parquet_file(path: &Path, records: &[Record], cfg: &WriterConfig) -> Result<()> {
    let batch = records_to_batch(records, cfg)?;
    let tmp = path.with_extension("parquet.tmp");
    let file = std::fs::File::create(&tmp)
        .with_context(|| format!("create failed: {}", tmp.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    if batch.num_rows() > 0 {
        writer.write(&batch)?;
    }
    writer.close()?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {} failed", tmp.display(), path.display()))?;
    Ok(())
}

const STAGING_PREFIX: &str = "batchinfer-shards";

fn staging_dir() -> Result<PathBuf> {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "{STAGING_PREFIX}-{}-{}",
        std::process::id(),
        batchinfer_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create staging dir failed: {}", dir.display()))?;
    Ok(dir)
}

/// Orders `records` by sample id and writes them as exactly `num_shards` shards.
///
/// S3 shards are staged in a temp dir that is removed whether or not the uploads succeed.
pub async fn write_shards(
    mut records: Vec<Record>,
    cfg: &WriterConfig,
    store: &ObjectStore,
) -> Result<Vec<ShardInfo>> {
    anyhow::ensure!(cfg.num_shards > 0, "num_shards must be > 0");
    records.sort_by_key(|r| r.sample_id);
    if let Some(dup) = records.windows(2).find(|w| w[0].sample_id == w[1].sample_id) {
        anyhow::bail!("sample_id {} reached the writer more than once", dup[0].sample_id);
    }

    match &cfg.destination {
        Location::Local(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create destination failed: {}", dir.display()))?;
            write_shard_files(records, cfg, store, dir).await
        }
        Location::S3 { .. } => {
            let staging = staging_dir()?;
            let written = write_shard_files(records, cfg, store, &staging).await;
            if let Err(err) = tokio::fs::remove_dir_all(&staging).await {
                tracing::warn!(dir = %staging.display(), error = %err, "staging cleanup failed");
            }
            written
        }
    }
}

async fn write_shard_files(
    records: Vec<Record>,
    cfg: &WriterConfig,
    store: &ObjectStore,
    local_dir: &Path,
) -> Result<Vec<ShardInfo>> {
    let records = Arc::new(records);
    let mut shards = Vec::with_capacity(cfg.num_shards);
    for (index, range) in shard_ranges(records.len(), cfg.num_shards)
        .into_iter()
        .enumerate()
    {
        let name = shard_file_name(index);
        let path = local_dir.join(&name);
        let rows = range.len();
        {
            let records = records.clone();
            let cfg = cfg.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || write_parquet_file(&path, &records[range], &cfg))
                .await
                .map_err(anyhow::Error::from)?
                .with_context(|| format!("writing shard {index}"))?;
        }

        let dest = match &cfg.destination {
            Location::Local(_) => path.display().to_string(),
            Location::S3 { .. } => {
                let url = cfg.destination.join(&name);
                store.upload_file(&path, &url).await?;
                tokio::fs::remove_file(&path).await.ok();
                url
            }
        };
        tracing::info!(
            target: "batchinfer_proof",
            event = "shard_written",
            shard = index as u64,
            rows = rows as u64,
            path = %dest,
            "shard written"
        );
        shards.push(ShardInfo {
            index,
            path: dest,
            rows,
        });
    }
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn shard_sizes_differ_by_at_most_one() {
        for (len, n) in [(10, 2), (10, 3), (3, 5), (0, 4), (7, 1), (1000, 7)] {
            let ranges = shard_ranges(len, n);
            assert_eq!(ranges.len(), n);
            let sizes: Vec<usize> = ranges.iter().map(Range::len).collect();
            assert_eq!(sizes.iter().sum::<usize>(), len);
            let max = sizes.iter().max().copied().unwrap_or(0);
            let min = sizes.iter().min().copied().unwrap_or(0);
            assert!(max - min <= 1, "{len}/{n}: {sizes:?}");
            // Contiguous and ordered.
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
        assert_eq!(shard_ranges(10, 3), vec![0..4, 4..7, 7..10]);
    }

    fn cfg(names: Option<Vec<String>>) -> WriterConfig {
        WriterConfig {
            destination: Location::Local(PathBuf::from("/unused")),
            num_shards: 2,
            label_field: "class".into(),
            tensor_shape: [1, 2, 2],
            class_names: names,
        }
    }

    fn predicted(id: u64, pred: u32) -> Record {
        Record {
            sample_id: id,
            image: Image::Tensor(Array3::from_elem((1, 2, 2), id as f32)),
            class: format!("c{id}"),
            predicted_class_index: Some(pred),
        }
    }

    #[test]
    fn batch_has_expected_columns() -> Result<()> {
        let names = Some(vec!["zero".to_string(), "one".to_string()]);
        let batch = records_to_batch(&[predicted(0, 1), predicted(1, 0)], &cfg(names))?;
        assert_eq!(batch.num_rows(), 2);
        let schema = batch.schema();
        let cols: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            cols,
            vec![IMAGE_COLUMN, "class", PREDICTION_COLUMN, PREDICTED_LABEL_COLUMN]
        );
        assert_eq!(
            schema.field(0).metadata().get("shape").map(String::as_str),
            Some("1,2,2")
        );
        let labels = batch
            .column(3)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(labels.value(0), "one");
        Ok(())
    }

    fn staging_dirs() -> Vec<String> {
        let prefix = format!("{STAGING_PREFIX}-{}-", std::process::id());
        std::fs::read_dir(std::env::temp_dir())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.starts_with(&prefix))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_upload_removes_staging_dir() {
        let mut cfg = cfg(None);
        cfg.destination = Location::S3 {
            bucket: "bucket".into(),
            prefix: "out".into(),
        };
        let records = vec![predicted(0, 0), predicted(1, 1), predicted(2, 0)];
        // No s3 client is configured, so the first upload fails.
        let err = write_shards(records, &cfg, &ObjectStore::local())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("s3"), "{err:#}");
        assert!(staging_dirs().is_empty(), "{:?}", staging_dirs());
    }

    #[test]
    fn unpredicted_or_raw_records_are_rejected() {
        let mut r = predicted(0, 0);
        r.predicted_class_index = None;
        assert!(records_to_batch(&[r], &cfg(None)).is_err());

        let raw = Record::new(1, Array3::zeros((2, 2, 1)), "c");
        assert!(records_to_batch(&[raw], &cfg(None)).is_err());
    }
}
