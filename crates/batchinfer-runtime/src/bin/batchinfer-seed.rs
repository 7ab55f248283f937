#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use batchinfer_core::config::Normalization;
use batchinfer_core::labels::render_labels_tsv;
use batchinfer_loader::Location;
use batchinfer_runtime::seed::{probe_weights, seed_files, write_local, SeedSpec};

#[derive(Debug, Parser)]
#[command(name = "batchinfer-seed", about = "Write a toy labeled image tree")]
struct Args {
    /// Local directory or `s3://bucket/prefix/` (requires feature `s3`).
    #[arg(long, env = "BATCHINFER_SEED_OUT")]
    out: String,

    #[arg(long, env = "BATCHINFER_SEED_CLASSES", default_value_t = 2)]
    classes: usize,

    #[arg(long, env = "BATCHINFER_SEED_IMAGES_PER_CLASS", default_value_t = 5)]
    images_per_class: usize,

    #[arg(long, env = "BATCHINFER_SEED_WIDTH", default_value_t = 64)]
    width: u32,

    #[arg(long, env = "BATCHINFER_SEED_HEIGHT", default_value_t = 48)]
    height: u32,

    #[arg(long, env = "BATCHINFER_SEED_NOISE", default_value_t = 12)]
    noise: u8,

    #[arg(long, env = "BATCHINFER_SEED", default_value_t = 0x5eed)]
    seed: u64,

    /// Also write linear probe weights (ImageNet normalization) that separate the classes.
    #[arg(long, env = "BATCHINFER_SEED_WRITE_WEIGHTS")]
    write_weights: Option<PathBuf>,

    /// Also write the class names as labels.tsv.
    #[arg(long, env = "BATCHINFER_SEED_WRITE_LABELS")]
    write_labels: Option<PathBuf>,
}

#[cfg(feature = "s3")]
async fn upload(bucket: &str, prefix: &str, files: &[(String, Vec<u8>)]) -> Result<()> {
    let client = batchinfer_loader::s3::client_from_env().await?;
    // Best effort bucket creation (ignore "already exists/owned" errors).
    if let Err(err) = client.create_bucket().bucket(bucket).send().await {
        tracing::warn!(?err, bucket, "create_bucket failed (continuing)");
    }
    for (rel, bytes) in files {
        let key = if prefix.is_empty() {
            rel.clone()
        } else {
            format!("{prefix}/{rel}")
        };
        batchinfer_loader::s3::put_bytes(&client, bucket, &key, bytes).await?;
    }
    Ok(())
}

#[cfg(not(feature = "s3"))]
async fn upload(bucket: &str, _prefix: &str, _files: &[(String, Vec<u8>)]) -> Result<()> {
    anyhow::bail!("seeding s3://{bucket} requires feature 's3'")
}

#[tokio::main]
async fn main() -> Result<()> {
    batchinfer_observe::logging::init_tracing();
    let args = Args::parse();
    let spec = SeedSpec {
        classes: args.classes,
        images_per_class: args.images_per_class,
        width: args.width,
        height: args.height,
        noise: args.noise,
        seed: args.seed,
    };

    let files = seed_files(&spec)?;
    let bytes: usize = files.iter().map(|(_, b)| b.len()).sum();
    match Location::parse(&args.out)? {
        Location::Local(root) => {
            let files_ref = &files;
            tokio::task::block_in_place(|| write_local(&root, files_ref))?;
        }
        Location::S3 { bucket, prefix } => upload(&bucket, &prefix, &files).await?,
    }

    if let Some(path) = &args.write_weights {
        let weights = probe_weights(&spec, &Normalization::imagenet())?;
        let json = serde_json::to_vec_pretty(&weights)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("write weights failed: {}", path.display()))?;
    }
    if let Some(path) = &args.write_labels {
        tokio::fs::write(path, render_labels_tsv(&spec.class_names()))
            .await
            .with_context(|| format!("write labels failed: {}", path.display()))?;
    }

    tracing::info!(
        target: "batchinfer_metrics",
        event = "seed_complete",
        out = %args.out,
        classes = spec.classes as u64,
        images = files.len() as u64,
        bytes = bytes as u64,
        "seeded dataset"
    );
    Ok(())
}
