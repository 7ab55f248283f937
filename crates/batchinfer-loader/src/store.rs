use std::path::Path;

use anyhow::{Context, Result};
use batchinfer_core::config::Partitioning;

use crate::listing::SourceEntry;
use crate::location::Location;

/// Storage access for the locations a run touches.
///
/// Local paths need no client; an S3 client is built once from the environment when any
/// location is `s3://`.
#[derive(Clone, Default)]
pub struct ObjectStore {
    #[cfg(feature = "s3")]
    s3: Option<crate::s3::S3Client>,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(feature = "s3")]
        let s3 = self.s3.is_some();
        #[cfg(not(feature = "s3"))]
        let s3 = false;
        f.debug_struct("ObjectStore").field("s3", &s3).finish()
    }
}

impl ObjectStore {
    pub fn local() -> Self {
        Self::default()
    }

    #[cfg(feature = "s3")]
    pub fn with_s3_client(client: crate::s3::S3Client) -> Self {
        Self { s3: Some(client) }
    }

    pub async fn for_locations(locations: &[&Location]) -> Result<Self> {
        let needs_s3 = locations.iter().any(|l| l.is_s3());
        if !needs_s3 {
            return Ok(Self::local());
        }
        #[cfg(feature = "s3")]
        {
            Ok(Self::with_s3_client(crate::s3::client_from_env().await?))
        }
        #[cfg(not(feature = "s3"))]
        {
            anyhow::bail!("s3:// location present but batchinfer-loader was built without feature 's3'")
        }
    }

    #[cfg(feature = "s3")]
    fn s3(&self) -> Result<&crate::s3::S3Client> {
        self.s3
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("s3 client not configured but s3 location present"))
    }

    /// Lists `source` and labels every image under it.
    pub async fn list(
        &self,
        source: &Location,
        partitioning: &Partitioning,
    ) -> Result<Vec<SourceEntry>> {
        match source {
            Location::Local(root) => {
                let root = root.clone();
                let partitioning = partitioning.clone();
                tokio::task::spawn_blocking(move || {
                    crate::listing::list_local(&root, &partitioning)
                })
                .await
                .map_err(anyhow::Error::from)?
            }
            #[cfg(feature = "s3")]
            Location::S3 { bucket, prefix } => {
                crate::listing::list_s3(self.s3()?, bucket, prefix, partitioning).await
            }
            #[cfg(not(feature = "s3"))]
            Location::S3 { .. } => {
                anyhow::bail!("s3 support not enabled (rebuild batchinfer-loader with --features s3)")
            }
        }
    }

    /// Reads one whole object. `salt` spreads retry jitter across concurrent readers.
    pub async fn read(&self, location: &str, salt: u64) -> Result<Vec<u8>> {
        if location.starts_with("s3://") {
            #[cfg(feature = "s3")]
            {
                let (bucket, key) = crate::location::parse_s3_bucket_key(location)?;
                return crate::s3::get_object_bytes(self.s3()?, &bucket, &key, salt).await;
            }
            #[cfg(not(feature = "s3"))]
            {
                let _ = salt;
                anyhow::bail!("s3 support not enabled (rebuild batchinfer-loader with --features s3)");
            }
        }
        let _ = salt;
        tokio::fs::read(location)
            .await
            .with_context(|| format!("read failed: {location}"))
    }

    /// Uploads a local file to `s3://bucket/key`.
    pub async fn upload_file(&self, path: &Path, url: &str) -> Result<()> {
        #[cfg(feature = "s3")]
        {
            let (bucket, key) = crate::location::parse_s3_bucket_key(url)?;
            crate::s3::put_file(self.s3()?, &bucket, &key, path).await
        }
        #[cfg(not(feature = "s3"))]
        {
            let _ = path;
            anyhow::bail!("cannot upload to {url}: built without feature 's3'")
        }
    }
}
