use std::path::PathBuf;

use anyhow::Result;

/// Where a dataset tree or output prefix lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    S3 { bucket: String, prefix: String },
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        anyhow::ensure!(!raw.is_empty(), "empty location");
        if raw.starts_with("s3://") {
            let (bucket, prefix) = parse_s3_prefix(raw)?;
            return Ok(Location::S3 { bucket, prefix });
        }
        let path = raw.strip_prefix("local://").unwrap_or(raw);
        anyhow::ensure!(
            !path.contains("://"),
            "unsupported location scheme: {raw} (expected s3:// or a local path)"
        );
        Ok(Location::Local(PathBuf::from(path)))
    }

    pub fn is_s3(&self) -> bool {
        matches!(self, Location::S3 { .. })
    }

    /// Joins a relative `/`-separated key onto this location.
    pub fn join(&self, rel: &str) -> String {
        let rel = rel.trim_start_matches('/');
        match self {
            Location::Local(p) => p.join(rel).display().to_string(),
            Location::S3 { bucket, prefix } => {
                if prefix.is_empty() {
                    format!("s3://{bucket}/{rel}")
                } else {
                    format!("s3://{bucket}/{prefix}/{rel}")
                }
            }
        }
    }
}

/// Splits `s3://bucket/prefix[/]` into bucket and a prefix without surrounding slashes.
pub fn parse_s3_prefix(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| anyhow::anyhow!("invalid s3 url: {url}"))?;
    let s = rest.trim().trim_matches('/');
    // Accept the `anonymous@bucket` form some tools use for public buckets.
    let s = s.split_once('@').map(|(_, b)| b).unwrap_or(s);
    let mut it = s.splitn(2, '/');
    let bucket = it.next().unwrap_or("").trim();
    anyhow::ensure!(!bucket.is_empty(), "invalid s3 url (missing bucket): {url}");
    let prefix = it.next().unwrap_or("").trim_matches('/').to_string();
    Ok((bucket.to_string(), prefix))
}

/// Splits `s3://bucket/key` into bucket and a non-empty key.
pub fn parse_s3_bucket_key(url: &str) -> Result<(String, String)> {
    let (bucket, key) = parse_s3_prefix(url)?;
    anyhow::ensure!(!key.is_empty(), "invalid s3 url (missing key): {url}");
    Ok((bucket, key))
}
