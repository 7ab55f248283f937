use std::path::Path;

use anyhow::{Context, Result};
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;

type S3SdkError<E> = aws_sdk_s3::error::SdkError<E>;

pub type S3Client = aws_sdk_s3::Client;

const MAX_ATTEMPTS: usize = 3;
const BASE_DELAY_MS: u64 = 50;
const MAX_DELAY_MS: u64 = 1000;

fn parse_env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            let b = match s.as_str() {
                "1" | "true" | "yes" | "y" | "on" => true,
                "0" | "false" | "no" | "n" | "off" => false,
                _ => anyhow::bail!(
                    "invalid boolean env var {}={:?} (expected true/false/1/0)",
                    key,
                    v
                ),
            };
            Ok(Some(b))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)),
    }
}

/// Build an S3 client from the ambient environment.
///
/// - Default: standard AWS resolution (region/creds from env/config/role).
/// - Optional: override endpoint via `BATCHINFER_S3_ENDPOINT_URL` (MinIO or other S3-compatible stores).
/// - Optional: `BATCHINFER_S3_FORCE_PATH_STYLE=1` forces path-style addressing. Defaults to on
///   when an endpoint override is set.
pub async fn client_from_env() -> Result<S3Client> {
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let endpoint_url: Option<String> = std::env::var("BATCHINFER_S3_ENDPOINT_URL").ok();
    let force_path_style = match parse_env_bool("BATCHINFER_S3_FORCE_PATH_STYLE")? {
        Some(v) => v,
        None => endpoint_url.is_some(),
    };

    let mut b: S3ConfigBuilder = aws_sdk_s3::config::Builder::from(&cfg);
    if let Some(url) = endpoint_url {
        b = b.endpoint_url(url);
    }
    if force_path_style {
        b = b.force_path_style(true);
    }

    Ok(aws_sdk_s3::Client::from_conf(b.build()))
}

fn is_transient<E>(err: &S3SdkError<E>) -> bool {
    match err {
        S3SdkError::TimeoutError(_) => true,
        S3SdkError::DispatchFailure(_) => true,
        S3SdkError::ResponseError(_) => true,
        S3SdkError::ConstructionFailure(_) => false,
        S3SdkError::ServiceError(_) => err
            .raw_response()
            .map(|raw| {
                let status_u16: u16 = raw.status().into();
                status_u16 == 429 || status_u16 >= 500
            })
            .unwrap_or(false),
        _ => false,
    }
}

/// Runs `f` with bounded exponential backoff on transient S3 failures.
///
/// `salt` spreads the jitter of concurrent callers (usually a sample id).
pub async fn with_retry<T, E, F, Fut>(salt: u64, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, S3SdkError<E>>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut attempt: usize = 0;
    let mut delay_ms: u64 = BASE_DELAY_MS;
    loop {
        attempt = attempt.saturating_add(1);
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if is_transient(&err) && attempt < MAX_ATTEMPTS {
                    let jitter = batchinfer_observe::time::unix_time_ms().wrapping_add(salt) % 37;
                    tracing::debug!(attempt, delay_ms, "transient s3 error; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        delay_ms.saturating_add(jitter),
                    ))
                    .await;
                    delay_ms = (delay_ms.saturating_mul(2)).min(MAX_DELAY_MS);
                    continue;
                }
                return Err(anyhow::Error::new(err));
            }
        }
    }
}

/// Lists every object key under `prefix` (sizes included), following continuation tokens.
pub async fn list_objects(
    client: &S3Client,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<(String, u64)>> {
    let mut objects: Vec<(String, u64)> = Vec::new();
    let mut token: Option<String> = None;
    let list_prefix = if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}/")
    };
    loop {
        let resp = with_retry(0, || {
            let mut req = client.list_objects_v2().bucket(bucket);
            if !list_prefix.is_empty() {
                req = req.prefix(list_prefix.as_str());
            }
            if let Some(t) = token.as_deref() {
                req = req.continuation_token(t);
            }
            req.send()
        })
        .await
        .with_context(|| format!("list_objects_v2 failed: s3://{bucket}/{list_prefix}"))?;

        if let Some(contents) = resp.contents {
            for obj in contents {
                let Some(k) = obj.key else { continue };
                if k.ends_with('/') {
                    continue;
                }
                let sz: u64 = obj.size.and_then(|v| u64::try_from(v).ok()).unwrap_or(0);
                objects.push((k, sz));
            }
        }
        if resp.is_truncated.unwrap_or(false) {
            token = resp.next_continuation_token;
            if token.is_none() {
                break;
            }
        } else {
            break;
        }
    }
    Ok(objects)
}

pub async fn get_object_bytes(
    client: &S3Client,
    bucket: &str,
    key: &str,
    salt: u64,
) -> Result<Vec<u8>> {
    let out = with_retry(salt, || client.get_object().bucket(bucket).key(key).send())
        .await
        .with_context(|| format!("get_object failed: s3://{bucket}/{key}"))?;
    let collected = out
        .body
        .collect()
        .await
        .with_context(|| format!("reading body failed: s3://{bucket}/{key}"))?;
    Ok(collected.into_bytes().to_vec())
}

/// Uploads the file at `path`; the body is reopened on every attempt.
pub async fn put_file(client: &S3Client, bucket: &str, key: &str, path: &Path) -> Result<()> {
    anyhow::ensure!(path.is_file(), "upload source is not a file: {}", path.display());
    with_retry(0, || {
        let req = client.put_object().bucket(bucket).key(key);
        async move {
            let body = match ByteStream::from_path(path).await {
                Ok(body) => body,
                Err(err) => return Err(S3SdkError::construction_failure(err)),
            };
            req.body(body).send().await
        }
    })
    .await
    .with_context(|| format!("put_object failed: s3://{bucket}/{key} <- {}", path.display()))?;
    Ok(())
}

pub async fn put_bytes(client: &S3Client, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
    with_retry(0, || {
        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
    })
    .await
    .with_context(|| format!("put_object failed: s3://{bucket}/{key}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestError = S3SdkError<std::io::Error>;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_errors_are_retried() -> Result<()> {
        let calls = AtomicUsize::new(0);
        let value = with_retry(7, || {
            let n = calls.fetch_add(1, Ordering::AcqRel);
            async move {
                if n < 2 {
                    Err(TestError::timeout_error(std::io::Error::other("slow")))
                } else {
                    Ok(n)
                }
            }
        })
        .await?;
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::Acquire), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retries_stop_at_the_attempt_limit() {
        let calls = AtomicUsize::new(0);
        let res: Result<()> = with_retry(0, || {
            calls.fetch_add(1, Ordering::AcqRel);
            async { Err(TestError::timeout_error(std::io::Error::other("slow"))) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::Acquire), MAX_ATTEMPTS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn construction_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let res: Result<()> = with_retry(0, || {
            calls.fetch_add(1, Ordering::AcqRel);
            async { Err(TestError::construction_failure(std::io::Error::other("bad body"))) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_upload_source_fails_before_any_request() {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        let client = S3Client::from_conf(conf);
        let err = put_file(
            &client,
            "bucket",
            "out/shard-00000.parquet",
            Path::new("/nonexistent/batchinfer/shard.parquet"),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("not a file"), "{err:#}");
    }
}
