use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use batchinfer_core::config::Partitioning;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "webp"];

/// One listed image, before any bytes are fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub sample_id: u64,
    /// Absolute local path or `s3://bucket/key`.
    pub location: String,
    /// Key relative to the source root, `/`-separated.
    pub rel: String,
    pub label: String,
}

pub fn has_image_extension(name: &str) -> bool {
    let Some((_stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

fn is_hidden(rel: &str) -> bool {
    rel.split('/').any(|c| c.starts_with('.'))
}

/// `rel` with the partitioning `base_dir` prefix removed, or `None` when `rel` lies outside it.
pub fn strip_base_dir<'a>(partitioning: &Partitioning, rel: &'a str) -> Option<&'a str> {
    let base = partitioning.base_dir.trim_matches('/');
    let rel = rel.trim_start_matches('/');
    if base.is_empty() {
        return Some(rel);
    }
    rel.strip_prefix(base)
        .filter(|after| after.is_empty() || after.starts_with('/'))
        .map(|after| after.trim_start_matches('/'))
}

/// Derives the label for `rel` under `partitioning`: `base_dir/<label>/<file>`.
///
/// The label is the file's parent directory, which must sit directly under `base_dir`;
/// loose files and nested directories are rejected.
pub fn label_for_rel(partitioning: &Partitioning, rel: &str) -> Result<String> {
    let field = &partitioning.field;
    let rest = strip_base_dir(partitioning, rel).with_context(|| {
        format!(
            "{rel:?} is not under partitioning base_dir {:?}",
            partitioning.base_dir
        )
    })?;
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [_file] => anyhow::bail!(
            "{rel:?} has no directory to derive field {field:?} from (expected <{field}>/<file>)"
        ),
        [label, _file] => {
            let label = label.trim();
            anyhow::ensure!(!label.is_empty(), "{rel:?} has an empty label directory");
            Ok(label.to_string())
        }
        _ => anyhow::bail!(
            "{rel:?} has {} directory levels under base_dir, partitioning field {field:?} expects 1 (<{field}>/<file>)",
            parts.len() - 1
        ),
    }
}

fn walk_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut out: Vec<(PathBuf, String)> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("read_dir failed: {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push((path, rel));
            }
        }
    }
    Ok(out)
}

/// Turns `(location, rel)` pairs into labeled, id-assigned entries.
///
/// Only files under the partitioning `base_dir` are kept, minus non-image and hidden files;
/// the rest are sorted by `rel` so ids are stable across runs over the same tree.
pub fn build_entries(
    mut files: Vec<(String, String)>,
    partitioning: &Partitioning,
) -> Result<Vec<SourceEntry>> {
    files.retain(|(_, rel)| {
        !is_hidden(rel)
            && has_image_extension(rel)
            && strip_base_dir(partitioning, rel).is_some()
    });
    files.sort_by(|a, b| a.1.cmp(&b.1));

    let mut entries = Vec::with_capacity(files.len());
    for (i, (location, rel)) in files.into_iter().enumerate() {
        let label = label_for_rel(partitioning, &rel)?;
        entries.push(SourceEntry {
            sample_id: i as u64,
            location,
            rel,
            label,
        });
    }
    Ok(entries)
}

pub fn list_local(root: &Path, partitioning: &Partitioning) -> Result<Vec<SourceEntry>> {
    anyhow::ensure!(
        root.is_dir(),
        "source must be a directory: {}",
        root.display()
    );
    let files = walk_files(root)?
        .into_iter()
        .map(|(path, rel)| {
            let abs = path.canonicalize().unwrap_or(path);
            (abs.display().to_string(), rel)
        })
        .collect();
    build_entries(files, partitioning)
}

#[cfg(feature = "s3")]
pub async fn list_s3(
    client: &crate::s3::S3Client,
    bucket: &str,
    prefix: &str,
    partitioning: &Partitioning,
) -> Result<Vec<SourceEntry>> {
    let p = prefix.trim_matches('/');
    let base = partitioning.base_dir.trim_matches('/');
    let list_prefix = [p, base]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    let objects = crate::s3::list_objects(client, bucket, &list_prefix).await?;
    let files = objects
        .into_iter()
        .map(|(key, _size)| {
            let rel = if p.is_empty() {
                key.trim_start_matches('/').to_string()
            } else {
                key.strip_prefix(p)
                    .unwrap_or(&key)
                    .trim_start_matches('/')
                    .to_string()
            };
            (format!("s3://{bucket}/{key}"), rel)
        })
        .collect();
    build_entries(files, partitioning)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(rels: &[&str]) -> Vec<(String, String)> {
        rels.iter()
            .map(|r| (format!("/data/{r}"), r.to_string()))
            .collect()
    }

    #[test]
    fn labels_come_from_parent_directory() -> Result<()> {
        let p = Partitioning::dir("class");
        assert_eq!(label_for_rel(&p, "cat/b.png")?, "cat");
        assert!(label_for_rel(&p, "loose.png").is_err());
        let nested = label_for_rel(&p, "animals/cat/1.png").unwrap_err();
        assert!(format!("{nested:#}").contains("2 directory levels"), "{nested:#}");
        Ok(())
    }

    #[test]
    fn base_dir_is_stripped() -> Result<()> {
        let p = Partitioning {
            base_dir: "train/".into(),
            field: "class".into(),
        };
        assert_eq!(label_for_rel(&p, "train/dog/1.jpg")?, "dog");
        assert_eq!(strip_base_dir(&p, "train/dog/1.jpg"), Some("dog/1.jpg"));
        assert_eq!(strip_base_dir(&p, "training/dog/1.jpg"), None);
        assert!(label_for_rel(&p, "val/dog/1.jpg").is_err());
        Ok(())
    }

    #[test]
    fn files_outside_base_dir_are_skipped() -> Result<()> {
        let p = Partitioning {
            base_dir: "train".into(),
            field: "class".into(),
        };
        let entries = build_entries(
            files(&["val/cat/1.png", "train/cat/1.png", "training/dog/2.png", "train/dog/1.png"]),
            &p,
        )?;
        let rels: Vec<&str> = entries.iter().map(|e| e.rel.as_str()).collect();
        assert_eq!(rels, vec!["train/cat/1.png", "train/dog/1.png"]);
        let labels: Vec<&str> = entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["cat", "dog"]);
        assert_eq!(entries[1].sample_id, 1);
        Ok(())
    }

    #[test]
    fn entries_are_filtered_sorted_and_dense() -> Result<()> {
        let entries = build_entries(
            files(&[
                "dog/2.JPG",
                "cat/1.png",
                "cat/notes.txt",
                "cat/.hidden.png",
                ".cache/x.png",
                "dog/1.jpeg",
            ]),
            &Partitioning::default(),
        )?;
        let rels: Vec<&str> = entries.iter().map(|e| e.rel.as_str()).collect();
        assert_eq!(rels, vec!["cat/1.png", "dog/1.jpeg", "dog/2.JPG"]);
        let ids: Vec<u64> = entries.iter().map(|e| e.sample_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(entries[2].label, "dog");
        Ok(())
    }
}
