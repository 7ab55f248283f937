//! Class-name tables in `labels.tsv` form.
//!
//! ```text
//! schema_version=1
//! 0<TAB>cat
//! 1<TAB>tabby%20cat
//! ```
//!
//! Names are percent-encoded so tabs and newlines survive a round trip.

use anyhow::{Context, Result};

pub const LABELS_SCHEMA_VERSION: u32 = 1;

pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

pub fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let hex = bytes
            .get(i + 1..i + 3)
            .context("bad percent-encoding (truncated)")?;
        let v = std::str::from_utf8(hex)
            .ok()
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .context("bad percent-encoding")?;
        out.push(v);
        i += 3;
    }
    Ok(String::from_utf8(out)?)
}

/// Parses a labels table into names indexed by class id.
///
/// Ids must be dense from 0; duplicates and gaps are rejected.
pub fn parse_labels_tsv(bytes: &[u8]) -> Result<Vec<String>> {
    let s = std::str::from_utf8(bytes)?;
    let mut lines = s.lines();
    let first = lines
        .by_ref()
        .find(|l| !l.trim().is_empty())
        .context("empty labels.tsv")?;

    let Some((k, v)) = first.split_once('=') else {
        anyhow::bail!("labels header missing schema_version");
    };
    anyhow::ensure!(
        k.trim() == "schema_version",
        "labels header must be schema_version=<n>"
    );
    let schema_version: u32 = v.trim().parse().context("invalid schema_version")?;
    anyhow::ensure!(
        schema_version == LABELS_SCHEMA_VERSION,
        "unsupported labels schema_version {schema_version}"
    );

    let mut items: Vec<(usize, String)> = Vec::new();
    for (line_no, raw) in lines.enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((id_s, label_enc)) = line.split_once('\t') else {
            anyhow::bail!("labels line {}: expected id<TAB>label", line_no + 2);
        };
        let id: usize = id_s
            .trim()
            .parse()
            .with_context(|| format!("labels line {}: bad label_id", line_no + 2))?;
        items.push((id, percent_decode(label_enc.trim())?));
    }

    items.sort_by_key(|(id, _)| *id);
    let mut labels: Vec<String> = Vec::with_capacity(items.len());
    for (id, label) in items {
        anyhow::ensure!(id >= labels.len(), "duplicate label_id {id}");
        anyhow::ensure!(id == labels.len(), "missing label_id {}", labels.len());
        labels.push(label);
    }
    Ok(labels)
}

pub fn render_labels_tsv(labels: &[String]) -> Vec<u8> {
    let mut bytes: Vec<u8> = Vec::with_capacity(labels.len() * 16 + 20);
    bytes.extend_from_slice(format!("schema_version={LABELS_SCHEMA_VERSION}\n").as_bytes());
    for (id, label) in labels.iter().enumerate() {
        bytes.extend_from_slice(id.to_string().as_bytes());
        bytes.push(b'\t');
        bytes.extend_from_slice(percent_encode(label).as_bytes());
        bytes.push(b'\n');
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sorted_and_decodes_names() -> Result<()> {
        let tsv = b"schema_version=1\n1\ttabby%20cat\n# comment\n0\tdog\n";
        let labels = parse_labels_tsv(tsv)?;
        assert_eq!(labels, vec!["dog".to_string(), "tabby cat".to_string()]);
        Ok(())
    }

    #[test]
    fn rejects_gaps_and_duplicates() {
        assert!(parse_labels_tsv(b"schema_version=1\n0\ta\n2\tc\n").is_err());
        assert!(parse_labels_tsv(b"schema_version=1\n0\ta\n0\tb\n").is_err());
    }

    #[test]
    fn rejects_unknown_schema() {
        let err = parse_labels_tsv(b"schema_version=7\n0\ta\n").unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn render_then_parse_keeps_awkward_names() -> Result<()> {
        let labels = vec!["a\tb".to_string(), "ü/ß".to_string()];
        assert_eq!(parse_labels_tsv(&render_labels_tsv(&labels))?, labels);
        Ok(())
    }
}
