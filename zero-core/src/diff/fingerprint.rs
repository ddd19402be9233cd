//! Finding fingerprints.
//!
//! A fingerprint identifies a finding across scans:
//! `(scanner, rule_id, location_key, content_hash)`. Paths lose their
//! absolute prefix, lines are bucketed to tolerate cosmetic shifts, and
//! the matched text is whitespace-collapsed before hashing so
//! reformatting does not read as a new finding.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Finding;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub scanner: String,
    pub rule_id: String,
    pub location_key: String,
    pub content_hash: String,
}

impl Fingerprint {
    /// Stable identity over all four components.
    pub fn full(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.scanner.as_bytes());
        hasher.update([0]);
        hasher.update(self.rule_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.location_key.as_bytes());
        hasher.update([0]);
        hasher.update(self.content_hash.as_bytes());
        hex(&hasher.finalize())
    }

    /// Identity ignoring location — what a finding keeps when its file
    /// moves. Used to reclassify new+fixed pairs as moved.
    pub fn match_key(&self) -> String {
        format!("{}\u{0}{}\u{0}{}", self.scanner, self.rule_id, self.content_hash)
    }
}

/// Compute the fingerprint of a finding with the given line bucket size.
pub fn fingerprint(finding: &Finding, line_bucket: u32) -> Fingerprint {
    Fingerprint {
        scanner: finding.scanner.clone(),
        rule_id: rule_id(finding),
        location_key: location_key(finding, line_bucket),
        content_hash: content_hash(finding),
    }
}

/// `metadata["rule_id"]` when the analyzer provides one, otherwise the
/// normalized title.
fn rule_id(finding: &Finding) -> String {
    finding
        .metadata
        .get("rule_id")
        .and_then(|v| v.as_str())
        .map_or_else(
            || collapse_whitespace(&finding.title).to_lowercase(),
            ToString::to_string,
        )
}

fn location_key(finding: &Finding, line_bucket: u32) -> String {
    let file = finding
        .location
        .as_ref()
        .map(|l| l.file.as_str())
        .or_else(|| {
            finding
                .evidence
                .as_ref()
                .and_then(|e| e.file_path.as_deref())
        });
    let Some(file) = file else {
        return String::new();
    };
    let path = normalize_path(file);
    match finding.location.as_ref().and_then(|l| l.line) {
        Some(line) => format!("{path}:{}", bucket_line(line, line_bucket)),
        None => path,
    }
}

/// Bucket a 1-based line number: lines within the same window of
/// `bucket` lines share a key.
pub fn bucket_line(line: u32, bucket: u32) -> u32 {
    let bucket = bucket.max(1);
    line.saturating_sub(1) / bucket
}

/// Forward slashes, no `.` segments, no absolute prefix.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn content_hash(finding: &Finding) -> String {
    let text = finding
        .evidence
        .as_ref()
        .and_then(|e| e.matched_text.as_deref())
        .or_else(|| {
            finding
                .location
                .as_ref()
                .and_then(|l| l.snippet.as_deref())
        })
        .unwrap_or("");
    let mut hasher = Sha256::new();
    hasher.update(collapse_whitespace(text).as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
