//! Suppression and feedback.
//!
//! Analyst verdicts are keyed by finding fingerprint and persisted at
//! the state root. On top of verdicts, declarative context rules drop
//! low-value findings by path: a medium-severity secret in a test
//! fixture is noise, the same secret in `src/` is not.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diff::{fingerprint, normalize_path};
use crate::error::{Result, StoreError};
use crate::store::ArtifactStore;
use crate::types::{Finding, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    TruePositive,
    FalsePositive,
    AcceptedRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub fingerprint: String,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fingerprint-keyed verdict store backed by `<root>/feedback.json`.
#[derive(Debug)]
pub struct FeedbackStore {
    store: ArtifactStore,
    path: PathBuf,
    records: Mutex<BTreeMap<String, FeedbackRecord>>,
}

impl FeedbackStore {
    pub fn open(store: ArtifactStore) -> Result<Self> {
        let path = store.layout().feedback_path();
        let records = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                }
                .into());
            }
        };
        Ok(Self {
            store,
            path,
            records: Mutex::new(records),
        })
    }

    pub fn record(
        &self,
        fingerprint: impl Into<String>,
        verdict: Verdict,
        note: Option<String>,
    ) -> Result<FeedbackRecord> {
        let fingerprint = fingerprint.into();
        let record = FeedbackRecord {
            fingerprint: fingerprint.clone(),
            verdict,
            note,
            created_at: Utc::now(),
        };
        let snapshot = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.insert(fingerprint, record.clone());
            records.clone()
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(StoreError::Serialization)?;
        self.store.atomic_write(&self.path, &bytes)?;
        Ok(record)
    }

    pub fn verdict(&self, fingerprint: &str) -> Option<Verdict> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(fingerprint)
            .map(|record| record.verdict)
    }

    pub fn list(&self) -> Vec<FeedbackRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Path-driven suppression rule: findings at or below `max_severity`
/// whose file matches one of the globs are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRule {
    pub name: String,
    pub patterns: Vec<String>,
    pub max_severity: Severity,
}

struct CompiledRule {
    name: String,
    patterns: Vec<glob::Pattern>,
    max_severity: Severity,
}

/// The shipped rule set: test, example, and documentation paths.
pub fn default_rules() -> Vec<ContextRule> {
    vec![
        ContextRule {
            name: "in_test".into(),
            patterns: vec![
                "tests/**".into(),
                "**/tests/**".into(),
                "test/**".into(),
                "**/test/**".into(),
                "**/*_test.*".into(),
                "**/*.test.*".into(),
                "**/spec/**".into(),
            ],
            max_severity: Severity::Medium,
        },
        ContextRule {
            name: "in_example".into(),
            patterns: vec![
                "examples/**".into(),
                "**/examples/**".into(),
                "**/demo/**".into(),
                "**/fixtures/**".into(),
            ],
            max_severity: Severity::Medium,
        },
        ContextRule {
            name: "in_docs".into(),
            patterns: vec!["docs/**".into(), "**/docs/**".into(), "**/*.md".into()],
            max_severity: Severity::Low,
        },
    ]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuppressionSummary {
    pub kept: usize,
    pub suppressed: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_reason: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct SuppressionOutcome {
    pub findings: Vec<Finding>,
    pub summary: SuppressionSummary,
}

pub struct SuppressionService {
    feedback: FeedbackStore,
    rules: Vec<CompiledRule>,
    line_bucket: u32,
}

impl std::fmt::Debug for SuppressionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuppressionService")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

impl SuppressionService {
    pub fn new(feedback: FeedbackStore, rules: Vec<ContextRule>, line_bucket: u32) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| CompiledRule {
                name: rule.name,
                patterns: rule
                    .patterns
                    .iter()
                    .filter_map(|p| glob::Pattern::new(p).ok())
                    .collect(),
                max_severity: rule.max_severity,
            })
            .collect();
        Self {
            feedback,
            rules,
            line_bucket,
        }
    }

    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    /// Filter a finding list. Applying the result again yields the same
    /// list: suppression is a pure filter over stable keys.
    pub fn apply(&self, findings: Vec<Finding>) -> SuppressionOutcome {
        let mut kept = Vec::new();
        let mut by_reason: BTreeMap<String, u64> = BTreeMap::new();

        'next: for finding in findings {
            let fp = fingerprint(&finding, self.line_bucket).full();
            if self.feedback.verdict(&fp) == Some(Verdict::FalsePositive) {
                *by_reason.entry("false_positive".into()).or_insert(0) += 1;
                continue;
            }
            if let Some(path) = finding_path(&finding) {
                let path = normalize_path(&path);
                for rule in &self.rules {
                    if finding.severity.rank() <= rule.max_severity.rank()
                        && rule.patterns.iter().any(|p| p.matches(&path))
                    {
                        debug!(rule = %rule.name, %path, "finding suppressed");
                        *by_reason.entry(rule.name.clone()).or_insert(0) += 1;
                        continue 'next;
                    }
                }
            }
            kept.push(finding);
        }

        let suppressed = by_reason.values().sum::<u64>() as usize;
        let summary = SuppressionSummary {
            kept: kept.len(),
            suppressed,
            by_reason,
        };
        SuppressionOutcome {
            findings: kept,
            summary,
        }
    }
}

fn finding_path(finding: &Finding) -> Option<String> {
    finding
        .location
        .as_ref()
        .map(|l| l.file.clone())
        .or_else(|| {
            finding
                .evidence
                .as_ref()
                .and_then(|e| e.file_path.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confidence, Location};

    fn service() -> (tempfile::TempDir, SuppressionService) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let feedback = FeedbackStore::open(store).unwrap();
        let service = SuppressionService::new(feedback, default_rules(), 5);
        (dir, service)
    }

    fn finding(file: &str, severity: Severity) -> Finding {
        Finding {
            id: "f".into(),
            title: "leaked key".into(),
            description: String::new(),
            category: "secret".into(),
            scanner: "secrets".into(),
            severity,
            confidence: Confidence::Medium,
            location: Some(Location {
                file: file.into(),
                line: Some(10),
                end_line: None,
                column: None,
                snippet: None,
            }),
            evidence: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_paths_suppress_medium_and_below() {
        let (_dir, service) = service();
        let outcome = service.apply(vec![
            finding("tests/fixtures/key.txt", Severity::Medium),
            finding("src/main.rs", Severity::Medium),
        ]);
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].location.as_ref().unwrap().file, "src/main.rs");
        assert_eq!(outcome.summary.by_reason["in_test"], 1);
    }

    #[test]
    fn critical_findings_survive_context_rules() {
        let (_dir, service) = service();
        let outcome = service.apply(vec![finding("tests/key.txt", Severity::Critical)]);
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.summary.suppressed, 0);
    }

    #[test]
    fn false_positive_verdict_drops_the_finding() {
        let (_dir, service) = service();
        let target = finding("src/main.rs", Severity::High);
        let fp = fingerprint(&target, 5).full();
        service
            .feedback()
            .record(fp, Verdict::FalsePositive, Some("sample data".into()))
            .unwrap();

        let outcome = service.apply(vec![target, finding("src/other.rs", Severity::High)]);
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.summary.by_reason["false_positive"], 1);
    }

    #[test]
    fn accepted_risk_is_kept() {
        let (_dir, service) = service();
        let target = finding("src/main.rs", Severity::High);
        let fp = fingerprint(&target, 5).full();
        service
            .feedback()
            .record(fp, Verdict::AcceptedRisk, None)
            .unwrap();
        let outcome = service.apply(vec![target]);
        assert_eq!(outcome.findings.len(), 1);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let (_dir, service) = service();
        let input = vec![
            finding("tests/a.rs", Severity::Low),
            finding("src/a.rs", Severity::High),
            finding("docs/README.md", Severity::Low),
        ];
        let once = service.apply(input);
        let twice = service.apply(once.findings.clone());
        assert_eq!(once.findings.len(), twice.findings.len());
        assert_eq!(twice.summary.suppressed, 0);
    }

    #[test]
    fn verdicts_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        {
            let feedback = FeedbackStore::open(store.clone()).unwrap();
            feedback
                .record("abc123", Verdict::FalsePositive, None)
                .unwrap();
        }
        let feedback = FeedbackStore::open(store).unwrap();
        assert_eq!(feedback.verdict("abc123"), Some(Verdict::FalsePositive));
        assert_eq!(feedback.list().len(), 1);
    }
}
