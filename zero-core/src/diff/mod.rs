//! Diff engine — classify findings between two scans.
//!
//! Both scans' snapshotted artifacts are fingerprinted; set differences
//! give `new` and `fixed`, and a new/fixed pair sharing everything but
//! its location key is reclassified as `moved`. The summary weights
//! severity deltas into a coarse risk trend.

mod fingerprint;

pub use fingerprint::{Fingerprint, bucket_line, collapse_whitespace, fingerprint, normalize_path};

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{DiffError, Result};
use crate::store::ArtifactStore;
use crate::types::{Finding, RepoId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaFinding {
    pub fingerprint: String,
    #[serde(flatten)]
    pub finding: Finding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovedFinding {
    pub fingerprint: String,
    #[serde(flatten)]
    pub finding: Finding,
    pub from_location: String,
    pub to_location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTrend {
    Improving,
    Degrading,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub new_count: usize,
    pub fixed_count: usize,
    pub moved_count: usize,
    pub unchanged_count: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub new_by_severity: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fixed_by_severity: BTreeMap<String, u64>,
    /// Positive means risk went up between baseline and compare.
    pub risk_score_delta: i64,
    pub risk_trend: RiskTrend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanDelta {
    pub repository: String,
    pub baseline_scan_id: u64,
    pub compare_scan_id: u64,
    pub new: Vec<DeltaFinding>,
    pub fixed: Vec<DeltaFinding>,
    pub moved: Vec<MovedFinding>,
    pub unchanged_count: usize,
    pub summary: DeltaSummary,
}

#[derive(Debug)]
pub struct DiffEngine {
    store: ArtifactStore,
    line_bucket: u32,
    history_enabled: bool,
}

impl DiffEngine {
    pub fn new(store: ArtifactStore, line_bucket: u32, history_enabled: bool) -> Self {
        Self {
            store,
            line_bucket,
            history_enabled,
        }
    }

    /// Diff two snapshotted scans of one repository.
    #[instrument(skip(self), fields(repo = %repo))]
    pub fn diff(&self, repo: &RepoId, baseline_id: u64, compare_id: u64) -> Result<ScanDelta> {
        if !self.history_enabled {
            return Err(DiffError::HistoryDisabled.into());
        }
        let baseline = self.load_findings(repo, baseline_id)?;
        let compare = self.load_findings(repo, compare_id)?;
        Ok(classify(repo, baseline_id, compare_id, baseline, compare))
    }

    fn load_findings(
        &self,
        repo: &RepoId,
        scan_id: u64,
    ) -> Result<HashMap<String, (Fingerprint, Finding)>> {
        if !self.store.history_exists(repo, scan_id) {
            return Err(DiffError::ScanNotFound {
                repo: repo.to_string(),
                scan_id,
            }
            .into());
        }
        let mut findings = HashMap::new();
        for envelope in self.store.read_history(repo, scan_id)? {
            for finding in envelope.findings {
                let fp = fingerprint(&finding, self.line_bucket);
                findings.entry(fp.full()).or_insert((fp, finding));
            }
        }
        Ok(findings)
    }
}

fn classify(
    repo: &RepoId,
    baseline_id: u64,
    compare_id: u64,
    baseline: HashMap<String, (Fingerprint, Finding)>,
    compare: HashMap<String, (Fingerprint, Finding)>,
) -> ScanDelta {
    let mut new: Vec<(String, Fingerprint, Finding)> = compare
        .iter()
        .filter(|(key, _)| !baseline.contains_key(*key))
        .map(|(key, (fp, finding))| (key.clone(), fp.clone(), finding.clone()))
        .collect();
    let mut fixed: Vec<(String, Fingerprint, Finding)> = baseline
        .iter()
        .filter(|(key, _)| !compare.contains_key(*key))
        .map(|(key, (fp, finding))| (key.clone(), fp.clone(), finding.clone()))
        .collect();
    let unchanged_count = compare
        .keys()
        .filter(|key| baseline.contains_key(*key))
        .count();

    // A "new" finding whose scanner/rule/content matches a "fixed" one
    // at a different location moved rather than appeared.
    let mut moved = Vec::new();
    let mut fixed_by_match: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, (_, fp, _)) in fixed.iter().enumerate() {
        fixed_by_match.entry(fp.match_key()).or_default().push(i);
    }
    let mut fixed_taken = vec![false; fixed.len()];
    let mut new_taken = vec![false; new.len()];
    for (i, (_, fp, finding)) in new.iter().enumerate() {
        let Some(candidates) = fixed_by_match.get(&fp.match_key()) else {
            continue;
        };
        let partner = candidates.iter().find(|&&j| {
            !fixed_taken[j] && fixed[j].1.location_key != fp.location_key
        });
        if let Some(&j) = partner {
            fixed_taken[j] = true;
            new_taken[i] = true;
            moved.push(MovedFinding {
                fingerprint: fp.full(),
                finding: finding.clone(),
                from_location: fixed[j].1.location_key.clone(),
                to_location: fp.location_key.clone(),
            });
        }
    }
    let new: Vec<DeltaFinding> = new
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !new_taken[*i])
        .map(|(_, (key, _, finding))| DeltaFinding {
            fingerprint: key,
            finding,
        })
        .collect();
    let fixed: Vec<DeltaFinding> = fixed
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !fixed_taken[*i])
        .map(|(_, (key, _, finding))| DeltaFinding {
            fingerprint: key,
            finding,
        })
        .collect();

    let summary = summarize(&new, &fixed, moved.len(), unchanged_count);
    ScanDelta {
        repository: repo.to_string(),
        baseline_scan_id: baseline_id,
        compare_scan_id: compare_id,
        new,
        fixed,
        moved,
        unchanged_count,
        summary,
    }
}

fn summarize(
    new: &[DeltaFinding],
    fixed: &[DeltaFinding],
    moved_count: usize,
    unchanged_count: usize,
) -> DeltaSummary {
    let severity_histogram = |findings: &[DeltaFinding]| {
        let mut map = BTreeMap::new();
        for delta in findings {
            *map.entry(delta.finding.severity.to_string()).or_insert(0) += 1;
        }
        map
    };
    let weight_sum = |findings: &[DeltaFinding]| {
        findings
            .iter()
            .map(|delta| delta.finding.severity.weight())
            .sum::<i64>()
    };

    let risk_score_delta = weight_sum(new) - weight_sum(fixed);
    let risk_trend = match risk_score_delta.cmp(&0) {
        std::cmp::Ordering::Greater => RiskTrend::Degrading,
        std::cmp::Ordering::Less => RiskTrend::Improving,
        std::cmp::Ordering::Equal => RiskTrend::Stable,
    };

    DeltaSummary {
        new_count: new.len(),
        fixed_count: fixed.len(),
        moved_count,
        unchanged_count,
        new_by_severity: severity_histogram(new),
        fixed_by_severity: severity_histogram(fixed),
        risk_score_delta,
        risk_trend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::types::{ArtifactEnvelope, Confidence, Evidence, Location, Severity};

    fn engine() -> (tempfile::TempDir, ArtifactStore, DiffEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let engine = DiffEngine::new(store.clone(), 5, true);
        (dir, store, engine)
    }

    fn repo() -> RepoId {
        "acme/widget".parse().unwrap()
    }

    fn finding(id: &str, file: &str, line: u32, matched: &str, severity: Severity) -> Finding {
        Finding {
            id: id.into(),
            title: format!("finding {id}"),
            description: String::new(),
            category: "secret".into(),
            scanner: "secrets".into(),
            severity,
            confidence: Confidence::High,
            location: Some(Location {
                file: file.into(),
                line: Some(line),
                end_line: None,
                column: None,
                snippet: None,
            }),
            evidence: Some(Evidence {
                fingerprint: None,
                file_path: Some(file.into()),
                matched_text: Some(matched.into()),
            }),
            metadata: serde_json::Map::new(),
        }
    }

    fn snapshot(store: &ArtifactStore, scan_id: u64, findings: Vec<Finding>) {
        let envelope = ArtifactEnvelope {
            analyzer: "secrets".into(),
            version: "1.0.0".into(),
            timestamp: Utc::now(),
            repository: "acme/widget".into(),
            duration_seconds: 0.1,
            summary: serde_json::json!({"total": findings.len()}),
            findings,
            recommendations: vec![],
        };
        store.write_envelope(&repo(), &envelope).unwrap();
        store.snapshot_scan(&repo(), scan_id).unwrap();
    }

    #[test]
    fn moved_and_fixed_are_distinguished() {
        let (_dir, store, engine) = engine();
        // Baseline: two findings. Compare: one moved files, one removed.
        snapshot(
            &store,
            1,
            vec![
                finding("a", "src/old.rs", 10, "AKIA-MOVED", Severity::High),
                finding("b", "src/gone.rs", 20, "AKIA-GONE", Severity::Critical),
                finding("c", "src/same.rs", 5, "AKIA-SAME", Severity::Low),
            ],
        );
        snapshot(
            &store,
            2,
            vec![
                finding("a", "src/new.rs", 90, "AKIA-MOVED", Severity::High),
                finding("c", "src/same.rs", 5, "AKIA-SAME", Severity::Low),
            ],
        );

        let delta = engine.diff(&repo(), 1, 2).unwrap();
        assert_eq!(delta.summary.new_count, 0);
        assert_eq!(delta.summary.fixed_count, 1);
        assert_eq!(delta.summary.moved_count, 1);
        assert_eq!(delta.summary.unchanged_count, 1);
        assert_eq!(delta.moved[0].from_location, "src/old.rs:1");
        assert_eq!(delta.moved[0].to_location, "src/new.rs:17");
        // The removed finding was critical, so risk improved
        assert_eq!(delta.summary.risk_trend, RiskTrend::Improving);
        assert_eq!(delta.summary.risk_score_delta, -10);
    }

    #[test]
    fn diff_is_symmetric_modulo_moves() {
        let (_dir, store, engine) = engine();
        snapshot(
            &store,
            1,
            vec![finding("a", "src/a.rs", 1, "ONE", Severity::Medium)],
        );
        snapshot(
            &store,
            2,
            vec![finding("b", "src/b.rs", 1, "TWO", Severity::Medium)],
        );

        let forward = engine.diff(&repo(), 1, 2).unwrap();
        let backward = engine.diff(&repo(), 2, 1).unwrap();
        let keys = |findings: &[DeltaFinding]| {
            let mut keys: Vec<String> =
                findings.iter().map(|d| d.fingerprint.clone()).collect();
            keys.sort();
            keys
        };
        assert_eq!(keys(&forward.new), keys(&backward.fixed));
        assert_eq!(keys(&forward.fixed), keys(&backward.new));
        assert_eq!(
            forward.summary.risk_score_delta,
            -backward.summary.risk_score_delta
        );
    }

    #[test]
    fn identical_scans_are_stable() {
        let (_dir, store, engine) = engine();
        let findings = vec![
            finding("a", "src/a.rs", 1, "ONE", Severity::High),
            finding("b", "src/b.rs", 9, "TWO", Severity::Low),
        ];
        snapshot(&store, 1, findings.clone());
        snapshot(&store, 2, findings);

        let delta = engine.diff(&repo(), 1, 2).unwrap();
        assert_eq!(delta.summary.new_count, 0);
        assert_eq!(delta.summary.fixed_count, 0);
        assert_eq!(delta.summary.unchanged_count, 2);
        assert_eq!(delta.summary.risk_trend, RiskTrend::Stable);
    }

    #[test]
    fn new_critical_finding_degrades() {
        let (_dir, store, engine) = engine();
        snapshot(&store, 1, vec![]);
        snapshot(
            &store,
            2,
            vec![finding("a", "src/a.rs", 1, "NEW", Severity::Critical)],
        );
        let delta = engine.diff(&repo(), 1, 2).unwrap();
        assert_eq!(delta.summary.risk_trend, RiskTrend::Degrading);
        assert_eq!(delta.summary.new_by_severity["critical"], 1);
    }

    #[test]
    fn unknown_scan_id_is_not_found() {
        let (_dir, store, engine) = engine();
        snapshot(&store, 1, vec![]);
        let err = engine.diff(&repo(), 1, 99).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ZeroError::Diff(DiffError::ScanNotFound { scan_id: 99, .. })
        ));
    }

    #[test]
    fn disabled_history_refuses_to_diff() {
        let (_dir, store, _) = engine();
        let engine = DiffEngine::new(store, 5, false);
        let err = engine.diff(&repo(), 1, 2).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ZeroError::Diff(DiffError::HistoryDisabled)
        ));
    }
}
