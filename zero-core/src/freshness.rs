//! Freshness engine — decides whether analyzer runs can be skipped.
//!
//! Per-repo metadata lives in `<repo>/freshness.json`. Age classification
//! is monotone in wall-clock time for a fixed last scan, and `record`
//! only stamps units the scheduler reports as complete or failed —
//! skipped units keep their prior stamp.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FreshnessSection;
use crate::error::{Result, StoreError};
use crate::store::ArtifactStore;
use crate::types::{RepoId, ScanRecord, UnitState};

/// Artifact age classification against the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeLevel {
    Fresh,
    Stale,
    VeryStale,
    Expired,
}

impl AgeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::VeryStale => "very_stale",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for AgeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted per-unit stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStamp {
    pub last_run: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// On-disk shape of `freshness.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FreshnessFile {
    #[serde(default)]
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub scanner_status: BTreeMap<String, UnitStamp>,
}

/// Per-unit view inside a [`FreshnessReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitAge {
    pub level: AgeLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessReport {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<DateTime<Utc>>,
    pub level: AgeLevel,
    pub needs_refresh: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_changed: Option<bool>,
    pub units: BTreeMap<String, UnitAge>,
}

/// Inputs to a skip decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipQuery<'a> {
    pub check_commit: bool,
    pub current_commit: Option<&'a str>,
    pub force: bool,
}

#[derive(Debug)]
pub struct FreshnessEngine {
    store: ArtifactStore,
    thresholds: FreshnessSection,
    // Serializes read-modify-write of one repo's freshness file. Scans of
    // the same repo are already exclusive; this covers API-side writers.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FreshnessEngine {
    pub fn new(store: ArtifactStore, thresholds: FreshnessSection) -> Self {
        Self {
            store,
            thresholds,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> &FreshnessSection {
        &self.thresholds
    }

    /// Classify an age against the thresholds.
    pub fn classify(&self, age: Duration) -> AgeLevel {
        let hours = |h: u64| {
            i64::try_from(h)
                .ok()
                .and_then(Duration::try_hours)
                .unwrap_or(Duration::MAX)
        };
        let days = |d: u64| {
            i64::try_from(d)
                .ok()
                .and_then(Duration::try_days)
                .unwrap_or(Duration::MAX)
        };
        if age <= hours(self.thresholds.fresh_hours) {
            AgeLevel::Fresh
        } else if age <= days(self.thresholds.stale_days) {
            AgeLevel::Stale
        } else if age <= days(self.thresholds.very_stale_days) {
            AgeLevel::VeryStale
        } else {
            AgeLevel::Expired
        }
    }

    fn classify_since(&self, instant: Option<DateTime<Utc>>, now: DateTime<Utc>) -> AgeLevel {
        match instant {
            Some(then) => self.classify(now - then),
            None => AgeLevel::Expired,
        }
    }

    pub fn load(&self, repo: &RepoId) -> Result<FreshnessFile> {
        let path = self.store.layout().freshness_path(repo);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FreshnessFile::default());
            }
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                }
                .into());
            }
        };
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }

    fn save(&self, repo: &RepoId, file: &FreshnessFile) -> Result<()> {
        let path = self.store.layout().freshness_path(repo);
        let bytes = serde_json::to_vec_pretty(file).map_err(StoreError::Serialization)?;
        self.store.atomic_write(&path, &bytes)
    }

    /// Full freshness breakdown for a repo.
    pub fn check(&self, repo: &RepoId, current_commit: Option<&str>) -> Result<FreshnessReport> {
        let file = self.load(repo)?;
        let now = Utc::now();
        let level = self.classify_since(file.last_scan, now);

        let commit_changed = match (current_commit, file.commit_sha.as_deref()) {
            (Some(current), Some(recorded)) => Some(current != recorded),
            _ => None,
        };

        let mut units = BTreeMap::new();
        let mut any_failed = false;
        for (unit, stamp) in &file.scanner_status {
            if !stamp.success {
                any_failed = true;
            }
            units.insert(
                unit.clone(),
                UnitAge {
                    level: self.classify_since(Some(stamp.last_run), now),
                    last_run: Some(stamp.last_run),
                    success: stamp.success,
                    error: stamp.error.clone(),
                },
            );
        }

        let needs_refresh =
            level != AgeLevel::Fresh || commit_changed == Some(true) || any_failed;

        Ok(FreshnessReport {
            repository: repo.to_string(),
            last_scan: file.last_scan,
            level,
            needs_refresh,
            commit_changed,
            units,
        })
    }

    /// Decide whether `unit` must run. Returns the decision plus the
    /// reason string recorded on skipped units.
    pub fn should_scan(
        &self,
        repo: &RepoId,
        unit: &str,
        query: SkipQuery<'_>,
    ) -> Result<(bool, String)> {
        if query.force {
            return Ok((true, "forced".into()));
        }
        if !self.store.exists(repo, unit) {
            return Ok((true, "no-artifact".into()));
        }

        let file = self.load(repo)?;
        let Some(stamp) = file.scanner_status.get(unit) else {
            return Ok((true, "no-record".into()));
        };
        if !stamp.success {
            return Ok((true, "previous-failure".into()));
        }

        if query.check_commit {
            if let (Some(current), Some(recorded)) =
                (query.current_commit, file.commit_sha.as_deref())
            {
                if current != recorded {
                    return Ok((true, "commit-changed".into()));
                }
            }
        }

        let level = self.classify(Utc::now() - stamp.last_run);
        if level == AgeLevel::Fresh {
            Ok((false, "fresh".into()))
        } else {
            Ok((true, level.as_str().into()))
        }
    }

    /// Stamp the units a completed scan actually ran. Skipped units keep
    /// whatever stamp they had.
    pub fn record(&self, record: &ScanRecord) -> Result<()> {
        let repo = &record.repository;
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(repo.key()).or_default())
        };
        let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = self.load(repo)?;
        file.repository = repo.to_string();
        file.last_scan = Some(record.finished_at);
        if record.commit_sha.is_some() {
            file.commit_sha = record.commit_sha.clone();
        }

        for (name, report) in &record.units {
            match report.state {
                UnitState::Complete | UnitState::Failed => {
                    file.scanner_status.insert(
                        name.clone(),
                        UnitStamp {
                            last_run: record.finished_at,
                            success: report.state == UnitState::Complete,
                            duration_seconds: report.duration_seconds.unwrap_or(0.0),
                            finding_count: report.finding_count,
                            output_file: report.output_file.clone(),
                            error: report.error.clone(),
                        },
                    );
                }
                // pending/running never reach a persisted record
                UnitState::Skipped | UnitState::Pending | UnitState::Running => {}
            }
        }

        self.save(repo, &file)
    }

    pub fn delete(&self, repo: &RepoId) -> Result<()> {
        let path = self.store.layout().freshness_path(repo);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io {
                path: path.display().to_string(),
                source: e,
            }
            .into()),
        }
    }
}
