//! Artifact store — the filesystem is the source of truth.
//!
//! The store enforces write atomicity only; mutual exclusion of writers
//! for the same `(repo, analyzer)` is the scheduler's single-owner
//! invariant. Rename is the read/write boundary: a reader sees either
//! the previous artifact or the new one, never a partial file.

mod layout;

pub use layout::Layout;

use std::io::Write as _;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::types::{ArtifactEnvelope, RepoId, ScanRecord};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: Layout,
}

impl ArtifactStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            layout: Layout::new(root),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    // ── Artifacts ──────────────────────────────────────────────────

    /// Atomically replace `<repo>/analysis/<analyzer>.json`. A failure
    /// anywhere before the final rename leaves the previous artifact
    /// intact.
    pub fn write(&self, repo: &RepoId, analyzer: &str, json: &serde_json::Value) -> Result<()> {
        let path = self.layout.artifact_path(repo, analyzer);
        let bytes = serde_json::to_vec_pretty(json).map_err(StoreError::Serialization)?;
        self.atomic_write(&path, &bytes)?;
        debug!(repo = %repo, analyzer, bytes = bytes.len(), "artifact written");
        Ok(())
    }

    pub fn write_envelope(&self, repo: &RepoId, envelope: &ArtifactEnvelope) -> Result<()> {
        let value = serde_json::to_value(envelope).map_err(StoreError::Serialization)?;
        self.write(repo, &envelope.analyzer, &value)
    }

    /// Read an artifact. A missing or corrupted file is `ArtifactNotFound`;
    /// corruption is logged but downstream readers see absence.
    pub fn read(&self, repo: &RepoId, analyzer: &str) -> Result<serde_json::Value> {
        let path = self.layout.artifact_path(repo, analyzer);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ArtifactNotFound {
                    repo: repo.to_string(),
                    analyzer: analyzer.to_string(),
                }
                .into());
            }
            Err(e) => return Err(io_err(&path, e).into()),
        };
        match serde_json::from_str(&text) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(repo = %repo, analyzer, error = %e, "corrupted artifact treated as absent");
                Err(StoreError::ArtifactNotFound {
                    repo: repo.to_string(),
                    analyzer: analyzer.to_string(),
                }
                .into())
            }
        }
    }

    pub fn read_envelope(&self, repo: &RepoId, analyzer: &str) -> Result<ArtifactEnvelope> {
        let value = self.read(repo, analyzer)?;
        serde_json::from_value(value).map_err(|e| {
            warn!(repo = %repo, analyzer, error = %e, "artifact does not match envelope shape");
            StoreError::ArtifactNotFound {
                repo: repo.to_string(),
                analyzer: analyzer.to_string(),
            }
            .into()
        })
    }

    pub fn exists(&self, repo: &RepoId, analyzer: &str) -> bool {
        self.layout.artifact_path(repo, analyzer).is_file()
    }

    /// Analyzer names with a current artifact, sorted.
    pub fn list(&self, repo: &RepoId) -> Result<Vec<String>> {
        let dir = self.layout.analysis_dir(repo);
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(io_err(&dir, e).into()),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Repositories with any state under the root, as `owner/name` keys.
    pub fn list_repos(&self) -> Result<Vec<RepoId>> {
        let root = self.layout.root();
        let mut repos = Vec::new();
        let owners = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(repos),
            Err(e) => return Err(io_err(root, e).into()),
        };
        for owner in owners {
            let owner = owner.map_err(|e| io_err(root, e))?;
            if !owner.path().is_dir() {
                continue;
            }
            let Some(owner_name) = owner.file_name().to_str().map(String::from) else {
                continue;
            };
            let names = std::fs::read_dir(owner.path()).map_err(|e| io_err(&owner.path(), e))?;
            for name in names {
                let name = name.map_err(|e| io_err(&owner.path(), e))?;
                if name.path().is_dir() {
                    if let Some(repo_name) = name.file_name().to_str() {
                        repos.push(RepoId::new(owner_name.clone(), repo_name));
                    }
                }
            }
        }
        repos.sort_by_key(RepoId::key);
        Ok(repos)
    }

    /// Recursively remove the repo directory. Idempotent.
    pub fn delete(&self, repo: &RepoId) -> Result<()> {
        let dir = self.layout.repo_dir(repo);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir, e).into()),
        }
    }

    // ── Scan records ───────────────────────────────────────────────

    pub fn list_scans(&self, repo: &RepoId) -> Result<Vec<ScanRecord>> {
        let path = self.layout.scans_path(repo);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&path, e).into()),
        };
        serde_json::from_str(&text).map_err(|e| StoreError::Serialization(e).into())
    }

    pub fn get_scan(&self, repo: &RepoId, scan_id: u64) -> Result<Option<ScanRecord>> {
        Ok(self
            .list_scans(repo)?
            .into_iter()
            .find(|record| record.scan_id == scan_id))
    }

    /// Next monotonic scan id for this repository.
    pub fn next_scan_id(&self, repo: &RepoId) -> Result<u64> {
        let max = self
            .list_scans(repo)?
            .iter()
            .map(|record| record.scan_id)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    pub fn append_scan(&self, record: &ScanRecord) -> Result<()> {
        let mut scans = self.list_scans(&record.repository)?;
        scans.push(record.clone());
        let path = self.layout.scans_path(&record.repository);
        let bytes = serde_json::to_vec_pretty(&scans).map_err(StoreError::Serialization)?;
        self.atomic_write(&path, &bytes)
    }

    // ── History snapshots ──────────────────────────────────────────

    /// Copy the current analysis artifacts into `history/<scan_id>/` so
    /// the diff engine can compare this scan against any other.
    pub fn snapshot_scan(&self, repo: &RepoId, scan_id: u64) -> Result<()> {
        let dest = self.layout.history_dir(repo, scan_id);
        std::fs::create_dir_all(&dest).map_err(|e| io_err(&dest, e))?;
        for analyzer in self.list(repo)? {
            let from = self.layout.artifact_path(repo, &analyzer);
            let to = dest.join(format!("{analyzer}.json"));
            std::fs::copy(&from, &to).map_err(|e| io_err(&to, e))?;
        }
        Ok(())
    }

    pub fn history_exists(&self, repo: &RepoId, scan_id: u64) -> bool {
        self.layout.history_dir(repo, scan_id).is_dir()
    }

    /// All envelopes snapshotted for one scan. Non-envelope files are
    /// skipped the same way corrupted artifacts are.
    pub fn read_history(&self, repo: &RepoId, scan_id: u64) -> Result<Vec<ArtifactEnvelope>> {
        let dir = self.layout.history_dir(repo, scan_id);
        let mut envelopes = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            match serde_json::from_str::<ArtifactEnvelope>(&text) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed snapshot");
                }
            }
        }
        envelopes.sort_by(|a, b| a.analyzer.cmp(&b.analyzer));
        Ok(envelopes)
    }

    // ── Internals ──────────────────────────────────────────────────

    pub(crate) fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .expect("artifact paths always have a parent directory");
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
        tmp.write_all(bytes).map_err(|e| io_err(path, e))?;
        tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
        tmp.persist(path)
            .map_err(|e| io_err(path, e.error))?;
        Ok(())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
