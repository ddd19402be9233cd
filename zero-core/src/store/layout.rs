//! Canonical on-disk layout.
//!
//! ```text
//! <root>/<owner>/<name>/
//!   repo/                 # working tree (populated by the source provider)
//!   analysis/             # one JSON per analyzer
//!   history/<scan_id>/    # snapshotted artifacts per scan
//!   freshness.json
//!   scans.json
//! ```
//!
//! Directory names are lowercased so the layout honors case-insensitive
//! repository identity.

use std::path::{Path, PathBuf};

use crate::types::RepoId;

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self, repo: &RepoId) -> PathBuf {
        self.root
            .join(repo.owner().to_lowercase())
            .join(repo.name().to_lowercase())
    }

    /// Working tree populated by clone/fetch.
    pub fn worktree_dir(&self, repo: &RepoId) -> PathBuf {
        self.repo_dir(repo).join("repo")
    }

    pub fn analysis_dir(&self, repo: &RepoId) -> PathBuf {
        self.repo_dir(repo).join("analysis")
    }

    pub fn artifact_path(&self, repo: &RepoId, analyzer: &str) -> PathBuf {
        self.analysis_dir(repo).join(format!("{analyzer}.json"))
    }

    pub fn history_dir(&self, repo: &RepoId, scan_id: u64) -> PathBuf {
        self.repo_dir(repo).join("history").join(scan_id.to_string())
    }

    pub fn freshness_path(&self, repo: &RepoId) -> PathBuf {
        self.repo_dir(repo).join("freshness.json")
    }

    pub fn scans_path(&self, repo: &RepoId) -> PathBuf {
        self.repo_dir(repo).join("scans.json")
    }

    pub fn feedback_path(&self) -> PathBuf {
        self.root.join("feedback.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_lowercased_and_deterministic() {
        let layout = Layout::new("/var/zero");
        let repo: RepoId = "Acme/Widget".parse().unwrap();
        assert_eq!(
            layout.artifact_path(&repo, "sbom"),
            PathBuf::from("/var/zero/acme/widget/analysis/sbom.json")
        );
        assert_eq!(
            layout.worktree_dir(&repo),
            PathBuf::from("/var/zero/acme/widget/repo")
        );
        assert_eq!(
            layout.history_dir(&repo, 3),
            PathBuf::from("/var/zero/acme/widget/history/3")
        );
    }
}
