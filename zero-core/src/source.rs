//! Source acquisition — working trees and org enumeration.
//!
//! The contract is narrow: produce a working tree rooted at a given
//! path and report the commit it sits at. The default implementation
//! shells out to the `git` CLI; `gix` resolves the resulting HEAD.

use std::path::Path;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{Result, SourceError};
use crate::types::RepoId;

/// What `ensure_worktree` reports back.
#[derive(Debug, Clone, Default)]
pub struct CheckoutInfo {
    pub commit_sha: Option<String>,
    pub file_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Shallow-clone depth; `None` means full history.
    pub depth: Option<u32>,
}

/// Materializes a working tree at `dest`.
#[async_trait::async_trait]
pub trait SourceProvider: Send + Sync {
    async fn ensure_worktree(
        &self,
        repo: &RepoId,
        dest: &Path,
        options: FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<CheckoutInfo>;
}

/// Enumerates the repositories of an organization.
#[async_trait::async_trait]
pub trait OrgSource: Send + Sync {
    async fn list_repos(&self, org: &str) -> Result<Vec<RepoId>>;
}

// ── Git CLI provider ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GitCliProvider {
    base_url: String,
}

impl GitCliProvider {
    /// `base_url` is the remote prefix, e.g. `https://github.com` or a
    /// `file://` root in tests.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn remote_url(&self, repo: &RepoId) -> String {
        format!(
            "{}/{}/{}.git",
            self.base_url.trim_end_matches('/'),
            repo.owner(),
            repo.name()
        )
    }

    async fn run_git(
        repo: &RepoId,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(repo = %repo, ?args, "git");
        let mut child = Command::new("git")
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SourceError::Io)?;
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let mut err = Vec::new();
        let status = tokio::select! {
            status = async {
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut err).await;
                child.wait().await
            } => status.map_err(SourceError::Io)?,
            () = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SourceError::Clone {
                    repo: repo.to_string(),
                    message: "canceled".into(),
                }
                .into());
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(SourceError::Clone {
                repo: repo.to_string(),
                message: String::from_utf8_lossy(&err).trim().to_string(),
            }
            .into())
        }
    }
}

#[async_trait::async_trait]
impl SourceProvider for GitCliProvider {
    #[instrument(skip_all, fields(repo = %repo))]
    async fn ensure_worktree(
        &self,
        repo: &RepoId,
        dest: &Path,
        options: FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<CheckoutInfo> {
        let dest_str = dest.display().to_string();
        if dest.join(".git").is_dir() {
            info!(repo = %repo, "updating existing working tree");
            Self::run_git(repo, &["-C", &dest_str, "fetch", "--quiet", "origin", "HEAD"], cancel)
                .await?;
            Self::run_git(
                repo,
                &["-C", &dest_str, "reset", "--hard", "--quiet", "FETCH_HEAD"],
                cancel,
            )
            .await?;
        } else {
            info!(repo = %repo, "cloning");
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(SourceError::Io)?;
            }
            let url = self.remote_url(repo);
            let depth = options.depth.map(|d| d.to_string());
            let mut args = vec!["clone", "--quiet"];
            if let Some(depth) = depth.as_deref() {
                args.push("--depth");
                args.push(depth);
            }
            args.push(&url);
            args.push(&dest_str);
            Self::run_git(repo, &args, cancel).await?;
        }

        Ok(CheckoutInfo {
            commit_sha: head_commit(dest),
            file_count: count_files(dest),
        })
    }
}

/// Resolve the working tree's HEAD commit, if it is a git checkout.
pub fn head_commit(worktree: &Path) -> Option<String> {
    let repo = gix::open(worktree).ok()?;
    let head = repo.head_commit().ok()?;
    Some(head.id().to_string())
}

/// Count regular files under a working tree, skipping `.git`. Feeds the
/// per-unit duration estimates; an unreadable subtree counts as empty.
pub fn count_files(root: &Path) -> u64 {
    let mut count = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if entry.file_name() != ".git" {
                    stack.push(path);
                }
            } else if file_type.is_file() {
                count += 1;
            }
        }
    }
    count
}

// ── GitHub org enumeration ─────────────────────────────────────────

#[derive(Debug)]
pub struct GithubOrgSource {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubOrgSource {
    pub fn new(api_base: impl Into<String>) -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            token: std::env::var("GITHUB_TOKEN").ok(),
        }
    }
}

impl Default for GithubOrgSource {
    fn default() -> Self {
        Self::new("https://api.github.com")
    }
}

#[async_trait::async_trait]
impl OrgSource for GithubOrgSource {
    #[instrument(skip_all, fields(org))]
    async fn list_repos(&self, org: &str) -> Result<Vec<RepoId>> {
        let mut repos = Vec::new();
        for page in 1..=50 {
            let url = format!(
                "{}/orgs/{org}/repos?per_page=100&page={page}",
                self.api_base.trim_end_matches('/')
            );
            let mut request = self
                .client
                .get(&url)
                .header("User-Agent", "zero-scan")
                .header("Accept", "application/vnd.github+json");
            if let Some(token) = &self.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
            let response = request.send().await.map_err(|e| SourceError::OrgListing {
                org: org.to_string(),
                message: e.to_string(),
            })?;
            if !response.status().is_success() {
                return Err(SourceError::OrgListing {
                    org: org.to_string(),
                    message: format!("HTTP {}", response.status()),
                }
                .into());
            }
            let body: serde_json::Value =
                response.json().await.map_err(|e| SourceError::OrgListing {
                    org: org.to_string(),
                    message: e.to_string(),
                })?;
            let page_repos = parse_repo_page(org, &body)?;
            if page_repos.is_empty() {
                break;
            }
            repos.extend(page_repos);
        }
        info!(org, count = repos.len(), "org enumerated");
        Ok(repos)
    }
}

fn parse_repo_page(org: &str, body: &serde_json::Value) -> Result<Vec<RepoId>> {
    let entries = body.as_array().ok_or_else(|| SourceError::OrgListing {
        org: org.to_string(),
        message: "expected a JSON array of repositories".into(),
    })?;
    Ok(entries
        .iter()
        .filter_map(|entry| entry["name"].as_str())
        .map(|name| RepoId::new(org, name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_url_shape() {
        let provider = GitCliProvider::new("https://github.com/");
        let repo: RepoId = "acme/widget".parse().unwrap();
        assert_eq!(
            provider.remote_url(&repo),
            "https://github.com/acme/widget.git"
        );
    }

    #[test]
    fn count_files_skips_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("README.md"), "# hi").unwrap();
        std::fs::write(dir.path().join(".git/objects/x"), "blob").unwrap();
        assert_eq!(count_files(dir.path()), 2);
    }

    #[test]
    fn repo_page_parses_names() {
        let body = serde_json::json!([
            {"name": "widget", "full_name": "acme/widget"},
            {"name": "gadget", "full_name": "acme/gadget"},
            {"no_name": true}
        ]);
        let repos = parse_repo_page("acme", &body).unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].to_string(), "acme/widget");
    }

    #[test]
    fn repo_page_rejects_non_arrays() {
        let body = serde_json::json!({"message": "Not Found"});
        assert!(parse_repo_page("acme", &body).is_err());
    }

    #[test]
    fn head_commit_of_non_repo_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(head_commit(dir.path()).is_none());
    }
}
