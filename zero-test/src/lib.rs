//! Integration test utilities and fixture management for Zero.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use zero_core::config::ZeroConfig;
use zero_core::error::{Result as ZeroResult, SchedError, SourceError};
use zero_core::freshness::FreshnessEngine;
use zero_core::hub::ProgressHub;
use zero_core::queue::JobQueue;
use zero_core::registry::{AnalyzerUnit, Registry, UnitContext, UnitOutput, UnitSpec};
use zero_core::scheduler::Scheduler;
use zero_core::source::{GitCliProvider, OrgSource};
use zero_core::store::ArtifactStore;
use zero_core::suppress::{FeedbackStore, SuppressionService, default_rules};
use zero_core::types::{
    ArtifactEnvelope, Confidence, Evidence, Finding, Location, RepoId, Severity,
};
use zero_core::worker::{RepoLocks, WorkerContext, WorkerPool};

// ── Git fixtures ───────────────────────────────────────────────────

/// A temporary git repository with a little history.
#[derive(Debug)]
pub struct TestRepo {
    pub dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create a small project with one commit.
    pub fn minimal() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let root = dir.path();

        git(root, &["init", "--quiet"]);
        git(root, &["config", "user.email", "test@zero.dev"]);
        git(root, &["config", "user.name", "Test"]);

        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(
            root.join("src/main.rs"),
            "fn main() {\n    println!(\"hello\");\n}\n",
        )
        .unwrap();
        std::fs::write(root.join("README.md"), "# Widget\n").unwrap();
        git(root, &["add", "."]);
        git(root, &["commit", "--quiet", "-m", "Initial commit"]);

        Self { dir }
    }

    /// Add or replace a file and commit.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
        git(self.path(), &["add", "."]);
        git(self.path(), &["commit", "--quiet", "-m", message]);
    }

    pub fn head(&self) -> String {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(self.path())
            .output()
            .expect("git rev-parse");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Publish as `<git_root>/<owner>/<name>.git` so a `file://` base
    /// URL serves it like a remote.
    pub fn publish(&self, git_root: &Path, repo: &RepoId) {
        let bare = git_root
            .join(repo.owner().to_lowercase())
            .join(format!("{}.git", repo.name().to_lowercase()));
        std::fs::create_dir_all(bare.parent().unwrap()).unwrap();
        git(
            self.path(),
            &[
                "clone",
                "--bare",
                "--quiet",
                ".",
                bare.to_str().expect("utf8 path"),
            ],
        );
    }

    /// Refresh a published bare mirror after new commits.
    pub fn republish(&self, git_root: &Path, repo: &RepoId) {
        let bare = git_root
            .join(repo.owner().to_lowercase())
            .join(format!("{}.git", repo.name().to_lowercase()));
        let branch = Command::new("git")
            .args(["symbolic-ref", "--short", "HEAD"])
            .current_dir(self.path())
            .output()
            .expect("git symbolic-ref");
        let branch = String::from_utf8_lossy(&branch.stdout).trim().to_string();
        let refspec = format!("HEAD:refs/heads/{branch}");
        git(
            self.path(),
            &[
                "push",
                "--quiet",
                "--force",
                bare.to_str().expect("utf8 path"),
                &refspec,
            ],
        );
    }
}

pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git runs");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

// ── Fake analyzer units ────────────────────────────────────────────

/// Scripted behavior for a [`FakeUnit`]. Tests hold the handle returned
/// by [`FakeUnit::spec`] to change the script between scans.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Vec<Finding>),
    Fail(String),
    /// Sleep, then succeed with no findings. Honors cancellation.
    Sleep(Duration),
    /// Block until canceled.
    Hang,
}

#[derive(Debug)]
pub struct FakeUnit {
    name: String,
    behavior: Arc<Mutex<Behavior>>,
}

impl FakeUnit {
    pub fn spec(
        name: &str,
        deps: &[&str],
        profiles: &[&str],
        behavior: Behavior,
    ) -> (UnitSpec, Arc<Mutex<Behavior>>) {
        let handle = Arc::new(Mutex::new(behavior));
        let unit = Self {
            name: name.to_string(),
            behavior: Arc::clone(&handle),
        };
        let mut spec = UnitSpec::new(name, Arc::new(unit));
        spec.dependencies = deps.iter().map(ToString::to_string).collect();
        spec.profiles = profiles.iter().map(ToString::to_string).collect();
        (spec, handle)
    }

    fn envelope(&self, repo: &RepoId, findings: Vec<Finding>) -> ArtifactEnvelope {
        ArtifactEnvelope {
            analyzer: self.name.clone(),
            version: "1.0.0".into(),
            timestamp: Utc::now(),
            repository: repo.to_string(),
            duration_seconds: 0.01,
            summary: serde_json::json!({"total": findings.len()}),
            findings,
            recommendations: vec![],
        }
    }
}

#[async_trait::async_trait]
impl AnalyzerUnit for FakeUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: UnitContext<'_>) -> ZeroResult<UnitOutput> {
        let behavior = self
            .behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match behavior {
            Behavior::Succeed(findings) => {
                let envelope = self.envelope(ctx.repo, findings);
                ctx.store.write_envelope(ctx.repo, &envelope)?;
                Ok(UnitOutput {
                    finding_count: envelope.findings.len() as u64,
                    output_file: Some(format!("{}.json", self.name)),
                })
            }
            Behavior::Fail(message) => Err(SchedError::UnitPanic {
                unit: self.name.clone(),
                message,
            }
            .into()),
            Behavior::Sleep(delay) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        let envelope = self.envelope(ctx.repo, vec![]);
                        ctx.store.write_envelope(ctx.repo, &envelope)?;
                        Ok(UnitOutput::default())
                    }
                    () = ctx.cancel.cancelled() => Err(SchedError::Canceled.into()),
                }
            }
            Behavior::Hang => {
                ctx.cancel.cancelled().await;
                Err(SchedError::Canceled.into())
            }
        }
    }
}

/// A finding with enough texture for fingerprinting tests.
pub fn sample_finding(id: &str, file: &str, line: u32, matched: &str, severity: Severity) -> Finding {
    Finding {
        id: id.into(),
        title: format!("finding {id}"),
        description: "synthetic".into(),
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

// ── Org fixture ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StaticOrg {
    pub repos: Vec<RepoId>,
}

#[async_trait::async_trait]
impl OrgSource for StaticOrg {
    async fn list_repos(&self, org: &str) -> ZeroResult<Vec<RepoId>> {
        if self.repos.is_empty() {
            return Err(SourceError::OrgListing {
                org: org.to_string(),
                message: "unknown organization".into(),
            }
            .into());
        }
        Ok(self.repos.clone())
    }
}

// ── Composition root for tests ─────────────────────────────────────

/// The whole stack over a temp state root and a `file://` git base.
pub struct Stack {
    pub dir: tempfile::TempDir,
    pub git_root: PathBuf,
    pub config: Arc<ZeroConfig>,
    pub store: ArtifactStore,
    pub freshness: Arc<FreshnessEngine>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub queue: Arc<JobQueue>,
    pub hub: Arc<ProgressHub>,
    pub ctx: Arc<WorkerContext>,
}

impl Stack {
    pub fn new(specs: Vec<UnitSpec>, org_repos: Vec<RepoId>) -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let git_root = dir.path().join("remotes");
        std::fs::create_dir_all(&git_root).unwrap();

        let mut config = ZeroConfig::default();
        config.state_root = dir.path().join("state");
        config.scheduler.cancel_grace_secs = 2;
        config.workers.job_timeout_secs = 120;

        let store = ArtifactStore::new(&config.state_root);
        let freshness = Arc::new(FreshnessEngine::new(store.clone(), config.freshness.clone()));
        let registry = Arc::new(Registry::new(specs).expect("valid unit table"));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            store.clone(),
            Arc::clone(&freshness),
            &config,
        ));
        let queue = Arc::new(JobQueue::new(config.queue.max_size));
        let hub = Arc::new(ProgressHub::new(config.hub.buffer_size));

        let base = format!("file://{}", git_root.display());
        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&queue),
            scheduler: Arc::clone(&scheduler),
            registry: Arc::clone(&registry),
            store: store.clone(),
            hub: Arc::clone(&hub),
            source: Arc::new(GitCliProvider::new(base)),
            orgs: Arc::new(StaticOrg { repos: org_repos }),
            locks: Arc::new(RepoLocks::default()),
            job_timeout: Duration::from_secs(config.workers.job_timeout_secs),
        });

        Self {
            git_root,
            config: Arc::new(config),
            store,
            freshness,
            registry,
            scheduler,
            queue,
            hub,
            ctx,
            dir,
        }
    }

    pub fn start_workers(&self, count: usize) -> WorkerPool {
        WorkerPool::start(count, Arc::clone(&self.ctx), Duration::from_secs(5))
    }

    /// Build the API state over this stack.
    pub fn app_state(&self) -> zero_server::AppState {
        let feedback = FeedbackStore::open(self.store.clone()).expect("open feedback store");
        zero_server::AppState {
            config: Arc::clone(&self.config),
            store: self.store.clone(),
            freshness: Arc::clone(&self.freshness),
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            hub: Arc::clone(&self.hub),
            diff: Arc::new(zero_core::diff::DiffEngine::new(
                self.store.clone(),
                self.config.diff.line_bucket,
                self.config.diff.history,
            )),
            suppression: Arc::new(SuppressionService::new(
                feedback,
                default_rules(),
                self.config.diff.line_bucket,
            )),
        }
    }

    /// Poll until the job is terminal or the deadline passes.
    pub async fn wait_terminal(&self, job_id: &str, deadline: Duration) -> zero_core::types::JobSnapshot {
        let start = std::time::Instant::now();
        loop {
            let snapshot = self.queue.get(job_id).expect("job exists");
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            assert!(
                start.elapsed() < deadline,
                "job {job_id} stuck in {}",
                snapshot.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack").finish_non_exhaustive()
    }
}

pub use zero_core::hub::job_topic;
pub use zero_core::types::{JobSpec, ScanOptions, ScanStatus, UnitState};

pub fn job_spec(target: &str, is_org: bool, profile: &str) -> JobSpec {
    JobSpec {
        target: target.to_string(),
        is_org,
        profile: profile.to_string(),
        options: ScanOptions::default(),
    }
}
