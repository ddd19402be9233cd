//! Worker pool — drains the job queue, one job per worker at a time.
//!
//! A worker drives clone + scheduler for single-repo jobs and iterates
//! repositories sequentially for org jobs. Per-repo async locks uphold
//! the single-owner invariant: overlapping jobs that target the same
//! repository serialize here, so no unit ever runs twice concurrently
//! for one repo.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{Result, ZeroError};
use crate::events::{CloneStage, EventSink, ScanEvent};
use crate::hub::{HubSink, ProgressHub, job_topic};
use crate::queue::{Job, JobQueue};
use crate::registry::Registry;
use crate::scheduler::{ScanRequest, Scheduler};
use crate::source::{FetchOptions, OrgSource, SourceProvider};
use crate::store::ArtifactStore;
use crate::types::{ProgressPhase, RepoId, ScanStatus};

/// Async per-repo locks. Guards scans, not artifacts: the store's
/// atomic rename covers readers.
#[derive(Debug, Default)]
pub struct RepoLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoLocks {
    pub async fn acquire(&self, repo: &RepoId) -> tokio::sync::OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(repo.key()).or_default())
        };
        slot.lock_owned().await
    }
}

/// Everything a worker needs; one shared instance per pool.
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<Registry>,
    pub store: ArtifactStore,
    pub hub: Arc<ProgressHub>,
    pub source: Arc<dyn SourceProvider>,
    pub orgs: Arc<dyn OrgSource>,
    pub locks: Arc<RepoLocks>,
    pub job_timeout: Duration,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("job_timeout", &self.job_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl WorkerPool {
    /// Spawn `count` workers draining the queue until `stop`.
    pub fn start(count: usize, ctx: Arc<WorkerContext>, grace: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..count.max(1))
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, ctx, shutdown).await;
                })
            })
            .collect();
        Self {
            shutdown,
            handles,
            grace,
        }
    }

    /// Stop accepting work and join workers within the grace period.
    /// A worker still mid-job after the grace is detached, not killed;
    /// its own cancellation context is responsible for unwinding it.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + self.grace;
        for handle in self.handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("worker did not stop within grace");
            }
        }
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    info!(worker_id, "worker started");
    loop {
        let job = match ctx.queue.dequeue(&shutdown).await {
            Ok(job) => job,
            Err(_) => break,
        };
        process_job(&ctx, &job).await;
    }
    info!(worker_id, "worker stopped");
}

/// Composite sink: publishes to the hub and folds unit transitions into
/// the job's progress snapshot.
struct JobSink {
    hub: HubSink,
    job: Arc<Job>,
}

impl EventSink for JobSink {
    fn emit(&self, event: ScanEvent) {
        if let Some((unit, state)) = event.unit_transition() {
            let unit = unit.to_string();
            self.job.update_progress(|progress| {
                let prior = progress.units.insert(unit.clone(), state);
                if state.is_terminal() && prior.is_none_or(|p| !p.is_terminal()) {
                    progress.scanners_complete += 1;
                }
            });
        }
        self.hub.emit(event);
    }
}

#[instrument(skip_all, fields(job_id = %job.id(), target = %job.spec().target))]
async fn process_job(ctx: &Arc<WorkerContext>, job: &Arc<Job>) {
    let topic = job_topic(job.id());
    let sink = JobSink {
        hub: HubSink::new(Arc::clone(&ctx.hub), topic),
        job: Arc::clone(job),
    };

    // Worker-side timeout is a child token so a timed-out job reads as
    // failed, not canceled-by-client.
    let cancel = job.cancel_token().child_token();
    let run = run_job(ctx, job, &sink, &cancel);
    tokio::pin!(run);
    let (result, timed_out) = tokio::select! {
        result = &mut run => (result, false),
        () = tokio::time::sleep(ctx.job_timeout) => {
            warn!("job timeout; canceling in-flight work");
            cancel.cancel();
            ((&mut run).await, true)
        }
    };

    let (status, error) = if job.cancel_token().is_cancelled() {
        (ScanStatus::Canceled, None)
    } else if timed_out {
        (ScanStatus::Failed, Some("job timeout".to_string()))
    } else {
        match result {
            Ok(status) => (status, None),
            Err(e) => {
                error!(error = %e, "job failed");
                (ScanStatus::Failed, Some(e.to_string()))
            }
        }
    };

    job.finish(status, error.clone());
    // Report whatever the terminal state actually is — a racing client
    // cancel wins over our computed status.
    let snapshot = job.snapshot();
    sink.emit(ScanEvent::JobStatus {
        job_id: job.id().to_string(),
        status: snapshot.status,
        error: snapshot.error,
        progress: Some(snapshot.progress),
    });
    info!(status = %snapshot.status, "job finished");
}

/// Returns the job's computed terminal status.
async fn run_job(
    ctx: &Arc<WorkerContext>,
    job: &Arc<Job>,
    sink: &JobSink,
    cancel: &CancellationToken,
) -> Result<ScanStatus> {
    let spec = job.spec().clone();

    let repos: Vec<RepoId> = if spec.is_org {
        let repos = ctx.orgs.list_repos(&spec.target).await?;
        info!(org = %spec.target, repos = repos.len(), "org fan-out");
        repos
    } else {
        let repo: RepoId = spec
            .target
            .parse()
            .map_err(|e: String| crate::error::SourceError::Clone {
                repo: spec.target.clone(),
                message: e,
            })?;
        vec![repo]
    };

    job.update_progress(|progress| {
        progress.repos_total = repos.len();
    });

    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut last_error: Option<ZeroError> = None;

    for repo in repos {
        if cancel.is_cancelled() {
            return Ok(ScanStatus::Canceled);
        }
        match scan_repo(ctx, job, sink, cancel, &repo).await {
            Ok(status) => {
                job.push_project(repo.to_string());
                job.update_progress(|progress| progress.repos_complete += 1);
                if status == ScanStatus::Canceled {
                    return Ok(ScanStatus::Canceled);
                }
                if status == ScanStatus::Failed {
                    failed += 1;
                } else {
                    completed += 1;
                }
            }
            Err(e) => {
                // Clone or org-repo failure: the repo's scan is lost but
                // the remaining repos still run.
                warn!(repo = %repo, error = %e, "repository scan failed");
                failed += 1;
                last_error = Some(e);
            }
        }
    }

    if completed == 0 && failed > 0 {
        match last_error {
            Some(e) => Err(e),
            None => Ok(ScanStatus::Failed),
        }
    } else {
        Ok(ScanStatus::Complete)
    }
}

async fn scan_repo(
    ctx: &Arc<WorkerContext>,
    job: &Arc<Job>,
    sink: &JobSink,
    cancel: &CancellationToken,
    repo: &RepoId,
) -> Result<ScanStatus> {
    let spec = job.spec().clone();
    // Single-owner: at most one running scan per repository.
    let _repo_guard = ctx.locks.acquire(repo).await;
    if cancel.is_cancelled() {
        return Ok(ScanStatus::Canceled);
    }

    job.set_status(ScanStatus::Cloning);
    job.update_progress(|progress| {
        progress.phase = Some(ProgressPhase::Cloning);
        progress.current_repo = Some(repo.to_string());
    });
    sink.emit(ScanEvent::JobStatus {
        job_id: job.id().to_string(),
        status: ScanStatus::Cloning,
        error: None,
        progress: None,
    });
    sink.emit(ScanEvent::CloneProgress {
        job_id: job.id().to_string(),
        repository: repo.to_string(),
        stage: CloneStage::Started,
    });

    let worktree = ctx.store.layout().worktree_dir(repo);
    let checkout = ctx
        .source
        .ensure_worktree(
            repo,
            &worktree,
            FetchOptions {
                depth: spec.options.depth,
            },
            cancel,
        )
        .await?;

    sink.emit(ScanEvent::CloneProgress {
        job_id: job.id().to_string(),
        repository: repo.to_string(),
        stage: CloneStage::Done,
    });

    let profile_size = ctx.registry.profile_units(&spec.profile).len();
    job.set_status(ScanStatus::Scanning);
    job.update_progress(|progress| {
        progress.phase = Some(ProgressPhase::Scanning);
        progress.scanners_total += profile_size;
        // The unit map tracks the repo currently scanning
        progress.units.clear();
    });
    sink.emit(ScanEvent::JobStatus {
        job_id: job.id().to_string(),
        status: ScanStatus::Scanning,
        error: None,
        progress: None,
    });

    let request = ScanRequest {
        job_id: job.id().to_string(),
        repo: repo.clone(),
        profile: spec.profile.clone(),
        options: spec.options.clone(),
        check_commit: true,
        worktree,
        commit_sha: checkout.commit_sha,
        file_count: checkout.file_count,
    };
    let record = ctx.scheduler.run_scan(&request, sink, cancel).await?;
    Ok(record.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use crate::config::ZeroConfig;
    use crate::error::SourceError;
    use crate::freshness::FreshnessEngine;
    use crate::registry::{AnalyzerUnit, UnitContext, UnitOutput, UnitSpec};
    use crate::source::CheckoutInfo;
    use crate::types::{ArtifactEnvelope, JobSpec, ScanOptions};

    /// Provider that fabricates an empty working tree.
    struct FakeProvider {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl SourceProvider for FakeProvider {
        async fn ensure_worktree(
            &self,
            repo: &RepoId,
            dest: &Path,
            _options: FetchOptions,
            _cancel: &CancellationToken,
        ) -> Result<CheckoutInfo> {
            if self.fail {
                return Err(SourceError::Clone {
                    repo: repo.to_string(),
                    message: "no such remote".into(),
                }
                .into());
            }
            std::fs::create_dir_all(dest).map_err(SourceError::Io)?;
            Ok(CheckoutInfo {
                commit_sha: Some("c1".into()),
                file_count: 3,
            })
        }
    }

    struct FakeOrg {
        repos: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl OrgSource for FakeOrg {
        async fn list_repos(&self, org: &str) -> Result<Vec<RepoId>> {
            Ok(self.repos.iter().map(|name| RepoId::new(org, *name)).collect())
        }
    }

    struct CountingUnit {
        name: String,
        delay: Duration,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl AnalyzerUnit for CountingUnit {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, ctx: UnitContext<'_>) -> Result<UnitOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let result = tokio::select! {
                () = tokio::time::sleep(self.delay) => {
                    let envelope = ArtifactEnvelope {
                        analyzer: self.name.clone(),
                        version: "1.0.0".into(),
                        timestamp: Utc::now(),
                        repository: ctx.repo.to_string(),
                        duration_seconds: 0.0,
                        summary: serde_json::json!({"total": 0}),
                        findings: vec![],
                        recommendations: vec![],
                    };
                    ctx.store.write_envelope(ctx.repo, &envelope)?;
                    Ok(UnitOutput::default())
                }
                () = ctx.cancel.cancelled() => {
                    Err(crate::error::SchedError::Canceled.into())
                }
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        ctx: Arc<WorkerContext>,
        max_running: Arc<AtomicUsize>,
    }

    fn harness(unit_delay: Duration, clone_fails: bool, org_repos: Vec<&'static str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ZeroConfig::default();
        config.state_root = dir.path().to_path_buf();
        config.scheduler.cancel_grace_secs = 1;

        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let mut specs = Vec::new();
        for name in ["sbom", "secrets"] {
            let mut spec = UnitSpec::new(
                name,
                Arc::new(CountingUnit {
                    name: name.into(),
                    delay: unit_delay,
                    running: Arc::clone(&running),
                    max_running: Arc::clone(&max_running),
                }),
            );
            spec.profiles = vec!["quick".into()];
            specs.push(spec);
        }

        let store = ArtifactStore::new(&config.state_root);
        let freshness = Arc::new(FreshnessEngine::new(store.clone(), config.freshness.clone()));
        let registry = Arc::new(Registry::new(specs).unwrap());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            store.clone(),
            freshness,
            &config,
        ));
        let ctx = Arc::new(WorkerContext {
            queue: Arc::new(JobQueue::new(16)),
            scheduler,
            registry,
            store,
            hub: Arc::new(ProgressHub::new(256)),
            source: Arc::new(FakeProvider { fail: clone_fails }),
            orgs: Arc::new(FakeOrg { repos: org_repos }),
            locks: Arc::new(RepoLocks::default()),
            job_timeout: Duration::from_secs(60),
        });
        Harness {
            _dir: dir,
            ctx,
            max_running,
        }
    }

    fn spec(target: &str, is_org: bool) -> JobSpec {
        JobSpec {
            target: target.into(),
            is_org,
            profile: "quick".into(),
            options: ScanOptions::default(),
        }
    }

    async fn wait_terminal(ctx: &Arc<WorkerContext>, job_id: &str) -> crate::types::JobSnapshot {
        for _ in 0..500 {
            let snapshot = ctx.queue.get(job_id).unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn single_repo_job_completes_end_to_end() {
        let harness = harness(Duration::from_millis(10), false, vec![]);
        let pool = WorkerPool::start(1, Arc::clone(&harness.ctx), Duration::from_secs(5));

        let job = harness.ctx.queue.enqueue(spec("acme/widget", false)).unwrap();
        let snapshot = wait_terminal(&harness.ctx, job.id()).await;

        assert_eq!(snapshot.status, ScanStatus::Complete);
        assert_eq!(snapshot.project_ids, vec!["acme/widget".to_string()]);
        assert_eq!(snapshot.progress.scanners_complete, 2);
        let repo: RepoId = "acme/widget".parse().unwrap();
        assert!(harness.ctx.store.exists(&repo, "sbom"));
        assert!(harness.ctx.store.exists(&repo, "secrets"));

        pool.stop().await;
    }

    #[tokio::test]
    async fn clone_failure_fails_the_job() {
        let harness = harness(Duration::from_millis(10), true, vec![]);
        let pool = WorkerPool::start(1, Arc::clone(&harness.ctx), Duration::from_secs(5));

        let job = harness.ctx.queue.enqueue(spec("acme/widget", false)).unwrap();
        let snapshot = wait_terminal(&harness.ctx, job.id()).await;

        assert_eq!(snapshot.status, ScanStatus::Failed);
        assert!(snapshot.error.unwrap().contains("no such remote"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn org_job_fans_out_to_every_repo() {
        let harness = harness(Duration::from_millis(5), false, vec!["a", "b", "c"]);
        let pool = WorkerPool::start(1, Arc::clone(&harness.ctx), Duration::from_secs(5));

        let job = harness.ctx.queue.enqueue(spec("acme", true)).unwrap();
        let snapshot = wait_terminal(&harness.ctx, job.id()).await;

        assert_eq!(snapshot.status, ScanStatus::Complete);
        assert_eq!(snapshot.progress.repos_total, 3);
        assert_eq!(snapshot.progress.repos_complete, 3);
        assert_eq!(
            snapshot.project_ids,
            vec!["acme/a".to_string(), "acme/b".to_string(), "acme/c".to_string()]
        );
        for name in ["a", "b", "c"] {
            let repo = RepoId::new("acme", name);
            assert!(harness.ctx.store.exists(&repo, "sbom"));
        }
        pool.stop().await;
    }

    #[tokio::test]
    async fn cancel_mid_scan_terminates_with_ordered_events() {
        let harness = harness(Duration::from_secs(30), false, vec![]);
        let pool = WorkerPool::start(1, Arc::clone(&harness.ctx), Duration::from_secs(5));

        let job = harness.ctx.queue.enqueue(spec("acme/widget", false)).unwrap();
        let mut sub = harness.ctx.hub.subscribe(&job_topic(job.id()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.ctx.queue.cancel(job.id()).unwrap();

        let snapshot = wait_terminal(&harness.ctx, job.id()).await;
        assert_eq!(snapshot.status, ScanStatus::Canceled);

        // The worker's terminal event closes out the topic in order
        let mut last_status = None;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while last_status.as_deref() != Some("canceled") {
            let message = tokio::time::timeout_at(deadline, sub.rx.recv())
                .await
                .expect("terminal event arrives")
                .expect("subscription stays live");
            let value: serde_json::Value = serde_json::from_str(&message).unwrap();
            if value["type"] == "job_status" {
                last_status = Some(value["payload"]["status"].as_str().unwrap().to_string());
            }
        }
        pool.stop().await;
    }

    #[tokio::test]
    async fn overlapping_jobs_for_one_repo_serialize() {
        let harness = harness(Duration::from_millis(50), false, vec![]);
        // Two workers so both jobs could run concurrently if unguarded
        let pool = WorkerPool::start(2, Arc::clone(&harness.ctx), Duration::from_secs(5));

        // Force so the second job actually re-runs instead of skipping fresh
        let mut forced = spec("acme/widget", false);
        forced.options.force = true;
        let first = harness.ctx.queue.enqueue(forced.clone()).unwrap();
        forced.target = "ACME/Widget".into();
        let second = harness.ctx.queue.enqueue(forced).unwrap();
        wait_terminal(&harness.ctx, first.id()).await;
        wait_terminal(&harness.ctx, second.id()).await;

        // With the per-repo lock, at most max_parallel units of ONE scan
        // run at a time; cross-scan overlap would have doubled this.
        assert!(harness.max_running.load(Ordering::SeqCst) <= 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn pool_stops_cleanly_when_idle() {
        let harness = harness(Duration::from_millis(5), false, vec![]);
        let pool = WorkerPool::start(2, Arc::clone(&harness.ctx), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.stop().await;
    }
}
