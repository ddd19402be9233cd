//! Bounded job queue.
//!
//! Jobs are lock-guarded aggregates; everything handed to callers is a
//! snapshot. The pending channel gives FIFO hand-off with
//! exactly-one-worker-per-job semantics, and the capacity bound is
//! enforced at enqueue time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::types::{JobProgress, JobSnapshot, JobSpec, ScanStatus};

/// A submitted scan job. Mutation goes through the methods below, all
/// guarded by a single lock; a terminal status is never left.
#[derive(Debug)]
pub struct Job {
    id: String,
    spec: JobSpec,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<JobState>,
}

#[derive(Debug)]
struct JobState {
    status: ScanStatus,
    progress: JobProgress,
    project_ids: Vec<String>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Job {
    fn new(id: String, spec: JobSpec) -> Self {
        Self {
            id,
            spec,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(JobState {
                status: ScanStatus::Queued,
                progress: JobProgress::default(),
                project_ids: Vec::new(),
                error: None,
                started_at: None,
                finished_at: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Cancellation source propagated into clone, scheduler, and units.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> ScanStatus {
        self.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Deep-enough copy for observers; never shares storage with the job.
    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.lock();
        JobSnapshot {
            id: self.id.clone(),
            spec: self.spec.clone(),
            status: state.status,
            progress: state.progress.clone(),
            project_ids: state.project_ids.clone(),
            error: state.error.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    /// Move to a non-terminal working status. Ignored once terminal.
    pub fn set_status(&self, status: ScanStatus) {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return;
        }
        if state.started_at.is_none() && status != ScanStatus::Queued {
            state.started_at = Some(Utc::now());
        }
        state.status = status;
    }

    pub fn update_progress(&self, apply: impl FnOnce(&mut JobProgress)) {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return;
        }
        apply(&mut state.progress);
    }

    pub fn push_project(&self, project_id: String) {
        let mut state = self.lock();
        if !state.project_ids.contains(&project_id) {
            state.project_ids.push(project_id);
        }
    }

    /// Terminal transition. The first caller wins; later calls are
    /// no-ops, which is what makes cancel racing a finishing worker safe.
    pub fn finish(&self, status: ScanStatus, error: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.error = error;
        state.finished_at = Some(Utc::now());
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
pub struct JobQueue {
    capacity: usize,
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    tx: mpsc::Sender<String>,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            capacity,
            jobs: Mutex::new(HashMap::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Accept a job with a generated id.
    pub fn enqueue(&self, spec: JobSpec) -> Result<Arc<Job>> {
        self.enqueue_with_id(uuid::Uuid::new_v4().to_string(), spec)
    }

    /// Accept a job under a caller-chosen id. Rejects collisions and
    /// enqueues past capacity.
    pub fn enqueue_with_id(&self, id: String, spec: JobSpec) -> Result<Arc<Job>> {
        let job = Arc::new(Job::new(id.clone(), spec));
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            if jobs.contains_key(&id) {
                return Err(QueueError::DuplicateJob(id).into());
            }
            jobs.insert(id.clone(), Arc::clone(&job));
        }
        match self.tx.try_send(id.clone()) {
            Ok(()) => {
                debug!(job_id = %id, "job enqueued");
                Ok(job)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.jobs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(QueueError::Full {
                    capacity: self.capacity,
                }
                .into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.jobs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(QueueError::Closed.into())
            }
        }
    }

    /// Block until a runnable job is available or `shutdown` fires.
    /// Jobs canceled while still queued are drained and skipped here.
    pub async fn dequeue(&self, shutdown: &CancellationToken) -> Result<Arc<Job>> {
        let mut rx = tokio::select! {
            guard = self.rx.lock() => guard,
            () = shutdown.cancelled() => return Err(QueueError::Closed.into()),
        };
        loop {
            let id = tokio::select! {
                id = rx.recv() => id.ok_or(QueueError::Closed)?,
                () = shutdown.cancelled() => return Err(QueueError::Closed.into()),
            };
            let job = self
                .jobs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&id)
                .cloned();
            match job {
                Some(job) if !job.is_terminal() => return Ok(job),
                Some(job) => debug!(job_id = %job.id(), "skipping terminal queued job"),
                None => debug!(job_id = %id, "skipping reaped queued job"),
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<JobSnapshot> {
        self.get_job(id).map(|job| job.snapshot())
    }

    pub fn get_job(&self, id: &str) -> Result<Arc<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()).into())
    }

    /// Cancel a non-terminal job: flips status, stamps `finished_at`,
    /// and fires the job's cancellation token so workers unwind.
    pub fn cancel(&self, id: &str) -> Result<JobSnapshot> {
        let job = self.get_job(id)?;
        if !job.finish(ScanStatus::Canceled, None) {
            return Err(QueueError::AlreadyTerminal {
                id: id.to_string(),
                status: job.status().to_string(),
            }
            .into());
        }
        job.cancel.cancel();
        debug!(job_id = %id, "job canceled");
        Ok(job.snapshot())
    }

    pub fn list_active(&self) -> Vec<JobSnapshot> {
        let mut active: Vec<JobSnapshot> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|job| !job.is_terminal())
            .map(|job| job.snapshot())
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active
    }

    pub fn list_recent(&self, window: Duration) -> Vec<JobSnapshot> {
        let cutoff = Utc::now() - window;
        let mut recent: Vec<JobSnapshot> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|job| job.created_at >= cutoff)
            .map(|job| job.snapshot())
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent
    }

    /// Reap terminal jobs older than `max_age`. Returns how many went.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, job| {
            let state = job.lock();
            !(state.status.is_terminal()
                && state.finished_at.is_some_and(|finished| finished < cutoff))
        });
        before - jobs.len()
    }
}
