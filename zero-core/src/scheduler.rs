//! Analyzer scheduler — dependency-ordered, bounded-parallel execution
//! of the eligible units for one repository.
//!
//! Units form a DAG (validated at registry construction). A readiness
//! queue is seeded with eligible units whose dependencies are already
//! satisfied; a unit becomes ready the moment its last outstanding
//! dependency completes. Dispatch order among ready units is longest
//! estimated duration first, then name, so the makespan stays small and
//! runs are deterministic. A counting semaphore bounds concurrency.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ZeroConfig;
use crate::error::{Result, SchedError, ZeroError};
use crate::events::{EventSink, ScanEvent};
use crate::freshness::{FreshnessEngine, SkipQuery};
use crate::registry::{Registry, UnitContext};
use crate::store::ArtifactStore;
use crate::types::{
    RepoId, ScanOptions, ScanRecord, ScanStatus, UnitReport, UnitState,
};

/// One scan of one repository, as handed to [`Scheduler::run_scan`].
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub job_id: String,
    pub repo: RepoId,
    pub profile: String,
    pub options: ScanOptions,
    /// Compare the working tree's commit against the recorded one when
    /// deciding skips.
    pub check_commit: bool,
    pub worktree: PathBuf,
    pub commit_sha: Option<String>,
    pub file_count: u64,
}

#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<Registry>,
    store: ArtifactStore,
    freshness: Arc<FreshnessEngine>,
    max_parallel: usize,
    default_timeout: Duration,
    slow_threshold: Duration,
    cancel_grace: Duration,
    snapshot_history: bool,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        store: ArtifactStore,
        freshness: Arc<FreshnessEngine>,
        config: &ZeroConfig,
    ) -> Self {
        Self {
            registry,
            store,
            freshness,
            max_parallel: config.scheduler.max_parallel,
            default_timeout: config.unit_default_timeout(),
            slow_threshold: config.slow_threshold(),
            cancel_grace: config.cancel_grace(),
            snapshot_history: config.diff.history,
        }
    }

    /// Run every eligible unit exactly once and persist the scan record.
    ///
    /// The caller (worker pool) holds the per-repo lock, so no other
    /// scan of this repository is in flight.
    #[instrument(skip_all, fields(repo = %request.repo, profile = %request.profile))]
    pub async fn run_scan(
        &self,
        request: &ScanRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<ScanRecord> {
        if !self.registry.has_profile(&request.profile) {
            return Err(SchedError::UnknownProfile(request.profile.clone()).into());
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let mut plan = self.build_plan(request, sink)?;
        info!(
            eligible = plan.pending_deps.len(),
            skipped = plan.reports.len(),
            "scan planned"
        );

        let mut canceled = cancel.is_cancelled();
        if !canceled {
            canceled = self.drive(request, &mut plan, sink, cancel).await;
        }

        // Anything left non-terminal: the scan was cut short, or a unit
        // task died without reporting.
        let leftover: Vec<String> = plan
            .states
            .iter()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        for name in leftover {
            let report = match plan.states[&name] {
                UnitState::Running => UnitReport {
                    unit: name.clone(),
                    state: UnitState::Failed,
                    duration_seconds: None,
                    error: Some(if canceled { "canceled" } else { "unit task aborted" }.into()),
                    skip_reason: None,
                    finding_count: None,
                    output_file: None,
                },
                _ => UnitReport::skipped(&name, if canceled { "canceled" } else { "dependency-failed" }),
            };
            plan.finish(&name, report.clone());
            emit_unit_complete(sink, request, report);
        }

        let finished_at = Utc::now();
        let complete = plan.count(UnitState::Complete);
        let failed = plan.count(UnitState::Failed);
        let skipped = plan.count(UnitState::Skipped);

        let status = if canceled {
            ScanStatus::Canceled
        } else if failed > 0 && complete == 0 {
            ScanStatus::Failed
        } else {
            ScanStatus::Complete
        };

        let scan_id = self.store.next_scan_id(&request.repo)?;
        let record = ScanRecord {
            scan_id,
            repository: request.repo.clone(),
            commit_sha: request.commit_sha.clone(),
            profile: request.profile.clone(),
            started_at,
            finished_at,
            duration_seconds: started.elapsed().as_secs_f64(),
            status,
            units: plan.reports,
        };

        self.freshness.record(&record)?;
        self.store.append_scan(&record)?;
        if self.snapshot_history && status != ScanStatus::Canceled {
            if let Err(e) = self.store.snapshot_scan(&request.repo, scan_id) {
                warn!(error = %e, "history snapshot failed");
            }
        }

        sink.emit(ScanEvent::ScanComplete {
            job_id: request.job_id.clone(),
            repository: request.repo.to_string(),
            status,
            scan_id,
            units_complete: complete,
            units_failed: failed,
            units_skipped: skipped,
        });
        info!(scan_id, %status, complete, failed, skipped, "scan finished");

        Ok(record)
    }

    /// Eligibility pass: decide per profile unit whether it runs, is
    /// skipped up front, or is blocked on in-scan dependencies.
    fn build_plan(&self, request: &ScanRequest, sink: &dyn EventSink) -> Result<Plan> {
        let mut plan = Plan::default();
        let profile_units = self.registry.profile_units(&request.profile);

        // First decide which units run at all
        let mut eligible = BTreeSet::new();
        for spec in &profile_units {
            let estimate = spec.estimated_duration(request.file_count);
            if request.options.skip_slow && estimate > self.slow_threshold {
                plan.preskip(&spec.name, "slow");
                continue;
            }
            let (run, reason) = self.freshness.should_scan(
                &request.repo,
                &spec.name,
                SkipQuery {
                    check_commit: request.check_commit,
                    current_commit: request.commit_sha.as_deref(),
                    force: request.options.force,
                },
            )?;
            if run {
                debug!(unit = %spec.name, %reason, "unit eligible");
                eligible.insert(spec.name.clone());
                plan.est.insert(spec.name.clone(), estimate);
            } else {
                plan.preskip(&spec.name, &reason);
            }
        }

        // Then wire dependencies among the eligible units
        for name in &eligible {
            let spec = self
                .registry
                .get(name)
                .ok_or_else(|| SchedError::UnknownUnit(name.clone()))?;
            let mut outstanding = BTreeSet::new();
            let mut missing_dep = None;
            for dep in &spec.dependencies {
                if eligible.contains(dep) {
                    outstanding.insert(dep.clone());
                    plan.dependents.entry(dep.clone()).or_default().push(name.clone());
                } else if !self.store.exists(&request.repo, dep) {
                    // Not running this scan and no current artifact
                    missing_dep = Some(dep.clone());
                    break;
                }
            }
            if let Some(dep) = missing_dep {
                debug!(unit = %name, dependency = %dep, "dependency has no artifact");
                plan.states.insert(name.clone(), UnitState::Pending);
                plan.pending_deps.insert(name.clone(), BTreeSet::new());
                let report = UnitReport::skipped(name, "dependency-missing");
                plan.finish(name, report);
                continue;
            }
            plan.states.insert(name.clone(), UnitState::Pending);
            if outstanding.is_empty() {
                plan.ready.push(name.clone());
            }
            plan.pending_deps.insert(name.clone(), outstanding);
        }

        // dependency-missing skips cascade like failures
        let preskipped: Vec<String> = plan
            .reports
            .iter()
            .filter(|(_, r)| r.skip_reason.as_deref() == Some("dependency-missing"))
            .map(|(name, _)| name.clone())
            .collect();
        for name in preskipped {
            plan.cascade_skip(&name, "dependency-missing");
        }

        // Emit the up-front skips so observers see the full unit set
        for report in plan.reports.values().cloned().collect::<Vec<_>>() {
            emit_unit_complete(sink, request, report);
        }

        Ok(plan)
    }

    /// Dispatch loop. Returns true when the scan was canceled.
    async fn drive(
        &self,
        request: &ScanRequest,
        plan: &mut Plan,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> bool {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks: JoinSet<(String, Duration, Result<crate::registry::UnitOutput>)> =
            JoinSet::new();
        let mut running = 0usize;

        loop {
            if plan.ready.is_empty() && running == 0 {
                return false;
            }

            if plan.ready.is_empty() {
                tokio::select! {
                    joined = tasks.join_next() => {
                        running -= 1;
                        self.on_joined(request, plan, sink, joined);
                    }
                    () = cancel.cancelled() => break,
                }
            } else {
                tokio::select! {
                    permit = Arc::clone(&semaphore).acquire_owned() => {
                        let permit = permit.expect("scan semaphore is never closed");
                        let name = plan.take_best_ready();
                        if self.dispatch(request, plan, sink, &mut tasks, name, permit, cancel) {
                            running += 1;
                        }
                    }
                    joined = tasks.join_next(), if running > 0 => {
                        running -= 1;
                        self.on_joined(request, plan, sink, joined);
                    }
                    () = cancel.cancelled() => break,
                }
            }
        }

        // Canceled: no new work, bounded grace for in-flight units.
        let deadline = tokio::time::Instant::now() + self.cancel_grace;
        while running > 0 {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(joined) => {
                    running -= 1;
                    self.on_joined(request, plan, sink, joined);
                }
                Err(_) => {
                    warn!(laggards = running, "grace expired; aborting in-flight units");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        request: &ScanRequest,
        plan: &mut Plan,
        sink: &dyn EventSink,
        tasks: &mut JoinSet<(String, Duration, Result<crate::registry::UnitOutput>)>,
        name: String,
        permit: tokio::sync::OwnedSemaphorePermit,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(spec) = self.registry.get(&name) else {
            // Validated at plan time; only reachable if the table mutated
            plan.finish(&name, UnitReport::skipped(&name, "unknown-unit"));
            return false;
        };
        plan.states.insert(name.clone(), UnitState::Running);
        sink.emit(ScanEvent::UnitStarted {
            job_id: request.job_id.clone(),
            repository: request.repo.to_string(),
            unit: name.clone(),
        });

        let runner = Arc::clone(&spec.runner);
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let repo = request.repo.clone();
        let worktree = request.worktree.clone();
        let store = self.store.clone();
        let unit_cancel = cancel.child_token();

        tasks.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let ctx_cancel = unit_cancel.clone();
            let run = async {
                let ctx = UnitContext {
                    repo: &repo,
                    worktree: &worktree,
                    store: &store,
                    cancel: &ctx_cancel,
                };
                runner.run(ctx).await
            };
            let result = match tokio::time::timeout(timeout, run).await {
                Ok(result) => result,
                Err(_) => {
                    unit_cancel.cancel();
                    Err(SchedError::UnitPanic {
                        unit: name.clone(),
                        message: "timeout".into(),
                    }
                    .into())
                }
            };
            (name, started.elapsed(), result)
        });
        true
    }

    fn on_joined(
        &self,
        request: &ScanRequest,
        plan: &mut Plan,
        sink: &dyn EventSink,
        joined: Option<
            std::result::Result<
                (String, Duration, Result<crate::registry::UnitOutput>),
                tokio::task::JoinError,
            >,
        >,
    ) {
        let Some(joined) = joined else { return };
        match joined {
            Ok((name, elapsed, Ok(output))) => {
                let report = UnitReport {
                    unit: name.clone(),
                    state: UnitState::Complete,
                    duration_seconds: Some(elapsed.as_secs_f64()),
                    error: None,
                    skip_reason: None,
                    finding_count: Some(output.finding_count),
                    output_file: output.output_file,
                };
                plan.finish(&name, report.clone());
                emit_unit_complete(sink, request, report);
                // Dependents may have just become ready
                for dependent in plan.dependents.remove(&name).unwrap_or_default() {
                    if let Some(outstanding) = plan.pending_deps.get_mut(&dependent) {
                        outstanding.remove(&name);
                        if outstanding.is_empty()
                            && plan.states.get(&dependent) == Some(&UnitState::Pending)
                        {
                            plan.ready.push(dependent);
                        }
                    }
                }
            }
            Ok((name, elapsed, Err(error))) => {
                let message = unit_error_message(&error);
                let report = UnitReport {
                    unit: name.clone(),
                    state: UnitState::Failed,
                    duration_seconds: Some(elapsed.as_secs_f64()),
                    error: Some(message.clone()),
                    skip_reason: None,
                    finding_count: None,
                    output_file: None,
                };
                warn!(unit = %name, error = %message, "unit failed");
                plan.finish(&name, report.clone());
                emit_unit_complete(sink, request, report);
                for report in plan.cascade_skip(&name, "dependency-failed") {
                    emit_unit_complete(sink, request, report);
                }
            }
            Err(join_error) => {
                // The task itself died; the unit is attributed at finalize
                warn!(error = %join_error, "unit task aborted");
            }
        }
    }
}

fn unit_error_message(error: &ZeroError) -> String {
    match error {
        ZeroError::Sched(SchedError::Canceled) => "canceled".into(),
        ZeroError::Sched(SchedError::UnitPanic { message, .. }) => message.clone(),
        other => other.to_string(),
    }
}

fn emit_unit_complete(sink: &dyn EventSink, request: &ScanRequest, report: UnitReport) {
    sink.emit(ScanEvent::UnitComplete {
        job_id: request.job_id.clone(),
        repository: request.repo.to_string(),
        report,
    });
}

/// Mutable state of one scan in flight.
#[derive(Debug, Default)]
struct Plan {
    states: HashMap<String, UnitState>,
    reports: BTreeMap<String, UnitReport>,
    pending_deps: HashMap<String, BTreeSet<String>>,
    dependents: HashMap<String, Vec<String>>,
    ready: Vec<String>,
    est: HashMap<String, Duration>,
}

impl Plan {
    fn preskip(&mut self, name: &str, reason: &str) {
        self.states.insert(name.to_string(), UnitState::Skipped);
        self.reports
            .insert(name.to_string(), UnitReport::skipped(name, reason));
    }

    fn finish(&mut self, name: &str, report: UnitReport) {
        self.states.insert(name.to_string(), report.state);
        self.reports.insert(name.to_string(), report);
    }

    fn count(&self, state: UnitState) -> usize {
        self.reports.values().filter(|r| r.state == state).count()
    }

    /// Longest estimated duration first; name ascending breaks ties.
    fn take_best_ready(&mut self) -> String {
        let mut best = 0;
        for (i, name) in self.ready.iter().enumerate() {
            let (best_est, best_name) = (self.est.get(&self.ready[best]), &self.ready[best]);
            let (est, _) = (self.est.get(name), name);
            let better = match (est, best_est) {
                (Some(a), Some(b)) => a > b || (a == b && name < best_name),
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => name < best_name,
            };
            if better {
                best = i;
            }
        }
        self.ready.swap_remove(best)
    }

    /// Mark every eligible transitive dependent of `failed_unit` skipped.
    /// Returns the newly produced reports in a deterministic order.
    fn cascade_skip(&mut self, failed_unit: &str, reason: &str) -> Vec<UnitReport> {
        let mut produced = Vec::new();
        let mut stack = vec![failed_unit.to_string()];
        while let Some(current) = stack.pop() {
            let mut dependents = self.dependents.remove(&current).unwrap_or_default();
            dependents.sort();
            for dependent in dependents {
                if self.states.get(&dependent) == Some(&UnitState::Pending) {
                    let report = UnitReport::skipped(&dependent, reason);
                    self.finish(&dependent, report.clone());
                    self.ready.retain(|r| r != &dependent);
                    produced.push(report);
                    stack.push(dependent);
                }
            }
        }
        produced
    }
}
