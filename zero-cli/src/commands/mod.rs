pub mod diff;
pub mod feedback;
pub mod remove;
pub mod repos;
pub mod scan;
pub mod scans;
pub mod serve;

use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;

use zero_core::config::ZeroConfig;
use zero_core::diff::DiffEngine;
use zero_core::freshness::FreshnessEngine;
use zero_core::hub::ProgressHub;
use zero_core::queue::JobQueue;
use zero_core::registry::Registry;
use zero_core::scheduler::Scheduler;
use zero_core::source::{GitCliProvider, GithubOrgSource};
use zero_core::store::ArtifactStore;
use zero_core::suppress::{FeedbackStore, SuppressionService, default_rules};
use zero_core::units::default_units;
use zero_core::worker::{RepoLocks, WorkerContext};
use zero_server::AppState;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the API server and worker pool
    Serve(serve::ServeArgs),
    /// Scan one repository or a whole org from the command line
    Scan(scan::ScanArgs),
    /// List scanned repositories with freshness
    Repos(repos::ReposArgs),
    /// List recorded scans for a repository
    Scans(scans::ScansArgs),
    /// Compare findings between two scans of a repository
    Diff(diff::DiffArgs),
    /// Record or list finding verdicts
    Feedback(feedback::FeedbackArgs),
    /// Delete a repository's artifacts and metadata
    Remove(remove::RemoveArgs),
}

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Serve(args) => serve::run(args).await,
        Command::Scan(args) => scan::run(args).await,
        Command::Repos(args) => repos::run(args).await,
        Command::Scans(args) => scans::run(args).await,
        Command::Diff(args) => diff::run(args).await,
        Command::Feedback(args) => feedback::run(args).await,
        Command::Remove(args) => remove::run(args).await,
    }
}

/// The composition root: every long-lived service, wired once.
pub struct Runtime {
    pub config: Arc<ZeroConfig>,
    pub state: AppState,
    pub worker_ctx: Arc<WorkerContext>,
}

impl Runtime {
    /// Build the full stack from configuration. Registry validation
    /// failures (cycles, unknown dependencies) surface here, before
    /// anything serves traffic.
    pub fn build(config: ZeroConfig, git_base: &str) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let store = ArtifactStore::new(&config.state_root);
        let freshness = Arc::new(FreshnessEngine::new(
            store.clone(),
            config.freshness.clone(),
        ));
        let registry =
            Arc::new(Registry::new(default_units()).context("invalid analyzer unit table")?);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            store.clone(),
            Arc::clone(&freshness),
            &config,
        ));
        let queue = Arc::new(JobQueue::new(config.queue.max_size));
        let hub = Arc::new(ProgressHub::new(config.hub.buffer_size));
        let diff = Arc::new(DiffEngine::new(
            store.clone(),
            config.diff.line_bucket,
            config.diff.history,
        ));
        let feedback = FeedbackStore::open(store.clone()).context("open feedback store")?;
        let suppression = Arc::new(SuppressionService::new(
            feedback,
            default_rules(),
            config.diff.line_bucket,
        ));

        let worker_ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&queue),
            scheduler,
            registry: Arc::clone(&registry),
            store: store.clone(),
            hub: Arc::clone(&hub),
            source: Arc::new(GitCliProvider::new(git_base)),
            orgs: Arc::new(GithubOrgSource::default()),
            locks: Arc::new(RepoLocks::default()),
            job_timeout: config.job_timeout(),
        });

        let state = AppState {
            config: Arc::clone(&config),
            store,
            freshness,
            registry,
            queue,
            hub,
            diff,
            suppression,
        };

        Ok(Self {
            config,
            state,
            worker_ctx,
        })
    }
}

pub fn load_config(root_override: Option<&std::path::Path>) -> anyhow::Result<ZeroConfig> {
    let mut config = ZeroConfig::load().map_err(|e| anyhow::anyhow!("config error: {e}"))?;
    if let Some(root) = root_override {
        config.state_root = root.to_path_buf();
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config error: {e}"))?;
    Ok(config)
}
