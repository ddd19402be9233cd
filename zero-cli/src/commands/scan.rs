use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

use zero_core::hub::job_topic;
use zero_core::types::{JobSpec, ScanOptions, ScanStatus, UnitState};
use zero_core::worker::WorkerPool;

use super::Runtime;

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Target: owner/name, or an org name with --org
    pub target: String,
    /// Treat the target as an organization and scan every repository
    #[arg(long)]
    pub org: bool,
    /// Analyzer profile
    #[arg(long, default_value = "quick")]
    pub profile: String,
    /// Re-run every unit regardless of freshness
    #[arg(long)]
    pub force: bool,
    /// Skip units with long estimated durations
    #[arg(long)]
    pub skip_slow: bool,
    /// Shallow clone depth
    #[arg(long)]
    pub depth: Option<u32>,
    /// State root override
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Git remote prefix for clones
    #[arg(long, default_value = "https://github.com")]
    pub git_base: String,
}

pub async fn run(args: ScanArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.root.as_deref())?;
    let runtime = Runtime::build(config, &args.git_base)?;

    let spec = JobSpec {
        target: args.target.clone(),
        is_org: args.org,
        profile: args.profile.clone(),
        options: ScanOptions {
            force: args.force,
            skip_slow: args.skip_slow,
            depth: args.depth,
        },
    };
    if !args.org {
        args.target
            .parse::<zero_core::types::RepoId>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    if !runtime.state.registry.has_profile(&spec.profile) {
        anyhow::bail!("config error: unknown profile {:?}", spec.profile);
    }

    let pool = WorkerPool::start(
        1,
        std::sync::Arc::clone(&runtime.worker_ctx),
        Duration::from_secs(runtime.config.workers.shutdown_grace_secs),
    );

    let job = runtime
        .state
        .queue
        .enqueue(spec)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut subscription = runtime.state.hub.subscribe(&job_topic(job.id()));

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message(format!("scanning {}", args.target));

    // Follow the event stream until the job goes terminal
    loop {
        let message = tokio::select! {
            message = subscription.rx.recv() => message,
            () = tokio::time::sleep(Duration::from_secs(2)) => {
                if runtime.state.queue.get(job.id()).map(|s| s.status.is_terminal()).unwrap_or(true) {
                    break;
                }
                continue;
            }
        };
        let Some(message) = message else { break };
        let Ok(event) = serde_json::from_str::<serde_json::Value>(&message) else {
            continue;
        };
        match event["type"].as_str() {
            Some("clone_progress") => {
                bar.set_message(format!(
                    "cloning {}",
                    event["payload"]["repository"].as_str().unwrap_or("")
                ));
            }
            Some("unit_started") => {
                bar.set_message(format!(
                    "{}: {}",
                    event["payload"]["repository"].as_str().unwrap_or(""),
                    event["payload"]["unit"].as_str().unwrap_or("")
                ));
            }
            Some("job_status") => {
                let status = event["payload"]["status"].as_str().unwrap_or("");
                if matches!(status, "complete" | "failed" | "canceled") {
                    break;
                }
            }
            _ => {}
        }
    }
    bar.finish_and_clear();
    pool.stop().await;

    let snapshot = runtime
        .state
        .queue
        .get(job.id())
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    println!("job {} {}", snapshot.id, snapshot.status);
    if let Some(error) = &snapshot.error {
        println!("  error: {error}");
    }
    for project in &snapshot.project_ids {
        println!("  scanned {project}");
    }
    for (unit, state) in &snapshot.progress.units {
        let marker = match state {
            UnitState::Complete => "ok",
            UnitState::Failed => "FAILED",
            UnitState::Skipped => "skipped",
            UnitState::Pending | UnitState::Running => "?",
        };
        println!("  {unit:<18} {marker}");
    }

    match snapshot.status {
        ScanStatus::Complete => Ok(()),
        ScanStatus::Canceled => anyhow::bail!("scan canceled"),
        _ => anyhow::bail!(
            "scan failed: {}",
            snapshot.error.unwrap_or_else(|| "see per-unit states".into())
        ),
    }
}
