use std::path::PathBuf;

use clap::Args;

use zero_core::diff::DiffEngine;
use zero_core::store::ArtifactStore;
use zero_core::types::RepoId;

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Repository as owner/name
    pub repository: String,
    /// Baseline scan id
    pub base: u64,
    /// Compare scan id
    pub compare: u64,
    /// State root override
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Emit the full delta as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: DiffArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.root.as_deref())?;
    let repo: RepoId = args
        .repository
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let store = ArtifactStore::new(&config.state_root);
    let engine = DiffEngine::new(store, config.diff.line_bucket, config.diff.history);

    let delta = engine
        .diff(&repo, args.base, args.compare)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&delta)?);
        return Ok(());
    }

    println!(
        "{} scan {} → {}",
        delta.repository, delta.baseline_scan_id, delta.compare_scan_id
    );
    println!(
        "  new {}  fixed {}  moved {}  unchanged {}",
        delta.summary.new_count,
        delta.summary.fixed_count,
        delta.summary.moved_count,
        delta.summary.unchanged_count
    );
    println!(
        "  risk: {:?} (delta {:+})",
        delta.summary.risk_trend, delta.summary.risk_score_delta
    );
    for finding in &delta.new {
        println!("  + [{}] {}", finding.finding.severity, finding.finding.title);
    }
    for finding in &delta.fixed {
        println!("  - [{}] {}", finding.finding.severity, finding.finding.title);
    }
    for moved in &delta.moved {
        println!(
            "  ~ {} ({} → {})",
            moved.finding.title, moved.from_location, moved.to_location
        );
    }
    Ok(())
}
