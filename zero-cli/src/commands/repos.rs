use std::path::PathBuf;

use clap::Args;

use zero_core::freshness::FreshnessEngine;
use zero_core::store::ArtifactStore;

#[derive(Args, Debug)]
pub struct ReposArgs {
    /// Only repositories under this owner
    #[arg(long)]
    pub owner: Option<String>,
    /// State root override
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ReposArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.root.as_deref())?;
    let store = ArtifactStore::new(&config.state_root);
    let freshness = FreshnessEngine::new(store.clone(), config.freshness.clone());

    let mut repos = store.list_repos().map_err(|e| anyhow::anyhow!("{e}"))?;
    if let Some(owner) = &args.owner {
        repos.retain(|repo| repo.owner().eq_ignore_ascii_case(owner));
    }

    if args.json {
        let mut entries = Vec::new();
        for repo in &repos {
            let report = freshness.check(repo, None).map_err(|e| anyhow::anyhow!("{e}"))?;
            entries.push(serde_json::to_value(&report)?);
        }
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if repos.is_empty() {
        println!("no repositories scanned yet");
        return Ok(());
    }
    println!("{:<40} {:<12} {:<22} refresh", "repository", "level", "last scan");
    for repo in &repos {
        let report = freshness.check(repo, None).map_err(|e| anyhow::anyhow!("{e}"))?;
        let last = report
            .last_scan
            .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        println!(
            "{:<40} {:<12} {:<22} {}",
            repo.to_string(),
            report.level.to_string(),
            last,
            if report.needs_refresh { "yes" } else { "no" }
        );
    }
    Ok(())
}
