use std::path::PathBuf;

use clap::Args;

use zero_core::store::ArtifactStore;
use zero_core::types::RepoId;

#[derive(Args, Debug)]
pub struct ScansArgs {
    /// Repository as owner/name
    pub repository: String,
    /// State root override
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ScansArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.root.as_deref())?;
    let repo: RepoId = args
        .repository
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let store = ArtifactStore::new(&config.state_root);
    let scans = store.list_scans(&repo).map_err(|e| anyhow::anyhow!("{e}"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&scans)?);
        return Ok(());
    }
    if scans.is_empty() {
        println!("no scans recorded for {repo}");
        return Ok(());
    }
    println!(
        "{:<6} {:<10} {:<10} {:<22} {:<10} units",
        "id", "profile", "status", "finished", "commit"
    );
    for scan in &scans {
        let commit = scan
            .commit_sha
            .as_deref()
            .map_or("-", |sha| sha.get(..8).unwrap_or(sha));
        let complete = scan
            .units
            .values()
            .filter(|u| u.state == zero_core::types::UnitState::Complete)
            .count();
        println!(
            "{:<6} {:<10} {:<10} {:<22} {:<10} {}/{}",
            scan.scan_id,
            scan.profile,
            scan.status.to_string(),
            scan.finished_at.format("%Y-%m-%d %H:%M:%S"),
            commit,
            complete,
            scan.units.len()
        );
    }
    Ok(())
}
