use std::path::PathBuf;

use clap::Args;

use zero_core::freshness::FreshnessEngine;
use zero_core::store::ArtifactStore;
use zero_core::types::RepoId;

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Repository as owner/name
    pub repository: String,
    /// State root override
    #[arg(long)]
    pub root: Option<PathBuf>,
}

pub async fn run(args: RemoveArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.root.as_deref())?;
    let repo: RepoId = args
        .repository
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let store = ArtifactStore::new(&config.state_root);
    let freshness = FreshnessEngine::new(store.clone(), config.freshness.clone());

    store.delete(&repo).map_err(|e| anyhow::anyhow!("{e}"))?;
    freshness.delete(&repo).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("removed {repo}");
    Ok(())
}
