use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use zero_core::worker::WorkerPool;

use super::Runtime;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bind address, e.g. 127.0.0.1:8400 (default from config)
    #[arg(long)]
    pub bind: Option<String>,
    /// State root override (default: $HOME/.zero/repos or $STATE_ROOT)
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Git remote prefix for clones
    #[arg(long, default_value = "https://github.com")]
    pub git_base: String,
}

pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.root.as_deref())?;
    let runtime = Runtime::build(config, &args.git_base)?;
    let bind = args
        .bind
        .unwrap_or_else(|| runtime.config.server.bind.clone());

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::start(
        runtime.config.workers.count,
        std::sync::Arc::clone(&runtime.worker_ctx),
        Duration::from_secs(runtime.config.workers.shutdown_grace_secs),
    );

    // Periodic reaping of old terminal jobs
    let reaper = {
        let queue = std::sync::Arc::clone(&runtime.state.queue);
        let retention = chrono::Duration::seconds(
            i64::try_from(runtime.config.queue.retention_secs).unwrap_or(i64::MAX),
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let reaped = queue.cleanup(retention);
                        if reaped > 0 {
                            info!(reaped, "terminal jobs cleaned up");
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        })
    };

    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            serve_shutdown.cancel();
        }
    });

    let result = zero_server::serve(runtime.state.clone(), &bind, shutdown.clone()).await;

    shutdown.cancel();
    pool.stop().await;
    reaper.abort();
    result.map_err(Into::into)
}
