use clap::Parser;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "zero",
    version,
    about = "Scan repositories and query the resulting intelligence"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Classify an error into an exit code.
///
///   0  — success
///   1  — general/unknown error
///   2  — configuration error
///   3  — unknown repository, scan, or artifact
///   4  — queue conflict (full, duplicate, terminal cancel)
///   5  — clone / source acquisition error
///   6  — scan finished with failures
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    let lower = format!("{err:#}").to_lowercase();
    if lower.contains("config") || lower.contains("cycle") || lower.contains("depends on unknown")
    {
        2
    } else if lower.contains("not found") {
        3
    } else if lower.contains("queue") || lower.contains("already") {
        4
    } else if lower.contains("clone") || lower.contains("org listing") {
        5
    } else if lower.contains("scan failed") {
        6
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(commands::run(cli.command)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_unknown_repo() {
        let err = anyhow::anyhow!("Artifact not found: acme/widget/sbom");
        assert_eq!(classify_exit_code(&err), 3);
    }

    #[test]
    fn exit_code_config() {
        let err = anyhow::anyhow!("Invalid config: queue.max_size must be > 0");
        assert_eq!(classify_exit_code(&err), 2);
    }

    #[test]
    fn exit_code_queue() {
        let err = anyhow::anyhow!("Queue is full (100 jobs)");
        assert_eq!(classify_exit_code(&err), 4);
    }

    #[test]
    fn exit_code_general() {
        let err = anyhow::anyhow!("something else entirely");
        assert_eq!(classify_exit_code(&err), 1);
    }
}
