use std::path::PathBuf;

use clap::{Args, Subcommand};

use zero_core::store::ArtifactStore;
use zero_core::suppress::{FeedbackStore, Verdict};

#[derive(Args, Debug)]
pub struct FeedbackArgs {
    #[command(subcommand)]
    pub action: FeedbackAction,
    /// State root override
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum FeedbackAction {
    /// Record a verdict for a finding fingerprint
    Record {
        fingerprint: String,
        #[arg(value_parser = parse_verdict)]
        verdict: Verdict,
        /// Free-form note explaining the verdict
        #[arg(long)]
        note: Option<String>,
    },
    /// List recorded verdicts
    List,
}

fn parse_verdict(raw: &str) -> Result<Verdict, String> {
    match raw {
        "true_positive" => Ok(Verdict::TruePositive),
        "false_positive" => Ok(Verdict::FalsePositive),
        "accepted_risk" => Ok(Verdict::AcceptedRisk),
        other => Err(format!(
            "unknown verdict {other:?}; expected true_positive, false_positive, or accepted_risk"
        )),
    }
}

pub async fn run(args: FeedbackArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.root.as_deref())?;
    let store = ArtifactStore::new(&config.state_root);
    let feedback = FeedbackStore::open(store).map_err(|e| anyhow::anyhow!("{e}"))?;

    match args.action {
        FeedbackAction::Record {
            fingerprint,
            verdict,
            note,
        } => {
            let record = feedback
                .record(fingerprint, verdict, note)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("recorded {:?} for {}", record.verdict, record.fingerprint);
        }
        FeedbackAction::List => {
            let records = feedback.list();
            if records.is_empty() {
                println!("no feedback recorded yet");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:?}  {}",
                    record.fingerprint,
                    record.verdict,
                    record.note.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}
