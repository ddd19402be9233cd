//! Subprocess-wrapped analyzer units.
//!
//! An external analyzer is any executable that accepts a working-tree
//! path as its final argument and emits an artifact envelope on stdout.
//! The wrapper validates the envelope, stamps repository and duration,
//! and writes it through the store.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SchedError, SourceError};
use crate::registry::{AnalyzerUnit, UnitContext, UnitOutput};
use crate::types::ArtifactEnvelope;

/// Default memory ceiling advertised to analyzer processes, in GiB.
pub const DEFAULT_MEMORY_LIMIT_GIB: u64 = 4;

#[derive(Debug, Clone)]
pub struct SubprocessUnit {
    name: String,
    program: String,
    args: Vec<String>,
    memory_limit_gib: u64,
}

impl SubprocessUnit {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.into_iter().collect(),
            memory_limit_gib: DEFAULT_MEMORY_LIMIT_GIB,
        }
    }

    pub fn with_memory_limit_gib(mut self, limit: u64) -> Self {
        self.memory_limit_gib = limit;
        self
    }
}

#[async_trait::async_trait]
impl AnalyzerUnit for SubprocessUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: UnitContext<'_>) -> Result<UnitOutput> {
        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(ctx.worktree)
            // Analyzers are expected to respect this ceiling themselves
            .env(
                "ZERO_MEMORY_LIMIT_BYTES",
                (self.memory_limit_gib * 1024 * 1024 * 1024).to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SourceError::Io)?;

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = tokio::select! {
            status = async {
                // Drain both pipes before waiting so a chatty analyzer
                // cannot deadlock on a full pipe.
                let _ = stdout.read_to_end(&mut out).await;
                let _ = stderr.read_to_end(&mut err).await;
                child.wait().await
            } => status.map_err(SourceError::Io)?,
            () = ctx.cancel.cancelled() => {
                debug!(unit = %self.name, "killing canceled analyzer process");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SchedError::Canceled.into());
            }
        };

        if !status.success() {
            let stderr_tail = tail(&err, 512);
            return Err(SchedError::UnitPanic {
                unit: self.name.clone(),
                message: format!("exit status {status}: {stderr_tail}"),
            }
            .into());
        }

        let mut envelope: ArtifactEnvelope = serde_json::from_slice(&out).map_err(|e| {
            SchedError::UnitPanic {
                unit: self.name.clone(),
                message: format!("analyzer emitted invalid envelope: {e}"),
            }
        })?;
        if envelope.analyzer != self.name {
            warn!(
                unit = %self.name,
                claimed = %envelope.analyzer,
                "analyzer output names a different unit; overriding"
            );
            envelope.analyzer = self.name.clone();
        }
        envelope.repository = ctx.repo.to_string();
        envelope.duration_seconds = started.elapsed().as_secs_f64();
        normalize_summary(&mut envelope);

        ctx.store.write_envelope(ctx.repo, &envelope)?;
        Ok(UnitOutput {
            finding_count: envelope.findings.len() as u64,
            output_file: Some(format!("{}.json", self.name)),
        })
    }
}

/// The summary must carry a `total` and per-severity counts whenever
/// findings are present; fill in whatever the analyzer left out.
fn normalize_summary(envelope: &mut crate::types::ArtifactEnvelope) {
    if !envelope.summary.is_object() {
        envelope.summary = serde_json::json!({});
    }
    let counts = envelope.severity_counts();
    let Some(summary) = envelope.summary.as_object_mut() else {
        return;
    };
    summary
        .entry("total")
        .or_insert_with(|| serde_json::json!(envelope.findings.len()));
    for (key, count) in counts {
        summary.entry(key).or_insert_with(|| serde_json::json!(count));
    }
}

fn tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= max {
        text.to_string()
    } else {
        let cut = text.len() - max;
        let boundary = (cut..text.len())
            .find(|i| text.is_char_boundary(*i))
            .unwrap_or(text.len());
        format!("…{}", &text[boundary..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    use crate::store::ArtifactStore;
    use crate::types::RepoId;

    fn ctx_parts() -> (tempfile::TempDir, ArtifactStore, RepoId, CancellationToken) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        (dir, store, "acme/widget".parse().unwrap(), CancellationToken::new())
    }

    #[tokio::test]
    async fn valid_envelope_is_stored() {
        let (dir, store, repo, cancel) = ctx_parts();
        let script = concat!(
            "{\"analyzer\":\"sbom\",\"version\":\"1.0.0\",",
            "\"timestamp\":\"2026-01-01T00:00:00Z\",\"repository\":\"x/y\",",
            "\"duration_seconds\":0,\"summary\":{\"total\":0},\"findings\":[],",
            "\"recommendations\":[]}"
        );
        let unit = SubprocessUnit::new(
            "sbom",
            "sh",
            ["-c".to_string(), format!("echo '{script}'")],
        );
        let ctx = UnitContext {
            repo: &repo,
            worktree: dir.path(),
            store: &store,
            cancel: &cancel,
        };
        let output = unit.run(ctx).await.unwrap();
        assert_eq!(output.output_file.as_deref(), Some("sbom.json"));
        // Repository is stamped with the actual target, not the claim
        let envelope = store.read_envelope(&repo, "sbom").unwrap();
        assert_eq!(envelope.repository, "acme/widget");
    }

    #[tokio::test]
    async fn summary_is_backfilled_with_counts() {
        let (dir, store, repo, cancel) = ctx_parts();
        let script = concat!(
            "{\"analyzer\":\"secrets\",\"version\":\"1.0.0\",",
            "\"timestamp\":\"2026-01-01T00:00:00Z\",\"repository\":\"x/y\",",
            "\"duration_seconds\":0,\"summary\":{},\"findings\":[",
            "{\"id\":\"f1\",\"title\":\"leak\",\"scanner\":\"secrets\",\"severity\":\"high\"}",
            "],\"recommendations\":[]}"
        );
        let unit = SubprocessUnit::new(
            "secrets",
            "sh",
            ["-c".to_string(), format!("echo '{script}'")],
        );
        let ctx = UnitContext {
            repo: &repo,
            worktree: dir.path(),
            store: &store,
            cancel: &cancel,
        };
        unit.run(ctx).await.unwrap();
        let stored = store.read(&repo, "secrets").unwrap();
        assert_eq!(stored["summary"]["total"], 1);
        assert_eq!(stored["summary"]["high_count"], 1);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_unit_failure() {
        let (dir, store, repo, cancel) = ctx_parts();
        let unit = SubprocessUnit::new(
            "sbom",
            "sh",
            ["-c".to_string(), "echo doom >&2; exit 3".to_string()],
        );
        let ctx = UnitContext {
            repo: &repo,
            worktree: dir.path(),
            store: &store,
            cancel: &cancel,
        };
        let err = unit.run(ctx).await.unwrap_err();
        assert!(err.to_string().contains("doom"), "stderr should surface: {err}");
        assert!(!store.exists(&repo, "sbom"));
    }

    #[tokio::test]
    async fn garbage_output_is_a_unit_failure() {
        let (dir, store, repo, cancel) = ctx_parts();
        let unit = SubprocessUnit::new(
            "sbom",
            "sh",
            ["-c".to_string(), "echo not-json".to_string()],
        );
        let ctx = UnitContext {
            repo: &repo,
            worktree: dir.path(),
            store: &store,
            cancel: &cancel,
        };
        let err = unit.run(ctx).await.unwrap_err();
        assert!(err.to_string().contains("invalid envelope"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let (dir, store, repo, cancel) = ctx_parts();
        let unit = SubprocessUnit::new(
            "sbom",
            "sh",
            ["-c".to_string(), "sleep 30".to_string()],
        );
        let ctx = UnitContext {
            repo: &repo,
            worktree: dir.path(),
            store: &store,
            cancel: &cancel,
        };
        cancel.cancel();
        let started = Instant::now();
        let err = unit.run(ctx).await.unwrap_err();
        assert!(started.elapsed().as_secs() < 5, "kill should be prompt");
        assert!(matches!(
            err,
            crate::error::ZeroError::Sched(SchedError::Canceled)
        ));
    }
}
