use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level Zero configuration, matching `<state_root>/config.toml`.
/// Environment variables override file values; see [`ZeroConfig::apply_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZeroConfig {
    /// Root of all persisted state. Default `$HOME/.zero/repos`.
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub workers: WorkerSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub freshness: FreshnessSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub diff: DiffSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl Default for ZeroConfig {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            queue: QueueSection::default(),
            workers: WorkerSection::default(),
            scheduler: SchedulerSection::default(),
            freshness: FreshnessSection::default(),
            hub: HubSection::default(),
            diff: DiffSection::default(),
            server: ServerSection::default(),
        }
    }
}

fn default_state_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".zero")
        .join("repos")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Reject new jobs once this many are pending.
    pub max_size: usize,
    /// Terminal jobs older than this are reaped by cleanup.
    pub retention_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_size: 100,
            retention_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    pub count: usize,
    /// Wall-clock cap on one job, org fan-out included.
    pub job_timeout_secs: u64,
    /// How long `stop()` waits for in-flight jobs before detaching.
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            count: 1,
            job_timeout_secs: 30 * 60,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Concurrent analyzer units per scan.
    pub max_parallel: usize,
    /// Applied when a unit declares no timeout of its own.
    pub unit_default_timeout_secs: u64,
    /// Units estimated to run longer than this are dropped under `skip_slow`.
    pub slow_threshold_secs: u64,
    /// After cancellation, in-flight units get this long to wind down.
    pub cancel_grace_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            unit_default_timeout_secs: 10 * 60,
            slow_threshold_secs: 120,
            cancel_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessSection {
    pub fresh_hours: u64,
    pub stale_days: u64,
    pub very_stale_days: u64,
}

impl Default for FreshnessSection {
    fn default() -> Self {
        Self {
            fresh_hours: 24,
            stale_days: 7,
            very_stale_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Outbound messages buffered per subscriber before eviction.
    pub buffer_size: usize,
    pub ping_interval_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            ping_interval_secs: 54,
            idle_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSection {
    /// Snapshot artifacts under `history/<scan_id>/` after each scan so
    /// any two scans can be diffed later.
    pub history: bool,
    /// Line bucket size for location keys; tolerates cosmetic shifts.
    pub line_bucket: u32,
}

impl Default for DiffSection {
    fn default() -> Self {
        Self {
            history: true,
            line_bucket: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8400".to_string(),
        }
    }
}

impl ZeroConfig {
    /// Load `<state_root>/config.toml` if present, then apply environment
    /// overrides. A missing file yields defaults; a malformed one is an
    /// error.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(root) = std::env::var("STATE_ROOT") {
            config.state_root = PathBuf::from(root);
        }
        let path = config.state_root.join("config.toml");
        if path.is_file() {
            config = Self::load_file(&path)?;
        }
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply the documented environment overrides on top of whatever was
    /// loaded. Unparseable values are ignored rather than fatal.
    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("STATE_ROOT") {
            self.state_root = PathBuf::from(root);
        }
        env_parse("QUEUE_MAX_SIZE", &mut self.queue.max_size);
        env_parse("WORKER_COUNT", &mut self.workers.count);
        env_parse("SCHED_MAX_PARALLEL", &mut self.scheduler.max_parallel);
        env_parse("FRESHNESS_FRESH_HOURS", &mut self.freshness.fresh_hours);
        env_parse("FRESHNESS_STALE_DAYS", &mut self.freshness.stale_days);
        env_parse(
            "FRESHNESS_VERY_STALE_DAYS",
            &mut self.freshness.very_stale_days,
        );
        env_parse("JOB_TIMEOUT_SECONDS", &mut self.workers.job_timeout_secs);
        env_parse(
            "UNIT_DEFAULT_TIMEOUT_SECONDS",
            &mut self.scheduler.unit_default_timeout_secs,
        );
        env_parse("HUB_BUFFER_SIZE", &mut self.hub.buffer_size);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_size == 0 {
            return Err(ConfigError::Invalid("queue.max_size must be > 0".into()));
        }
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid("workers.count must be > 0".into()));
        }
        if self.scheduler.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_parallel must be > 0".into(),
            ));
        }
        if !(1..=10).contains(&self.diff.line_bucket) {
            return Err(ConfigError::Invalid(
                "diff.line_bucket must be within 1..=10".into(),
            ));
        }
        if self.freshness.fresh_hours == 0 {
            return Err(ConfigError::Invalid(
                "freshness.fresh_hours must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.workers.job_timeout_secs)
    }

    pub fn unit_default_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.unit_default_timeout_secs)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_secs(self.scheduler.slow_threshold_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.scheduler.cancel_grace_secs)
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(value) = std::env::var(var) {
        if let Ok(parsed) = value.parse() {
            *slot = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ZeroConfig::default();
        assert_eq!(config.queue.max_size, 100);
        assert_eq!(config.workers.count, 1);
        assert_eq!(config.scheduler.max_parallel, 4);
        assert_eq!(config.freshness.fresh_hours, 24);
        assert_eq!(config.hub.buffer_size, 256);
        assert_eq!(config.diff.line_bucket, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_round_trip() {
        let config = ZeroConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: ZeroConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.queue.max_size, config.queue.max_size);
        assert_eq!(back.scheduler.max_parallel, config.scheduler.max_parallel);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: ZeroConfig = toml::from_str(
            "state_root = \"/tmp/zero\"\n\n[queue]\nmax_size = 7\nretention_secs = 60\n",
        )
        .unwrap();
        assert_eq!(config.queue.max_size, 7);
        assert_eq!(config.workers.count, 1);
        assert_eq!(config.state_root, PathBuf::from("/tmp/zero"));
    }

    #[test]
    fn validation_rejects_zero_capacities() {
        let mut config = ZeroConfig::default();
        config.queue.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = ZeroConfig::default();
        config.diff.line_bucket = 11;
        assert!(config.validate().is_err());
    }
}
