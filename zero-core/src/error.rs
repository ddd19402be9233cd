/// Top-level Zero error type.
#[derive(thiserror::Error, Debug)]
pub enum ZeroError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Scheduler error: {0}")]
    Sched(#[from] SchedError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Diff error: {0}")]
    Diff(#[from] DiffError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact not found: {repo}/{analyzer}")]
    ArtifactNotFound { repo: String, analyzer: String },

    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("Queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: String, status: String },

    #[error("Queue is shut down")]
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum SchedError {
    #[error("Unknown analyzer unit: {0}")]
    UnknownUnit(String),

    #[error("Unknown profile: {0}")]
    UnknownProfile(String),

    #[error("Scan canceled")]
    Canceled,

    #[error("Unit {unit} panicked: {message}")]
    UnitPanic { unit: String, message: String },
}

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("Clone failed for {repo}: {message}")]
    Clone { repo: String, message: String },

    #[error("Git error: {0}")]
    Git(String),

    #[error("Org listing failed for {org}: {message}")]
    OrgListing { org: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum DiffError {
    #[error("Scan {scan_id} not found for {repo}")]
    ScanNotFound { repo: String, scan_id: u64 },

    #[error("Scan history is disabled")]
    HistoryDisabled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Dependency cycle involving unit {0}")]
    DependencyCycle(String),
}

pub type Result<T> = std::result::Result<T, ZeroError>;
