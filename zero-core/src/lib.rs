//! Zero core library — scan orchestration for repository intelligence.
//!
//! A scan request flows queue → worker → source provider → scheduler:
//! the [`queue::JobQueue`] accepts jobs, the [`worker::WorkerPool`]
//! drains them, and the [`scheduler::Scheduler`] runs the declared
//! analyzer units against a working tree, streaming progress through
//! the [`hub::ProgressHub`] and landing artifacts in the
//! [`store::ArtifactStore`].

pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod freshness;
pub mod hub;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod suppress;
pub mod types;
pub mod units;
pub mod worker;
