//! Progress events streamed to observers.
//!
//! The scheduler and worker pool emit through an [`EventSink`]; the hub
//! implements that sink for live subscribers, and tests use
//! [`RecordingSink`] to assert on ordering.

use serde::{Deserialize, Serialize};

use crate::types::{JobProgress, ScanStatus, UnitReport, UnitState};

/// Wire message published to a `job:<id>` or `session:<id>` topic.
///
/// Serialized as `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Sent once when a WebSocket subscriber attaches.
    Connected { job_id: String, topic: String },
    JobStatus {
        job_id: String,
        status: ScanStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<JobProgress>,
    },
    CloneProgress {
        job_id: String,
        repository: String,
        stage: CloneStage,
    },
    UnitStarted {
        job_id: String,
        repository: String,
        unit: String,
    },
    UnitComplete {
        job_id: String,
        repository: String,
        #[serde(flatten)]
        report: UnitReport,
    },
    ScanComplete {
        job_id: String,
        repository: String,
        status: ScanStatus,
        scan_id: u64,
        units_complete: usize,
        units_failed: usize,
        units_skipped: usize,
    },
    /// Reply to a client `{"type": "ping"}`.
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneStage {
    Started,
    Fetching,
    Done,
}

impl ScanEvent {
    /// Per-unit state transition carried by this event, if any. Lets
    /// progress trackers fold a stream back into a snapshot map.
    pub fn unit_transition(&self) -> Option<(&str, UnitState)> {
        match self {
            Self::UnitStarted { unit, .. } => Some((unit, UnitState::Running)),
            Self::UnitComplete { report, .. } => Some((report.unit.as_str(), report.state)),
            _ => None,
        }
    }
}

/// Capability the scheduler and workers publish through. Implementations
/// must not block: a slow observer is the hub's problem, not the scan's.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ScanEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ScanEvent) {}
}

/// Sink that records events in order, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<ScanEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScanEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ScanEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_and_payload() {
        let event = ScanEvent::Connected {
            job_id: "j1".into(),
            topic: "job:j1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["payload"]["topic"], "job:j1");
    }

    #[test]
    fn unit_complete_flattens_report() {
        let event = ScanEvent::UnitComplete {
            job_id: "j1".into(),
            repository: "acme/widget".into(),
            report: UnitReport::skipped("sbom", "fresh"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "unit_complete");
        assert_eq!(json["payload"]["unit"], "sbom");
        assert_eq!(json["payload"]["state"], "skipped");
        assert_eq!(json["payload"]["skip_reason"], "fresh");
    }

    #[test]
    fn recording_sink_preserves_order() {
        let sink = RecordingSink::new();
        sink.emit(ScanEvent::Pong);
        sink.emit(ScanEvent::Connected {
            job_id: "a".into(),
            topic: "job:a".into(),
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ScanEvent::Pong);
    }
}
