//! Live run streams: log replay, new lines, status heartbeats, completion.

pub mod publisher;

use crate::storage::{RunRecord, RunStatus};

pub use self::publisher::Publisher;

/// One message pushed to a stream observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete log line.
    Line { line: String },
    /// Periodic heartbeat carrying the current status.
    Status {
        status: RunStatus,
        exit_code: Option<i32>,
    },
    /// The run reached a terminal state; nothing follows.
    Done { run: RunRecord },
    /// The stream could not be served; nothing follows.
    Error { error: String },
}

impl StreamEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}
