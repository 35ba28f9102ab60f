//! Progress and log events emitted by a motion session.
//!
//! Every failure and every rejected spelling is recorded with its literal
//! command text and axis, so a session log can be read after the fact without
//! the tracing output.

use chrono::{DateTime, Utc};
use hardware::galil::{AttemptOutcome, Axis, ProbeAttempt};
use serde::{Deserialize, Serialize};

use crate::sequencer::{AxisOutcome, AxisState};

/// Severity of a session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    SessionStarted { axes: Vec<Axis> },
    AxisStarted { start_position: i64 },
    StateChanged { from: AxisState, to: AxisState },
    /// A candidate spelling was rejected by the controller.
    CommandRejected { command: String, reply: String },
    /// A candidate spelling failed at the transport.
    CommandFailed { command: String, error: String },
    WaypointStarted { index: usize, target: i64, speed: i64 },
    WaypointReached { index: usize, target: i64, observed: i64 },
    VerificationMismatch {
        target: i64,
        observed: i64,
        tolerance: i64,
    },
    WaitTimedOut { target: i64 },
    /// A step failed; counts toward the error budget when `counted` is set.
    StepFailed {
        step: String,
        error: String,
        counted: bool,
        cumulative_errors: u32,
    },
    PositionUpdate { position: i64 },
    AxisFinished { outcome: AxisOutcome },
    SessionFinished,
}

/// One entry in the chronological session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub axis: Option<Axis>,
    pub level: EventLevel,
    pub kind: EventKind,
    pub message: String,
}

impl SessionEvent {
    pub fn new(
        axis: Option<Axis>,
        level: EventLevel,
        kind: EventKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            axis,
            level,
            kind,
            message: message.into(),
        }
    }

    /// Event for a probe attempt that did not succeed; `None` for accepted ones.
    pub fn from_attempt(attempt: &ProbeAttempt) -> Option<Self> {
        let (kind, level) = match &attempt.outcome {
            AttemptOutcome::Accepted(_) => return None,
            AttemptOutcome::Rejected(reply) => (
                EventKind::CommandRejected {
                    command: attempt.command.clone(),
                    reply: reply.clone(),
                },
                EventLevel::Debug,
            ),
            AttemptOutcome::Failed(error) => (
                EventKind::CommandFailed {
                    command: attempt.command.clone(),
                    error: error.clone(),
                },
                EventLevel::Warning,
            ),
        };
        Some(Self::new(attempt.axis, level, kind, attempt.to_string()))
    }

    pub fn is_warning_or_worse(&self) -> bool {
        self.level >= EventLevel::Warning
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let time = self.timestamp.format("%H:%M:%S%.3f");
        match self.axis {
            Some(axis) => write!(f, "[{time}] {:?} axis {axis}: {}", self.level, self.message),
            None => write!(f, "[{time}] {:?}: {}", self.level, self.message),
        }
    }
}
