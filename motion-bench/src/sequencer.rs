//! Per-axis motion sequencer.
//!
//! Drives one axis through its waypoints:
//!
//! ```text
//! Idle -> ServoEngaging -> Configuring -> Moving -> Verifying -> Idle
//!                              ^                        |
//!                              +------ next waypoint ---+
//!
//! any state -> Aborted (error budget exhausted or cancelled)
//! ```
//!
//! Only failures while commanding a move count against the error budget.
//! Servo engagement and speed configuration are best-effort, a verification
//! wait that times out is a warning, and a position outside tolerance is a
//! warning. After the last waypoint the axis returns to the position it
//! started from.

use std::thread;
use std::time::{Duration, Instant};

use hardware::galil::{
    AttemptOutcome, Axis, AxisOperations, CommandChannel, OperationError, SessionLease,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::events::{EventKind, EventLevel, SessionEvent};
use crate::program::{intermediate_targets, Waypoint};

/// Default interval between verification polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default bound on a single verification wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

/// Default position tolerance in encoder counts.
pub const DEFAULT_TOLERANCE: i64 = 10;

/// Default error budget per axis.
pub const DEFAULT_MAX_ERRORS: u32 = 3;

/// Wait, verification and error-budget settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Allowed distance from the target, in counts.
    pub tolerance: i64,
    /// Move failures tolerated before the axis is aborted. Must be at least 1.
    pub max_errors: u32,
    /// Split moves into steps no longer than this many counts.
    pub max_step: Option<u32>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
            tolerance: DEFAULT_TOLERANCE,
            max_errors: DEFAULT_MAX_ERRORS,
            max_step: None,
        }
    }
}

/// Sequencer state for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum AxisState {
    Idle,
    ServoEngaging,
    Configuring,
    Moving,
    Verifying,
    Aborted,
}

/// Why an axis stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    ErrorBudget,
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::ErrorBudget => f.write_str("error-budget"),
            AbortReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal state of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisOutcome {
    Completed,
    Aborted(AbortReason),
}

impl AxisOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, AxisOutcome::Completed)
    }
}

impl std::fmt::Display for AxisOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AxisOutcome::Completed => f.write_str("Completed"),
            AxisOutcome::Aborted(reason) => write!(f, "Aborted: {reason}"),
        }
    }
}

/// Mutable counters for one axis during one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRunState {
    pub waypoint_index: usize,
    pub consecutive_errors: u32,
    pub cumulative_errors: u32,
    pub cancelled: bool,
}

/// Summary of one axis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisReport {
    pub axis: Axis,
    pub outcome: AxisOutcome,
    pub start_position: i64,
    pub final_position: Option<i64>,
    pub waypoints_completed: usize,
    pub errors: u32,
    pub mismatches: u32,
    pub timeouts: u32,
}

impl AxisReport {
    /// Report for an axis that never ran because the session was cancelled first.
    pub fn cancelled_before_start(axis: Axis) -> Self {
        Self {
            axis,
            outcome: AxisOutcome::Aborted(AbortReason::Cancelled),
            start_position: 0,
            final_position: None,
            waypoints_completed: 0,
            errors: 0,
            mismatches: 0,
            timeouts: 0,
        }
    }
}

/// Result of commanding one move including its verification.
enum Step {
    Done,
    /// Move failed; budget not yet exhausted.
    Failed,
    Exhausted,
    Cancelled,
}

enum Wait {
    Settled,
    TimedOut,
    Cancelled,
}

/// Runs one axis's waypoints over a session lease.
pub struct MotionSequencer<'a, C> {
    lease: &'a SessionLease<C>,
    config: &'a SequencerConfig,
    cancel: &'a CancellationToken,
    sink: &'a mut dyn FnMut(SessionEvent),
    axis: Axis,
    state: AxisState,
    run: TestRunState,
    /// Where the axis is believed to be; used to plan intermediate steps.
    current: i64,
    status_supported: bool,
    mismatches: u32,
    timeouts: u32,
}

impl<'a, C: CommandChannel> MotionSequencer<'a, C> {
    pub fn new(
        lease: &'a SessionLease<C>,
        axis: Axis,
        config: &'a SequencerConfig,
        cancel: &'a CancellationToken,
        sink: &'a mut dyn FnMut(SessionEvent),
    ) -> Self {
        Self {
            lease,
            config,
            cancel,
            sink,
            axis,
            state: AxisState::Idle,
            run: TestRunState::default(),
            current: 0,
            status_supported: true,
            mismatches: 0,
            timeouts: 0,
        }
    }

    pub fn state(&self) -> AxisState {
        self.state
    }

    pub fn run_state(&self) -> &TestRunState {
        &self.run
    }

    /// Execute the waypoints, then return to the start position.
    pub fn run(mut self, waypoints: &[Waypoint]) -> AxisReport {
        let start = if self.cancel.is_cancelled() {
            self.last_known_position()
        } else {
            self.capture_start()
        };
        self.current = start;
        self.emit(
            EventLevel::Info,
            EventKind::AxisStarted {
                start_position: start,
            },
            format!("Starting {} waypoint(s) from {start}", waypoints.len()),
        );

        let mut completed = 0;
        let outcome = 'sequence: {
            if self.cancel.is_cancelled() {
                break 'sequence self.abort_cancelled();
            }
            self.engage_servo();

            for (index, waypoint) in waypoints.iter().enumerate() {
                self.run.waypoint_index = index;
                if self.cancel.is_cancelled() {
                    break 'sequence self.abort_cancelled();
                }
                self.emit(
                    EventLevel::Info,
                    EventKind::WaypointStarted {
                        index,
                        target: waypoint.target(),
                        speed: waypoint.speed(),
                    },
                    format!(
                        "Waypoint {}: {} at {} counts/s",
                        index + 1,
                        waypoint.target(),
                        waypoint.speed()
                    ),
                );
                match self.move_to(waypoint.target(), waypoint.speed(), Some(index)) {
                    Step::Done => completed += 1,
                    Step::Failed => {}
                    Step::Exhausted => break 'sequence self.abort_budget(),
                    Step::Cancelled => break 'sequence self.abort_cancelled(),
                }
            }

            if let Some(last) = waypoints.last() {
                if self.cancel.is_cancelled() {
                    break 'sequence self.abort_cancelled();
                }
                self.emit(
                    EventLevel::Info,
                    EventKind::WaypointStarted {
                        index: waypoints.len(),
                        target: start,
                        speed: last.speed(),
                    },
                    format!("Returning to start position {start}"),
                );
                match self.move_to(start, last.speed(), None) {
                    Step::Done | Step::Failed => {}
                    Step::Exhausted => break 'sequence self.abort_budget(),
                    Step::Cancelled => break 'sequence self.abort_cancelled(),
                }
            }

            self.transition(AxisState::Idle);
            AxisOutcome::Completed
        };

        let final_position = self.lease.oracle().last_known(self.axis).map(|r| r.counts);
        self.emit(
            if outcome.is_completed() {
                EventLevel::Info
            } else {
                EventLevel::Warning
            },
            EventKind::AxisFinished { outcome },
            format!(
                "{outcome} ({completed}/{} waypoints, {} error(s))",
                waypoints.len(),
                self.run.cumulative_errors
            ),
        );

        AxisReport {
            axis: self.axis,
            outcome,
            start_position: start,
            final_position,
            waypoints_completed: completed,
            errors: self.run.cumulative_errors,
            mismatches: self.mismatches,
            timeouts: self.timeouts,
        }
    }

    // ==================== Phases ====================

    fn capture_start(&mut self) -> i64 {
        if let Some(position) = self.read_position() {
            return position;
        }
        let fallback = self.last_known_position();
        self.emit(
            EventLevel::Warning,
            EventKind::StepFailed {
                step: "capture-start".to_string(),
                error: "position unavailable".to_string(),
                counted: false,
                cumulative_errors: self.run.cumulative_errors,
            },
            format!("Could not read start position; using {fallback}"),
        );
        fallback
    }

    fn engage_servo(&mut self) {
        self.transition(AxisState::ServoEngaging);
        let axis = self.axis;
        if let Err(e) = self.with_ops(|ops| ops.stop(axis)) {
            self.step_warning("stop", &e);
        }
        if let Err(e) = self.with_ops(|ops| ops.servo_on(axis)) {
            self.step_warning("servo-on", &e);
        }
    }

    /// Configure, move (in steps when `max_step` is set) and verify.
    fn move_to(&mut self, target: i64, speed: i64, index: Option<usize>) -> Step {
        let axis = self.axis;

        self.transition(AxisState::Configuring);
        if let Err(e) = self.with_ops(|ops| ops.set_speed(axis, speed)) {
            self.step_warning("set-speed", &e);
        }

        let steps = match self.config.max_step {
            Some(max_step) => intermediate_targets(self.current, target, max_step),
            None => vec![target],
        };

        for step_target in steps {
            if self.cancel.is_cancelled() {
                return Step::Cancelled;
            }

            self.transition(AxisState::Moving);
            if let Err(e) = self.with_ops(|ops| ops.absolute_move(axis, step_target)) {
                // The program advances as if the target had been reached.
                self.current = target;
                return if self.record_error("move", &e) {
                    Step::Exhausted
                } else {
                    Step::Failed
                };
            }
            self.run.consecutive_errors = 0;

            self.transition(AxisState::Verifying);
            match self.wait_for(step_target) {
                Wait::Settled => {}
                Wait::TimedOut => {
                    self.timeouts += 1;
                    self.emit(
                        EventLevel::Warning,
                        EventKind::WaitTimedOut {
                            target: step_target,
                        },
                        format!(
                            "Motion toward {step_target} not finished after {:?}; continuing",
                            self.config.max_wait
                        ),
                    );
                }
                Wait::Cancelled => return Step::Cancelled,
            }
            self.current = step_target;
        }

        self.verify(target, index);
        Step::Done
    }

    /// Poll until the axis stops, it is within tolerance, or the wait expires.
    fn wait_for(&mut self, target: i64) -> Wait {
        let deadline = Instant::now() + self.config.max_wait;
        loop {
            if self.cancel.is_cancelled() {
                return Wait::Cancelled;
            }

            let position = self.read_position();
            if let Some(position) = position {
                self.emit(
                    EventLevel::Debug,
                    EventKind::PositionUpdate { position },
                    format!("Position {position}"),
                );
            }

            let settled = match self.poll_moving() {
                Some(moving) => !moving,
                None => position.is_some_and(|p| self.within_tolerance(p, target)),
            };
            if settled {
                return Wait::Settled;
            }
            if Instant::now() >= deadline {
                return Wait::TimedOut;
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Re-read the position after the wait and compare it with the target.
    fn verify(&mut self, target: i64, index: Option<usize>) {
        let tolerance = self.config.tolerance;
        match self.read_position() {
            Some(observed) if self.within_tolerance(observed, target) => {
                if let Some(index) = index {
                    self.emit(
                        EventLevel::Info,
                        EventKind::WaypointReached {
                            index,
                            target,
                            observed,
                        },
                        format!("Reached {observed} (target {target})"),
                    );
                }
            }
            Some(observed) => {
                self.mismatches += 1;
                self.emit(
                    EventLevel::Warning,
                    EventKind::VerificationMismatch {
                        target,
                        observed,
                        tolerance,
                    },
                    format!(
                        "Position {observed} is {} counts from target {target} (tolerance ±{tolerance})",
                        observed - target
                    ),
                );
            }
            None => self.emit(
                EventLevel::Warning,
                EventKind::StepFailed {
                    step: "verify".to_string(),
                    error: "position unavailable".to_string(),
                    counted: false,
                    cumulative_errors: self.run.cumulative_errors,
                },
                format!("Could not read position to verify target {target}"),
            ),
        }
    }

    fn abort_budget(&mut self) -> AxisOutcome {
        self.stop_best_effort();
        self.transition(AxisState::Aborted);
        AxisOutcome::Aborted(AbortReason::ErrorBudget)
    }

    fn abort_cancelled(&mut self) -> AxisOutcome {
        self.run.cancelled = true;
        self.stop_best_effort();
        self.transition(AxisState::Aborted);
        AxisOutcome::Aborted(AbortReason::Cancelled)
    }

    // ==================== Helpers ====================

    /// Last reading from the shared snapshot, without channel traffic.
    fn last_known_position(&self) -> i64 {
        self.lease
            .oracle()
            .last_known(self.axis)
            .map(|r| r.counts)
            .unwrap_or(0)
    }

    /// Run operations under the lease, then move probe attempts into the event log.
    fn with_ops<R>(&mut self, f: impl FnOnce(&mut AxisOperations<C>) -> R) -> R {
        let lease = self.lease;
        let (result, attempts) = {
            let mut ops = lease.operations();
            let result = f(&mut *ops);
            (result, ops.probe_mut().drain_journal())
        };
        for attempt in &attempts {
            if let Some(event) = SessionEvent::from_attempt(attempt) {
                self.deliver(event);
            }
        }
        result
    }

    /// Refresh the shared snapshot and return this axis's position.
    fn read_position(&mut self) -> Option<i64> {
        let lease = self.lease;
        let axis = self.axis;
        match self.with_ops(|ops| lease.oracle().refresh(ops)) {
            Ok(snapshot) => snapshot.get(axis),
            Err(e) => {
                debug!("Axis {axis}: position refresh failed: {e}");
                None
            }
        }
    }

    /// In-motion flag, or `None` once the controller has shown it has no status query.
    fn poll_moving(&mut self) -> Option<bool> {
        if !self.status_supported {
            return None;
        }
        let axis = self.axis;
        match self.with_ops(|ops| ops.is_moving(axis)) {
            Ok(moving) => Some(moving),
            Err(OperationError::Protocol(e))
                if e.attempts
                    .iter()
                    .all(|a| matches!(a.outcome, AttemptOutcome::Rejected(_))) =>
            {
                info!("Axis {axis}: no motion status query; verifying by position");
                self.status_supported = false;
                None
            }
            Err(e) => {
                debug!("Axis {axis}: status query failed: {e}");
                None
            }
        }
    }

    fn within_tolerance(&self, observed: i64, target: i64) -> bool {
        observed.abs_diff(target) <= self.config.tolerance.unsigned_abs()
    }

    /// Count a move failure. Returns true when the budget is exhausted.
    fn record_error(&mut self, step: &str, error: &OperationError) -> bool {
        self.run.consecutive_errors += 1;
        self.run.cumulative_errors += 1;
        let cumulative = self.run.cumulative_errors;
        let max = self.config.max_errors;
        self.emit(
            EventLevel::Error,
            EventKind::StepFailed {
                step: step.to_string(),
                error: error.to_string(),
                counted: true,
                cumulative_errors: cumulative,
            },
            format!("{step} failed ({cumulative}/{max}): {error}"),
        );
        cumulative >= max
    }

    fn step_warning(&mut self, step: &str, error: &OperationError) {
        self.emit(
            EventLevel::Warning,
            EventKind::StepFailed {
                step: step.to_string(),
                error: error.to_string(),
                counted: false,
                cumulative_errors: self.run.cumulative_errors,
            },
            format!("{step} failed: {error}"),
        );
    }

    fn stop_best_effort(&mut self) {
        let axis = self.axis;
        if let Err(e) = self.with_ops(|ops| ops.stop(axis)) {
            self.step_warning("stop", &e);
        }
    }

    fn transition(&mut self, to: AxisState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.emit(
            EventLevel::Debug,
            EventKind::StateChanged { from, to },
            format!("{from} -> {to}"),
        );
    }

    fn emit(&mut self, level: EventLevel, kind: EventKind, message: String) {
        self.deliver(SessionEvent::new(Some(self.axis), level, kind, message));
    }

    fn deliver(&mut self, event: SessionEvent) {
        let axis = self.axis;
        match event.level {
            EventLevel::Debug => debug!("Axis {axis}: {}", event.message),
            EventLevel::Info => info!("Axis {axis}: {}", event.message),
            EventLevel::Warning => warn!("Axis {axis}: {}", event.message),
            EventLevel::Error => error!("Axis {axis}: {}", event.message),
        }
        (self.sink)(event);
    }
}
