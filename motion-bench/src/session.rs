//! Test sessions: run a motion program across axes, one axis at a time.
//!
//! A session holds the controller's session lease for its whole run, so the
//! controlling context cannot interleave commands with it. Axes run strictly
//! in the order given because they share the one channel. Live positions stay
//! readable through [`Controller::latest_positions`].
//!
//! ```no_run
//! use hardware::galil::{Axis, Controller, TcpChannel};
//! use motion_bench::program::MotionProgram;
//! use motion_bench::session::{SessionOptions, TestSession};
//!
//! let controller = Controller::new(TcpChannel::connect_default_port("192.168.0.100")?);
//! let session = TestSession::new(controller);
//! let program = MotionProgram::new().symmetric_sweep(Axis::A, 0, 12_800, 10_000);
//!
//! let handle = session.start(program, vec![Axis::A], SessionOptions::default())?;
//! for event in handle.events() {
//!     println!("{event}");
//! }
//! let summary = handle.wait()?;
//! println!("{}", summary.outcome(Axis::A).unwrap());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver};
use hardware::galil::{
    Axis, AxisOperations, CommandChannel, Controller, SessionLease, MAX_POSITION,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::config::AxisPreset;
use crate::events::{EventKind, EventLevel, SessionEvent};
use crate::program::MotionProgram;
use crate::sequencer::{AxisOutcome, AxisReport, MotionSequencer, SequencerConfig};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Controller busy: another session is active")]
    Busy,

    #[error("Invalid session: {0}")]
    Validation(String),

    #[error("Session worker panicked")]
    WorkerPanicked,
}

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub sequencer: SequencerConfig,
    /// Presets applied best-effort to each selected axis before it runs.
    pub presets: BTreeMap<Axis, AxisPreset>,
}

/// Final result of a session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// One report per selected axis, in run order.
    pub reports: Vec<AxisReport>,
    /// Every event in the order it was emitted.
    pub log: Vec<SessionEvent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn outcome(&self, axis: Axis) -> Option<AxisOutcome> {
        self.report(axis).map(|r| r.outcome)
    }

    pub fn report(&self, axis: Axis) -> Option<&AxisReport> {
        self.reports.iter().find(|r| r.axis == axis)
    }

    pub fn all_completed(&self) -> bool {
        self.reports.iter().all(|r| r.outcome.is_completed())
    }
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Session {} ({:.1}s)",
            if self.all_completed() {
                "completed"
            } else {
                "finished with aborts"
            },
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
        )?;
        for r in &self.reports {
            writeln!(
                f,
                "  Axis {}: {} - {} waypoint(s), {} error(s), {} mismatch(es), {} timeout(s)",
                r.axis, r.outcome, r.waypoints_completed, r.errors, r.mismatches, r.timeouts
            )?;
        }
        Ok(())
    }
}

/// A session running on a background worker.
pub struct SessionHandle {
    cancel: CancellationToken,
    events: Receiver<SessionEvent>,
    worker: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    /// Request cancellation. The active axis stops within one poll tick.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Progress events. The iterator ends when the worker finishes.
    pub fn events(&self) -> crossbeam_channel::Iter<'_, SessionEvent> {
        self.events.iter()
    }

    pub fn receiver(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker and return the summary.
    pub fn wait(self) -> Result<SessionSummary, SessionError> {
        self.worker.join().map_err(|_| SessionError::WorkerPanicked)
    }
}

/// Runs motion programs on one controller.
pub struct TestSession<C> {
    controller: Controller<C>,
    current: Mutex<CancellationToken>,
}

impl<C: CommandChannel> TestSession<C> {
    pub fn new(controller: Controller<C>) -> Self {
        Self {
            controller,
            current: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn controller(&self) -> &Controller<C> {
        &self.controller
    }

    /// Cancel the most recently started run.
    pub fn cancel(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Start a run on a background worker.
    ///
    /// The program is validated and the session lease taken before this
    /// returns, so ad-hoc controller calls fail with `Busy` from here on.
    pub fn start(
        &self,
        program: MotionProgram,
        axes: Vec<Axis>,
        options: SessionOptions,
    ) -> Result<SessionHandle, SessionError>
    where
        C: 'static,
    {
        validate(&program, &axes, &options)?;
        let lease = self.acquire()?;
        let cancel = self.fresh_token();

        let (tx, rx) = unbounded();
        let worker_cancel = cancel.clone();
        let worker = thread::spawn(move || {
            let mut forward = |event: &SessionEvent| {
                // The receiver may be gone; the summary still has the full log.
                let _ = tx.send(event.clone());
            };
            execute(&lease, &program, &axes, &options, &worker_cancel, &mut forward)
        });

        Ok(SessionHandle {
            cancel,
            events: rx,
            worker,
        })
    }

    /// Run on the calling thread, reporting progress through `on_event`.
    pub fn run_blocking(
        &self,
        program: &MotionProgram,
        axes: &[Axis],
        options: &SessionOptions,
        cancel: &CancellationToken,
        mut on_event: impl FnMut(&SessionEvent),
    ) -> Result<SessionSummary, SessionError> {
        validate(program, axes, options)?;
        let lease = self.acquire()?;
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cancel.clone();
        Ok(execute(&lease, program, axes, options, cancel, &mut on_event))
    }

    fn acquire(&self) -> Result<SessionLease<C>, SessionError> {
        self.controller
            .acquire_session()
            .map_err(|_| SessionError::Busy)
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }
}

/// Reject programs that cannot run before anything is sent.
fn validate(
    program: &MotionProgram,
    axes: &[Axis],
    options: &SessionOptions,
) -> Result<(), SessionError> {
    let invalid = |msg: String| Err(SessionError::Validation(msg));

    if options.sequencer.max_errors == 0 {
        return invalid("max_errors must be at least 1".to_string());
    }
    if options.sequencer.tolerance < 0 {
        return invalid(format!(
            "tolerance must not be negative, got {}",
            options.sequencer.tolerance
        ));
    }
    if axes.is_empty() {
        return invalid("no axes selected".to_string());
    }
    let mut seen = BTreeSet::new();
    for &axis in axes {
        if !seen.insert(axis) {
            return invalid(format!("axis {axis} selected twice"));
        }
        let waypoints = program.waypoints(axis);
        if waypoints.is_empty() {
            return invalid(format!("axis {axis} has no waypoints"));
        }
        for waypoint in waypoints {
            if waypoint.speed() <= 0 {
                return invalid(format!(
                    "axis {axis}: speed must be positive, got {}",
                    waypoint.speed()
                ));
            }
            if waypoint.target().unsigned_abs() > MAX_POSITION as u64 {
                return invalid(format!(
                    "axis {axis}: target {} is out of range",
                    waypoint.target()
                ));
            }
        }
    }
    for (&axis, preset) in &options.presets {
        preset
            .validate(axis)
            .map_err(|e| SessionError::Validation(e.to_string()))?;
    }
    Ok(())
}

/// Body of a session, on whichever thread owns the lease.
fn execute<C: CommandChannel>(
    lease: &SessionLease<C>,
    program: &MotionProgram,
    axes: &[Axis],
    options: &SessionOptions,
    cancel: &CancellationToken,
    on_event: &mut dyn FnMut(&SessionEvent),
) -> SessionSummary {
    let started_at = Utc::now();
    let mut log = Vec::new();
    let mut sink = |event: SessionEvent| {
        on_event(&event);
        log.push(event);
    };

    info!("Session started on axes {axes:?}");
    sink(SessionEvent::new(
        None,
        EventLevel::Info,
        EventKind::SessionStarted {
            axes: axes.to_vec(),
        },
        format!("Session started on {} axis(es)", axes.len()),
    ));

    let mut reports = Vec::with_capacity(axes.len());
    for &axis in axes {
        if cancel.is_cancelled() {
            reports.push(cancelled_report(axis, "Cancelled before start", &mut sink));
            continue;
        }

        if let Some(preset) = options.presets.get(&axis) {
            if !apply_preset(lease, axis, preset, cancel, &mut sink) {
                if let Err(e) = run_ops(lease, &mut sink, |ops| ops.stop(axis)) {
                    warn!("Axis {axis}: stop after cancel failed: {e}");
                }
                reports.push(cancelled_report(
                    axis,
                    "Cancelled while applying preset",
                    &mut sink,
                ));
                continue;
            }
        }
        let report = MotionSequencer::new(lease, axis, &options.sequencer, cancel, &mut sink)
            .run(program.waypoints(axis));
        reports.push(report);
    }

    sink(SessionEvent::new(
        None,
        EventLevel::Info,
        EventKind::SessionFinished,
        "Session finished",
    ));
    info!("Session finished");

    SessionSummary {
        reports,
        log,
        started_at,
        finished_at: Utc::now(),
    }
}

fn cancelled_report(
    axis: Axis,
    message: &str,
    sink: &mut dyn FnMut(SessionEvent),
) -> AxisReport {
    let report = AxisReport::cancelled_before_start(axis);
    sink(SessionEvent::new(
        Some(axis),
        EventLevel::Warning,
        EventKind::AxisFinished {
            outcome: report.outcome,
        },
        message,
    ));
    report
}

/// Run operations under the lease and log the probe attempts they made.
fn run_ops<C: CommandChannel, R>(
    lease: &SessionLease<C>,
    sink: &mut dyn FnMut(SessionEvent),
    f: impl FnOnce(&mut AxisOperations<C>) -> R,
) -> R {
    let (result, attempts) = {
        let mut ops = lease.operations();
        let result = f(&mut *ops);
        (result, ops.probe_mut().drain_journal())
    };
    for attempt in &attempts {
        if let Some(event) = SessionEvent::from_attempt(attempt) {
            sink(event);
        }
    }
    result
}

/// Apply every parameter in a preset; failures are warnings.
///
/// Returns false if the session was cancelled before all parameters were sent.
fn apply_preset<C: CommandChannel>(
    lease: &SessionLease<C>,
    axis: Axis,
    preset: &AxisPreset,
    cancel: &CancellationToken,
    sink: &mut dyn FnMut(SessionEvent),
) -> bool {
    for (code, value) in preset.parameters() {
        if cancel.is_cancelled() {
            return false;
        }
        if let Err(e) = run_ops(lease, sink, |ops| ops.set_parameter(axis, code, value)) {
            warn!("Axis {axis}: preset {code}={value} not applied: {e}");
            sink(SessionEvent::new(
                Some(axis),
                EventLevel::Warning,
                EventKind::StepFailed {
                    step: format!("preset-{code}"),
                    error: e.to_string(),
                    counted: false,
                    cumulative_errors: 0,
                },
                format!("Preset {code}={value} not applied: {e}"),
            ));
        }
    }
    true
}
