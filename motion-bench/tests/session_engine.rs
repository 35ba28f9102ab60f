//! End-to-end motion sessions against the simulated controller.

use std::collections::BTreeMap;
use std::time::Duration;

use hardware::galil::sim::SimulatedController;
use hardware::galil::{Axis, Controller, ControllerError};
use motion_bench::cancel::CancellationToken;
use motion_bench::config::AxisPreset;
use motion_bench::events::{EventKind, SessionEvent};
use motion_bench::program::MotionProgram;
use motion_bench::sequencer::{AbortReason, AxisOutcome, SequencerConfig};
use motion_bench::session::{SessionOptions, SessionSummary, TestSession};

fn fast_options(max_errors: u32) -> SessionOptions {
    SessionOptions {
        sequencer: SequencerConfig {
            poll_interval: Duration::from_millis(1),
            max_wait: Duration::from_millis(200),
            max_errors,
            ..SequencerConfig::default()
        },
        ..SessionOptions::default()
    }
}

fn run(
    sim: &SimulatedController,
    program: &MotionProgram,
    axes: &[Axis],
    options: &SessionOptions,
    cancel: &CancellationToken,
) -> SessionSummary {
    let session = TestSession::new(Controller::new(sim.clone()));
    session
        .run_blocking(program, axes, options, cancel, |_| {})
        .unwrap()
}

fn moves_for(sim: &SimulatedController, axis: Axis) -> Vec<String> {
    let spaced = format!("PA {axis}");
    let compact = format!("PA{axis}");
    sim.history()
        .into_iter()
        .filter(|c| c.starts_with(&spaced) || c.starts_with(&compact))
        .collect()
}

fn events_for(summary: &SessionSummary, axis: Axis) -> Vec<&SessionEvent> {
    summary.log.iter().filter(|e| e.axis == Some(axis)).collect()
}

#[test]
fn test_three_waypoints_complete_and_return_to_start() {
    let sim = SimulatedController::new().with_position(Axis::A, 500);
    let program = MotionProgram::new().with_targets(Axis::A, [1500, -500, 800], 10_000);

    let summary = run(
        &sim,
        &program,
        &[Axis::A],
        &fast_options(3),
        &CancellationToken::new(),
    );

    let report = summary.report(Axis::A).unwrap();
    assert_eq!(report.outcome, AxisOutcome::Completed);
    assert_eq!(report.errors, 0);
    assert_eq!(report.mismatches, 0);
    assert_eq!(report.waypoints_completed, 3);
    assert_eq!(report.start_position, 500);

    assert_eq!(
        moves_for(&sim, Axis::A),
        vec!["PA A=1500", "PA A=-500", "PA A=800", "PA A=500"]
    );
    assert_eq!(sim.position(Axis::A), 500);
    assert_eq!(summary.outcome(Axis::A).unwrap().to_string(), "Completed");
}

#[test]
fn test_error_budget_aborts_only_the_failing_axis() {
    let sim = SimulatedController::new();
    sim.reject_when(|cmd| cmd.starts_with("PA B") || cmd.starts_with("PAB"));
    let program = MotionProgram::new()
        .with_targets(Axis::B, [100, 200, 300], 5000)
        .with_targets(Axis::C, [100, 200, 300], 5000);

    let summary = run(
        &sim,
        &program,
        &[Axis::B, Axis::C],
        &fast_options(3),
        &CancellationToken::new(),
    );

    let b = summary.report(Axis::B).unwrap();
    assert_eq!(b.outcome, AxisOutcome::Aborted(AbortReason::ErrorBudget));
    assert_eq!(b.errors, 3);
    assert_eq!(b.outcome.to_string(), "Aborted: error-budget");
    // Three failed moves, each trying all three spellings.
    assert_eq!(moves_for(&sim, Axis::B).len(), 9);

    let counted = events_for(&summary, Axis::B)
        .into_iter()
        .filter(|e| matches!(e.kind, EventKind::StepFailed { counted: true, .. }))
        .count();
    assert_eq!(counted, 3);

    // Every rejected spelling is logged with its literal text.
    assert!(summary.log.iter().any(|e| matches!(
        &e.kind,
        EventKind::CommandRejected { command, .. } if command == "PA B 100"
    )));

    let c = summary.report(Axis::C).unwrap();
    assert_eq!(c.outcome, AxisOutcome::Completed);
    assert_eq!(c.errors, 0);
    assert_eq!(sim.position(Axis::C), 0);
}

#[test]
fn test_cumulative_errors_never_exceed_budget() {
    let sim = SimulatedController::new();
    sim.reject_when(|cmd| cmd.starts_with("PA"));
    let program = MotionProgram::new().with_targets(Axis::A, 1..=10, 5000);

    let summary = run(
        &sim,
        &program,
        &[Axis::A],
        &fast_options(4),
        &CancellationToken::new(),
    );

    for event in &summary.log {
        if let EventKind::StepFailed {
            cumulative_errors, ..
        } = event.kind
        {
            assert!(cumulative_errors <= 4);
        }
    }
    assert_eq!(summary.report(Axis::A).unwrap().errors, 4);
}

#[test]
fn test_cancellation_mid_session_marks_axes_cancelled() {
    let sim = SimulatedController::new();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    sim.on_command(move |cmd| {
        if cmd == "PA A=2000" {
            trigger.cancel();
        }
    });
    let program = MotionProgram::new()
        .with_targets(Axis::A, [1000, 2000, 3000], 5000)
        .with_targets(Axis::B, [1000], 5000);

    let summary = run(&sim, &program, &[Axis::A, Axis::B], &fast_options(3), &cancel);

    assert_eq!(
        summary.outcome(Axis::A),
        Some(AxisOutcome::Aborted(AbortReason::Cancelled))
    );
    assert_eq!(
        summary.outcome(Axis::B),
        Some(AxisOutcome::Aborted(AbortReason::Cancelled))
    );

    // No move after the one in flight, and a final stop.
    assert_eq!(moves_for(&sim, Axis::A), vec!["PA A=1000", "PA A=2000"]);
    let history = sim.history();
    assert_eq!(history.last().map(String::as_str), Some("STA"));
    // Axis B never touched the channel.
    assert!(!history
        .iter()
        .any(|c| c.ends_with('B') || c.contains("B=")));
}

#[test]
fn test_cancel_during_preset_stops_without_further_traffic() {
    let sim = SimulatedController::new();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    sim.on_command(move |cmd| {
        if cmd == "KPA=10" {
            trigger.cancel();
        }
    });
    let program = MotionProgram::new()
        .with_targets(Axis::A, [1000], 5000)
        .with_targets(Axis::B, [1000], 5000);
    let options = SessionOptions {
        presets: BTreeMap::from([
            (Axis::A, AxisPreset::default()),
            (Axis::B, AxisPreset::default()),
        ]),
        ..fast_options(3)
    };

    let summary = run(&sim, &program, &[Axis::A, Axis::B], &options, &cancel);

    for axis in [Axis::A, Axis::B] {
        assert_eq!(
            summary.outcome(axis),
            Some(AxisOutcome::Aborted(AbortReason::Cancelled))
        );
    }
    let history = sim.history();
    let kp = history.iter().position(|c| c == "KPA=10").unwrap();
    assert_eq!(&history[kp + 1..], ["STA"]);
}

#[test]
fn test_verification_tolerance() {
    let within = SimulatedController::new().with_landing_offset(Axis::A, 7);
    let program = MotionProgram::new().with_targets(Axis::A, [5000, 6000], 5000);
    let summary = run(
        &within,
        &program,
        &[Axis::A],
        &fast_options(3),
        &CancellationToken::new(),
    );
    assert_eq!(summary.outcome(Axis::A), Some(AxisOutcome::Completed));
    assert!(!summary
        .log
        .iter()
        .any(|e| matches!(e.kind, EventKind::VerificationMismatch { .. })));
    assert!(!summary.log.iter().any(|e| e.is_warning_or_worse()));

    let beyond = SimulatedController::new().with_landing_offset(Axis::A, 50);
    let summary = run(
        &beyond,
        &program,
        &[Axis::A],
        &fast_options(3),
        &CancellationToken::new(),
    );
    let report = summary.report(Axis::A).unwrap();
    assert_eq!(report.outcome, AxisOutcome::Completed);
    assert_eq!(report.errors, 0);
    assert_eq!(report.waypoints_completed, 2);

    let first_mismatch = summary
        .log
        .iter()
        .position(|e| {
            matches!(
                e.kind,
                EventKind::VerificationMismatch {
                    target: 5000,
                    observed: 5050,
                    ..
                }
            )
        })
        .unwrap();
    let next_waypoint = summary
        .log
        .iter()
        .position(|e| matches!(e.kind, EventKind::WaypointStarted { index: 1, .. }))
        .unwrap();
    assert!(first_mismatch < next_waypoint);
    assert!(summary.log[first_mismatch].is_warning_or_worse());
}

#[test]
fn test_learned_spelling_is_reused_across_waypoints() {
    let sim = SimulatedController::new();
    sim.reject_when(|cmd| cmd.starts_with("PA A"));
    let program = MotionProgram::new().with_targets(Axis::A, [100, 200, 300], 5000);

    let summary = run(
        &sim,
        &program,
        &[Axis::A],
        &fast_options(3),
        &CancellationToken::new(),
    );

    assert_eq!(summary.outcome(Axis::A), Some(AxisOutcome::Completed));
    assert_eq!(
        moves_for(&sim, Axis::A),
        vec!["PA A=100", "PAA=100", "PAA=200", "PAA=300", "PAA=0"]
    );
}

#[test]
fn test_background_session_excludes_ad_hoc_commands() {
    let sim = SimulatedController::new().with_settle_polls(u32::MAX);
    let controller = Controller::new(sim.clone());
    let session = TestSession::new(controller.clone());
    let program = MotionProgram::new().with_targets(Axis::A, [1000, 2000], 5000);
    let options = SessionOptions {
        sequencer: SequencerConfig {
            poll_interval: Duration::from_millis(5),
            max_wait: Duration::from_secs(30),
            ..SequencerConfig::default()
        },
        ..SessionOptions::default()
    };

    let handle = session.start(program, vec![Axis::A], options).unwrap();
    assert!(matches!(
        controller.with_operations(|ops| ops.stop_all()),
        Err(ControllerError::Busy)
    ));
    assert!(matches!(
        controller.refresh_positions(),
        Err(ControllerError::Busy)
    ));

    for event in handle.events() {
        if matches!(event.kind, EventKind::PositionUpdate { .. }) {
            // The live display reads the published snapshot.
            assert!(controller.latest_positions().is_some());
            handle.cancel();
        }
    }

    let summary = handle.wait().unwrap();
    assert_eq!(
        summary.outcome(Axis::A),
        Some(AxisOutcome::Aborted(AbortReason::Cancelled))
    );
    assert!(!controller.is_session_active());
    assert!(controller.with_operations(|ops| ops.stop_all()).is_ok());
}
