//! Motion programs: ordered waypoints per axis.

use std::collections::BTreeMap;

use hardware::galil::Axis;
use serde::{Deserialize, Serialize};

/// One target position and speed for an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waypoint {
    axis: Axis,
    target: i64,
    speed: i64,
}

impl Waypoint {
    /// `target` in encoder counts, `speed` in counts/s.
    pub fn new(axis: Axis, target: i64, speed: i64) -> Self {
        Self {
            axis,
            target,
            speed,
        }
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn target(&self) -> i64 {
        self.target
    }

    pub fn speed(&self) -> i64 {
        self.speed
    }
}

/// Waypoints grouped by axis, each group in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionProgram {
    waypoints: BTreeMap<Axis, Vec<Waypoint>>,
}

impl MotionProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a waypoint to its axis's group.
    pub fn push(&mut self, waypoint: Waypoint) {
        self.waypoints
            .entry(waypoint.axis())
            .or_default()
            .push(waypoint);
    }

    /// Builder form of [`push`](Self::push) for a run of targets at one speed.
    pub fn with_targets(
        mut self,
        axis: Axis,
        targets: impl IntoIterator<Item = i64>,
        speed: i64,
    ) -> Self {
        for target in targets {
            self.push(Waypoint::new(axis, target, speed));
        }
        self
    }

    /// Sweep around `origin`: `+distance/2`, `-distance/2`, back to `origin`.
    pub fn symmetric_sweep(self, axis: Axis, origin: i64, distance: i64, speed: i64) -> Self {
        let half = distance / 2;
        self.with_targets(axis, [origin + half, origin - half, origin], speed)
    }

    /// [`symmetric_sweep`](Self::symmetric_sweep) with the distance in millimetres.
    pub fn symmetric_sweep_mm(
        self,
        axis: Axis,
        origin: i64,
        distance_mm: f64,
        turns_per_mm: f64,
        clicks_per_turn: i64,
        speed: i64,
    ) -> Self {
        let distance = mm_to_counts(distance_mm, turns_per_mm, clicks_per_turn);
        self.symmetric_sweep(axis, origin, distance, speed)
    }

    /// Waypoints for one axis; empty if the axis has none.
    pub fn waypoints(&self, axis: Axis) -> &[Waypoint] {
        self.waypoints.get(&axis).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Axes with at least one waypoint.
    pub fn axes(&self) -> impl Iterator<Item = Axis> + '_ {
        self.waypoints
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(&axis, _)| axis)
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.values().all(Vec::is_empty)
    }

    /// All waypoints across axes.
    pub fn iter(&self) -> impl Iterator<Item = &Waypoint> {
        self.waypoints.values().flatten()
    }
}

/// Convert a distance in millimetres to encoder counts, truncating toward zero.
pub fn mm_to_counts(distance_mm: f64, turns_per_mm: f64, clicks_per_turn: i64) -> i64 {
    (distance_mm * turns_per_mm * clicks_per_turn as f64) as i64
}

/// Targets for moving from `from` to `to` in steps of at most `max_step`.
///
/// The last element is always `to`. Every earlier element lies strictly
/// between `from` and `to`. A `max_step` of 0 means a single step.
pub fn intermediate_targets(from: i64, to: i64, max_step: u32) -> Vec<i64> {
    let distance = to.abs_diff(from);
    let step = u64::from(max_step);
    if step == 0 || distance <= step {
        return vec![to];
    }

    let direction = if to > from { 1 } else { -1 };
    let count = distance.div_ceil(step);
    let mut targets: Vec<i64> = (1..count)
        .map(|k| from + direction * (k * step) as i64)
        .collect();
    targets.push(to);
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_symmetric_sweep() {
        let program = MotionProgram::new().symmetric_sweep(Axis::A, 100, 2000, 5000);
        let targets: Vec<i64> = program.waypoints(Axis::A).iter().map(|w| w.target()).collect();
        assert_eq!(targets, vec![1100, -900, 100]);
        assert!(program.waypoints(Axis::B).is_empty());
        assert_eq!(program.axes().collect::<Vec<_>>(), vec![Axis::A]);
    }

    #[test]
    fn test_mm_to_counts() {
        // 10 mm at 0.2 turns/mm and 64000 clicks/turn
        assert_eq!(mm_to_counts(10.0, 0.2, 64000), 128_000);
        assert_eq!(mm_to_counts(-1.0, 0.2, 64000), -12_800);
        assert_relative_eq!(mm_to_counts(0.01, 0.2, 64000) as f64, 128.0);
    }

    #[test]
    fn test_sweep_mm_matches_counts() {
        let mm = MotionProgram::new().symmetric_sweep_mm(Axis::C, 0, 10.0, 0.2, 64000, 1000);
        let counts = MotionProgram::new().symmetric_sweep(Axis::C, 0, 128_000, 1000);
        assert_eq!(mm, counts);
    }

    #[test]
    fn test_intermediate_targets_never_overshoot() {
        for (from, to, step) in [(0, 1000, 300), (1000, 0, 300), (-50, 50, 7), (5, 5, 1), (0, 900, 300)] {
            let targets = intermediate_targets(from, to, step);
            assert_eq!(*targets.last().unwrap(), to);
            let (lo, hi) = (from.min(to), from.max(to));
            for &t in &targets[..targets.len() - 1] {
                assert!(lo < t && t < hi, "{t} outside ({lo}, {hi})");
            }
            let mut previous = from;
            for &t in &targets {
                assert!(t.abs_diff(previous) <= u64::from(step));
                previous = t;
            }
        }
    }

    #[test]
    fn test_intermediate_targets_exact_multiple() {
        assert_eq!(intermediate_targets(0, 900, 300), vec![300, 600, 900]);
        assert_eq!(intermediate_targets(0, -1000, 300), vec![-300, -600, -900, -1000]);
        assert_eq!(intermediate_targets(0, 1000, 0), vec![1000]);
    }
}
