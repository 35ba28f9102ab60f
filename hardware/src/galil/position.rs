//! Multi-axis position reports.
//!
//! `TP` answers with one signed count per axis in A, B, C, D order:
//!
//! ```text
//! 1000, 2000, 3000, 4000
//! ```
//!
//! Parsing is lenient: a malformed field drops only that axis, so one bad
//! value never hides the others.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use super::axis::Axis;
use super::channel::CommandChannel;
use super::operations::{AxisOperations, OperationError};

/// Position refresh failures.
#[derive(Error, Debug, Clone)]
pub enum PositionError {
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// The report contained no parseable field at all.
    #[error("Unparseable position report: {0:?}")]
    Unparseable(String),
}

/// Positions observed by one `TP` query.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    positions: BTreeMap<Axis, i64>,
    captured_at: Instant,
}

impl PositionSnapshot {
    pub fn new(positions: BTreeMap<Axis, i64>, captured_at: Instant) -> Self {
        Self {
            positions,
            captured_at,
        }
    }

    /// Snapshot with no observations, stamped now.
    pub fn empty() -> Self {
        Self::new(BTreeMap::new(), Instant::now())
    }

    /// Position of an axis in encoder counts, if it was in the report.
    pub fn get(&self, axis: Axis) -> Option<i64> {
        self.positions.get(&axis).copied()
    }

    pub fn positions(&self) -> &BTreeMap<Axis, i64> {
        &self.positions
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Time since capture.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }
}

/// Last reading for a single axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisReading {
    pub counts: i64,
    pub observed_at: Instant,
}

/// Parse a `TP` reply into axis positions.
///
/// Fields map to axes by index. Fields that are not integers are skipped, and
/// fields beyond the last axis are ignored.
pub fn parse_positions(report: &str) -> BTreeMap<Axis, i64> {
    report
        .trim()
        .split(',')
        .enumerate()
        .filter_map(|(index, field)| {
            let axis = Axis::from_index(index)?;
            match field.trim().parse::<i64>() {
                Ok(value) => Some((axis, value)),
                Err(_) => {
                    trace!("Skipping malformed position field {index}: {field:?}");
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, Default)]
struct OracleState {
    latest: Option<PositionSnapshot>,
    per_axis: BTreeMap<Axis, AxisReading>,
}

/// Reads positions and shares the latest observations.
///
/// Clones share state: a display can hold one clone and read
/// [`latest`](Self::latest) while the motion worker refreshes through another.
#[derive(Debug, Clone, Default)]
pub struct PositionOracle {
    state: Arc<RwLock<OracleState>>,
}

impl PositionOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query all positions and publish them.
    ///
    /// Does not retry. Axes missing from the report keep their previous
    /// reading in [`last_known`](Self::last_known).
    pub fn refresh<C: CommandChannel>(
        &self,
        ops: &mut AxisOperations<C>,
    ) -> Result<PositionSnapshot, PositionError> {
        let report = ops.read_positions_raw()?;
        let positions = parse_positions(&report);
        if positions.is_empty() {
            return Err(PositionError::Unparseable(report));
        }

        let snapshot = PositionSnapshot::new(positions, Instant::now());
        debug!("Positions: {:?}", snapshot.positions());
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    fn publish(&self, snapshot: PositionSnapshot) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for (&axis, &counts) in snapshot.positions() {
            state.per_axis.insert(
                axis,
                AxisReading {
                    counts,
                    observed_at: snapshot.captured_at(),
                },
            );
        }
        state.latest = Some(snapshot);
    }

    /// Most recent snapshot, if any refresh has succeeded.
    pub fn latest(&self) -> Option<PositionSnapshot> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .clone()
    }

    /// Most recent reading of one axis across all refreshes.
    pub fn last_known(&self, axis: Axis) -> Option<AxisReading> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .per_axis
            .get(&axis)
            .copied()
    }
}
