//! Shared controller handle with session exclusion.
//!
//! The physical link is a single serialised resource. [`Controller`] owns it
//! and hands it out in two ways:
//!
//! - ad-hoc calls from the controlling context via
//!   [`with_operations`](Controller::with_operations) and
//!   [`refresh_positions`](Controller::refresh_positions)
//! - exclusive use by a background motion session via
//!   [`acquire_session`](Controller::acquire_session)
//!
//! While a [`SessionLease`] is alive every ad-hoc call fails with
//! [`ControllerError::Busy`] instead of interleaving traffic with the session.
//! Live displays keep working through [`latest_positions`](Controller::latest_positions),
//! which reads the snapshot the session publishes and sends nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use super::channel::CommandChannel;
use super::operations::{AxisOperations, OperationError};
use super::position::{PositionError, PositionOracle, PositionSnapshot};

/// Errors from the controller handle.
#[derive(Error, Debug, Clone)]
pub enum ControllerError {
    /// A motion session holds the channel.
    #[error("Controller busy: a motion session is active")]
    Busy,

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Position(#[from] PositionError),
}

struct Shared<C> {
    link: Mutex<AxisOperations<C>>,
    oracle: PositionOracle,
    session_active: AtomicBool,
}

/// Explicit handle to one controller.
///
/// Cheap to clone; all clones refer to the same link.
pub struct Controller<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Controller<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: CommandChannel> Controller<C> {
    pub fn new(channel: C) -> Self {
        Self {
            shared: Arc::new(Shared {
                link: Mutex::new(AxisOperations::new(channel)),
                oracle: PositionOracle::new(),
                session_active: AtomicBool::new(false),
            }),
        }
    }

    /// Whether a motion session currently holds the channel.
    pub fn is_session_active(&self) -> bool {
        self.shared.session_active.load(Ordering::Acquire)
    }

    /// Run ad-hoc operations from the controlling context.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Busy`] while a session is active.
    pub fn with_operations<R>(
        &self,
        f: impl FnOnce(&mut AxisOperations<C>) -> R,
    ) -> Result<R, ControllerError> {
        if self.is_session_active() {
            return Err(ControllerError::Busy);
        }
        let mut ops = self.lock_link();
        // A session may have started while we waited for the lock.
        if self.is_session_active() {
            return Err(ControllerError::Busy);
        }
        Ok(f(&mut *ops))
    }

    /// Query positions now. Fails with `Busy` during a session.
    pub fn refresh_positions(&self) -> Result<PositionSnapshot, ControllerError> {
        let oracle = self.shared.oracle.clone();
        Ok(self.with_operations(|ops| oracle.refresh(ops))??)
    }

    /// Last published positions, without touching the channel.
    pub fn latest_positions(&self) -> Option<PositionSnapshot> {
        self.shared.oracle.latest()
    }

    /// Shared position state for live display.
    pub fn oracle(&self) -> PositionOracle {
        self.shared.oracle.clone()
    }

    /// Replace the link after a reconnect. Learned spellings are forgotten.
    pub fn reconnect(&self, channel: C) -> Result<(), ControllerError> {
        self.with_operations(|ops| {
            ops.probe_mut().replace_channel(channel);
        })?;
        info!("Controller link replaced; format cache cleared");
        Ok(())
    }

    /// Reserve the channel for a motion session.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Busy`] if another session holds it.
    pub fn acquire_session(&self) -> Result<SessionLease<C>, ControllerError> {
        self.shared
            .session_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ControllerError::Busy)?;
        debug!("Session lease acquired");
        Ok(SessionLease {
            shared: Arc::clone(&self.shared),
        })
    }

    fn lock_link(&self) -> MutexGuard<'_, AxisOperations<C>> {
        self.shared
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to the channel for one motion session.
///
/// Released on drop.
pub struct SessionLease<C> {
    shared: Arc<Shared<C>>,
}

impl<C: CommandChannel> SessionLease<C> {
    /// Lock the link for the session's traffic.
    pub fn operations(&self) -> MutexGuard<'_, AxisOperations<C>> {
        self.shared
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Position state shared with the controlling context.
    pub fn oracle(&self) -> &PositionOracle {
        &self.shared.oracle
    }
}

impl<C> Drop for SessionLease<C> {
    fn drop(&mut self) {
        self.shared.session_active.store(false, Ordering::Release);
        debug!("Session lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::galil::axis::Axis;
    use crate::galil::scripted::ScriptedChannel;

    fn controller() -> (Controller<ScriptedChannel>, crate::galil::scripted::SentLog) {
        let channel = ScriptedChannel::new(|cmd| {
            Ok(if cmd == "TP" { "1, 2, 3, 4" } else { ":" }.to_string())
        });
        let log = channel.sent_log();
        (Controller::new(channel), log)
    }

    #[test]
    fn test_ad_hoc_calls_without_session() {
        let (controller, log) = controller();
        controller
            .with_operations(|ops| ops.servo_on(Axis::A))
            .unwrap()
            .unwrap();
        let snapshot = controller.refresh_positions().unwrap();
        assert_eq!(snapshot.get(Axis::B), Some(2));
        assert_eq!(log.commands(), vec!["SHA", "TP"]);
    }

    #[test]
    fn test_session_blocks_ad_hoc_traffic() {
        let (controller, log) = controller();
        let lease = controller.acquire_session().unwrap();

        assert!(controller.is_session_active());
        assert!(matches!(
            controller.with_operations(|ops| ops.stop_all()),
            Err(ControllerError::Busy)
        ));
        assert!(matches!(
            controller.refresh_positions(),
            Err(ControllerError::Busy)
        ));
        assert!(log.is_empty());

        lease.oracle().refresh(&mut *lease.operations()).unwrap();
        assert_eq!(controller.latest_positions().unwrap().get(Axis::D), Some(4));

        drop(lease);
        assert!(!controller.is_session_active());
        assert!(controller.with_operations(|ops| ops.stop_all()).is_ok());
    }

    #[test]
    fn test_only_one_session_at_a_time() {
        let (controller, _) = controller();
        let first = controller.acquire_session().unwrap();
        assert!(matches!(
            controller.acquire_session(),
            Err(ControllerError::Busy)
        ));
        drop(first);
        assert!(controller.acquire_session().is_ok());
    }

    #[test]
    fn test_reconnect_clears_learned_spellings() {
        let (controller, _) = controller();
        controller
            .with_operations(|ops| ops.stop(Axis::A))
            .unwrap()
            .unwrap();
        controller
            .reconnect(ScriptedChannel::accept_all())
            .unwrap();
        let cached = controller
            .with_operations(|ops| ops.probe().cache().len())
            .unwrap();
        assert_eq!(cached, 0);
    }
}
