//! Automated motion verification for Galil controllers.
//!
//! A [`TestSession`](session::TestSession) drives each selected axis through a
//! [`MotionProgram`](program::MotionProgram) one axis at a time, verifying every
//! reached position and absorbing step failures up to an error budget. The
//! controlling context keeps a [`CancellationToken`](cancel::CancellationToken)
//! and a stream of [`SessionEvent`](events::SessionEvent)s.

pub mod cancel;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod program;
pub mod sequencer;
pub mod session;
