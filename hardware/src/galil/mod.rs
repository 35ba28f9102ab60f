//! Galil DMC motion controller over TCP.
//!
//! Layers, bottom up:
//!
//! - [`CommandChannel`]: one request, one normalised reply
//! - [`SyntaxProbe`]: tries candidate spellings and caches the winner
//! - [`AxisOperations`]: validated logical operations
//! - [`PositionOracle`]: parses `TP` reports and shares the latest readings
//! - [`Controller`]: shared handle that excludes ad-hoc traffic during a session

mod axis;
mod channel;
mod controller;
mod operations;
mod position;
mod probe;
pub mod scripted;
pub mod sim;
mod syntax;

pub use axis::Axis;
pub use channel::{
    normalize_reply, ChannelResult, CommandChannel, CommunicationError, TcpChannel, ACK,
    DEFAULT_PORT, DEFAULT_TIMEOUT, NAK,
};
pub use controller::{Controller, ControllerError, SessionLease};
pub use operations::{
    parse_motion_status, validate_parameter, AxisOperations, OperationError, OperationResult,
    ValidationError, MAX_POSITION,
};
pub use position::{parse_positions, AxisReading, PositionError, PositionOracle, PositionSnapshot};
pub use probe::{AttemptOutcome, CacheKey, FormatCache, ProbeAttempt, ProtocolError, SyntaxProbe};
pub use syntax::{is_rejection, InfoItem, Operation, OperationKind, ParameterCode, REJECTION_TOKENS};
