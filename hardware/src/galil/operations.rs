//! Typed axis operations for Galil controllers.
//!
//! [`AxisOperations`] validates parameters before any wire traffic and then
//! executes the logical operation through the [`SyntaxProbe`]. It does not
//! enforce ordering (servo-on before motion, speed before move); sequencing is
//! the caller's job.
//!
//! # Example
//!
//! ```no_run
//! use hardware::galil::{Axis, AxisOperations, TcpChannel};
//!
//! let channel = TcpChannel::connect_default_port("192.168.0.100")?;
//! let mut ops = AxisOperations::new(channel);
//!
//! ops.servo_on(Axis::A)?;
//! ops.set_speed(Axis::A, 10_000)?;
//! ops.absolute_move(Axis::A, 64_000)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::debug;

use super::axis::Axis;
use super::channel::CommandChannel;
use super::probe::{ProtocolError, SyntaxProbe};
use super::syntax::{InfoItem, Operation, ParameterCode};

/// Largest magnitude the controller accepts for a position in counts.
pub const MAX_POSITION: i64 = 2_147_483_647;

/// Input rejected before anything was sent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid axis '{0}'. Must be one of A, B, C, D")]
    InvalidAxis(String),

    #[error("Speed must be positive, got {0}")]
    NonPositiveSpeed(i64),

    #[error("{code} must be positive, got {value}")]
    NonPositive { code: ParameterCode, value: f64 },

    #[error("{code} must be a finite number, got {value}")]
    NotFinite { code: ParameterCode, value: f64 },

    #[error("{code} must not be negative, got {value}")]
    Negative { code: ParameterCode, value: f64 },

    #[error("Position {0} is outside ±{MAX_POSITION} counts")]
    PositionOutOfRange(i64),
}

/// Failure of a single axis operation.
#[derive(Error, Debug, Clone)]
pub enum OperationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for axis operations.
pub type OperationResult<T> = Result<T, OperationError>;

/// Logical operations on one controller.
pub struct AxisOperations<C> {
    probe: SyntaxProbe<C>,
}

impl<C: CommandChannel> AxisOperations<C> {
    pub fn new(channel: C) -> Self {
        Self {
            probe: SyntaxProbe::new(channel),
        }
    }

    pub fn from_probe(probe: SyntaxProbe<C>) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &SyntaxProbe<C> {
        &self.probe
    }

    pub fn probe_mut(&mut self) -> &mut SyntaxProbe<C> {
        &mut self.probe
    }

    fn execute(&mut self, operation: Operation) -> OperationResult<String> {
        Ok(self.probe.execute(&operation)?)
    }

    // ==================== Servo ====================

    /// Enable closed-loop control (servo here).
    pub fn servo_on(&mut self, axis: Axis) -> OperationResult<()> {
        self.execute(Operation::ServoOn(axis))?;
        Ok(())
    }

    /// Disable the motor (motor off).
    pub fn servo_off(&mut self, axis: Axis) -> OperationResult<()> {
        self.execute(Operation::ServoOff(axis))?;
        Ok(())
    }

    // ==================== Parameters ====================

    /// Set one per-axis parameter.
    ///
    /// Speed, acceleration and deceleration must be positive; torque limit
    /// must not be negative; gains must be finite.
    pub fn set_parameter(
        &mut self,
        axis: Axis,
        code: ParameterCode,
        value: f64,
    ) -> OperationResult<()> {
        validate_parameter(code, value)?;
        debug!("Axis {axis}: {code}={value}");
        self.execute(Operation::SetParameter { axis, code, value })?;
        Ok(())
    }

    /// Set slew speed in counts/s.
    pub fn set_speed(&mut self, axis: Axis, speed: i64) -> OperationResult<()> {
        if speed <= 0 {
            return Err(ValidationError::NonPositiveSpeed(speed).into());
        }
        self.set_parameter(axis, ParameterCode::Speed, speed as f64)
    }

    pub fn set_acceleration(&mut self, axis: Axis, accel: i64) -> OperationResult<()> {
        self.set_parameter(axis, ParameterCode::Acceleration, accel as f64)
    }

    pub fn set_deceleration(&mut self, axis: Axis, decel: i64) -> OperationResult<()> {
        self.set_parameter(axis, ParameterCode::Deceleration, decel as f64)
    }

    pub fn set_torque_limit(&mut self, axis: Axis, volts: f64) -> OperationResult<()> {
        self.set_parameter(axis, ParameterCode::TorqueLimit, volts)
    }

    /// Set PID gains. All three are validated before the first is sent.
    pub fn set_pid(&mut self, axis: Axis, kp: f64, ki: f64, kd: f64) -> OperationResult<()> {
        validate_parameter(ParameterCode::ProportionalGain, kp)?;
        validate_parameter(ParameterCode::IntegralGain, ki)?;
        validate_parameter(ParameterCode::DerivativeGain, kd)?;

        self.set_parameter(axis, ParameterCode::ProportionalGain, kp)?;
        self.set_parameter(axis, ParameterCode::IntegralGain, ki)?;
        self.set_parameter(axis, ParameterCode::DerivativeGain, kd)
    }

    // ==================== Motion ====================

    /// Set jog speed in counts/s; negative jogs in reverse. Motion starts on [`begin`](Self::begin).
    pub fn jog(&mut self, axis: Axis, speed: i64) -> OperationResult<()> {
        self.execute(Operation::Jog { axis, speed })?;
        Ok(())
    }

    /// Begin motion on an axis.
    pub fn begin(&mut self, axis: Axis) -> OperationResult<()> {
        self.execute(Operation::Begin(axis))?;
        Ok(())
    }

    /// Command an absolute move: position-absolute followed by begin.
    ///
    /// Returns once the controller accepted the move; it does not wait for completion.
    pub fn absolute_move(&mut self, axis: Axis, position: i64) -> OperationResult<()> {
        validate_position(position)?;
        debug!("Axis {axis}: absolute move to {position}");
        self.execute(Operation::PositionAbsolute { axis, position })?;
        self.begin(axis)
    }

    /// Decelerate one axis to a stop.
    pub fn stop(&mut self, axis: Axis) -> OperationResult<()> {
        self.execute(Operation::Stop(axis))?;
        Ok(())
    }

    /// Stop every axis.
    pub fn stop_all(&mut self) -> OperationResult<()> {
        self.execute(Operation::StopAll)?;
        Ok(())
    }

    /// Redefine the current position of an axis without moving it.
    pub fn define_position(&mut self, axis: Axis, position: i64) -> OperationResult<()> {
        validate_position(position)?;
        self.execute(Operation::DefinePosition { axis, position })?;
        Ok(())
    }

    // ==================== Queries ====================

    /// Raw all-axis position report (`TP`).
    pub fn read_positions_raw(&mut self) -> OperationResult<String> {
        self.execute(Operation::ReadPositions)
    }

    /// Whether the controller reports the axis as in motion.
    ///
    /// A numeric reply (`MG _BGA`) is in motion when non-zero; any other reply
    /// is in motion when it mentions the axis letter.
    pub fn is_moving(&mut self, axis: Axis) -> OperationResult<bool> {
        let reply = self.execute(Operation::ReadStatus(axis))?;
        Ok(parse_motion_status(&reply, axis))
    }

    /// Read a controller operand (`MG _FW`, ...).
    pub fn query_info(&mut self, item: InfoItem) -> OperationResult<String> {
        let reply = self.execute(Operation::QueryInfo(item))?;
        Ok(reply.trim().to_string())
    }

    /// Change the controller's own IP address. The link may drop once it takes effect.
    pub fn set_ip_address(&mut self, ip: Ipv4Addr) -> OperationResult<()> {
        debug!("Setting controller IP to {ip}");
        self.execute(Operation::SetIpAddress(ip))?;
        Ok(())
    }

    // ==================== Composite Operations ====================

    /// Servo on, set jog speed, begin.
    pub fn start_jog(&mut self, axis: Axis, speed: i64) -> OperationResult<()> {
        self.servo_on(axis)?;
        self.jog(axis, speed)?;
        self.begin(axis)
    }

    /// Stop, load new PID gains, re-engage the servo and hold position with a zero-speed jog.
    pub fn tune(&mut self, axis: Axis, kp: f64, ki: f64, kd: f64) -> OperationResult<()> {
        validate_parameter(ParameterCode::ProportionalGain, kp)?;
        validate_parameter(ParameterCode::IntegralGain, ki)?;
        validate_parameter(ParameterCode::DerivativeGain, kd)?;

        self.stop(axis)?;
        self.set_pid(axis, kp, ki, kd)?;
        self.servo_on(axis)?;
        self.jog(axis, 0)?;
        self.begin(axis)
    }

    /// Stop everything, move the axis to 0 and redefine that as the origin.
    pub fn reset_position(&mut self, axis: Axis) -> OperationResult<()> {
        if let Err(e) = self.stop_all() {
            debug!("Stop before reset failed: {e}");
        }
        self.absolute_move(axis, 0)?;
        self.define_position(axis, 0)
    }
}

/// Check a parameter value before it is sent.
///
/// Speed, acceleration and deceleration must be positive, torque limit must
/// not be negative, and every value must be finite.
pub fn validate_parameter(code: ParameterCode, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite { code, value });
    }
    match code {
        ParameterCode::Speed | ParameterCode::Acceleration | ParameterCode::Deceleration
            if value <= 0.0 =>
        {
            Err(ValidationError::NonPositive { code, value })
        }
        ParameterCode::TorqueLimit if value < 0.0 => Err(ValidationError::Negative { code, value }),
        _ => Ok(()),
    }
}

fn validate_position(position: i64) -> Result<(), ValidationError> {
    if position.unsigned_abs() > MAX_POSITION as u64 {
        Err(ValidationError::PositionOutOfRange(position))
    } else {
        Ok(())
    }
}

/// Interpret a motion-status reply for one axis.
pub fn parse_motion_status(reply: &str, axis: Axis) -> bool {
    let reply = reply.trim();
    match reply.parse::<f64>() {
        Ok(value) => value != 0.0,
        Err(_) => reply.to_ascii_uppercase().contains(axis.letter()),
    }
}
