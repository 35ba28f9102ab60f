//! Simulated Galil controller.
//!
//! Implements [`CommandChannel`] with enough of the DMC command set to drive
//! the motion engine without hardware: servo, jog, absolute moves, stop,
//! parameters, `TP`, `MG _BGx` and the common `MG` operands. Both the compact
//! (`PAA=100`) and spaced (`PA A=100`) spellings are understood.
//!
//! Clones share state, so a test can keep one handle to inject faults while
//! another is owned by the controller.
//!
//! ```
//! use hardware::galil::sim::SimulatedController;
//! use hardware::galil::{Axis, AxisOperations};
//!
//! let sim = SimulatedController::new();
//! let mut ops = AxisOperations::new(sim.clone());
//! ops.servo_on(Axis::A).unwrap();
//! ops.absolute_move(Axis::A, 1500).unwrap();
//! assert_eq!(sim.position(Axis::A), 1500);
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::axis::Axis;
use super::channel::{ChannelResult, CommandChannel, CommunicationError, ACK, NAK};

type Fault = Box<dyn Fn(&str) -> Option<ChannelResult<String>> + Send>;
type Hook = Box<dyn FnMut(&str) + Send>;

#[derive(Debug, Clone, Default)]
struct AxisState {
    position: i64,
    target: Option<i64>,
    servo: bool,
    jog_speed: Option<i64>,
    /// Remaining queries before an in-flight move lands.
    polls_remaining: Option<u32>,
    parameters: BTreeMap<String, f64>,
}

#[derive(Default)]
struct SimState {
    axes: BTreeMap<Axis, AxisState>,
    settle_polls: u32,
    landing_offset: BTreeMap<Axis, i64>,
    faults: Vec<Fault>,
    hooks: Vec<Hook>,
    history: Vec<String>,
    ip: Option<Ipv4Addr>,
}

impl SimState {
    fn axis(&mut self, axis: Axis) -> &mut AxisState {
        self.axes.entry(axis).or_default()
    }

    fn land(&mut self, axis: Axis) {
        let offset = self.landing_offset.get(&axis).copied().unwrap_or(0);
        let state = self.axis(axis);
        if let Some(target) = state.target.take() {
            state.position = target + offset;
        }
        state.polls_remaining = None;
    }

    fn begin(&mut self, axis: Axis) -> bool {
        let settle = self.settle_polls;
        let state = self.axis(axis);
        if !state.servo {
            return false;
        }
        if let Some(speed) = state.jog_speed {
            // Jogging: advance a nominal tenth of a second of travel.
            state.position += speed / 10;
            return true;
        }
        if state.target.is_some() {
            if settle == 0 {
                self.land(axis);
            } else {
                self.axis(axis).polls_remaining = Some(settle);
            }
        }
        true
    }

    fn stop(&mut self, axis: Axis) {
        let state = self.axis(axis);
        state.jog_speed = None;
        state.target = None;
        state.polls_remaining = None;
    }

    /// Advance an in-flight move by one status or position query.
    fn tick(&mut self, axis: Axis) {
        let remaining = self.axis(axis).polls_remaining;
        match remaining {
            Some(0) => self.land(axis),
            Some(n) => self.axis(axis).polls_remaining = Some(n - 1),
            None => {}
        }
    }

    fn is_moving(&mut self, axis: Axis) -> bool {
        self.tick(axis);
        let state = self.axis(axis);
        state.polls_remaining.is_some() || state.jog_speed.is_some_and(|s| s != 0)
    }

    fn report(&mut self) -> String {
        for axis in Axis::ALL {
            self.tick(axis);
        }
        Axis::ALL
            .iter()
            .map(|&a| self.axis(a).position.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// In-memory controller speaking the Galil command set.
#[derive(Clone, Default)]
pub struct SimulatedController {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves stay in flight for `polls` status or position queries before landing.
    pub fn with_settle_polls(self, polls: u32) -> Self {
        self.lock().settle_polls = polls;
        self
    }

    /// Moves on `axis` land `offset` counts away from their target.
    pub fn with_landing_offset(self, axis: Axis, offset: i64) -> Self {
        self.lock().landing_offset.insert(axis, offset);
        self
    }

    /// Set the current position of an axis.
    pub fn with_position(self, axis: Axis, position: i64) -> Self {
        self.lock().axis(axis).position = position;
        self
    }

    /// Reply `?` to every command matching `predicate`.
    pub fn reject_when<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        self.lock().faults.push(Box::new(move |cmd| {
            predicate(cmd).then(|| Ok(NAK.to_string()))
        }));
    }

    /// Fail every command matching `predicate` with a transport timeout.
    pub fn time_out_when<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        self.lock().faults.push(Box::new(move |cmd| {
            predicate(cmd).then(|| Err(CommunicationError::Timeout))
        }));
    }

    /// Call `hook` with every command before it is processed.
    pub fn on_command<F>(&self, hook: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.lock().hooks.push(Box::new(hook));
    }

    pub fn position(&self, axis: Axis) -> i64 {
        self.lock().axis(axis).position
    }

    pub fn servo_enabled(&self, axis: Axis) -> bool {
        self.lock().axis(axis).servo
    }

    /// Last value set for a parameter (`"SP"`, `"KP"`, ...).
    pub fn parameter(&self, axis: Axis, code: &str) -> Option<f64> {
        self.lock().axis(axis).parameters.get(code).copied()
    }

    /// Address set with `IP`, if any.
    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.lock().ip
    }

    /// Every command received, in order.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    fn process(state: &mut SimState, command: &str) -> String {
        let cmd = command.trim().to_ascii_uppercase();

        if cmd == "TP" {
            return state.report();
        }
        if cmd == "ST" {
            for axis in Axis::ALL {
                state.stop(axis);
            }
            return ACK.to_string();
        }
        if let Some(operand) = cmd.strip_prefix("MG _") {
            return Self::message(state, operand);
        }
        // Only the spaced dotted form, like firmware that wants a separator.
        if let Some(address) = cmd.strip_prefix("IP ") {
            return match address.trim().parse::<Ipv4Addr>() {
                Ok(ip) => {
                    state.ip = Some(ip);
                    ACK.to_string()
                }
                Err(_) => NAK.to_string(),
            };
        }

        let (Some(mnemonic), Some(rest)) = (cmd.get(..2), cmd.get(2..)) else {
            return NAK.to_string();
        };
        let rest = rest.trim_start();
        let Some(axis_letter) = rest.chars().next() else {
            return NAK.to_string();
        };
        let axis = match axis_letter {
            'A'..='D' => axis_letter.to_string().parse::<Axis>().ok(),
            '1'..='9' if mnemonic == "SH" => rest
                .parse::<u8>()
                .ok()
                .and_then(|bits| Axis::ALL.into_iter().find(|a| a.servo_bit() == bits)),
            _ => None,
        };
        let Some(axis) = axis else {
            return NAK.to_string();
        };
        let args = if axis_letter.is_ascii_digit() {
            ""
        } else {
            rest[1..].trim_start()
        };
        let value = args
            .strip_prefix('=')
            .or_else(|| (!args.is_empty()).then_some(args))
            .map(|v| v.trim().parse::<f64>());

        let ok = match (mnemonic, value) {
            ("SH", None) => {
                state.axis(axis).servo = true;
                true
            }
            ("MO", None) => {
                state.stop(axis);
                state.axis(axis).servo = false;
                true
            }
            ("BG", None) => state.begin(axis),
            ("ST", None) => {
                state.stop(axis);
                true
            }
            ("JG", Some(Ok(v))) if args.starts_with('=') => {
                let s = state.axis(axis);
                s.jog_speed = Some(v as i64);
                s.target = None;
                true
            }
            ("PA", Some(Ok(v))) => {
                let s = state.axis(axis);
                s.target = Some(v as i64);
                s.jog_speed = None;
                true
            }
            ("DP", Some(Ok(v))) if args.starts_with('=') => {
                state.axis(axis).position = v as i64;
                true
            }
            ("SP" | "AC" | "DC" | "TL" | "KP" | "KI" | "KD", Some(Ok(v)))
                if args.starts_with('=') =>
            {
                state
                    .axis(axis)
                    .parameters
                    .insert(mnemonic.to_string(), v);
                true
            }
            _ => false,
        };

        if ok {
            ACK.to_string()
        } else {
            NAK.to_string()
        }
    }

    fn message(state: &mut SimState, operand: &str) -> String {
        if let Some(letter) = operand.strip_prefix("BG") {
            return match letter.parse::<Axis>() {
                Ok(axis) => {
                    if state.is_moving(axis) {
                        "1.0000".to_string()
                    } else {
                        "0.0000".to_string()
                    }
                }
                Err(_) => NAK.to_string(),
            };
        }
        match operand {
            "FW" => "DMC4040 Rev 1.3a (simulated)".to_string(),
            "ID" => "DMC4040 SIM".to_string(),
            "BN" => "40400001".to_string(),
            "TC" => "0".to_string(),
            "TE" => "0, 0, 0, 0".to_string(),
            "LF" => "1, 1, 1, 1".to_string(),
            "IP" => {
                let octets = state.ip.map_or([192, 168, 0, 100], |ip| ip.octets());
                octets.map(|o| o.to_string()).join(", ")
            }
            _ => NAK.to_string(),
        }
    }
}

impl CommandChannel for SimulatedController {
    fn send(&mut self, command: &str) -> ChannelResult<String> {
        let mut state = self.lock();
        state.history.push(command.to_string());
        for hook in state.hooks.iter_mut() {
            hook(command);
        }

        for fault in &state.faults {
            if let Some(result) = fault(command) {
                trace!("Sim fault on {command:?}");
                return result;
            }
        }

        let reply = Self::process(&mut state, command);
        trace!("Sim {command:?} -> {reply:?}");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::galil::operations::AxisOperations;

    #[test]
    fn test_compact_and_spaced_spellings() {
        let mut sim = SimulatedController::new();
        for cmd in ["SHA", "SH B", "SH 4", "SH8"] {
            assert_eq!(sim.send(cmd).unwrap(), ":", "{cmd}");
        }
        for axis in Axis::ALL {
            assert!(sim.servo_enabled(axis));
        }

        assert_eq!(sim.send("PA A=100").unwrap(), ":");
        assert_eq!(sim.send("PAB=200").unwrap(), ":");
        assert_eq!(sim.send("PA C 300").unwrap(), ":");
        sim.send("BGA").unwrap();
        sim.send("BG B").unwrap();
        sim.send("BGC").unwrap();
        assert_eq!(sim.send("TP").unwrap(), "100, 200, 300, 0");
    }

    #[test]
    fn test_unknown_commands_are_rejected() {
        let mut sim = SimulatedController::new();
        assert_eq!(sim.send("XQ #AUTO").unwrap(), "?");
        assert_eq!(sim.send("SHE").unwrap(), "?");
        assert_eq!(sim.send("MG _BG").unwrap(), "?");
        assert_eq!(sim.send("SP A").unwrap(), "?");
    }

    #[test]
    fn test_begin_requires_servo() {
        let mut sim = SimulatedController::new();
        sim.send("PA A=100").unwrap();
        assert_eq!(sim.send("BGA").unwrap(), "?");
        assert_eq!(sim.position(Axis::A), 0);
    }

    #[test]
    fn test_settle_polls_report_motion() {
        let sim = SimulatedController::new().with_settle_polls(2);
        let mut ops = AxisOperations::new(sim.clone());
        ops.servo_on(Axis::B).unwrap();
        ops.absolute_move(Axis::B, 700).unwrap();

        assert!(ops.is_moving(Axis::B).unwrap());
        assert!(ops.is_moving(Axis::B).unwrap());
        assert!(!ops.is_moving(Axis::B).unwrap());
        assert_eq!(sim.position(Axis::B), 700);
    }

    #[test]
    fn test_landing_offset() {
        let sim = SimulatedController::new().with_landing_offset(Axis::A, 40);
        let mut ops = AxisOperations::new(sim.clone());
        ops.servo_on(Axis::A).unwrap();
        ops.absolute_move(Axis::A, 5000).unwrap();
        assert_eq!(sim.position(Axis::A), 5040);
    }

    #[test]
    fn test_injected_rejection_and_timeout() {
        let mut sim = SimulatedController::new();
        sim.reject_when(|cmd| cmd.starts_with("PA"));
        sim.time_out_when(|cmd| cmd == "TP");
        assert_eq!(sim.send("PA A=1").unwrap(), "?");
        assert!(matches!(sim.send("TP"), Err(CommunicationError::Timeout)));
    }

    #[test]
    fn test_parameters_and_stop() {
        let mut sim = SimulatedController::new();
        sim.send("SPA=5000").unwrap();
        sim.send("KI B=0.1").unwrap();
        assert_eq!(sim.parameter(Axis::A, "SP"), Some(5000.0));
        assert_eq!(sim.parameter(Axis::B, "KI"), Some(0.1));

        sim.send("SHA").unwrap();
        sim.send("JGA=-5000").unwrap();
        sim.send("BGA").unwrap();
        assert_eq!(sim.position(Axis::A), -500);
        assert_eq!(sim.send("MG _BGA").unwrap(), "1.0000");
        sim.send("STA").unwrap();
        assert_eq!(sim.send("MG _BGA").unwrap(), "0.0000");
    }

    #[test]
    fn test_ip_address_needs_spaced_form() {
        let mut sim = SimulatedController::new();
        assert_eq!(sim.send("MG _IP").unwrap(), "192, 168, 0, 100");
        assert_eq!(sim.send("IP10.0.0.5").unwrap(), "?");
        assert_eq!(sim.send("IP 10.0.0.256").unwrap(), "?");
        assert_eq!(sim.send("IP 10.0.0.5").unwrap(), ":");
        assert_eq!(sim.ip_address(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(sim.send("MG _IP").unwrap(), "10, 0, 0, 5");
    }
}
