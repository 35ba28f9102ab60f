//! Logical operations and their candidate command spellings.
//!
//! Galil firmware revisions disagree on spacing and argument style, so each
//! logical operation carries an ordered list of renderings. The order is fixed:
//! [`SyntaxProbe`](super::SyntaxProbe) tries them first to last and caches the
//! index of the first one the controller accepts.
//!
//! | Operation | Candidates |
//! |-----------|------------|
//! | Servo on | `SHA`, `SH A`, `SH 1`, `SH1` |
//! | Servo off | `MOA`, `MO A` |
//! | Jog | `JGA=5000`, `JG A=5000` |
//! | Begin | `BGA`, `BG A` |
//! | Stop | `STA`, `ST A` |
//! | Stop all | `ST` |
//! | Position absolute | `PA A=1000`, `PAA=1000`, `PA A 1000` |
//! | Parameter | `SPA=5000`, `SP A=5000` (SP, AC, DC, TL, KP, KI, KD) |
//! | Define position | `DPA=0`, `DP A=0` |
//! | Position report | `TP` |
//! | Motion status | `MG _BGA`, `MG _BG` |
//! | Info query | `MG _FW`, `MG _BN`, ... |
//! | Set IP address | `IP10.0.0.5`, `IP 10.0.0.5`, `IP=10.0.0.5`, `IP10005` |

use std::net::Ipv4Addr;

use super::axis::Axis;

/// Replies that mean the controller did not accept a command.
pub const REJECTION_TOKENS: [&str; 5] = ["?", "ERROR", "error", "Unsupported", ""];

/// Whether a reply is a protocol-level rejection.
pub fn is_rejection(reply: &str) -> bool {
    let reply = reply.trim();
    REJECTION_TOKENS.contains(&reply)
}

/// Per-axis parameters set with `{CODE}{axis}={value}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::EnumIter)]
pub enum ParameterCode {
    /// `SP`: slew speed, counts/s
    Speed,
    /// `AC`: acceleration, counts/s²
    Acceleration,
    /// `DC`: deceleration, counts/s²
    Deceleration,
    /// `TL`: torque limit, volts
    TorqueLimit,
    /// `KP`: proportional gain
    ProportionalGain,
    /// `KI`: integral gain
    IntegralGain,
    /// `KD`: derivative gain
    DerivativeGain,
}

impl ParameterCode {
    /// Two-letter command mnemonic.
    pub fn code(self) -> &'static str {
        match self {
            ParameterCode::Speed => "SP",
            ParameterCode::Acceleration => "AC",
            ParameterCode::Deceleration => "DC",
            ParameterCode::TorqueLimit => "TL",
            ParameterCode::ProportionalGain => "KP",
            ParameterCode::IntegralGain => "KI",
            ParameterCode::DerivativeGain => "KD",
        }
    }

    /// Whether the controller takes this parameter as a whole number.
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ParameterCode::Speed | ParameterCode::Acceleration | ParameterCode::Deceleration
        )
    }
}

impl std::fmt::Display for ParameterCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Controller operands readable with `MG _{name}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum InfoItem {
    Firmware,
    Identity,
    SerialNumber,
    TorqueCommand,
    ErrorCode,
    LimitSwitches,
    MotionStatus,
    IpAddress,
    IpAddressLong,
}

impl InfoItem {
    /// Operand name without the leading underscore.
    pub fn operand(self) -> &'static str {
        match self {
            InfoItem::Firmware => "FW",
            InfoItem::Identity => "ID",
            InfoItem::SerialNumber => "BN",
            InfoItem::TorqueCommand => "TC",
            InfoItem::ErrorCode => "TE",
            InfoItem::LimitSwitches => "LF",
            InfoItem::MotionStatus => "BG",
            InfoItem::IpAddress => "IP",
            InfoItem::IpAddressLong => "IPADDR",
        }
    }
}

/// The kind of a logical operation, without its parameter values.
///
/// Together with the axis this is the key under which the winning spelling is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    ServoOn,
    ServoOff,
    Jog,
    Begin,
    Stop,
    StopAll,
    PositionAbsolute,
    SetParameter(ParameterCode),
    DefinePosition,
    ReadPositions,
    ReadStatus,
    QueryInfo(InfoItem),
    SetIpAddress,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::ServoOn => f.write_str("servo-on"),
            OperationKind::ServoOff => f.write_str("servo-off"),
            OperationKind::Jog => f.write_str("jog"),
            OperationKind::Begin => f.write_str("begin"),
            OperationKind::Stop => f.write_str("stop"),
            OperationKind::StopAll => f.write_str("stop-all"),
            OperationKind::PositionAbsolute => f.write_str("position-absolute"),
            OperationKind::SetParameter(code) => write!(f, "set-{}", code.code()),
            OperationKind::DefinePosition => f.write_str("define-position"),
            OperationKind::ReadPositions => f.write_str("read-positions"),
            OperationKind::ReadStatus => f.write_str("read-status"),
            OperationKind::QueryInfo(item) => write!(f, "query-_{}", item.operand()),
            OperationKind::SetIpAddress => f.write_str("set-ip"),
        }
    }
}

/// A logical operation with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    ServoOn(Axis),
    ServoOff(Axis),
    Jog { axis: Axis, speed: i64 },
    Begin(Axis),
    Stop(Axis),
    StopAll,
    PositionAbsolute { axis: Axis, position: i64 },
    SetParameter {
        axis: Axis,
        code: ParameterCode,
        value: f64,
    },
    DefinePosition { axis: Axis, position: i64 },
    ReadPositions,
    ReadStatus(Axis),
    QueryInfo(InfoItem),
    SetIpAddress(Ipv4Addr),
}

impl Operation {
    /// The operation kind used as cache key.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::ServoOn(_) => OperationKind::ServoOn,
            Operation::ServoOff(_) => OperationKind::ServoOff,
            Operation::Jog { .. } => OperationKind::Jog,
            Operation::Begin(_) => OperationKind::Begin,
            Operation::Stop(_) => OperationKind::Stop,
            Operation::StopAll => OperationKind::StopAll,
            Operation::PositionAbsolute { .. } => OperationKind::PositionAbsolute,
            Operation::SetParameter { code, .. } => OperationKind::SetParameter(*code),
            Operation::DefinePosition { .. } => OperationKind::DefinePosition,
            Operation::ReadPositions => OperationKind::ReadPositions,
            Operation::ReadStatus(_) => OperationKind::ReadStatus,
            Operation::QueryInfo(item) => OperationKind::QueryInfo(*item),
            Operation::SetIpAddress(_) => OperationKind::SetIpAddress,
        }
    }

    /// The addressed axis, if the operation targets one.
    pub fn axis(&self) -> Option<Axis> {
        match self {
            Operation::ServoOn(axis)
            | Operation::ServoOff(axis)
            | Operation::Begin(axis)
            | Operation::Stop(axis)
            | Operation::ReadStatus(axis)
            | Operation::Jog { axis, .. }
            | Operation::PositionAbsolute { axis, .. }
            | Operation::SetParameter { axis, .. }
            | Operation::DefinePosition { axis, .. } => Some(*axis),
            Operation::StopAll
            | Operation::ReadPositions
            | Operation::QueryInfo(_)
            | Operation::SetIpAddress(_) => None,
        }
    }

    /// All candidate renderings, highest priority first.
    pub fn candidates(&self) -> Vec<String> {
        match *self {
            Operation::ServoOn(axis) => {
                let bit = axis.servo_bit();
                vec![
                    format!("SH{axis}"),
                    format!("SH {axis}"),
                    format!("SH {bit}"),
                    format!("SH{bit}"),
                ]
            }
            Operation::ServoOff(axis) => vec![format!("MO{axis}"), format!("MO {axis}")],
            Operation::Jog { axis, speed } => {
                vec![format!("JG{axis}={speed}"), format!("JG {axis}={speed}")]
            }
            Operation::Begin(axis) => vec![format!("BG{axis}"), format!("BG {axis}")],
            Operation::Stop(axis) => vec![format!("ST{axis}"), format!("ST {axis}")],
            Operation::StopAll => vec!["ST".to_string()],
            Operation::PositionAbsolute { axis, position } => vec![
                format!("PA {axis}={position}"),
                format!("PA{axis}={position}"),
                format!("PA {axis} {position}"),
            ],
            Operation::SetParameter { axis, code, value } => {
                let value = format_value(code, value);
                vec![
                    format!("{code}{axis}={value}"),
                    format!("{code} {axis}={value}"),
                ]
            }
            Operation::DefinePosition { axis, position } => {
                vec![format!("DP{axis}={position}"), format!("DP {axis}={position}")]
            }
            Operation::ReadPositions => vec!["TP".to_string()],
            Operation::ReadStatus(axis) => vec![format!("MG _BG{axis}"), "MG _BG".to_string()],
            Operation::QueryInfo(item) => vec![format!("MG _{}", item.operand())],
            Operation::SetIpAddress(ip) => {
                let digits = ip.to_string().replace('.', "");
                vec![
                    format!("IP{ip}"),
                    format!("IP {ip}"),
                    format!("IP={ip}"),
                    format!("IP{digits}"),
                ]
            }
        }
    }
}

/// Render a parameter value the way the controller expects it.
///
/// Integral parameters are truncated; others keep up to four decimals with
/// trailing zeros removed.
fn format_value(code: ParameterCode, value: f64) -> String {
    if code.is_integral() {
        return format!("{}", value.trunc() as i64);
    }
    let text = format!("{value:.4}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() || text == "-" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_tokens() {
        for token in ["?", "ERROR", "error", "Unsupported", "", "  ?  "] {
            assert!(is_rejection(token), "{token:?} should be a rejection");
        }
        for reply in [":", "0", "1000, 2000", "Error 5", "?1"] {
            assert!(!is_rejection(reply), "{reply:?} should not be a rejection");
        }
    }

    #[test]
    fn test_servo_on_candidate_order() {
        assert_eq!(
            Operation::ServoOn(Axis::C).candidates(),
            vec!["SHC", "SH C", "SH 4", "SH4"]
        );
    }

    #[test]
    fn test_absolute_move_candidate_order() {
        assert_eq!(
            Operation::PositionAbsolute {
                axis: Axis::B,
                position: -250
            }
            .candidates(),
            vec!["PA B=-250", "PAB=-250", "PA B -250"]
        );
    }

    #[test]
    fn test_jog_is_sign_prefixed() {
        assert_eq!(
            Operation::Jog {
                axis: Axis::A,
                speed: -5000
            }
            .candidates()[0],
            "JGA=-5000"
        );
    }

    #[test]
    fn test_parameter_rendering() {
        let speed = Operation::SetParameter {
            axis: Axis::A,
            code: ParameterCode::Speed,
            value: 1024000.7,
        };
        assert_eq!(speed.candidates(), vec!["SPA=1024000", "SP A=1024000"]);

        let gain = Operation::SetParameter {
            axis: Axis::D,
            code: ParameterCode::IntegralGain,
            value: 0.1,
        };
        assert_eq!(gain.candidates()[0], "KID=0.1");

        let torque = Operation::SetParameter {
            axis: Axis::A,
            code: ParameterCode::TorqueLimit,
            value: 8.0,
        };
        assert_eq!(torque.candidates()[0], "TLA=8");
    }

    #[test]
    fn test_axisless_operations() {
        assert_eq!(Operation::StopAll.axis(), None);
        assert_eq!(Operation::ReadPositions.candidates(), vec!["TP"]);
        assert_eq!(
            Operation::QueryInfo(InfoItem::Firmware).candidates(),
            vec!["MG _FW"]
        );
    }

    #[test]
    fn test_set_ip_candidate_order() {
        let op = Operation::SetIpAddress(Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(op.axis(), None);
        assert_eq!(op.kind(), OperationKind::SetIpAddress);
        assert_eq!(
            op.candidates(),
            vec!["IP192.168.0.1", "IP 192.168.0.1", "IP=192.168.0.1", "IP19216801"]
        );
    }

    #[test]
    fn test_kind_keys_distinguish_parameter_codes() {
        let kp = Operation::SetParameter {
            axis: Axis::A,
            code: ParameterCode::ProportionalGain,
            value: 1.0,
        };
        let kd = Operation::SetParameter {
            axis: Axis::A,
            code: ParameterCode::DerivativeGain,
            value: 1.0,
        };
        assert_ne!(kp.kind(), kd.kind());
    }
}
