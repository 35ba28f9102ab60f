//! Controller information dump.

use std::net::Ipv4Addr;

use hardware::galil::{AxisOperations, CommandChannel, InfoItem, OperationResult};
use tracing::debug;

/// Labelled controller readings. Items the controller does not support are omitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerInfo {
    pub entries: Vec<(String, String)>,
}

impl ControllerInfo {
    pub fn get(&self, label: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for ControllerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (label, value) in &self.entries {
            writeln!(f, "{label}: {value}")?;
        }
        Ok(())
    }
}

/// Each label with the items to try, first supported wins.
const INFO_ITEMS: &[(&str, &[InfoItem])] = &[
    ("Firmware", &[InfoItem::Firmware, InfoItem::Identity]),
    ("Serial", &[InfoItem::SerialNumber]),
    ("Torque Command", &[InfoItem::TorqueCommand]),
    ("Error Code", &[InfoItem::ErrorCode]),
    ("Limit Switch Status", &[InfoItem::LimitSwitches]),
    ("Motion Status", &[InfoItem::MotionStatus]),
];

fn first_supported<C: CommandChannel>(
    ops: &mut AxisOperations<C>,
    items: &[InfoItem],
) -> Option<String> {
    items.iter().find_map(|&item| match ops.query_info(item) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("{} unsupported: {e}", item.operand());
            None
        }
    })
}

/// Query firmware, serial, positions, torque, error code, limits and motion status.
///
/// Each item is queried on its own; one unsupported item does not hide the rest.
pub fn controller_info<C: CommandChannel>(ops: &mut AxisOperations<C>) -> ControllerInfo {
    let mut info = ControllerInfo::default();
    for &(label, items) in INFO_ITEMS {
        if let Some(value) = first_supported(ops, items) {
            info.entries.push((label.to_string(), value));
        }
        if label == "Serial" {
            match ops.read_positions_raw() {
                Ok(positions) => info.entries.push(("Positions".to_string(), positions)),
                Err(e) => debug!("Position report unsupported: {e}"),
            }
        }
    }
    info
}

/// The controller's own IP address as it reports it.
pub fn controller_ip<C: CommandChannel>(ops: &mut AxisOperations<C>) -> Option<String> {
    first_supported(ops, &[InfoItem::IpAddress, InfoItem::IpAddressLong])
}

/// Assign a new IP address to the controller.
///
/// The link keeps using the old address until the controller is power cycled
/// or the connection is reopened.
pub fn set_controller_ip<C: CommandChannel>(
    ops: &mut AxisOperations<C>,
    ip: Ipv4Addr,
) -> OperationResult<()> {
    ops.set_ip_address(ip)
}

/// Firmware string, falling back to the identity query.
pub fn firmware<C: CommandChannel>(ops: &mut AxisOperations<C>) -> OperationResult<String> {
    ops.query_info(InfoItem::Firmware)
        .or_else(|_| ops.query_info(InfoItem::Identity))
}
