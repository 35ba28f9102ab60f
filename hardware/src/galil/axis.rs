use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::operations::ValidationError;

/// Galil axis identifiers.
///
/// The controller addresses axes by letter. Position reports (`TP`) list the
/// axes in this order, one comma-separated field per axis.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    ValueEnum,
    strum::EnumIter,
)]
pub enum Axis {
    A,
    B,
    C,
    D,
}

impl Axis {
    /// All axes in report order.
    pub const ALL: [Axis; 4] = [Axis::A, Axis::B, Axis::C, Axis::D];

    /// Axis letter as used in command text.
    pub fn letter(self) -> char {
        match self {
            Axis::A => 'A',
            Axis::B => 'B',
            Axis::C => 'C',
            Axis::D => 'D',
        }
    }

    /// Zero-based position of this axis in a `TP` report.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Axis for a zero-based report field index.
    pub fn from_index(index: usize) -> Option<Axis> {
        Self::ALL.get(index).copied()
    }

    /// Bit used by the bitmask spelling of servo-here (`SH 1`, `SH 2`, `SH 4`, `SH 8`).
    pub fn servo_bit(self) -> u8 {
        1 << self.index()
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl std::str::FromStr for Axis {
    type Err = ValidationError;

    /// Parses an axis letter, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Axis::A),
            "B" => Ok(Axis::B),
            "C" => Ok(Axis::C),
            "D" => Ok(Axis::D),
            _ => Err(ValidationError::InvalidAxis(s.to_string())),
        }
    }
}
