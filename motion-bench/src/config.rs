//! Bench configuration: connection settings and per-axis presets.
//!
//! Stored as JSON in `~/.galil_bench/config.json` by default. A missing file
//! means the stock configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hardware::galil::{validate_parameter, Axis, ParameterCode, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::program::mm_to_counts;

/// Default controller address.
pub const DEFAULT_IP: &str = "192.168.0.100";

/// Default jog speed in counts/s.
pub const DEFAULT_JOG_SPEED: i64 = 128_000;

/// Encoder counts per motor revolution for the stock motors.
pub const DEFAULT_CLICKS_PER_TURN: i64 = 64_000;

/// Motor revolutions per millimetre of travel for the stock stages.
pub const DEFAULT_TURNS_PER_MM: f64 = 0.2;

const CONFIG_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid preset for axis {axis}: {reason}")]
    InvalidPreset { axis: Axis, reason: String },

    #[error("HOME not set")]
    NoHome,
}

fn default_clicks_per_turn() -> i64 {
    DEFAULT_CLICKS_PER_TURN
}

fn default_turns_per_mm() -> f64 {
    DEFAULT_TURNS_PER_MM
}

/// Tuning and mechanics for one axis.
///
/// Controller parameters are optional; only those present are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisPreset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jog_speed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ki: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ac: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tl: Option<f64>,
    #[serde(default = "default_clicks_per_turn")]
    pub clicks_per_turn: i64,
    #[serde(default = "default_turns_per_mm")]
    pub turns_per_mm: f64,
}

impl Default for AxisPreset {
    /// The stock preset shipped with the bench.
    fn default() -> Self {
        Self {
            jog_speed: Some(DEFAULT_JOG_SPEED),
            kp: Some(10.0),
            ki: Some(0.1),
            kd: Some(50.0),
            sp: Some(1_024_000),
            ac: Some(2_560_000),
            dc: Some(2_560_000),
            tl: Some(8.2),
            clicks_per_turn: DEFAULT_CLICKS_PER_TURN,
            turns_per_mm: DEFAULT_TURNS_PER_MM,
        }
    }
}

impl AxisPreset {
    /// Preset with no controller parameters and stock mechanics.
    pub fn empty() -> Self {
        Self {
            jog_speed: None,
            kp: None,
            ki: None,
            kd: None,
            sp: None,
            ac: None,
            dc: None,
            tl: None,
            clicks_per_turn: DEFAULT_CLICKS_PER_TURN,
            turns_per_mm: DEFAULT_TURNS_PER_MM,
        }
    }

    /// Controller parameters to apply, in application order.
    pub fn parameters(&self) -> Vec<(ParameterCode, f64)> {
        [
            (ParameterCode::ProportionalGain, self.kp),
            (ParameterCode::IntegralGain, self.ki),
            (ParameterCode::DerivativeGain, self.kd),
            (ParameterCode::Speed, self.sp.map(|v| v as f64)),
            (ParameterCode::Acceleration, self.ac.map(|v| v as f64)),
            (ParameterCode::Deceleration, self.dc.map(|v| v as f64)),
            (ParameterCode::TorqueLimit, self.tl),
        ]
        .into_iter()
        .filter_map(|(code, value)| value.map(|v| (code, v)))
        .collect()
    }

    /// Convert millimetres of travel to encoder counts.
    pub fn mm_to_counts(&self, distance_mm: f64) -> i64 {
        mm_to_counts(distance_mm, self.turns_per_mm, self.clicks_per_turn)
    }

    pub fn validate(&self, axis: Axis) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPreset { axis, reason };

        for (code, value) in self.parameters() {
            validate_parameter(code, value).map_err(|e| invalid(e.to_string()))?;
        }
        if let Some(speed) = self.jog_speed {
            if speed <= 0 {
                return Err(invalid(format!("jog_speed must be positive, got {speed}")));
            }
        }
        if self.clicks_per_turn <= 0 {
            return Err(invalid(format!(
                "clicks_per_turn must be positive, got {}",
                self.clicks_per_turn
            )));
        }
        if !(self.turns_per_mm.is_finite() && self.turns_per_mm > 0.0) {
            return Err(invalid(format!(
                "turns_per_mm must be positive, got {}",
                self.turns_per_mm
            )));
        }
        Ok(())
    }
}

/// Connection settings and axis presets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub ip_address: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub jog_speed: i64,
    pub axis_presets: BTreeMap<Axis, AxisPreset>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            ip_address: DEFAULT_IP.to_string(),
            port: DEFAULT_PORT,
            timeout_ms: 2000,
            jog_speed: DEFAULT_JOG_SPEED,
            axis_presets: [Axis::A, Axis::B, Axis::C]
                .into_iter()
                .map(|axis| (axis, AxisPreset::default()))
                .collect(),
        }
    }
}

impl BenchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn preset(&self, axis: Axis) -> Option<&AxisPreset> {
        self.axis_presets.get(&axis)
    }

    /// Jog speed for an axis: its preset's, else the global default.
    pub fn jog_speed_for(&self, axis: Axis) -> i64 {
        self.preset(axis)
            .and_then(|p| p.jog_speed)
            .unwrap_or(self.jog_speed)
    }

    /// Preset for an axis, or an empty one with stock mechanics.
    pub fn preset_or_empty(&self, axis: Axis) -> AxisPreset {
        self.preset(axis).cloned().unwrap_or_else(AxisPreset::empty)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (&axis, preset) in &self.axis_presets {
            preset.validate(axis)?;
        }
        Ok(())
    }
}

/// Loads and saves [`BenchConfig`] under a root directory.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Storage rooted at `~/.galil_bench`.
    pub fn new() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
        Ok(Self {
            root_path: PathBuf::from(home).join(".galil_bench"),
        })
    }

    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_path.join(CONFIG_FILE)
    }

    /// Load the configuration; the stock configuration if no file exists.
    pub fn load(&self) -> Result<BenchConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("No config at {}; using defaults", path.display());
            return Ok(BenchConfig::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: BenchConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration, creating the root directory if needed.
    pub fn save(&self, config: &BenchConfig) -> Result<PathBuf, ConfigError> {
        config.validate()?;
        std::fs::create_dir_all(&self.root_path)?;
        let path = self.config_path();
        std::fs::write(&path, serde_json::to_string_pretty(config)?)?;
        info!("Saved config to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("nested"));
        let config = storage.load().unwrap();
        assert_eq!(config, BenchConfig::default());
        assert_eq!(config.port, 23);
        assert_eq!(config.axis_presets.len(), 3);
        assert!(config.preset(Axis::D).is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());

        let mut config = BenchConfig {
            ip_address: "10.0.0.5".to_string(),
            ..BenchConfig::default()
        };
        config.axis_presets.insert(
            Axis::D,
            AxisPreset {
                kp: Some(4.0),
                ..AxisPreset::empty()
            },
        );
        let path = storage.save(&config).unwrap();
        assert!(path.ends_with("config.json"));

        let loaded = storage.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());
        std::fs::write(
            storage.config_path(),
            r#"{"ip_address": "192.168.1.2", "axis_presets": {"B": {"kp": 12}}}"#,
        )
        .unwrap();

        let config = storage.load().unwrap();
        assert_eq!(config.ip_address, "192.168.1.2");
        assert_eq!(config.jog_speed, DEFAULT_JOG_SPEED);
        let preset = config.preset(Axis::B).unwrap();
        assert_eq!(preset.parameters(), vec![(ParameterCode::ProportionalGain, 12.0)]);
        assert_eq!(preset.clicks_per_turn, DEFAULT_CLICKS_PER_TURN);
        assert!(config.preset(Axis::A).is_none());
    }

    #[test]
    fn test_invalid_preset_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());
        std::fs::write(
            storage.config_path(),
            r#"{"axis_presets": {"A": {"sp": 0}}}"#,
        )
        .unwrap();
        assert!(matches!(
            storage.load(),
            Err(ConfigError::InvalidPreset { axis: Axis::A, .. })
        ));
    }

    #[test]
    fn test_preset_rules_match_controller_validation() {
        use hardware::galil::ValidationError;

        let cases = [
            (
                AxisPreset {
                    sp: Some(0),
                    ..AxisPreset::empty()
                },
                ValidationError::NonPositive {
                    code: ParameterCode::Speed,
                    value: 0.0,
                },
            ),
            (
                AxisPreset {
                    kp: Some(f64::NAN),
                    ..AxisPreset::empty()
                },
                ValidationError::NotFinite {
                    code: ParameterCode::ProportionalGain,
                    value: f64::NAN,
                },
            ),
            (
                AxisPreset {
                    tl: Some(-1.0),
                    ..AxisPreset::empty()
                },
                ValidationError::Negative {
                    code: ParameterCode::TorqueLimit,
                    value: -1.0,
                },
            ),
        ];
        for (preset, expected) in cases {
            match preset.validate(Axis::C) {
                Err(ConfigError::InvalidPreset { axis, reason }) => {
                    assert_eq!(axis, Axis::C);
                    assert_eq!(reason, expected.to_string());
                }
                other => panic!("expected an invalid preset, got {other:?}"),
            }
        }
        assert!(AxisPreset::default().validate(Axis::A).is_ok());
    }

    #[test]
    fn test_stock_preset_parameters() {
        let preset = AxisPreset::default();
        let codes: Vec<&str> = preset.parameters().iter().map(|(c, _)| c.code()).collect();
        assert_eq!(codes, vec!["KP", "KI", "KD", "SP", "AC", "DC", "TL"]);
        assert_relative_eq!(preset.mm_to_counts(1.0) as f64, 12_800.0);
    }

    #[test]
    fn test_jog_speed_fallback() {
        let mut config = BenchConfig::default();
        config.axis_presets.insert(Axis::A, AxisPreset::empty());
        assert_eq!(config.jog_speed_for(Axis::A), DEFAULT_JOG_SPEED);
        config.jog_speed = 5000;
        assert_eq!(config.jog_speed_for(Axis::A), 5000);
        assert_eq!(config.jog_speed_for(Axis::B), DEFAULT_JOG_SPEED);
    }
}
