//! Configuration management for PilotGate.
//!
//! Every section has serde defaults, so a config file only needs the keys
//! it wants to change. An empty file is a valid config.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vehicle: VehicleConfig,
    pub oracle: OracleConfig,
    pub arbitration: ArbitrationConfig,
    pub dispatch: DispatchConfig,
    pub perception: PerceptionConfig,
    pub logging: LoggingConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub vehicle_id: String,
    /// Vehicle link address, e.g. a MAVLink UDP endpoint
    pub link_address: String,
    pub default_takeoff_altitude_m: f32,
    pub max_altitude_m: f32,
    pub critical_battery_percent: f32,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            vehicle_id: "uav-001".to_string(),
            link_address: "udp://:14550".to_string(),
            default_takeoff_altitude_m: 10.0,
            max_altitude_m: 120.0,
            critical_battery_percent: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
    /// Launch a new proposal request every N decision cycles. A request
    /// still running when the next one is due delays it; it is never cut
    /// short before `timeout_ms`.
    pub interval_cycles: u32,
    pub temperature: f32,
    /// Query only while detections are present or a follow is active
    pub require_trigger: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3:8b".to_string(),
            timeout_ms: 30_000,
            interval_cycles: 50,
            temperature: 0.2,
            require_trigger: false,
        }
    }
}

/// Fixed action issued while in failsafe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeAction {
    Hold,
    Land,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub cycle_period_ms: u64,
    pub oracle_failure_threshold: u32,
    pub link_failure_threshold: u32,
    pub telemetry_stale_after_ms: u64,
    pub recovery_cycles: u32,
    pub failsafe_action: SafeAction,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: 100,
            oracle_failure_threshold: 5,
            link_failure_threshold: 3,
            telemetry_stale_after_ms: 2_000,
            recovery_cycles: 3,
            failsafe_action: SafeAction::Hold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub link_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 50,
            max_backoff_ms: 400,
            link_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    pub observation_ttl_ms: u64,
    pub min_confidence: f32,
    pub max_observations: usize,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            observation_ttl_ms: 5_000,
            min_confidence: 0.5,
            max_observations: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// SQLite file for the command audit log; `None` disables auditing
    pub path: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject values the decision loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let arb = &self.arbitration;
        if arb.cycle_period_ms == 0 {
            return Err(invalid("arbitration.cycle_period_ms must be > 0"));
        }
        if arb.oracle_failure_threshold == 0 || arb.link_failure_threshold == 0 {
            return Err(invalid("arbitration failure thresholds must be > 0"));
        }
        if arb.telemetry_stale_after_ms == 0 {
            return Err(invalid("arbitration.telemetry_stale_after_ms must be > 0"));
        }
        if arb.recovery_cycles == 0 {
            return Err(invalid("arbitration.recovery_cycles must be > 0"));
        }
        if self.oracle.interval_cycles == 0 || self.oracle.timeout_ms == 0 {
            return Err(invalid("oracle.interval_cycles and oracle.timeout_ms must be > 0"));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(invalid("dispatch.max_attempts must be > 0"));
        }
        if self.dispatch.base_backoff_ms > self.dispatch.max_backoff_ms {
            return Err(invalid("dispatch.base_backoff_ms exceeds dispatch.max_backoff_ms"));
        }
        if !(0.0..=1.0).contains(&self.perception.min_confidence) {
            return Err(invalid("perception.min_confidence must be within [0, 1]"));
        }
        if self.perception.max_observations == 0 {
            return Err(invalid("perception.max_observations must be > 0"));
        }
        let v = &self.vehicle;
        if !(v.default_takeoff_altitude_m > 0.0 && v.default_takeoff_altitude_m <= v.max_altitude_m) {
            return Err(invalid(
                "vehicle.default_takeoff_altitude_m must be within (0, max_altitude_m]",
            ));
        }
        if !(0.0..=100.0).contains(&v.critical_battery_percent) {
            return Err(invalid("vehicle.critical_battery_percent must be within [0, 100]"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> CoreError {
    CoreError::InvalidConfig(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.arbitration.oracle_failure_threshold, 5);
        assert_eq!(config.arbitration.failsafe_action, SafeAction::Hold);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [arbitration]
            oracle_failure_threshold = 2
            failsafe_action = "land"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.arbitration.oracle_failure_threshold, 2);
        assert_eq!(config.arbitration.failsafe_action, SafeAction::Land);
        assert_eq!(config.arbitration.cycle_period_ms, 100);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.vehicle.default_takeoff_altitude_m, 10.0);
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let result = Config::from_toml_str("[arbitration]\noracle_failure_threshold = 0\n");
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_rejects_out_of_range_confidence() {
        let mut config = Config::default();
        config.perception.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_config_parses() {
        let config = Config::from_toml_str(include_str!("../../../config/pilotgate.toml")).unwrap();
        assert_eq!(config.oracle.interval_cycles, 50);
        assert!(config.oracle.require_trigger);
        assert_eq!(config.audit.path.as_deref(), Some("data/pilotgate-audit.db"));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = Config::from_toml_str("[arbitration\n");
        assert!(matches!(result, Err(CoreError::ConfigParse(_))));
    }
}
