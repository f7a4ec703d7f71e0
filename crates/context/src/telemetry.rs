//! Telemetry normalizer
//!
//! Converts raw vehicle-link samples into canonical [`VehicleState`] records.
//! Links often publish position, attitude and battery on separate streams,
//! so a raw sample may carry only some fields; missing fields are taken
//! from the last normalized state.

#![warn(missing_docs)]

use crate::types::{Attitude, Battery, FlightMode, GpsFix, Position, Velocity, VehicleState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative altitude above which the vehicle counts as airborne
const IN_AIR_ALTITUDE_M: f32 = 0.5;
/// Vertical speed above which the vehicle counts as airborne
const IN_AIR_VERTICAL_SPEED_M_S: f32 = 0.5;

/// Telemetry normalization errors
#[derive(Debug, Error, PartialEq)]
pub enum TelemetryError {
    /// A field required to build the first state is absent
    #[error("Missing telemetry field: {0}")]
    MissingField(&'static str),

    /// A numeric field is NaN or infinite
    #[error("Non-finite telemetry value in {0}")]
    NonFinite(&'static str),

    /// Coordinates outside the valid range
    #[error("Position out of range: lat={lat}, lon={lon}")]
    PositionOutOfRange {
        /// Latitude
        lat: f64,
        /// Longitude
        lon: f64,
    },
}

/// Raw sample as emitted by the vehicle link
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawTelemetrySample {
    /// Latitude in degrees
    pub latitude_deg: Option<f64>,
    /// Longitude in degrees
    pub longitude_deg: Option<f64>,
    /// Altitude above home in meters
    pub relative_altitude_m: Option<f32>,
    /// NED velocity (north, east, down) in m/s
    pub velocity_ned_m_s: Option<[f32; 3]>,
    /// Attitude (roll, pitch, yaw) in degrees
    pub attitude_deg: Option<[f32; 3]>,
    /// Battery remaining percent
    pub battery_percent: Option<f32>,
    /// Battery voltage
    pub battery_voltage_v: Option<f32>,
    /// Flight mode name, e.g. "HOLD"
    pub flight_mode: Option<String>,
    /// MAVLink GPS fix type
    pub gps_fix_type: Option<u8>,
    /// Armed flag
    pub armed: Option<bool>,
    /// Airborne flag; derived from altitude and vertical speed when absent
    pub in_air: Option<bool>,
    /// Monotonic sample timestamp in nanoseconds
    pub timestamp_ns: u64,
}

/// Stateless-per-sample normalizer holding only the last-seen state
#[derive(Debug, Default)]
pub struct TelemetryNormalizer {
    last: Option<VehicleState>,
}

impl TelemetryNormalizer {
    /// Create a normalizer with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Last state produced by this normalizer
    pub fn last_state(&self) -> Option<&VehicleState> {
        self.last.as_ref()
    }

    /// Normalize one raw sample
    pub fn normalize(&mut self, raw: RawTelemetrySample) -> Result<VehicleState, TelemetryError> {
        let prev = self.last.as_ref();

        let position = match (raw.latitude_deg, raw.longitude_deg) {
            (Some(lat), Some(lon)) => {
                finite64(lat, "latitude_deg")?;
                finite64(lon, "longitude_deg")?;
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                    return Err(TelemetryError::PositionOutOfRange { lat, lon });
                }
                let relative_alt_m = match raw.relative_altitude_m {
                    Some(alt) => finite32(alt, "relative_altitude_m")?,
                    None => prev.map(|p| p.position.relative_alt_m).unwrap_or(0.0),
                };
                Position {
                    lat,
                    lon,
                    relative_alt_m,
                }
            }
            _ => {
                let mut position = prev
                    .map(|p| p.position)
                    .ok_or(TelemetryError::MissingField("position"))?;
                if let Some(alt) = raw.relative_altitude_m {
                    position.relative_alt_m = finite32(alt, "relative_altitude_m")?;
                }
                position
            }
        };

        let velocity = match raw.velocity_ned_m_s {
            Some([n, e, d]) => Velocity {
                north_m_s: finite32(n, "velocity_ned_m_s")?,
                east_m_s: finite32(e, "velocity_ned_m_s")?,
                down_m_s: finite32(d, "velocity_ned_m_s")?,
            },
            None => prev.map(|p| p.velocity).unwrap_or_default(),
        };

        let attitude = match raw.attitude_deg {
            Some([roll, pitch, yaw]) => Attitude {
                roll_deg: finite32(roll, "attitude_deg")?,
                pitch_deg: finite32(pitch, "attitude_deg")?,
                yaw_deg: finite32(yaw, "attitude_deg")?,
            },
            None => prev.map(|p| p.attitude).unwrap_or_default(),
        };

        let prev_battery = prev.map(|p| p.battery);
        let battery = Battery {
            percent: match raw.battery_percent {
                Some(pct) => finite32(pct, "battery_percent")?.clamp(0.0, 100.0),
                None => prev_battery
                    .map(|b| b.percent)
                    .ok_or(TelemetryError::MissingField("battery_percent"))?,
            },
            voltage_v: match raw.battery_voltage_v {
                Some(v) => finite32(v, "battery_voltage_v")?,
                None => prev_battery.map(|b| b.voltage_v).unwrap_or(0.0),
            },
        };

        let flight_mode = match raw.flight_mode.as_deref() {
            Some(name) => FlightMode::from_link_name(name),
            None => prev.map(|p| p.flight_mode).unwrap_or(FlightMode::Unknown),
        };

        let gps_fix = match raw.gps_fix_type {
            Some(fix) => GpsFix::from_fix_type(fix),
            None => prev.map(|p| p.gps_fix).unwrap_or(GpsFix::NoFix),
        };

        let armed = raw
            .armed
            .or_else(|| prev.map(|p| p.armed))
            .unwrap_or(false);

        let in_air = raw.in_air.unwrap_or_else(|| {
            position.relative_alt_m > IN_AIR_ALTITUDE_M
                || velocity.down_m_s.abs() > IN_AIR_VERTICAL_SPEED_M_S
        });

        let state = VehicleState {
            position,
            velocity,
            attitude,
            battery,
            flight_mode,
            gps_fix,
            armed,
            in_air,
            observed_at_ns: raw.timestamp_ns,
        };
        self.last = Some(state.clone());
        Ok(state)
    }
}

fn finite32(value: f32, field: &'static str) -> Result<f32, TelemetryError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TelemetryError::NonFinite(field))
    }
}

fn finite64(value: f64, field: &'static str) -> Result<f64, TelemetryError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TelemetryError::NonFinite(field))
    }
}
