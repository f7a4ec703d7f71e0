//! Canonical vehicle state types
//!
//! This module defines the normalized vehicle state that every other
//! component reads. Raw link samples are converted into these types by the
//! telemetry normalizer.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// Flight mode reported by the flight controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightMode {
    /// On the ground, not flying
    Grounded,
    /// Holding position
    Hold,
    /// Flying an onboard mission
    Mission,
    /// Pilot-stabilized manual flight
    Manual,
    /// Returning to launch
    Return,
    /// Landing
    Land,
    /// Following external setpoints
    Offboard,
    /// Emergency / termination mode
    Emergency,
    /// Mode not recognized
    Unknown,
}

impl FlightMode {
    /// Map a MAVLink-style flight mode name onto a `FlightMode`
    pub fn from_link_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "READY" | "GROUNDED" | "STANDBY" => FlightMode::Grounded,
            "HOLD" | "LOITER" | "POSCTL" | "ALTCTL" => FlightMode::Hold,
            "MISSION" | "AUTO" => FlightMode::Mission,
            "MANUAL" | "STABILIZED" | "ACRO" | "RATTITUDE" => FlightMode::Manual,
            "RETURN_TO_LAUNCH" | "RTL" | "RETURN" => FlightMode::Return,
            "LAND" | "LANDING" => FlightMode::Land,
            "OFFBOARD" | "GUIDED" | "FOLLOW_ME" | "TAKEOFF" => FlightMode::Offboard,
            "EMERGENCY" | "TERMINATION" => FlightMode::Emergency,
            _ => FlightMode::Unknown,
        }
    }
}

/// GPS fix quality, ordered from worst to best
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum GpsFix {
    /// No fix
    NoFix,
    /// 2D fix (no altitude)
    Fix2d,
    /// 3D fix
    Fix3d,
    /// RTK float or fixed
    Rtk,
}

impl GpsFix {
    /// Map a MAVLink `GPS_FIX_TYPE` value
    pub fn from_fix_type(fix_type: u8) -> Self {
        match fix_type {
            0 | 1 => GpsFix::NoFix,
            2 => GpsFix::Fix2d,
            3 | 4 => GpsFix::Fix3d,
            _ => GpsFix::Rtk,
        }
    }

    /// Whether the fix is good enough for position-based navigation
    pub fn supports_navigation(&self) -> bool {
        *self >= GpsFix::Fix3d
    }
}

/// Global position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
    /// Altitude above the home position in meters
    pub relative_alt_m: f32,
}

/// Velocity in the local NED frame
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    /// North component in m/s
    pub north_m_s: f32,
    /// East component in m/s
    pub east_m_s: f32,
    /// Down component in m/s
    pub down_m_s: f32,
}

impl Velocity {
    /// Horizontal speed over ground
    pub fn ground_speed_m_s(&self) -> f32 {
        (self.north_m_s * self.north_m_s + self.east_m_s * self.east_m_s).sqrt()
    }
}

/// Euler attitude
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Attitude {
    /// Roll in degrees
    pub roll_deg: f32,
    /// Pitch in degrees
    pub pitch_deg: f32,
    /// Yaw in degrees
    pub yaw_deg: f32,
}

/// Battery status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Battery {
    /// Remaining charge (0-100)
    pub percent: f32,
    /// Pack voltage
    pub voltage_v: f32,
}

/// Canonical vehicle state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VehicleState {
    /// Global position
    pub position: Position,
    /// NED velocity
    pub velocity: Velocity,
    /// Attitude
    pub attitude: Attitude,
    /// Battery status
    pub battery: Battery,
    /// Current flight mode
    pub flight_mode: FlightMode,
    /// GPS fix quality
    pub gps_fix: GpsFix,
    /// Motors armed
    pub armed: bool,
    /// Vehicle airborne
    pub in_air: bool,
    /// Monotonic timestamp of the sample this state was built from
    pub observed_at_ns: u64,
}

impl VehicleState {
    /// Age of this state at `now_ns`; zero under clock skew
    pub fn age_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.observed_at_ns)
    }

    /// Check if the state is older than `stale_after_ns`
    pub fn is_stale(&self, now_ns: u64, stale_after_ns: u64) -> bool {
        self.age_ns(now_ns) > stale_after_ns
    }

    /// Check if the battery is at or below `critical_percent`
    pub fn is_battery_critical(&self, critical_percent: f32) -> bool {
        self.battery.percent <= critical_percent
    }
}
