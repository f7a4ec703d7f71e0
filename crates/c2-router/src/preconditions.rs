//! Vehicle-state preconditions for each command
//!
//! A single exhaustive table decides whether a command may be sent given the
//! latest known `VehicleState`. Adding a `VehicleCommand` variant fails to
//! compile until it has a row here.

#![warn(missing_docs)]

use crate::command_types::VehicleCommand;
use pilotgate_context::{GpsFix, VehicleState};
use pilotgate_core::VehicleConfig;
use thiserror::Error;

/// Reason a command may not be sent in the current vehicle state
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PreconditionViolation {
    /// No telemetry has been received
    #[error("No vehicle state available")]
    NoVehicleState,

    /// Command requires the vehicle on the ground
    #[error("Vehicle is airborne")]
    Airborne,

    /// Command requires the vehicle in the air
    #[error("Vehicle is not airborne")]
    NotAirborne,

    /// Command requires armed motors
    #[error("Vehicle is not armed")]
    NotArmed,

    /// Battery at or below the critical level
    #[error("Battery critical: {percent}% <= {critical}%")]
    BatteryCritical {
        /// Current charge
        percent: f32,
        /// Critical threshold
        critical: f32,
    },

    /// GPS fix too weak for position-based navigation
    #[error("GPS fix {0:?} insufficient for navigation")]
    InsufficientGpsFix(GpsFix),

    /// Requested altitude above the configured ceiling
    #[error("Altitude {requested} m exceeds limit {limit} m")]
    AltitudeLimit {
        /// Requested altitude
        requested: f32,
        /// Configured ceiling
        limit: f32,
    },
}

/// Vehicle limits consulted by the precondition table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreconditionLimits {
    /// Maximum altitude above home in meters
    pub max_altitude_m: f32,
    /// Battery percent at or below which takeoff is refused
    pub critical_battery_percent: f32,
}

impl PreconditionLimits {
    /// Limits from the vehicle configuration section
    pub fn from_config(config: &VehicleConfig) -> Self {
        Self {
            max_altitude_m: config.max_altitude_m,
            critical_battery_percent: config.critical_battery_percent,
        }
    }
}

impl Default for PreconditionLimits {
    fn default() -> Self {
        Self::from_config(&VehicleConfig::default())
    }
}

impl VehicleCommand {
    /// Check the command against the latest vehicle state
    pub fn check_preconditions(
        &self,
        state: Option<&VehicleState>,
        limits: &PreconditionLimits,
    ) -> Result<(), PreconditionViolation> {
        let state = match (self, state) {
            (VehicleCommand::Hold, _) => return Ok(()),
            (_, None) => return Err(PreconditionViolation::NoVehicleState),
            (_, Some(state)) => state,
        };

        match self {
            VehicleCommand::Arm | VehicleCommand::Disarm => on_ground(state),
            VehicleCommand::TakeOff { .. } => {
                if !state.armed {
                    return Err(PreconditionViolation::NotArmed);
                }
                on_ground(state)?;
                if state.is_battery_critical(limits.critical_battery_percent) {
                    return Err(PreconditionViolation::BatteryCritical {
                        percent: state.battery.percent,
                        critical: limits.critical_battery_percent,
                    });
                }
                Ok(())
            }
            VehicleCommand::Land => airborne(state),
            VehicleCommand::GotoLocation { alt_m, .. } | VehicleCommand::FollowTarget { alt_m, .. } => {
                airborne(state)?;
                navigable(state)?;
                within_ceiling(*alt_m, limits)
            }
            VehicleCommand::ReturnToHome => {
                airborne(state)?;
                navigable(state)
            }
            VehicleCommand::Hold => Ok(()),
        }
    }
}

fn on_ground(state: &VehicleState) -> Result<(), PreconditionViolation> {
    if state.in_air {
        Err(PreconditionViolation::Airborne)
    } else {
        Ok(())
    }
}

fn airborne(state: &VehicleState) -> Result<(), PreconditionViolation> {
    if state.in_air {
        Ok(())
    } else {
        Err(PreconditionViolation::NotAirborne)
    }
}

fn within_ceiling(alt_m: f32, limits: &PreconditionLimits) -> Result<(), PreconditionViolation> {
    if alt_m > limits.max_altitude_m {
        Err(PreconditionViolation::AltitudeLimit {
            requested: alt_m,
            limit: limits.max_altitude_m,
        })
    } else {
        Ok(())
    }
}

fn navigable(state: &VehicleState) -> Result<(), PreconditionViolation> {
    if state.gps_fix.supports_navigation() {
        Ok(())
    } else {
        Err(PreconditionViolation::InsufficientGpsFix(state.gps_fix))
    }
}
