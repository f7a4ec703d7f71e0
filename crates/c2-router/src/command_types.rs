//! Command type definitions for vehicle control
//!
//! This module defines the closed set of vehicle commands and the envelopes
//! that carry them between the oracle, the operator surface, the arbitration
//! gate and the dispatcher.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A command that fails its well-formedness rule
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MalformedCommand {
    /// Numeric parameter is NaN or infinite
    #[error("Non-finite parameter: {0}")]
    NonFinite(&'static str),

    /// Coordinates outside the valid range
    #[error("Coordinates out of range: lat={lat}, lon={lon}")]
    CoordinatesOutOfRange {
        /// Latitude
        lat: f64,
        /// Longitude
        lon: f64,
    },

    /// Altitude must be positive
    #[error("Altitude must be positive, got {0} m")]
    NonPositiveAltitude(f32),

    /// Follow distance must be positive
    #[error("Follow distance must be positive, got {0} m")]
    NonPositiveDistance(f32),

    /// Follow command without a target
    #[error("Follow command names no target")]
    MissingTarget,

    /// Operator envelope combines override flag and payload inconsistently
    #[error("Operator command has override_active={override_active} with {payload}")]
    InconsistentOverride {
        /// Override flag
        override_active: bool,
        /// Description of the payload
        payload: &'static str,
    },
}

/// Vehicle command enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VehicleCommand {
    /// Arm motors
    Arm,
    /// Take off to a relative altitude
    TakeOff {
        /// Target altitude above home in meters
        altitude_m: f32,
    },
    /// Land at the current position
    Land,
    /// Fly to a global position
    GotoLocation {
        /// Latitude in decimal degrees
        lat: f64,
        /// Longitude in decimal degrees
        lon: f64,
        /// Altitude above home in meters
        alt_m: f32,
    },
    /// Hold the current position
    Hold,
    /// Return to the launch position
    ReturnToHome,
    /// Disarm motors
    Disarm,
    /// Track a perceived target at a fixed distance
    FollowTarget {
        /// Detection id of the target
        target_id: String,
        /// Horizontal distance to keep, in meters
        follow_distance_m: f32,
        /// Altitude above home in meters
        alt_m: f32,
    },
}

impl VehicleCommand {
    /// Short command name used in logs and the audit log
    pub fn name(&self) -> &'static str {
        match self {
            VehicleCommand::Arm => "arm",
            VehicleCommand::TakeOff { .. } => "takeoff",
            VehicleCommand::Land => "land",
            VehicleCommand::GotoLocation { .. } => "goto_location",
            VehicleCommand::Hold => "hold",
            VehicleCommand::ReturnToHome => "return_to_home",
            VehicleCommand::Disarm => "disarm",
            VehicleCommand::FollowTarget { .. } => "follow_target",
        }
    }

    /// Whether sending the command twice has the same effect as sending it once
    ///
    /// Only idempotent commands are retried by the dispatcher.
    pub fn is_idempotent(&self) -> bool {
        match self {
            VehicleCommand::Hold
            | VehicleCommand::GotoLocation { .. }
            | VehicleCommand::ReturnToHome
            | VehicleCommand::FollowTarget { .. } => true,
            VehicleCommand::Arm
            | VehicleCommand::TakeOff { .. }
            | VehicleCommand::Land
            | VehicleCommand::Disarm => false,
        }
    }

    /// Check the well-formedness rule of the command
    pub fn validate(&self) -> Result<(), MalformedCommand> {
        match self {
            VehicleCommand::TakeOff { altitude_m } => positive_altitude(*altitude_m, "altitude_m"),
            VehicleCommand::GotoLocation { lat, lon, alt_m } => {
                if !lat.is_finite() {
                    return Err(MalformedCommand::NonFinite("lat"));
                }
                if !lon.is_finite() {
                    return Err(MalformedCommand::NonFinite("lon"));
                }
                if !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lon) {
                    return Err(MalformedCommand::CoordinatesOutOfRange {
                        lat: *lat,
                        lon: *lon,
                    });
                }
                positive_altitude(*alt_m, "alt_m")
            }
            VehicleCommand::FollowTarget {
                target_id,
                follow_distance_m,
                alt_m,
            } => {
                if target_id.trim().is_empty() {
                    return Err(MalformedCommand::MissingTarget);
                }
                if !follow_distance_m.is_finite() {
                    return Err(MalformedCommand::NonFinite("follow_distance_m"));
                }
                if *follow_distance_m <= 0.0 {
                    return Err(MalformedCommand::NonPositiveDistance(*follow_distance_m));
                }
                positive_altitude(*alt_m, "alt_m")
            }
            VehicleCommand::Arm
            | VehicleCommand::Land
            | VehicleCommand::Hold
            | VehicleCommand::ReturnToHome
            | VehicleCommand::Disarm => Ok(()),
        }
    }
}

fn positive_altitude(altitude_m: f32, field: &'static str) -> Result<(), MalformedCommand> {
    if !altitude_m.is_finite() {
        return Err(MalformedCommand::NonFinite(field));
    }
    if altitude_m <= 0.0 {
        return Err(MalformedCommand::NonPositiveAltitude(altitude_m));
    }
    Ok(())
}

impl fmt::Display for VehicleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleCommand::TakeOff { altitude_m } => write!(f, "takeoff({altitude_m} m)"),
            VehicleCommand::GotoLocation { lat, lon, alt_m } => {
                write!(f, "goto_location({lat:.6}, {lon:.6}, {alt_m} m)")
            }
            VehicleCommand::FollowTarget {
                target_id,
                follow_distance_m,
                alt_m,
            } => write!(f, "follow_target({target_id}, {follow_distance_m} m, {alt_m} m)"),
            other => f.write_str(other.name()),
        }
    }
}

/// Origin of a resolved command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    /// Human operator
    Human,
    /// Policy oracle proposal, or the default hold when there is none
    Automated,
    /// Fixed safe action issued by the gate
    Failsafe,
}

/// Command proposed by the policy oracle for a specific snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedCommand {
    /// Proposed command
    pub command: VehicleCommand,
    /// Snapshot the proposal was computed from
    pub snapshot_id: u64,
    /// Oracle rationale, possibly empty
    pub rationale: String,
}

/// Discrete operator input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorCommand {
    /// Command to execute; `None` for a release
    pub command: Option<VehicleCommand>,
    /// Whether the operator asserts override
    pub override_active: bool,
    /// Monotonic issue time
    pub issued_at_ns: u64,
}

/// What a well-formed operator command asks for
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorIntent {
    /// Take control with this command
    Override(VehicleCommand),
    /// Hand control back to automation
    Release,
}

impl OperatorCommand {
    /// Override with `command`
    pub fn assert(command: VehicleCommand, issued_at_ns: u64) -> Self {
        Self {
            command: Some(command),
            override_active: true,
            issued_at_ns,
        }
    }

    /// Release override
    pub fn release(issued_at_ns: u64) -> Self {
        Self {
            command: None,
            override_active: false,
            issued_at_ns,
        }
    }

    /// Classify the envelope, rejecting malformed combinations
    pub fn intent(&self) -> Result<OperatorIntent, MalformedCommand> {
        match (&self.command, self.override_active) {
            (Some(command), true) => {
                command.validate()?;
                Ok(OperatorIntent::Override(command.clone()))
            }
            (None, false) => Ok(OperatorIntent::Release),
            (Some(_), false) => Err(MalformedCommand::InconsistentOverride {
                override_active: false,
                payload: "a command",
            }),
            (None, true) => Err(MalformedCommand::InconsistentOverride {
                override_active: true,
                payload: "no command",
            }),
        }
    }
}

/// Output of one arbitration cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedCommand {
    /// Strictly increasing sequence number
    pub seq: u64,
    /// Decision cycle that produced this command
    pub cycle: u64,
    /// Command to execute
    pub command: VehicleCommand,
    /// Winning source
    pub source: CommandSource,
    /// Why this command won
    pub rationale: String,
    /// True when the gate re-issued a standing command: the held operator
    /// override, or the oracle proposal still in effect
    pub reissue: bool,
    /// Resolution timestamp
    pub resolved_at_ns: u64,
}

/// Result of dispatching a resolved command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Vehicle link acknowledged, or the command was already in effect
    Accepted {
        /// Sequence number
        seq: u64,
        /// False when no link call was needed
        forwarded: bool,
        /// Link attempts made
        attempts: u32,
    },
    /// Command failed a precondition or was denied by the vehicle
    Rejected {
        /// Sequence number
        seq: u64,
        /// Rejection reason
        reason: String,
    },
    /// Transport failed on every allowed attempt
    Failed {
        /// Sequence number
        seq: u64,
        /// Last transport error
        reason: String,
        /// Link attempts made
        attempts: u32,
    },
}

impl CommandOutcome {
    /// Sequence number of the command this outcome belongs to
    pub fn seq(&self) -> u64 {
        match self {
            CommandOutcome::Accepted { seq, .. } => *seq,
            CommandOutcome::Rejected { seq, .. } => *seq,
            CommandOutcome::Failed { seq, .. } => *seq,
        }
    }

    /// Check if the command was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandOutcome::Accepted { .. })
    }

    /// Outcome class without payload, e.g. "accepted"
    pub fn class(&self) -> &'static str {
        match self {
            CommandOutcome::Accepted { .. } => "accepted",
            CommandOutcome::Rejected { .. } => "rejected",
            CommandOutcome::Failed { .. } => "failed",
        }
    }
}
