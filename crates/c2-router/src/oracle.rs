//! Policy oracle adapter
//!
//! The oracle is an external reasoning service that returns free text. This
//! module turns a `ContextSnapshot` into a request, bounds the round trip,
//! and validates the reply against a fixed action schema before anything
//! downstream sees it.
//!
//! # Reply schema
//!
//! ```json
//! {"action": "goto_location",
//!  "parameters": {"lat": 47.39, "lon": 8.54, "altitude_m": 20.0},
//!  "reason": "survey next waypoint",
//!  "snapshot_id": 42}
//! ```
//!
//! The object may be wrapped in a Markdown code fence.

#![warn(missing_docs)]

use crate::command_types::{ProposedCommand, VehicleCommand};
use async_trait::async_trait;
use pilotgate_context::ContextSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Oracle failures; each one counts toward the failsafe threshold
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    /// No reply within the configured bound
    #[error("Oracle request timed out")]
    Timeout,

    /// Reply was not a valid action object
    #[error("Oracle reply parse error: {0}")]
    ParseError(String),

    /// Transport or HTTP failure
    #[error("Oracle unreachable: {0}")]
    Unreachable(String),
}

/// Request handed to a `PolicyOracle`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleRequest {
    /// Snapshot the request was built from
    pub snapshot_id: u64,
    /// Full prompt text: instruction line plus serialized snapshot
    pub prompt: String,
}

impl OracleRequest {
    /// Instruction line placed before the serialized snapshot
    pub const INSTRUCTION: &'static str = "Reply with one JSON object {\"action\", \"parameters\", \"reason\", \"snapshot_id\"} \
         choosing one of: arm, takeoff, land, goto_location, follow_target, hold, return_to_home, disarm.";

    /// Build a request from a snapshot
    pub fn from_snapshot(snapshot: &ContextSnapshot) -> Result<Self, OracleError> {
        let body = serde_json::to_string(snapshot)
            .map_err(|e| OracleError::ParseError(format!("snapshot serialization: {e}")))?;
        Ok(Self {
            snapshot_id: snapshot.snapshot_id,
            prompt: format!("{}\n{}", Self::INSTRUCTION, body),
        })
    }
}

/// External reasoning service
#[async_trait]
pub trait PolicyOracle: Send + Sync {
    /// Backend identifier, e.g. the model name
    fn id(&self) -> &str;

    /// Send a request and return the raw reply text
    async fn query(&self, request: &OracleRequest) -> Result<String, OracleError>;
}

/// Validated oracle reply
#[derive(Debug, Clone, PartialEq)]
pub enum OracleReply {
    /// Usable proposal for the snapshot it was asked about
    Proposed(ProposedCommand),
    /// Reply belongs to another or a superseded snapshot
    Discarded {
        /// Snapshot the request was built from
        snapshot_id: u64,
    },
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    snapshot_id: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TakeoffParameters {
    #[serde(default, alias = "altitude")]
    altitude_m: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct GotoParameters {
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude")]
    lon: f64,
    #[serde(alias = "altitude", alias = "alt_m")]
    altitude_m: f32,
}

#[derive(Debug, Deserialize)]
struct FollowParameters {
    target_id: String,
    #[serde(alias = "distance_m")]
    follow_distance_m: f32,
    #[serde(default, alias = "altitude", alias = "alt_m")]
    altitude_m: Option<f32>,
}

/// Oracle client adapter
///
/// Shared between the decision loop and the tasks it spawns; it remembers
/// the newest snapshot it was asked about so late replies can be discarded.
pub struct OracleClient {
    oracle: Arc<dyn PolicyOracle>,
    timeout: Duration,
    default_takeoff_altitude_m: f32,
    latest_snapshot_id: AtomicU64,
}

impl OracleClient {
    /// Create a client around `oracle`
    pub fn new(oracle: Arc<dyn PolicyOracle>, timeout: Duration, default_takeoff_altitude_m: f32) -> Self {
        Self {
            oracle,
            timeout,
            default_takeoff_altitude_m,
            latest_snapshot_id: AtomicU64::new(0),
        }
    }

    /// Identifier of the wrapped oracle
    pub fn oracle_id(&self) -> &str {
        self.oracle.id()
    }

    /// Ask the oracle for a proposal about `snapshot`
    pub async fn propose(&self, snapshot: Arc<ContextSnapshot>) -> Result<OracleReply, OracleError> {
        let snapshot_id = snapshot.snapshot_id;
        self.latest_snapshot_id.fetch_max(snapshot_id, Ordering::SeqCst);

        let request = OracleRequest::from_snapshot(&snapshot)?;
        let text = match tokio::time::timeout(self.timeout, self.oracle.query(&request)).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!(snapshot_id, timeout_ms = self.timeout.as_millis() as u64, "Oracle timed out");
                return Err(OracleError::Timeout);
            }
        };

        let reply = parse_reply(&text, snapshot_id, self.default_takeoff_altitude_m)?;
        if self.latest_snapshot_id.load(Ordering::SeqCst) != snapshot_id {
            debug!(snapshot_id, "Oracle reply superseded by a newer request");
            return Ok(OracleReply::Discarded { snapshot_id });
        }
        Ok(reply)
    }
}

/// Validate raw reply text for the snapshot `snapshot_id`
pub fn parse_reply(
    text: &str,
    snapshot_id: u64,
    default_takeoff_altitude_m: f32,
) -> Result<OracleReply, OracleError> {
    let json = strip_code_fence(text);
    let decision: RawDecision = serde_json::from_str(json)
        .map_err(|e| OracleError::ParseError(format!("invalid action object: {e}")))?;

    if let Some(echoed) = decision.snapshot_id {
        if echoed != snapshot_id {
            debug!(asked = snapshot_id, echoed, "Oracle reply names another snapshot");
            return Ok(OracleReply::Discarded { snapshot_id });
        }
    }

    let command = command_from_decision(&decision, default_takeoff_altitude_m)?;
    command
        .validate()
        .map_err(|e| OracleError::ParseError(format!("{}: {e}", decision.action)))?;

    Ok(OracleReply::Proposed(ProposedCommand {
        command,
        snapshot_id,
        rationale: decision.reason.unwrap_or_default(),
    }))
}

fn command_from_decision(
    decision: &RawDecision,
    default_takeoff_altitude_m: f32,
) -> Result<VehicleCommand, OracleError> {
    let action = decision.action.trim().to_ascii_lowercase();
    let command = match action.as_str() {
        "arm" => VehicleCommand::Arm,
        "takeoff" | "take_off" => {
            let params: TakeoffParameters = parameters(decision)?.unwrap_or_default();
            VehicleCommand::TakeOff {
                altitude_m: params.altitude_m.unwrap_or(default_takeoff_altitude_m),
            }
        }
        "land" => VehicleCommand::Land,
        "goto_location" => {
            let params: GotoParameters = parameters(decision)?.ok_or_else(|| {
                OracleError::ParseError("goto_location requires parameters".to_string())
            })?;
            VehicleCommand::GotoLocation {
                lat: params.lat,
                lon: params.lon,
                alt_m: params.altitude_m,
            }
        }
        "follow_target" => {
            let params: FollowParameters = parameters(decision)?.ok_or_else(|| {
                OracleError::ParseError("follow_target requires parameters".to_string())
            })?;
            VehicleCommand::FollowTarget {
                target_id: params.target_id,
                follow_distance_m: params.follow_distance_m,
                alt_m: params.altitude_m.unwrap_or(default_takeoff_altitude_m),
            }
        }
        "hold" | "do_nothing" => VehicleCommand::Hold,
        "return_to_home" | "return_to_launch" | "rtl" => VehicleCommand::ReturnToHome,
        "disarm" => VehicleCommand::Disarm,
        other => {
            return Err(OracleError::ParseError(format!("unknown action '{other}'")));
        }
    };
    Ok(command)
}

fn parameters<T: serde::de::DeserializeOwned>(decision: &RawDecision) -> Result<Option<T>, OracleError> {
    match &decision.parameters {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| OracleError::ParseError(format!("{} parameters: {e}", decision.action))),
    }
}

/// Remove a surrounding Markdown code fence, if any
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest.trim_start_matches("json"),
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
