//! Perception normalizer
//!
//! Converts raw detection events from a perception front-end into
//! canonical [`Observation`] records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PerceptionError {
    #[error("Confidence {0} outside [0, 1]")]
    InvalidConfidence(f32),

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("Detection has an empty type label")]
    EmptyLabel,
}

/// What was detected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    LandingPad,
    Obstacle,
    Person,
    TargetMarker,
    Other(String),
}

impl ObservationKind {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "landing_pad" => ObservationKind::LandingPad,
            "obstacle" => ObservationKind::Obstacle,
            "person" => ObservationKind::Person,
            "target_marker" => ObservationKind::TargetMarker,
            other => ObservationKind::Other(other.to_string()),
        }
    }
}

/// Coarse direction of a detection relative to the vehicle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelativeBearing {
    AheadCenter,
    AheadLeft,
    AheadRight,
    Below,
    Unknown,
}

impl RelativeBearing {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "ahead_center" => RelativeBearing::AheadCenter,
            "ahead_left" => RelativeBearing::AheadLeft,
            "ahead_right" => RelativeBearing::AheadRight,
            "below" => RelativeBearing::Below,
            _ => RelativeBearing::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NedOffset {
    pub north_m: f32,
    pub east_m: f32,
    pub down_m: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpatialHint {
    pub distance_m: Option<f32>,
    pub bearing: RelativeBearing,
    pub offset_ned: Option<NedOffset>,
}

/// Canonical observation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    /// Stable identity assigned by the front-end tracker, if any
    pub detection_id: Option<String>,
    pub kind: ObservationKind,
    pub confidence: f32,
    pub hint: SpatialHint,
    pub observed_at_ns: u64,
}

impl Observation {
    pub fn is_expired(&self, now_ns: u64, ttl_ns: u64) -> bool {
        now_ns.saturating_sub(self.observed_at_ns) > ttl_ns
    }
}

/// Raw detection event as produced by a perception front-end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawDetection {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub label: String,
    pub confidence: f32,
    pub distance_m: Option<f32>,
    pub relative_position: Option<String>,
    pub offset_ned_m: Option<[f32; 3]>,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone)]
pub struct PerceptionNormalizer {
    min_confidence: f32,
}

impl PerceptionNormalizer {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    /// Normalize a detection. `Ok(None)` means the detection was valid but
    /// below the confidence floor.
    pub fn normalize(&self, raw: RawDetection) -> Result<Option<Observation>, PerceptionError> {
        if raw.confidence.is_nan() || !(0.0..=1.0).contains(&raw.confidence) {
            return Err(PerceptionError::InvalidConfidence(raw.confidence));
        }
        if raw.label.trim().is_empty() {
            return Err(PerceptionError::EmptyLabel);
        }
        if let Some(d) = raw.distance_m {
            if !d.is_finite() {
                return Err(PerceptionError::NonFinite("distance_m"));
            }
        }
        let offset_ned = match raw.offset_ned_m {
            Some(v) if v.iter().any(|c| !c.is_finite()) => {
                return Err(PerceptionError::NonFinite("offset_ned_m"));
            }
            Some([north_m, east_m, down_m]) => Some(NedOffset {
                north_m,
                east_m,
                down_m,
            }),
            None => None,
        };

        if raw.confidence < self.min_confidence {
            return Ok(None);
        }

        Ok(Some(Observation {
            detection_id: raw.id.filter(|id| !id.is_empty()),
            kind: ObservationKind::from_label(&raw.label),
            confidence: raw.confidence,
            hint: SpatialHint {
                distance_m: raw.distance_m,
                bearing: raw
                    .relative_position
                    .as_deref()
                    .map(RelativeBearing::from_label)
                    .unwrap_or(RelativeBearing::Unknown),
                offset_ned,
            },
            observed_at_ns: raw.timestamp_ns,
        }))
    }
}
