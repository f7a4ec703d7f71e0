//! Situational context for the PilotGate vehicle command gate.
//!
//! This crate turns raw vehicle-link telemetry and perception detections
//! into canonical types and fuses them into immutable snapshots:
//! - `types`: canonical `VehicleState` and its parts
//! - `telemetry`: raw sample to `VehicleState` normalization
//! - `perception`: raw detection to `Observation` normalization
//! - `mission`: the standing mission objective
//! - `aggregator`: the `ContextAggregator` producing `ContextSnapshot`s
//!
//! # Examples
//!
//! ```
//! use pilotgate_context::{
//!     ContextAggregator, MissionObjective, RawTelemetrySample, TelemetryNormalizer,
//! };
//!
//! let mut normalizer = TelemetryNormalizer::new();
//! let state = normalizer
//!     .normalize(RawTelemetrySample {
//!         latitude_deg: Some(47.3977),
//!         longitude_deg: Some(8.5456),
//!         battery_percent: Some(80.0),
//!         timestamp_ns: 1_000,
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! let mut aggregator = ContextAggregator::new(5_000_000_000, 64);
//! aggregator.ingest_vehicle_state(state);
//! let snapshot = aggregator.snapshot(MissionObjective::default(), 2_000).unwrap();
//! assert_eq!(snapshot.snapshot_id, 1);
//! ```

pub mod aggregator;
pub mod mission;
pub mod perception;
pub mod telemetry;
pub mod types;

pub use aggregator::{ContextAggregator, ContextError, ContextSnapshot, IngestOutcome};
pub use mission::{MissionObjective, MissionStage};
pub use perception::{
    NedOffset, Observation, ObservationKind, PerceptionError, PerceptionNormalizer, RawDetection,
    RelativeBearing, SpatialHint,
};
pub use telemetry::{RawTelemetrySample, TelemetryError, TelemetryNormalizer};
pub use types::{Attitude, Battery, FlightMode, GpsFix, Position, Velocity, VehicleState};
