//! Context aggregator
//!
//! Fuses the latest vehicle state, the active observation set and the
//! standing mission objective into an immutable [`ContextSnapshot`].
//!
//! # Invariants
//!
//! - A `VehicleState` older than (or as old as) the held one is discarded,
//!   never merged.
//! - Expired observations are swept before every snapshot and never reach a
//!   consumer.
//! - Each snapshot is a new `Arc`; a published snapshot is never mutated.

#![warn(missing_docs)]

use crate::mission::MissionObjective;
use crate::perception::Observation;
use crate::types::VehicleState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Aggregator errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    /// No telemetry has been ingested yet
    #[error("Incomplete state: no vehicle telemetry received yet")]
    IncompleteState,
}

/// Result of an ingest call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Input replaced or joined the held state
    Accepted,
    /// Input was not newer than what is held and was dropped
    DiscardedStale,
}

/// Immutable situational snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnapshot {
    /// Monotonically increasing snapshot identifier
    pub snapshot_id: u64,
    /// When the snapshot was taken
    pub taken_at_ns: u64,
    /// Latest vehicle state
    pub vehicle: VehicleState,
    /// Non-expired observations, newest first
    pub observations: Vec<Observation>,
    /// Current mission objective
    pub objective: MissionObjective,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ObservationKey {
    Tracked(String),
    Anonymous(u64),
}

/// Context aggregator for a single vehicle
#[derive(Debug)]
pub struct ContextAggregator {
    vehicle: Option<VehicleState>,
    observations: BTreeMap<ObservationKey, Observation>,
    next_anonymous: u64,
    observation_ttl_ns: u64,
    max_observations: usize,
    next_snapshot_id: u64,
    current: Option<Arc<ContextSnapshot>>,
}

impl ContextAggregator {
    /// Create an aggregator
    ///
    /// # Arguments
    /// * `observation_ttl_ns` - Observations older than this are swept
    /// * `max_observations` - Cap on the active observation set
    pub fn new(observation_ttl_ns: u64, max_observations: usize) -> Self {
        Self {
            vehicle: None,
            observations: BTreeMap::new(),
            next_anonymous: 0,
            observation_ttl_ns,
            max_observations: max_observations.max(1),
            next_snapshot_id: 1,
            current: None,
        }
    }

    /// Replace the held vehicle state if `state` is strictly newer
    pub fn ingest_vehicle_state(&mut self, state: VehicleState) -> IngestOutcome {
        if let Some(held) = &self.vehicle {
            if state.observed_at_ns <= held.observed_at_ns {
                warn!(
                    held_ns = held.observed_at_ns,
                    incoming_ns = state.observed_at_ns,
                    "Discarding stale vehicle state"
                );
                return IngestOutcome::DiscardedStale;
            }
        }
        self.vehicle = Some(state);
        IngestOutcome::Accepted
    }

    /// Insert an observation into the active set
    ///
    /// Tracked observations replace an older record with the same id;
    /// untracked ones are appended.
    pub fn ingest_observation(&mut self, observation: Observation) -> IngestOutcome {
        let key = match &observation.detection_id {
            Some(id) => {
                let key = ObservationKey::Tracked(id.clone());
                if let Some(existing) = self.observations.get(&key) {
                    if existing.observed_at_ns > observation.observed_at_ns {
                        debug!(detection_id = %id, "Discarding out-of-order detection");
                        return IngestOutcome::DiscardedStale;
                    }
                }
                key
            }
            None => {
                self.next_anonymous += 1;
                ObservationKey::Anonymous(self.next_anonymous)
            }
        };

        if !self.observations.contains_key(&key) && self.observations.len() >= self.max_observations {
            self.evict_oldest();
        }
        self.observations.insert(key, observation);
        IngestOutcome::Accepted
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .observations
            .iter()
            .min_by_key(|(_, obs)| obs.observed_at_ns)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.observations.remove(&key);
        }
    }

    /// Drop observations older than the staleness window
    pub fn sweep_expired(&mut self, now_ns: u64) -> usize {
        let ttl = self.observation_ttl_ns;
        let before = self.observations.len();
        self.observations.retain(|_, obs| !obs.is_expired(now_ns, ttl));
        let swept = before - self.observations.len();
        if swept > 0 {
            debug!(swept, "Expired observations removed");
        }
        swept
    }

    /// Build a new snapshot from the held state
    pub fn snapshot(
        &mut self,
        objective: MissionObjective,
        now_ns: u64,
    ) -> Result<Arc<ContextSnapshot>, ContextError> {
        self.sweep_expired(now_ns);

        let vehicle = self.vehicle.clone().ok_or(ContextError::IncompleteState)?;

        let mut observations: Vec<Observation> = self.observations.values().cloned().collect();
        observations.sort_by(|a, b| b.observed_at_ns.cmp(&a.observed_at_ns));

        let snapshot = Arc::new(ContextSnapshot {
            snapshot_id: self.next_snapshot_id,
            taken_at_ns: now_ns,
            vehicle,
            observations,
            objective,
        });
        self.next_snapshot_id += 1;
        self.current = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Latest accepted vehicle state
    pub fn latest_vehicle_state(&self) -> Option<&VehicleState> {
        self.vehicle.as_ref()
    }

    /// Most recently built snapshot
    pub fn current_snapshot(&self) -> Option<Arc<ContextSnapshot>> {
        self.current.clone()
    }

    /// Size of the active observation set
    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }
}
