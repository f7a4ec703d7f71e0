//! Vehicle link seam and the simulated link
//!
//! `VehicleLink` is the only way commands leave the process. `SimLink` is a
//! flag-bookkeeping stand-in: it applies each command to an armed / in-air /
//! position record and publishes the result as raw telemetry.

#![warn(missing_docs)]

use crate::command_types::VehicleCommand;
use async_trait::async_trait;
use pilotgate_context::RawTelemetrySample;
use pilotgate_core::Clock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// Command as understood by the vehicle link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LinkCommand {
    /// Arm motors
    Arm,
    /// Disarm motors
    Disarm,
    /// Take off to a relative altitude
    Takeoff {
        /// Altitude above home in meters
        altitude_m: f32,
    },
    /// Land
    Land,
    /// Fly to a global position
    Goto {
        /// Latitude
        lat: f64,
        /// Longitude
        lon: f64,
        /// Altitude above home in meters
        alt_m: f32,
    },
    /// Hold position
    Hold,
    /// Return to launch
    ReturnToHome,
    /// Track a target
    Follow {
        /// Target identifier
        target_id: String,
        /// Distance to keep in meters
        distance_m: f32,
        /// Altitude above home in meters
        alt_m: f32,
    },
}

impl From<&VehicleCommand> for LinkCommand {
    fn from(command: &VehicleCommand) -> Self {
        match command {
            VehicleCommand::Arm => LinkCommand::Arm,
            VehicleCommand::TakeOff { altitude_m } => LinkCommand::Takeoff {
                altitude_m: *altitude_m,
            },
            VehicleCommand::Land => LinkCommand::Land,
            VehicleCommand::GotoLocation { lat, lon, alt_m } => LinkCommand::Goto {
                lat: *lat,
                lon: *lon,
                alt_m: *alt_m,
            },
            VehicleCommand::Hold => LinkCommand::Hold,
            VehicleCommand::ReturnToHome => LinkCommand::ReturnToHome,
            VehicleCommand::Disarm => LinkCommand::Disarm,
            VehicleCommand::FollowTarget {
                target_id,
                follow_distance_m,
                alt_m,
            } => LinkCommand::Follow {
                target_id: target_id.clone(),
                distance_m: *follow_distance_m,
                alt_m: *alt_m,
            },
        }
    }
}

/// Vehicle link errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// No acknowledgement within the link timeout
    #[error("Link timeout after {timeout_ms} ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Link is down
    #[error("Link disconnected: {0}")]
    Disconnected(String),

    /// Vehicle received the command and refused it
    #[error("Vehicle denied command: {0}")]
    Denied(String),
}

impl TransportError {
    /// Whether a retry can help
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Denied(_))
    }
}

/// Outbound vehicle link
#[async_trait]
pub trait VehicleLink: Send + Sync {
    /// Send a command and wait for the vehicle's acknowledgement
    async fn send(&self, command: LinkCommand) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
struct SimVehicle {
    home: (f64, f64),
    lat: f64,
    lon: f64,
    relative_alt_m: f32,
    battery_percent: f32,
    armed: bool,
    in_air: bool,
    flight_mode: &'static str,
}

impl SimVehicle {
    fn apply(&mut self, command: &LinkCommand) -> Result<(), TransportError> {
        match command {
            LinkCommand::Arm => {
                if self.in_air {
                    return Err(TransportError::Denied("already airborne".to_string()));
                }
                self.armed = true;
            }
            LinkCommand::Disarm => {
                if self.in_air {
                    return Err(TransportError::Denied("cannot disarm in flight".to_string()));
                }
                self.armed = false;
                self.flight_mode = "READY";
            }
            LinkCommand::Takeoff { altitude_m } => {
                if !self.armed {
                    return Err(TransportError::Denied("not armed".to_string()));
                }
                self.in_air = true;
                self.relative_alt_m = *altitude_m;
                self.flight_mode = "HOLD";
            }
            LinkCommand::Land => {
                self.in_air = false;
                self.relative_alt_m = 0.0;
                self.flight_mode = "LAND";
            }
            LinkCommand::Goto { lat, lon, alt_m } => {
                self.lat = *lat;
                self.lon = *lon;
                self.relative_alt_m = *alt_m;
                self.flight_mode = "HOLD";
            }
            LinkCommand::Follow { alt_m, .. } => {
                if !self.in_air {
                    return Err(TransportError::Denied("cannot follow on the ground".to_string()));
                }
                // No target motion is simulated; the vehicle holds at the follow altitude
                self.relative_alt_m = *alt_m;
                self.flight_mode = "FOLLOW_ME";
            }
            LinkCommand::Hold => {
                if self.in_air {
                    self.flight_mode = "HOLD";
                }
            }
            LinkCommand::ReturnToHome => {
                (self.lat, self.lon) = self.home;
                self.flight_mode = "RETURN_TO_LAUNCH";
            }
        }
        Ok(())
    }

    fn sample(&self, timestamp_ns: u64) -> RawTelemetrySample {
        RawTelemetrySample {
            latitude_deg: Some(self.lat),
            longitude_deg: Some(self.lon),
            relative_altitude_m: Some(self.relative_alt_m),
            velocity_ned_m_s: Some([0.0, 0.0, 0.0]),
            attitude_deg: Some([0.0, 0.0, 0.0]),
            battery_percent: Some(self.battery_percent),
            battery_voltage_v: Some(12.0 + 4.8 * self.battery_percent / 100.0),
            flight_mode: Some(self.flight_mode.to_string()),
            gps_fix_type: Some(3),
            armed: Some(self.armed),
            in_air: Some(self.in_air),
            timestamp_ns,
        }
    }
}

/// Simulated vehicle link
///
/// Records every command it receives and can be told to fail the next N
/// sends, to delay acknowledgements, or to simulate a draining battery.
pub struct SimLink {
    vehicle: Mutex<SimVehicle>,
    sent: Mutex<Vec<LinkCommand>>,
    scripted_failures: Mutex<VecDeque<TransportError>>,
    fail_remaining: AtomicU32,
    ack_delay: Mutex<Option<Duration>>,
    telemetry_tx: watch::Sender<Option<RawTelemetrySample>>,
    clock: Arc<dyn Clock>,
}

impl SimLink {
    /// Home position of a new simulated vehicle
    pub const DEFAULT_HOME: (f64, f64) = (47.397_742, 8.545_594);

    /// Create a grounded, disarmed vehicle at `home`
    pub fn new(
        home: (f64, f64),
        clock: Arc<dyn Clock>,
        telemetry_tx: watch::Sender<Option<RawTelemetrySample>>,
    ) -> Self {
        Self {
            vehicle: Mutex::new(SimVehicle {
                home,
                lat: home.0,
                lon: home.1,
                relative_alt_m: 0.0,
                battery_percent: 100.0,
                armed: false,
                in_air: false,
                flight_mode: "READY",
            }),
            sent: Mutex::new(Vec::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            fail_remaining: AtomicU32::new(0),
            ack_delay: Mutex::new(None),
            telemetry_tx,
            clock,
        }
    }

    /// Publish the current simulated state as a telemetry sample
    pub fn publish_telemetry(&self) {
        let sample = lock(&self.vehicle).sample(self.clock.now_ns());
        self.telemetry_tx.send_replace(Some(sample));
    }

    /// Fail the next `count` sends with a disconnect
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Fail the next send with `error`; scripted errors are consumed first
    pub fn push_failure(&self, error: TransportError) {
        lock(&self.scripted_failures).push_back(error);
    }

    /// Delay every acknowledgement by `delay`
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        *lock(&self.ack_delay) = delay;
    }

    /// Set the simulated battery level
    pub fn set_battery_percent(&self, percent: f32) {
        lock(&self.vehicle).battery_percent = percent.clamp(0.0, 100.0);
    }

    /// Commands that reached the vehicle, in order
    pub fn sent_commands(&self) -> Vec<LinkCommand> {
        lock(&self.sent).clone()
    }

    /// Number of commands that reached the vehicle
    pub fn send_count(&self) -> usize {
        lock(&self.sent).len()
    }

    fn take_failure(&self) -> Option<TransportError> {
        if let Some(error) = lock(&self.scripted_failures).pop_front() {
            return Some(error);
        }
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| TransportError::Disconnected("simulated link failure".to_string()))
    }
}

#[async_trait]
impl VehicleLink for SimLink {
    async fn send(&self, command: LinkCommand) -> Result<(), TransportError> {
        let delay = *lock(&self.ack_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.take_failure() {
            debug!(?command, %error, "Simulated send failure");
            return Err(error);
        }

        lock(&self.vehicle).apply(&command)?;
        info!(?command, "Simulated vehicle applied command");
        lock(&self.sent).push(command);
        self.publish_telemetry();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
