//! Core functionality for the PilotGate vehicle command gate.
//!
//! This crate provides the configuration, error, logging and clock
//! utilities shared by the context, arbitration and dispatch crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::{ms_to_ns, Clock, ManualClock, MonotonicClock};
pub use config::{
    ArbitrationConfig, AuditConfig, Config, DispatchConfig, LogFormat, LoggingConfig,
    OracleConfig, PerceptionConfig, SafeAction, VehicleConfig,
};
pub use error::{CoreError, Result};
