//! End-to-end tests for the PilotGate decision loop
//!
//! This test suite validates:
//! - Operator priority over oracle proposals within a cycle
//! - Precondition rejection of unsafe automated commands
//! - Failsafe entry on oracle, telemetry and link failures, and recovery
//! - Idempotent dispatch and the command audit chain

pub mod test_utils;

#[cfg(test)]
mod arbitration_scenarios;

#[cfg(test)]
mod failsafe_scenarios;

#[cfg(test)]
mod dispatch_audit_tests;
