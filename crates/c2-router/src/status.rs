//! Operator-visible gate status

use crate::command_types::{CommandSource, VehicleCommand};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Arbitration state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Oracle proposals drive the vehicle
    #[default]
    Automated,
    /// Operator commands drive the vehicle
    HumanOverride,
    /// Fixed safe action until health recovers
    Failsafe,
}

/// Why the gate entered failsafe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeCause {
    /// Consecutive oracle failures reached the threshold
    OracleUnavailable,
    /// Telemetry older than the staleness bound, or never received
    TelemetryLost,
    /// Consecutive dispatch transport failures reached the threshold
    LinkFailures,
    /// Battery at or below the critical level while airborne
    CriticalBattery,
}

impl fmt::Display for FailsafeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailsafeCause::OracleUnavailable => "oracle unavailable",
            FailsafeCause::TelemetryLost => "telemetry lost",
            FailsafeCause::LinkFailures => "vehicle link failures",
            FailsafeCause::CriticalBattery => "critical battery",
        })
    }
}

/// Running totals kept by the gate
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateCounters {
    pub cycles: u64,
    pub human_commands: u64,
    pub automated_commands: u64,
    pub failsafe_commands: u64,
    pub rejections: u64,
    pub failsafe_entries: u64,
    pub operator_commands_ignored: u64,
}

/// Snapshot of the gate for operators and logs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GateStatus {
    pub state: GateState,
    pub failsafe_cause: Option<FailsafeCause>,
    pub last_rejection: Option<String>,
    pub last_seq: Option<u64>,
    pub last_command: Option<VehicleCommand>,
    pub last_source: Option<CommandSource>,
    /// Outcome class of the most recent dispatch
    pub last_outcome: Option<String>,
    /// Automation waits for an operator release
    #[serde(default)]
    pub automation_paused: bool,
    pub oracle_failures: u32,
    pub link_failures: u32,
    pub counters: GateCounters,
    pub updated_at_ns: u64,
}

impl GateStatus {
    /// One-line summary for a terminal
    pub fn summary(&self) -> String {
        let mut line = format!("state={:?}", self.state);
        if let Some(cause) = self.failsafe_cause {
            line.push_str(&format!(" cause=\"{cause}\""));
        }
        if let (Some(seq), Some(command), Some(source)) =
            (self.last_seq, &self.last_command, self.last_source)
        {
            line.push_str(&format!(" last=#{seq} {command} ({source:?})"));
        }
        if let Some(outcome) = &self.last_outcome {
            line.push_str(&format!(" outcome={outcome}"));
        }
        if let Some(reason) = &self.last_rejection {
            line.push_str(&format!(" last_rejection=\"{reason}\""));
        }
        if self.automation_paused {
            line.push_str(" automation=paused");
        }
        line.push_str(&format!(
            " oracle_failures={} link_failures={} cycles={}",
            self.oracle_failures, self.link_failures, self.counters.cycles
        ));
        line
    }
}
