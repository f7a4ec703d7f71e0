//! Command arbitration and safety gate
//!
//! The gate is the single point where human and automated intent meet. Each
//! decision cycle it consumes every operator command received since the last
//! cycle, at most one oracle event and the latest vehicle state, and produces
//! exactly one `ResolvedCommand`.
//!
//! # Cycle order
//!
//! 1. Operator intake
//! 2. Health accounting and failsafe entry
//! 3. Resolution
//! 4. Failsafe recovery check (takes effect next cycle)
//!
//! # Priority
//!
//! Operator always wins outside failsafe. A release hands control back to
//! automation. Failsafe ignores both sources and issues the safe action until
//! health has been good for `recovery_cycles` consecutive cycles.
//!
//! # Standing proposal
//!
//! In `Automated` the latest valid oracle proposal stays in effect between
//! oracle replies and is re-issued every cycle. It is dropped on an oracle
//! failure, a standby cycle, a dispatch rejection, an operator override and
//! failsafe entry; the gate then holds until the next proposal.
//!
//! A proposed `Land` or `Disarm` hands control back: automation pauses, the
//! decision loop stops querying the oracle and only an operator release
//! resumes it. An emergency landing on critical battery pauses it as well.

#![warn(missing_docs)]

use crate::command_types::{
    CommandOutcome, CommandSource, OperatorCommand, OperatorIntent, ProposedCommand,
    ResolvedCommand, VehicleCommand,
};
use crate::oracle::OracleError;
use crate::status::{FailsafeCause, GateCounters, GateState, GateStatus};
use pilotgate_context::VehicleState;
use pilotgate_core::{ms_to_ns, Config, SafeAction};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Broken gate or dispatcher guarantee; the only fatal error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Sequence numbers must strictly increase
    #[error("Invariant violation: sequence number {got} not greater than {last}")]
    SequenceRegression {
        /// Previous sequence number
        last: u64,
        /// Offending sequence number
        got: u64,
    },

    /// A fresh operator override resolved to an automated command
    #[error("Invariant violation: fresh operator override lost to automated command (seq {seq})")]
    OverrideLost {
        /// Offending sequence number
        seq: u64,
    },

    /// Override state without a stored operator command
    #[error("Invariant violation: human override active without an operator command")]
    OverrideWithoutCommand,

    /// Dispatcher misused the retry state machine
    #[error("Invariant violation: retry state machine: {0}")]
    RetryStateMachine(String),
}

/// What the oracle contributed to one cycle
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OracleEvent {
    /// No request finished this cycle
    #[default]
    Idle,
    /// A validated proposal for the current snapshot
    Proposal(ProposedCommand),
    /// The request failed
    Failure(OracleError),
    /// The reply was for another snapshot
    Discarded,
    /// A query was due but skipped because nothing triggers one
    Standby,
}

/// Inputs of one decision cycle
#[derive(Debug, Clone, Default)]
pub struct CycleInput<'a> {
    /// Cycle timestamp
    pub now_ns: u64,
    /// Latest accepted vehicle state
    pub vehicle: Option<&'a VehicleState>,
    /// Every operator command received since the previous cycle
    pub operator_commands: Vec<OperatorCommand>,
    /// Oracle contribution
    pub oracle: OracleEvent,
}

/// Gate thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    /// Consecutive oracle failures that trigger failsafe
    pub oracle_failure_threshold: u32,
    /// Consecutive dispatch failures that trigger failsafe
    pub link_failure_threshold: u32,
    /// Telemetry age that triggers failsafe
    pub telemetry_stale_after_ns: u64,
    /// Healthy cycles required to leave failsafe
    pub recovery_cycles: u32,
    /// Action issued in failsafe
    pub failsafe_action: SafeAction,
    /// Battery level that triggers failsafe while airborne
    pub critical_battery_percent: f32,
}

impl GateConfig {
    /// Thresholds from the `arbitration` and `vehicle` config sections
    pub fn from_config(config: &Config) -> Self {
        let arb = &config.arbitration;
        Self {
            oracle_failure_threshold: arb.oracle_failure_threshold,
            link_failure_threshold: arb.link_failure_threshold,
            telemetry_stale_after_ns: ms_to_ns(arb.telemetry_stale_after_ms),
            recovery_cycles: arb.recovery_cycles,
            failsafe_action: arb.failsafe_action,
            critical_battery_percent: config.vehicle.critical_battery_percent,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Command arbitration and safety gate for one vehicle
#[derive(Debug)]
pub struct CommandArbiter {
    config: GateConfig,
    state: GateState,
    failsafe_cause: Option<FailsafeCause>,
    /// Last accepted operator command; present only in `HumanOverride`
    operator_command: Option<VehicleCommand>,
    last_operator_issued_ns: Option<u64>,
    oracle_failures: u32,
    link_failures: u32,
    healthy_cycles: u32,
    /// Time the telemetry watchdog started, at the first cycle
    watchdog_armed_at_ns: Option<u64>,
    cycle: u64,
    last_seq: Option<u64>,
    last_resolved: Option<(VehicleCommand, CommandSource)>,
    last_outcome: Option<&'static str>,
    awaiting_outcome: BTreeSet<u64>,
    last_rejection: Option<String>,
    /// Latest valid oracle proposal, in effect while `Automated`
    standing_proposal: Option<ProposedCommand>,
    /// Sequence number of the last command taken from a proposal
    proposal_seq: Option<u64>,
    automation_paused: bool,
    counters: GateCounters,
}

struct Resolution {
    command: VehicleCommand,
    source: CommandSource,
    rationale: String,
    reissue: bool,
    from_proposal: bool,
}

impl Resolution {
    fn new(command: VehicleCommand, source: CommandSource, rationale: impl Into<String>) -> Self {
        Self {
            command,
            source,
            rationale: rationale.into(),
            reissue: false,
            from_proposal: false,
        }
    }
}

struct Health {
    cause: Option<FailsafeCause>,
}

impl CommandArbiter {
    /// Create a gate in `Automated`
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::Automated,
            failsafe_cause: None,
            operator_command: None,
            last_operator_issued_ns: None,
            oracle_failures: 0,
            link_failures: 0,
            healthy_cycles: 0,
            watchdog_armed_at_ns: None,
            cycle: 0,
            last_seq: None,
            last_resolved: None,
            last_outcome: None,
            awaiting_outcome: BTreeSet::new(),
            last_rejection: None,
            standing_proposal: None,
            proposal_seq: None,
            automation_paused: false,
            counters: GateCounters::default(),
        }
    }

    /// Current arbitration state
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Cause of the current failsafe episode
    pub fn failsafe_cause(&self) -> Option<FailsafeCause> {
        self.failsafe_cause
    }

    /// Operator command being re-issued while in `HumanOverride`
    pub fn operator_command(&self) -> Option<&VehicleCommand> {
        self.operator_command.as_ref()
    }

    /// Oracle proposal currently in effect
    pub fn standing_proposal(&self) -> Option<&ProposedCommand> {
        self.standing_proposal.as_ref()
    }

    /// Whether the standing proposal is a target follow
    pub fn is_following(&self) -> bool {
        matches!(
            self.standing_proposal.as_ref().map(|p| &p.command),
            Some(VehicleCommand::FollowTarget { .. })
        )
    }

    /// Whether automation waits for an operator release
    pub fn automation_paused(&self) -> bool {
        self.automation_paused
    }

    /// Most recent rejection reason
    pub fn last_rejection(&self) -> Option<&str> {
        self.last_rejection.as_deref()
    }

    /// Consecutive oracle failures
    pub fn oracle_failures(&self) -> u32 {
        self.oracle_failures
    }

    /// Consecutive dispatch transport failures
    pub fn link_failures(&self) -> u32 {
        self.link_failures
    }

    /// Number of cycles run
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Running totals
    pub fn counters(&self) -> GateCounters {
        self.counters
    }

    /// Run one decision cycle
    pub fn resolve_cycle(&mut self, input: CycleInput<'_>) -> Result<ResolvedCommand, InvariantViolation> {
        self.cycle += 1;
        self.counters.cycles += 1;
        let now_ns = input.now_ns;

        // 1. Operator intake
        let mut fresh_override = self.intake_operator(input.operator_commands);

        // 2. Health accounting
        let health = self.account_health(&input.oracle, input.vehicle, now_ns);
        match (self.state, health.cause) {
            (GateState::Failsafe, Some(FailsafeCause::CriticalBattery))
                if self.failsafe_cause != Some(FailsafeCause::CriticalBattery) =>
            {
                warn!(previous = ?self.failsafe_cause, "Failsafe cause escalated to critical battery");
                self.failsafe_cause = Some(FailsafeCause::CriticalBattery);
                self.pause_automation("emergency landing");
            }
            (GateState::Failsafe, _) => {}
            (_, Some(cause)) => {
                self.enter_failsafe(cause);
                if fresh_override.take().is_some() {
                    warn!("Operator command of this cycle superseded by failsafe entry");
                }
            }
            (_, None) => {}
        }

        // 3. Resolution
        let had_fresh_override = fresh_override.is_some();
        let Resolution {
            command,
            source,
            rationale,
            reissue,
            from_proposal,
        } = self.resolve(fresh_override, input.oracle)?;

        let seq = self.last_seq.map_or(1, |last| last + 1);
        if let Some(last) = self.last_seq {
            if seq <= last {
                error!(last, seq, "Sequence number regression");
                return Err(InvariantViolation::SequenceRegression { last, got: seq });
            }
        }
        if had_fresh_override && source == CommandSource::Automated {
            error!(seq, "Fresh operator override resolved to automated command");
            return Err(InvariantViolation::OverrideLost { seq });
        }
        self.last_seq = Some(seq);
        if from_proposal {
            self.proposal_seq = Some(seq);
        }
        self.awaiting_outcome.insert(seq);
        self.last_resolved = Some((command.clone(), source));
        match source {
            CommandSource::Human => self.counters.human_commands += 1,
            CommandSource::Automated => self.counters.automated_commands += 1,
            CommandSource::Failsafe => self.counters.failsafe_commands += 1,
        }

        // 4. Recovery check
        if self.state == GateState::Failsafe {
            self.check_recovery(&health);
        }

        debug!(
            cycle = self.cycle,
            seq,
            command = %command,
            ?source,
            reissue,
            state = ?self.state,
            "Cycle resolved"
        );

        Ok(ResolvedCommand {
            seq,
            cycle: self.cycle,
            command,
            source,
            rationale,
            reissue,
            resolved_at_ns: now_ns,
        })
    }

    /// Feed a dispatch outcome back into health accounting
    pub fn record_outcome(&mut self, outcome: &CommandOutcome) {
        if !self.awaiting_outcome.remove(&outcome.seq()) {
            warn!(seq = outcome.seq(), "Outcome for unknown sequence number ignored");
            return;
        }
        self.last_outcome = Some(outcome.class());
        match outcome {
            CommandOutcome::Accepted { .. } => self.link_failures = 0,
            CommandOutcome::Rejected { seq, reason } => {
                self.counters.rejections += 1;
                self.last_rejection = Some(reason.clone());
                if self.proposal_seq == Some(*seq) {
                    self.drop_standing_proposal("proposal rejected");
                }
            }
            CommandOutcome::Failed { .. } => self.link_failures += 1,
        }
    }

    /// Operator-visible status
    pub fn status(&self, now_ns: u64) -> GateStatus {
        let (last_command, last_source) = match &self.last_resolved {
            Some((command, source)) => (Some(command.clone()), Some(*source)),
            None => (None, None),
        };
        GateStatus {
            state: self.state,
            failsafe_cause: self.failsafe_cause,
            last_rejection: self.last_rejection.clone(),
            last_seq: self.last_seq,
            last_command,
            last_source,
            last_outcome: self.last_outcome.map(str::to_string),
            automation_paused: self.automation_paused,
            oracle_failures: self.oracle_failures,
            link_failures: self.link_failures,
            counters: self.counters,
            updated_at_ns: now_ns,
        }
    }

    /// Accept the newest well-formed operator command, returning a fresh override
    fn intake_operator(&mut self, commands: Vec<OperatorCommand>) -> Option<VehicleCommand> {
        if commands.is_empty() {
            return None;
        }
        if self.state == GateState::Failsafe {
            for command in &commands {
                warn!(
                    issued_at_ns = command.issued_at_ns,
                    cause = ?self.failsafe_cause,
                    "Operator command ignored in failsafe"
                );
            }
            self.counters.operator_commands_ignored += commands.len() as u64;
            return None;
        }

        let mut newest: Option<(u64, OperatorIntent)> = None;
        for command in commands {
            let intent = match command.intent() {
                Ok(intent) => intent,
                Err(reason) => {
                    warn!(%reason, "Malformed operator command rejected");
                    self.counters.rejections += 1;
                    self.last_rejection = Some(format!("malformed operator command: {reason}"));
                    continue;
                }
            };
            if let Some(last) = self.last_operator_issued_ns {
                if command.issued_at_ns <= last {
                    debug!(
                        issued_at_ns = command.issued_at_ns,
                        last_accepted_ns = last,
                        "Operator command older than last accepted one ignored"
                    );
                    continue;
                }
            }
            if newest
                .as_ref()
                .map_or(true, |(issued, _)| command.issued_at_ns > *issued)
            {
                newest = Some((command.issued_at_ns, intent));
            }
        }

        let (issued_at_ns, intent) = newest?;
        self.last_operator_issued_ns = Some(issued_at_ns);
        match intent {
            OperatorIntent::Override(command) => {
                if self.state == GateState::Automated {
                    info!(command = %command, "Human override asserted");
                }
                self.state = GateState::HumanOverride;
                self.operator_command = Some(command.clone());
                self.drop_standing_proposal("operator override");
                Some(command)
            }
            OperatorIntent::Release => {
                if self.automation_paused {
                    info!("Automation resumed by operator release");
                    self.automation_paused = false;
                }
                if self.state == GateState::HumanOverride {
                    info!("Human override released");
                    self.state = GateState::Automated;
                    self.operator_command = None;
                } else {
                    debug!("Release received without active override");
                }
                None
            }
        }
    }

    fn account_health(
        &mut self,
        oracle: &OracleEvent,
        vehicle: Option<&VehicleState>,
        now_ns: u64,
    ) -> Health {
        match oracle {
            OracleEvent::Failure(err) => {
                self.oracle_failures += 1;
                warn!(%err, consecutive = self.oracle_failures, "Oracle failure");
            }
            OracleEvent::Proposal(_) => self.oracle_failures = 0,
            OracleEvent::Discarded | OracleEvent::Idle | OracleEvent::Standby => {}
        }

        let stale_after = self.config.telemetry_stale_after_ns;
        let armed_at = *self.watchdog_armed_at_ns.get_or_insert(now_ns);
        let telemetry_lost = match vehicle {
            Some(state) => state.is_stale(now_ns, stale_after),
            None => now_ns.saturating_sub(armed_at) > stale_after,
        };
        let battery_critical = vehicle.map_or(false, |state| {
            state.in_air && state.is_battery_critical(self.config.critical_battery_percent)
        });

        let cause = if battery_critical {
            Some(FailsafeCause::CriticalBattery)
        } else if telemetry_lost {
            Some(FailsafeCause::TelemetryLost)
        } else if self.link_failures >= self.config.link_failure_threshold {
            Some(FailsafeCause::LinkFailures)
        } else if self.oracle_failures >= self.config.oracle_failure_threshold {
            Some(FailsafeCause::OracleUnavailable)
        } else {
            None
        };
        Health { cause }
    }

    fn enter_failsafe(&mut self, cause: FailsafeCause) {
        warn!(%cause, previous = ?self.state, "Entering failsafe");
        self.state = GateState::Failsafe;
        self.failsafe_cause = Some(cause);
        self.operator_command = None;
        self.healthy_cycles = 0;
        self.counters.failsafe_entries += 1;
        self.drop_standing_proposal("failsafe entry");
        if cause == FailsafeCause::CriticalBattery {
            self.pause_automation("emergency landing");
        }
    }

    fn pause_automation(&mut self, reason: &str) {
        if !self.automation_paused {
            info!(reason, "Automation paused until operator release");
            self.automation_paused = true;
        }
    }

    fn drop_standing_proposal(&mut self, reason: &str) {
        if let Some(proposal) = self.standing_proposal.take() {
            debug!(command = %proposal.command, reason, "Standing proposal dropped");
        }
    }

    fn check_recovery(&mut self, health: &Health) {
        if health.cause.is_some() {
            self.healthy_cycles = 0;
            return;
        }
        self.healthy_cycles += 1;
        if self.healthy_cycles >= self.config.recovery_cycles {
            info!(
                cause = ?self.failsafe_cause,
                healthy_cycles = self.healthy_cycles,
                "Failsafe cleared, resuming automated control"
            );
            self.state = GateState::Automated;
            self.failsafe_cause = None;
            self.healthy_cycles = 0;
        }
    }

    fn resolve(
        &mut self,
        fresh_override: Option<VehicleCommand>,
        oracle: OracleEvent,
    ) -> Result<Resolution, InvariantViolation> {
        let resolution = match self.state {
            GateState::Failsafe => {
                let cause = self
                    .failsafe_cause
                    .map(|c| c.to_string())
                    .unwrap_or_default();
                Resolution::new(self.safe_action(), CommandSource::Failsafe, format!("failsafe: {cause}"))
            }
            GateState::HumanOverride => match fresh_override {
                Some(command) => Resolution::new(command, CommandSource::Human, "operator override"),
                None => {
                    let command = self
                        .operator_command
                        .clone()
                        .ok_or(InvariantViolation::OverrideWithoutCommand)?;
                    Resolution {
                        reissue: true,
                        ..Resolution::new(command, CommandSource::Human, "operator override (re-issued)")
                    }
                }
            },
            GateState::Automated => self.resolve_automated(oracle),
        };
        Ok(resolution)
    }

    fn resolve_automated(&mut self, oracle: OracleEvent) -> Resolution {
        let standby = matches!(oracle, OracleEvent::Standby);
        match oracle {
            OracleEvent::Proposal(proposal) if self.automation_paused => {
                debug!(command = %proposal.command, "Proposal ignored while automation is paused");
            }
            OracleEvent::Proposal(mut proposal) => {
                if proposal.rationale.is_empty() {
                    proposal.rationale = format!("oracle proposal for snapshot {}", proposal.snapshot_id);
                }
                if matches!(proposal.command, VehicleCommand::Land | VehicleCommand::Disarm) {
                    self.pause_automation("oracle handed control back");
                }
                let resolution = Resolution {
                    from_proposal: true,
                    ..Resolution::new(
                        proposal.command.clone(),
                        CommandSource::Automated,
                        proposal.rationale.clone(),
                    )
                };
                self.standing_proposal = Some(proposal);
                return resolution;
            }
            OracleEvent::Failure(_) => self.drop_standing_proposal("oracle failure"),
            OracleEvent::Standby => self.drop_standing_proposal("no active trigger"),
            OracleEvent::Idle | OracleEvent::Discarded => {}
        }

        match &self.standing_proposal {
            Some(proposal) => Resolution {
                reissue: true,
                from_proposal: true,
                ..Resolution::new(
                    proposal.command.clone(),
                    CommandSource::Automated,
                    proposal.rationale.clone(),
                )
            },
            None => {
                let rationale = if self.automation_paused {
                    "automation paused"
                } else if standby {
                    "no active trigger"
                } else {
                    "no proposal"
                };
                Resolution::new(VehicleCommand::Hold, CommandSource::Automated, rationale)
            }
        }
    }

    fn safe_action(&self) -> VehicleCommand {
        if self.failsafe_cause == Some(FailsafeCause::CriticalBattery) {
            return VehicleCommand::Land;
        }
        match self.config.failsafe_action {
            SafeAction::Hold => VehicleCommand::Hold,
            SafeAction::Land => VehicleCommand::Land,
        }
    }
}
