//! Execution dispatcher
//!
//! Validates each resolved command against the latest vehicle state, sends
//! it over the vehicle link with bounded, time-limited attempts and reports
//! a `CommandOutcome` correlated by sequence number.

#![warn(missing_docs)]

use crate::arbiter::InvariantViolation;
use crate::command_types::{CommandOutcome, ResolvedCommand, VehicleCommand};
use crate::link::{LinkCommand, TransportError, VehicleLink};
use crate::preconditions::PreconditionLimits;
use crate::retry::{BackoffPolicy, InFlightCommand, RetryDecision, RetryError};
use pilotgate_context::VehicleState;
use pilotgate_core::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Attempt budget for idempotent commands
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff: BackoffPolicy,
    /// Bound on a single link call
    pub link_timeout: Duration,
    /// Vehicle limits for the precondition table
    pub limits: PreconditionLimits,
}

impl DispatcherConfig {
    /// Settings from the `dispatch` and `vehicle` config sections
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.dispatch.max_attempts,
            backoff: BackoffPolicy::from_millis(
                config.dispatch.base_backoff_ms,
                config.dispatch.max_backoff_ms,
            ),
            link_timeout: Duration::from_millis(config.dispatch.link_timeout_ms),
            limits: PreconditionLimits::from_config(&config.vehicle),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Execution dispatcher for one vehicle
pub struct ExecutionDispatcher {
    link: Arc<dyn VehicleLink>,
    config: DispatcherConfig,
    last_dispatched_seq: Option<u64>,
    /// Command currently in effect on the vehicle, if known
    last_accepted: Option<VehicleCommand>,
    link_calls: u64,
}

impl ExecutionDispatcher {
    /// Create a dispatcher sending over `link`
    pub fn new(link: Arc<dyn VehicleLink>, config: DispatcherConfig) -> Self {
        Self {
            link,
            config,
            last_dispatched_seq: None,
            last_accepted: None,
            link_calls: 0,
        }
    }

    /// Last command the vehicle acknowledged
    pub fn last_accepted(&self) -> Option<&VehicleCommand> {
        self.last_accepted.as_ref()
    }

    /// Total link calls made, including retries
    pub fn link_calls(&self) -> u64 {
        self.link_calls
    }

    /// Dispatch a resolved command
    ///
    /// Only a sequence number that does not increase is an error; every
    /// other problem is reported through the returned outcome.
    pub async fn dispatch(
        &mut self,
        resolved: ResolvedCommand,
        vehicle: Option<&VehicleState>,
    ) -> Result<CommandOutcome, InvariantViolation> {
        let seq = resolved.seq;
        if let Some(last) = self.last_dispatched_seq {
            if seq <= last {
                return Err(InvariantViolation::SequenceRegression {
                    last,
                    got: seq,
                });
            }
        }
        self.last_dispatched_seq = Some(seq);

        let in_effect = self.last_accepted.as_ref() == Some(&resolved.command);
        // A re-issued standing command is never re-checked
        if in_effect && resolved.reissue {
            debug!(seq, command = %resolved.command, "Re-issued command already in effect, not forwarded");
            return Ok(not_forwarded(seq));
        }

        if let Err(violation) = resolved
            .command
            .check_preconditions(vehicle, &self.config.limits)
        {
            warn!(seq, command = %resolved.command, %violation, "Command rejected by precondition");
            return Ok(CommandOutcome::Rejected {
                seq,
                reason: violation.to_string(),
            });
        }

        if in_effect && resolved.command.is_idempotent() {
            debug!(seq, command = %resolved.command, "Command already in effect, not forwarded");
            return Ok(not_forwarded(seq));
        }

        let outcome = self
            .send_with_retry(InFlightCommand::new(
                seq,
                resolved.command,
                self.config.max_attempts,
            ))
            .await
            .map_err(|e| InvariantViolation::RetryStateMachine(e.to_string()))?;

        Ok(outcome)
    }

    async fn send_with_retry(
        &mut self,
        mut in_flight: InFlightCommand,
    ) -> Result<CommandOutcome, RetryError> {
        let link_command = LinkCommand::from(in_flight.command());

        loop {
            let attempt = in_flight.begin_attempt()?;
            self.link_calls += 1;

            match self.send_once(link_command.clone()).await {
                Ok(()) => {
                    in_flight.mark_accepted()?;
                    info!(
                        seq = in_flight.seq(),
                        command = %in_flight.command(),
                        attempt,
                        "Command acknowledged by vehicle"
                    );
                    self.last_accepted = Some(in_flight.command().clone());
                    break;
                }
                Err(error) if !error.is_retryable() => {
                    warn!(seq = in_flight.seq(), %error, "Command denied by vehicle");
                    in_flight.mark_rejected(error.to_string())?;
                    break;
                }
                Err(error) => {
                    match in_flight.record_transport_failure(error.to_string(), &self.config.backoff)? {
                        RetryDecision::RetryAfter(delay) => {
                            warn!(
                                seq = in_flight.seq(),
                                attempt,
                                %error,
                                delay_ms = delay.as_millis() as u64,
                                "Transport failure, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            warn!(
                                seq = in_flight.seq(),
                                attempts = in_flight.attempts(),
                                %error,
                                "Transport failure, giving up"
                            );
                            // Vehicle state is unknown after a failed send
                            self.last_accepted = None;
                            break;
                        }
                    }
                }
            }
        }

        in_flight.into_outcome()
    }

    async fn send_once(&self, command: LinkCommand) -> Result<(), TransportError> {
        let timeout = self.config.link_timeout;
        match tokio::time::timeout(timeout, self.link.send(command)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn not_forwarded(seq: u64) -> CommandOutcome {
    CommandOutcome::Accepted {
        seq,
        forwarded: false,
        attempts: 0,
    }
}
