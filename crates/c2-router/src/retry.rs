//! Per-command retry state machine
//!
//! `InFlightCommand` tracks one dispatched command from `Pending` to exactly
//! one terminal state. Non-idempotent commands get a single attempt.

#![warn(missing_docs)]

use crate::command_types::{CommandOutcome, VehicleCommand};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Retry state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InFlightState {
    /// Awaiting a link acknowledgement
    Pending,
    /// Link acknowledged
    Accepted,
    /// Vehicle denied the command
    Rejected,
    /// Transport failed on every allowed attempt
    Failed,
}

impl InFlightState {
    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InFlightState::Pending)
    }
}

/// Illegal use of the retry state machine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    /// Transition out of a terminal state
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state
        from: InFlightState,
        /// Requested state
        to: InFlightState,
    },

    /// Attempt budget used up
    #[error("No attempts left ({attempts} of {max_attempts} used)")]
    AttemptsExhausted {
        /// Attempts made
        attempts: u32,
        /// Attempt budget
        max_attempts: u32,
    },
}

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
}

impl BackoffPolicy {
    /// Create a policy from millisecond bounds
    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    /// Delay before attempt `failed_attempts + 1`
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

/// What the dispatcher should do after a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again
    RetryAfter(Duration),
    /// Budget exhausted; the command is now `Failed`
    GiveUp,
}

/// A command being dispatched
#[derive(Debug, Clone)]
pub struct InFlightCommand {
    seq: u64,
    command: VehicleCommand,
    state: InFlightState,
    attempts: u32,
    max_attempts: u32,
    last_error: Option<String>,
}

impl InFlightCommand {
    /// Track `command`; non-idempotent commands are capped at one attempt
    pub fn new(seq: u64, command: VehicleCommand, max_attempts: u32) -> Self {
        let max_attempts = if command.is_idempotent() {
            max_attempts.max(1)
        } else {
            1
        };
        Self {
            seq,
            command,
            state: InFlightState::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
        }
    }

    /// Sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Tracked command
    pub fn command(&self) -> &VehicleCommand {
        &self.command
    }

    /// Current state
    pub fn state(&self) -> InFlightState {
        self.state
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt budget
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Start the next attempt, returning its 1-based number
    pub fn begin_attempt(&mut self) -> Result<u32, RetryError> {
        self.require_pending(InFlightState::Pending)?;
        if self.attempts >= self.max_attempts {
            return Err(RetryError::AttemptsExhausted {
                attempts: self.attempts,
                max_attempts: self.max_attempts,
            });
        }
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Link acknowledged the current attempt
    pub fn mark_accepted(&mut self) -> Result<(), RetryError> {
        self.transition(InFlightState::Accepted)
    }

    /// Vehicle denied the command; never retried
    pub fn mark_rejected(&mut self, reason: impl Into<String>) -> Result<(), RetryError> {
        self.transition(InFlightState::Rejected)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Record a transport failure of the current attempt
    pub fn record_transport_failure(
        &mut self,
        reason: impl Into<String>,
        backoff: &BackoffPolicy,
    ) -> Result<RetryDecision, RetryError> {
        self.require_pending(InFlightState::Failed)?;
        self.last_error = Some(reason.into());
        if self.attempts < self.max_attempts {
            Ok(RetryDecision::RetryAfter(backoff.delay(self.attempts)))
        } else {
            self.state = InFlightState::Failed;
            Ok(RetryDecision::GiveUp)
        }
    }

    /// Convert a terminal command into its outcome
    pub fn into_outcome(self) -> Result<CommandOutcome, RetryError> {
        let reason = self.last_error.unwrap_or_default();
        match self.state {
            InFlightState::Accepted => Ok(CommandOutcome::Accepted {
                seq: self.seq,
                forwarded: true,
                attempts: self.attempts,
            }),
            InFlightState::Rejected => Ok(CommandOutcome::Rejected {
                seq: self.seq,
                reason,
            }),
            InFlightState::Failed => Ok(CommandOutcome::Failed {
                seq: self.seq,
                reason,
                attempts: self.attempts,
            }),
            InFlightState::Pending => Err(RetryError::InvalidTransition {
                from: InFlightState::Pending,
                to: InFlightState::Pending,
            }),
        }
    }

    fn transition(&mut self, to: InFlightState) -> Result<(), RetryError> {
        self.require_pending(to)?;
        self.state = to;
        Ok(())
    }

    fn require_pending(&self, to: InFlightState) -> Result<(), RetryError> {
        if self.state.is_terminal() {
            return Err(RetryError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::from_millis(50, 400)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay(1), Duration::from_millis(50));
        assert_eq!(p.delay(2), Duration::from_millis(100));
        assert_eq!(p.delay(3), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(400));
        assert_eq!(p.delay(10), Duration::from_millis(400));
    }

    #[test]
    fn test_idempotent_command_retries_until_budget() {
        let mut cmd = InFlightCommand::new(1, VehicleCommand::Hold, 3);

        assert_eq!(cmd.begin_attempt(), Ok(1));
        assert_eq!(
            cmd.record_transport_failure("timeout", &policy()),
            Ok(RetryDecision::RetryAfter(Duration::from_millis(50)))
        );
        assert_eq!(cmd.begin_attempt(), Ok(2));
        assert!(matches!(
            cmd.record_transport_failure("timeout", &policy()),
            Ok(RetryDecision::RetryAfter(_))
        ));
        assert_eq!(cmd.begin_attempt(), Ok(3));
        assert_eq!(
            cmd.record_transport_failure("timeout", &policy()),
            Ok(RetryDecision::GiveUp)
        );

        assert_eq!(cmd.state(), InFlightState::Failed);
        assert_eq!(
            cmd.into_outcome(),
            Ok(CommandOutcome::Failed {
                seq: 1,
                reason: "timeout".to_string(),
                attempts: 3
            })
        );
    }

    #[test]
    fn test_non_idempotent_command_gets_one_attempt() {
        let mut cmd = InFlightCommand::new(2, VehicleCommand::Arm, 5);
        assert_eq!(cmd.max_attempts(), 1);

        cmd.begin_attempt().unwrap();
        assert_eq!(
            cmd.record_transport_failure("link down", &policy()),
            Ok(RetryDecision::GiveUp)
        );
        assert!(matches!(
            cmd.begin_attempt(),
            Err(RetryError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut cmd = InFlightCommand::new(3, VehicleCommand::Hold, 3);
        cmd.begin_attempt().unwrap();
        cmd.mark_accepted().unwrap();

        assert_eq!(
            cmd.mark_rejected("late denial"),
            Err(RetryError::InvalidTransition {
                from: InFlightState::Accepted,
                to: InFlightState::Rejected
            })
        );
        assert_eq!(
            cmd.into_outcome(),
            Ok(CommandOutcome::Accepted {
                seq: 3,
                forwarded: true,
                attempts: 1
            })
        );
    }

    #[test]
    fn test_pending_has_no_outcome() {
        let cmd = InFlightCommand::new(4, VehicleCommand::Land, 1);
        assert!(cmd.into_outcome().is_err());
    }
}
