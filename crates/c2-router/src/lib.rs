//! C2 Router - command arbitration and execution for PilotGate
//!
//! This crate sits between the sources of vehicle intent and the vehicle:
//! - Command types shared by operators, the policy oracle and the gate
//! - Policy oracle adapter with schema validation and an Ollama backend
//! - Command arbitration and safety gate with failsafe handling
//! - Execution dispatcher with preconditions, dedupe and bounded retry
//! - Vehicle link trait and a simulated vehicle
//! - Hash-chained SQLite audit log of every resolved command
//! - Decision loop tying the above together per vehicle
//!
//! # Architecture
//!
//! Each decision cycle flows through the following pipeline:
//! 1. Operator commands drained from the inbox
//! 2. Telemetry and detections fused into a `ContextSnapshot`
//! 3. Oracle proposal collected (requests run off the cycle)
//! 4. `CommandArbiter` resolves exactly one `ResolvedCommand`
//! 5. `ExecutionDispatcher` checks preconditions and sends it
//! 6. Outcome fed back to the gate and appended to the `AuditLog`
//!
//! # Priority
//!
//! - Failsafe: the configured safe action, nothing else
//! - Human override: the operator's command, re-issued every cycle
//! - Automated: the latest oracle proposal, or hold when there is none
//!
//! # Examples
//!
//! ```
//! use pilotgate_c2_router::{
//!     CommandArbiter, CommandSource, CycleInput, GateConfig, OperatorCommand, VehicleCommand,
//! };
//!
//! let mut gate = CommandArbiter::new(GateConfig::default());
//! let resolved = gate
//!     .resolve_cycle(CycleInput {
//!         now_ns: 0,
//!         operator_commands: vec![OperatorCommand::assert(VehicleCommand::Hold, 0)],
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! assert_eq!(resolved.source, CommandSource::Human);
//! assert_eq!(resolved.command, VehicleCommand::Hold);
//! ```

pub mod arbiter;
pub mod audit;
pub mod channels;
pub mod command_types;
pub mod control_loop;
pub mod dispatcher;
pub mod link;
pub mod ollama;
pub mod oracle;
pub mod preconditions;
pub mod retry;
pub mod status;

// Re-export commonly used types
pub use arbiter::{CommandArbiter, CycleInput, GateConfig, InvariantViolation, OracleEvent};
pub use audit::{AuditEntry, AuditError, AuditLog};
pub use channels::{gate_channels, GateInputs, InputHandles, OperatorHandle, DEFAULT_OPERATOR_CAPACITY};
pub use command_types::{
    CommandOutcome, CommandSource, MalformedCommand, OperatorCommand, OperatorIntent,
    ProposedCommand, ResolvedCommand, VehicleCommand,
};
pub use control_loop::{CycleReport, DecisionLoop};
pub use dispatcher::{DispatcherConfig, ExecutionDispatcher};
pub use link::{LinkCommand, SimLink, TransportError, VehicleLink};
pub use ollama::OllamaOracle;
pub use oracle::{parse_reply, OracleClient, OracleError, OracleReply, OracleRequest, PolicyOracle};
pub use preconditions::{PreconditionLimits, PreconditionViolation};
pub use retry::{BackoffPolicy, InFlightCommand, InFlightState, RetryDecision, RetryError};
pub use status::{FailsafeCause, GateCounters, GateState, GateStatus};
