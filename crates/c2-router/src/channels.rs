//! Input channels feeding the decision loop
//!
//! Telemetry and perception are latest-value channels: a producer overwrites
//! the slot and the loop reads whatever is newest at the start of a cycle.
//! Operator commands go through a bounded queue because the gate needs every
//! command issued since the previous cycle.

use crate::command_types::OperatorCommand;
use pilotgate_context::{RawDetection, RawTelemetrySample};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Default operator inbox capacity
pub const DEFAULT_OPERATOR_CAPACITY: usize = 64;

/// Producer ends of the loop's input channels
pub struct InputHandles {
    /// Latest raw telemetry sample; hand this to the vehicle link
    pub telemetry: watch::Sender<Option<RawTelemetrySample>>,
    /// Latest perception frame
    pub perception: watch::Sender<Vec<RawDetection>>,
    /// Operator command submission
    pub operator: OperatorHandle,
}

/// Cloneable operator command sender
#[derive(Clone)]
pub struct OperatorHandle {
    tx: mpsc::Sender<OperatorCommand>,
}

impl OperatorHandle {
    /// Queue a command, waiting for space in the inbox
    pub async fn submit(&self, command: OperatorCommand) -> Result<(), OperatorCommand> {
        self.tx.send(command).await.map_err(|e| e.0)
    }

    /// Queue a command without waiting; fails when the inbox is full or closed
    pub fn try_submit(&self, command: OperatorCommand) -> Result<(), OperatorCommand> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(command) => {
                warn!("Operator inbox full, command dropped");
                command
            }
            mpsc::error::TrySendError::Closed(command) => command,
        })
    }
}

/// Consumer ends, owned by the decision loop
pub struct GateInputs {
    telemetry: watch::Receiver<Option<RawTelemetrySample>>,
    perception: watch::Receiver<Vec<RawDetection>>,
    operator: mpsc::Receiver<OperatorCommand>,
}

/// Create a connected set of input channels
pub fn gate_channels(operator_capacity: usize) -> (InputHandles, GateInputs) {
    let (telemetry_tx, telemetry_rx) = watch::channel(None);
    let (perception_tx, perception_rx) = watch::channel(Vec::new());
    let (operator_tx, operator_rx) = mpsc::channel(operator_capacity.max(1));

    (
        InputHandles {
            telemetry: telemetry_tx,
            perception: perception_tx,
            operator: OperatorHandle { tx: operator_tx },
        },
        GateInputs {
            telemetry: telemetry_rx,
            perception: perception_rx,
            operator: operator_rx,
        },
    )
}

impl GateInputs {
    /// Newest telemetry sample not yet seen by the loop
    pub fn take_telemetry(&mut self) -> Option<RawTelemetrySample> {
        if !self.telemetry.has_changed().unwrap_or(false) {
            return None;
        }
        self.telemetry.borrow_and_update().clone()
    }

    /// Newest perception frame not yet seen by the loop
    pub fn take_detections(&mut self) -> Vec<RawDetection> {
        if !self.perception.has_changed().unwrap_or(false) {
            return Vec::new();
        }
        self.perception.borrow_and_update().clone()
    }

    /// Every operator command queued since the last drain, in arrival order
    pub fn drain_operator(&mut self) -> Vec<OperatorCommand> {
        let mut commands = Vec::new();
        loop {
            match self.operator.try_recv() {
                Ok(command) => commands.push(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !commands.is_empty() {
                        debug!("Operator inbox closed after final drain");
                    }
                    break;
                }
            }
        }
        commands
    }
}
