//! Per-vehicle decision loop
//!
//! Owns every component of the command path and drives one decision cycle
//! per tick:
//!
//! 1. Drain the operator inbox
//! 2. Normalize and ingest new telemetry and detections
//! 3. Build a context snapshot
//! 4. Collect a finished oracle request, launch a new one when due
//! 5. Arbitrate, dispatch, feed the outcome back to the gate
//! 6. Append to the audit log and publish `GateStatus`
//!
//! Oracle requests run on spawned tasks and are only ever polled, so a slow
//! oracle never delays a cycle. At most one request runs at a time; a request
//! that is still running when the next one is due delays it, and only
//! `timeout_ms` ends it early.
//!
//! With `require_trigger` set, a due query is skipped while the snapshot holds
//! no observation and no follow is in effect. The gate sees `Standby` and
//! holds. No query is launched while automation is paused.

use crate::arbiter::{CommandArbiter, CycleInput, GateConfig, InvariantViolation, OracleEvent};
use crate::audit::AuditLog;
use crate::channels::GateInputs;
use crate::command_types::{CommandOutcome, ResolvedCommand};
use crate::dispatcher::{DispatcherConfig, ExecutionDispatcher};
use crate::link::VehicleLink;
use crate::oracle::{OracleClient, OracleError, OracleReply, PolicyOracle};
use crate::status::{GateCounters, GateState, GateStatus};
use pilotgate_context::{
    ContextAggregator, ContextError, ContextSnapshot, IngestOutcome, MissionObjective,
    PerceptionNormalizer, TelemetryNormalizer, VehicleState,
};
use pilotgate_core::{ms_to_ns, Clock, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Command resolved this cycle
    pub resolved: ResolvedCommand,
    /// Dispatch outcome of `resolved`
    pub outcome: CommandOutcome,
    /// Snapshot built this cycle, if the context was complete
    pub snapshot_id: Option<u64>,
    /// Gate state after the cycle
    pub state: GateState,
}

struct InFlightRequest {
    snapshot_id: u64,
    handle: JoinHandle<Result<OracleReply, OracleError>>,
}

/// Decision loop for a single vehicle
pub struct DecisionLoop {
    inputs: GateInputs,
    telemetry: TelemetryNormalizer,
    perception: PerceptionNormalizer,
    aggregator: ContextAggregator,
    objective: MissionObjective,
    arbiter: CommandArbiter,
    dispatcher: ExecutionDispatcher,
    oracle: Option<Arc<OracleClient>>,
    oracle_timeout: Duration,
    default_takeoff_altitude_m: f32,
    oracle_interval_cycles: u64,
    require_trigger: bool,
    /// First cycle at which the next request may launch
    next_oracle_cycle: u64,
    in_flight: Option<InFlightRequest>,
    ready: Option<OracleEvent>,
    audit: Option<AuditLog>,
    status_tx: watch::Sender<GateStatus>,
    clock: Arc<dyn Clock>,
    cycle_period: Duration,
    cycles: u64,
}

impl DecisionLoop {
    /// Build a loop from configuration
    ///
    /// The loop starts without an oracle, an audit log or a mission
    /// objective; add them with the `with_*` methods.
    pub fn new(
        config: &Config,
        inputs: GateInputs,
        link: Arc<dyn VehicleLink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status_tx, _) = watch::channel(GateStatus::default());
        Self {
            inputs,
            telemetry: TelemetryNormalizer::new(),
            perception: PerceptionNormalizer::new(config.perception.min_confidence),
            aggregator: ContextAggregator::new(
                ms_to_ns(config.perception.observation_ttl_ms),
                config.perception.max_observations,
            ),
            objective: MissionObjective::default(),
            arbiter: CommandArbiter::new(GateConfig::from_config(config)),
            dispatcher: ExecutionDispatcher::new(link, DispatcherConfig::from_config(config)),
            oracle: None,
            oracle_timeout: Duration::from_millis(config.oracle.timeout_ms),
            default_takeoff_altitude_m: config.vehicle.default_takeoff_altitude_m,
            oracle_interval_cycles: u64::from(config.oracle.interval_cycles.max(1)),
            require_trigger: config.oracle.require_trigger,
            next_oracle_cycle: 1,
            in_flight: None,
            ready: None,
            audit: None,
            status_tx,
            clock,
            cycle_period: Duration::from_millis(config.arbitration.cycle_period_ms),
            cycles: 0,
        }
    }

    /// Attach a policy oracle
    pub fn with_oracle(mut self, oracle: Arc<dyn PolicyOracle>) -> Self {
        info!(oracle = oracle.id(), "Policy oracle attached");
        self.oracle = Some(Arc::new(OracleClient::new(
            oracle,
            self.oracle_timeout,
            self.default_takeoff_altitude_m,
        )));
        self
    }

    /// Attach an audit log
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Set the standing mission objective
    pub fn with_objective(mut self, objective: MissionObjective) -> Self {
        self.objective = objective;
        self
    }

    /// Replace the mission objective; used from the next snapshot on
    pub fn set_objective(&mut self, objective: MissionObjective) {
        self.objective = objective;
    }

    /// Receiver for status published after every cycle
    pub fn subscribe_status(&self) -> watch::Receiver<GateStatus> {
        self.status_tx.subscribe()
    }

    /// Gate status as of now
    pub fn status(&self) -> GateStatus {
        self.arbiter.status(self.clock.now_ns())
    }

    /// Arbitration gate
    pub fn arbiter(&self) -> &CommandArbiter {
        &self.arbiter
    }

    /// Execution dispatcher
    pub fn dispatcher(&self) -> &ExecutionDispatcher {
        &self.dispatcher
    }

    /// Audit log, if attached
    pub fn audit(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    /// Latest accepted vehicle state
    pub fn vehicle_state(&self) -> Option<&VehicleState> {
        self.aggregator.latest_vehicle_state()
    }

    /// Most recent context snapshot
    pub fn current_snapshot(&self) -> Option<Arc<ContextSnapshot>> {
        self.aggregator.current_snapshot()
    }

    /// Whether an oracle request is running
    pub fn oracle_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Wait for the running oracle request to finish
    ///
    /// Its result is delivered to the gate on the next cycle.
    pub async fn oracle_settled(&mut self) {
        if let Some(request) = self.in_flight.take() {
            let event = oracle_event(request.snapshot_id, request.handle.await);
            self.ready = Some(event);
        }
    }

    /// Run one decision cycle
    pub async fn run_cycle(&mut self) -> Result<CycleReport, InvariantViolation> {
        let now_ns = self.clock.now_ns();
        self.cycles += 1;

        let operator_commands = self.inputs.drain_operator();
        self.ingest_inputs();

        let snapshot = match self.aggregator.snapshot(self.objective.clone(), now_ns) {
            Ok(snapshot) => Some(snapshot),
            Err(ContextError::IncompleteState) => {
                debug!(cycle = self.cycles, "No vehicle state yet, snapshot skipped");
                None
            }
        };

        let oracle = self.poll_oracle().await;
        let oracle = match (oracle, self.launch_oracle_if_due(snapshot.as_ref())) {
            (OracleEvent::Idle, Launch::Skipped) => OracleEvent::Standby,
            (event, _) => event,
        };

        let vehicle = self.aggregator.latest_vehicle_state().cloned();
        let resolved = self.arbiter.resolve_cycle(CycleInput {
            now_ns,
            vehicle: vehicle.as_ref(),
            operator_commands,
            oracle,
        })?;

        let outcome = self
            .dispatcher
            .dispatch(resolved.clone(), vehicle.as_ref())
            .await?;
        self.arbiter.record_outcome(&outcome);

        if let Some(audit) = self.audit.as_mut() {
            if let Err(e) = audit.append(&resolved, &outcome) {
                error!(seq = resolved.seq, error = %e, "Failed to append audit entry");
            }
        }

        let status = self.arbiter.status(now_ns);
        let state = status.state;
        self.status_tx.send_replace(status);

        Ok(CycleReport {
            resolved,
            outcome,
            snapshot_id: snapshot.map(|s| s.snapshot_id),
            state,
        })
    }

    /// Run cycles at the configured period until `shutdown` turns true
    ///
    /// Returns the gate counters on a clean stop. An `InvariantViolation`
    /// ends the loop immediately.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<GateCounters, InvariantViolation> {
        let mut ticker = tokio::time::interval(self.cycle_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            period_ms = self.cycle_period.as_millis() as u64,
            oracle = ?self.oracle.as_ref().map(|o| o.oracle_id()),
            "Decision loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(violation) = self.run_cycle().await {
                        error!(%violation, cycle = self.cycles, "Decision loop halted");
                        return Err(violation);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let counters = self.arbiter.counters();
        info!(
            cycles = counters.cycles,
            failsafe_entries = counters.failsafe_entries,
            rejections = counters.rejections,
            "Decision loop stopped"
        );
        Ok(counters)
    }

    fn ingest_inputs(&mut self) {
        if let Some(raw) = self.inputs.take_telemetry() {
            match self.telemetry.normalize(raw) {
                Ok(state) => {
                    if self.aggregator.ingest_vehicle_state(state) == IngestOutcome::DiscardedStale {
                        debug!("Telemetry sample not newer than held state");
                    }
                }
                Err(e) => warn!(error = %e, "Telemetry sample dropped"),
            }
        }

        for raw in self.inputs.take_detections() {
            match self.perception.normalize(raw) {
                Ok(Some(observation)) => {
                    self.aggregator.ingest_observation(observation);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Detection dropped"),
            }
        }
    }

    /// Take the result of a finished oracle request, if any
    async fn poll_oracle(&mut self) -> OracleEvent {
        if let Some(event) = self.ready.take() {
            return event;
        }
        let finished = self
            .in_flight
            .as_ref()
            .map_or(false, |request| request.handle.is_finished());
        if !finished {
            return OracleEvent::Idle;
        }
        match self.in_flight.take() {
            // Finished, so this resolves without waiting
            Some(request) => oracle_event(request.snapshot_id, request.handle.await),
            None => OracleEvent::Idle,
        }
    }

    /// Launch a request when one is due and none is running
    fn launch_oracle_if_due(&mut self, snapshot: Option<&Arc<ContextSnapshot>>) -> Launch {
        let (Some(client), Some(snapshot)) = (self.oracle.as_ref(), snapshot) else {
            return Launch::NotDue;
        };
        if self.in_flight.is_some() || self.cycles < self.next_oracle_cycle {
            return Launch::NotDue;
        }
        if self.arbiter.automation_paused() {
            return Launch::NotDue;
        }
        self.next_oracle_cycle = self.cycles + self.oracle_interval_cycles;

        if self.require_trigger && snapshot.observations.is_empty() && !self.arbiter.is_following() {
            debug!(snapshot_id = snapshot.snapshot_id, "No active trigger, oracle query skipped");
            return Launch::Skipped;
        }

        let client = Arc::clone(client);
        let request_snapshot = Arc::clone(snapshot);
        let snapshot_id = snapshot.snapshot_id;
        debug!(snapshot_id, "Launching oracle request");
        self.in_flight = Some(InFlightRequest {
            snapshot_id,
            handle: tokio::spawn(async move { client.propose(request_snapshot).await }),
        });
        Launch::Started
    }
}

enum Launch {
    NotDue,
    Skipped,
    Started,
}

impl Drop for DecisionLoop {
    fn drop(&mut self) {
        if let Some(request) = self.in_flight.take() {
            request.handle.abort();
        }
    }
}

fn oracle_event(
    snapshot_id: u64,
    result: Result<Result<OracleReply, OracleError>, JoinError>,
) -> OracleEvent {
    match result {
        Ok(Ok(OracleReply::Proposed(proposal))) => {
            debug!(snapshot_id, command = %proposal.command, "Oracle proposal received");
            OracleEvent::Proposal(proposal)
        }
        Ok(Ok(OracleReply::Discarded { .. })) => OracleEvent::Discarded,
        Ok(Err(e)) => OracleEvent::Failure(e),
        Err(e) => {
            error!(snapshot_id, error = %e, "Oracle task failed");
            OracleEvent::Failure(OracleError::Unreachable(format!("oracle task failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{gate_channels, InputHandles};
    use crate::command_types::{CommandSource, OperatorCommand, VehicleCommand};
    use crate::link::SimLink;
    use async_trait::async_trait;
    use crate::oracle::OracleRequest;
    use pilotgate_context::RawDetection;
    use pilotgate_core::ManualClock;

    struct ReplyOracle(&'static str);

    #[async_trait]
    impl PolicyOracle for ReplyOracle {
        fn id(&self) -> &str {
            "reply"
        }

        async fn query(&self, _request: &OracleRequest) -> Result<String, OracleError> {
            Ok(self.0.to_string())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.oracle.interval_cycles = 1;
        config.dispatch.base_backoff_ms = 1;
        config.dispatch.max_backoff_ms = 1;
        config
    }

    fn setup(config: &Config) -> (DecisionLoop, Arc<SimLink>, ManualClock, InputHandles) {
        let clock = ManualClock::starting_at(1_000_000);
        let (mut handles, inputs) = gate_channels(8);
        let (unused_tx, _) = watch::channel(None);
        let telemetry = std::mem::replace(&mut handles.telemetry, unused_tx);
        let link = Arc::new(SimLink::new(
            SimLink::DEFAULT_HOME,
            Arc::new(clock.clone()),
            telemetry,
        ));
        link.publish_telemetry();
        let decision_loop = DecisionLoop::new(config, inputs, link.clone(), Arc::new(clock.clone()));
        (decision_loop, link, clock, handles)
    }

    #[tokio::test]
    async fn test_first_cycle_holds_without_oracle() {
        let (mut dl, link, clock, _handles) = setup(&config());
        clock.advance_ms(100);

        let report = dl.run_cycle().await.unwrap();
        assert_eq!(report.resolved.command, VehicleCommand::Hold);
        assert_eq!(report.resolved.source, CommandSource::Automated);
        assert_eq!(report.snapshot_id, Some(1));
        assert!(report.outcome.is_accepted());
        assert_eq!(link.send_count(), 1);
        assert_eq!(dl.subscribe_status().borrow().last_seq, Some(1));
    }

    #[tokio::test]
    async fn test_oracle_proposal_applies_next_cycle() {
        let (dl, _link, clock, _handles) = setup(&config());
        let mut dl = dl.with_oracle(Arc::new(ReplyOracle(r#"{"action": "arm", "reason": "prepare"}"#)));

        clock.advance_ms(100);
        let first = dl.run_cycle().await.unwrap();
        assert_eq!(first.resolved.command, VehicleCommand::Hold);
        assert!(dl.oracle_in_flight());

        dl.oracle_settled().await;
        clock.advance_ms(100);
        let second = dl.run_cycle().await.unwrap();
        assert_eq!(second.resolved.command, VehicleCommand::Arm);
        assert_eq!(second.resolved.rationale, "prepare");
        assert!(second.outcome.is_accepted());
    }

    struct SlowOracle(Duration);

    #[async_trait]
    impl PolicyOracle for SlowOracle {
        fn id(&self) -> &str {
            "slow"
        }

        async fn query(&self, _request: &OracleRequest) -> Result<String, OracleError> {
            tokio::time::sleep(self.0).await;
            Ok(r#"{"action": "arm"}"#.to_string())
        }
    }

    #[tokio::test]
    async fn test_running_request_is_not_cut_short() {
        let mut config = config();
        config.oracle.timeout_ms = 5_000;
        let (dl, _link, clock, _handles) = setup(&config);
        let mut dl = dl.with_oracle(Arc::new(SlowOracle(Duration::from_millis(1_000))));

        for _ in 0..8 {
            clock.advance_ms(100);
            let report = dl.run_cycle().await.unwrap();
            assert_eq!(report.state, GateState::Automated);
            assert!(dl.oracle_in_flight());
        }
        assert_eq!(dl.arbiter().oracle_failures(), 0);

        dl.oracle_settled().await;
        clock.advance_ms(100);
        let report = dl.run_cycle().await.unwrap();
        assert_eq!(report.resolved.command, VehicleCommand::Arm);
    }

    #[tokio::test]
    async fn test_no_query_without_trigger() {
        let mut config = config();
        config.oracle.require_trigger = true;
        let (dl, _link, clock, handles) = setup(&config);
        let mut dl = dl.with_oracle(Arc::new(ReplyOracle(r#"{"action": "arm"}"#)));

        clock.advance_ms(100);
        let report = dl.run_cycle().await.unwrap();
        assert_eq!(report.resolved.rationale, "no active trigger");
        assert!(!dl.oracle_in_flight());

        handles.perception.send_replace(vec![RawDetection {
            id: Some("sim-1".to_string()),
            label: "person".to_string(),
            confidence: 0.9,
            distance_m: Some(15.0),
            relative_position: Some("ahead_center".to_string()),
            offset_ned_m: None,
            timestamp_ns: clock.now_ns(),
        }]);
        clock.advance_ms(100);
        dl.run_cycle().await.unwrap();
        assert!(dl.oracle_in_flight());
    }

    #[tokio::test]
    async fn test_operator_command_reaches_vehicle() {
        let (mut dl, link, clock, handles) = setup(&config());
        handles
            .operator
            .submit(OperatorCommand::assert(VehicleCommand::Arm, clock.now_ns()))
            .await
            .unwrap();

        clock.advance_ms(100);
        let report = dl.run_cycle().await.unwrap();
        assert_eq!(report.resolved.source, CommandSource::Human);
        assert_eq!(report.state, GateState::HumanOverride);
        assert!(report.outcome.is_accepted());

        // Re-issued Arm is deduplicated
        clock.advance_ms(100);
        let report = dl.run_cycle().await.unwrap();
        assert!(report.resolved.reissue);
        assert_eq!(
            report.outcome,
            CommandOutcome::Accepted {
                seq: report.resolved.seq,
                forwarded: false,
                attempts: 0
            }
        );
        assert_eq!(link.send_count(), 1);
    }

    #[tokio::test]
    async fn test_cycles_are_audited() {
        let (dl, _link, clock, _handles) = setup(&config());
        let mut dl = dl.with_audit(AuditLog::open_in_memory().unwrap());

        for _ in 0..3 {
            clock.advance_ms(100);
            dl.run_cycle().await.unwrap();
        }
        let audit = dl.audit().unwrap();
        assert_eq!(audit.len().unwrap(), 3);
        assert_eq!(audit.verify_chain().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (dl, _link, _clock, _handles) = setup(&config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(dl.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown_tx.send_replace(true);

        let counters = task.await.unwrap().unwrap();
        assert!(counters.cycles >= 2);
    }
}
