//! Test utilities for decision loop scenarios

use async_trait::async_trait;
use pilotgate_c2_router::{
    gate_channels, CycleReport, DecisionLoop, InputHandles, OperatorCommand, OracleError,
    OracleRequest, PolicyOracle, SimLink,
};
use pilotgate_core::{Clock, Config, ManualClock};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Cycle period used by every scenario
pub const CYCLE_MS: u64 = 100;

/// Install a test-writer subscriber once; later calls are no-ops
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// Oracle replaying a script of replies, then a fallback reply
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Result<String, OracleError>>>,
    fallback: Result<String, OracleError>,
    delay: Duration,
    requests: Mutex<Vec<u64>>,
}

impl ScriptedOracle {
    /// Oracle answering `reply` to every request
    pub fn always(reply: &str) -> Self {
        Self::scripted(Vec::new(), Ok(reply.to_string()))
    }

    /// Oracle answering from `script` first, then `fallback`
    pub fn scripted(script: Vec<Result<String, OracleError>>, fallback: Result<String, OracleError>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Delay every reply by `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Snapshot ids of every request received
    pub fn requests(&self) -> Vec<u64> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyOracle for ScriptedOracle {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn query(&self, request: &OracleRequest) -> Result<String, OracleError> {
        self.requests.lock().unwrap().push(request.snapshot_id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Config with an oracle request every cycle and millisecond backoff
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.arbitration.cycle_period_ms = CYCLE_MS;
    config.oracle.interval_cycles = 1;
    config.oracle.timeout_ms = 50;
    config.dispatch.base_backoff_ms = 1;
    config.dispatch.max_backoff_ms = 2;
    config.dispatch.link_timeout_ms = 100;
    config
}

/// Decision loop over a simulated vehicle, driven by a manual clock
pub struct Rig {
    pub decision_loop: DecisionLoop,
    pub link: Arc<SimLink>,
    pub clock: ManualClock,
    pub handles: InputHandles,
    /// When false, `step` does not publish telemetry
    pub telemetry_enabled: bool,
}

impl Rig {
    /// Rig without an oracle
    pub fn new(config: &Config) -> Self {
        Self::build(config, |decision_loop| decision_loop)
    }

    /// Rig with `oracle` attached
    pub fn with_oracle(config: &Config, oracle: Arc<dyn PolicyOracle>) -> Self {
        Self::build(config, |decision_loop| decision_loop.with_oracle(oracle))
    }

    /// Rig whose loop is finished by `configure`
    pub fn build(config: &Config, configure: impl FnOnce(DecisionLoop) -> DecisionLoop) -> Self {
        init_test_logging();
        let clock = ManualClock::starting_at(1_000_000_000);
        let (mut handles, inputs) = gate_channels(16);

        // The link publishes into the loop's telemetry slot
        let (detached, _) = watch::channel(None);
        let telemetry = std::mem::replace(&mut handles.telemetry, detached);
        let link = Arc::new(SimLink::new(SimLink::DEFAULT_HOME, Arc::new(clock.clone()), telemetry));

        let decision_loop = configure(DecisionLoop::new(
            config,
            inputs,
            link.clone(),
            Arc::new(clock.clone()),
        ));
        Self {
            decision_loop,
            link,
            clock,
            handles,
            telemetry_enabled: true,
        }
    }

    /// Queue an operator command stamped with the current clock
    pub fn operator(&self, command: impl FnOnce(u64) -> OperatorCommand) {
        let command = command(self.clock.now_ns());
        self.handles.operator.try_submit(command).unwrap();
    }

    /// Advance one period and run one cycle
    ///
    /// The oracle request launched by the cycle is awaited so its result is
    /// deterministically available to the next cycle.
    pub async fn step(&mut self) -> CycleReport {
        self.clock.advance_ms(CYCLE_MS);
        if self.telemetry_enabled {
            self.link.publish_telemetry();
        }
        let report = self.decision_loop.run_cycle().await.unwrap();
        self.decision_loop.oracle_settled().await;
        report
    }

    /// Run `n` cycles, returning every report
    pub async fn steps(&mut self, n: usize) -> Vec<CycleReport> {
        let mut reports = Vec::with_capacity(n);
        for _ in 0..n {
            reports.push(self.step().await);
        }
        reports
    }
}
