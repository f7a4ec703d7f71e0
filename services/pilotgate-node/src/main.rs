//! PilotGate node: one vehicle, one decision loop.
//!
//! Wires configuration, logging, the simulated vehicle link, the Ollama
//! oracle, the simulated perception scene and the stdin operator console,
//! then runs until Ctrl-C or `exit`.

mod operator;

use anyhow::{bail, Context};
use pilotgate_c2_router::{
    gate_channels, AuditLog, DecisionLoop, InputHandles, OllamaOracle, SimLink,
    DEFAULT_OPERATOR_CAPACITY,
};
use pilotgate_core::{logging, Clock, Config, LogFormat, MonotonicClock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

/// Simulated vehicle telemetry rate
const TELEMETRY_PERIOD: Duration = Duration::from_millis(200);

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[derive(Debug, Default, PartialEq)]
struct NodeArgs {
    config: Option<PathBuf>,
    json_logs: bool,
    version_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&args)?;

    if args.version_json {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if args.json_logs {
        config.logging.format = LogFormat::Json;
    }
    logging::init_with(&config.logging);

    info!(
        vehicle_id = %config.vehicle.vehicle_id,
        link = %config.vehicle.link_address,
        cycle_period_ms = config.arbitration.cycle_period_ms,
        "PilotGate node starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let (handles, inputs) = gate_channels(DEFAULT_OPERATOR_CAPACITY);
    let InputHandles {
        telemetry,
        perception,
        operator,
    } = handles;
    let (scene_tx, scene_rx) = watch::channel(Vec::new());
    let scene_publisher = tokio::spawn(operator::run_scene_publisher(
        scene_rx,
        perception,
        Arc::clone(&clock),
        TELEMETRY_PERIOD,
    ));

    let link = Arc::new(SimLink::new(SimLink::DEFAULT_HOME, Arc::clone(&clock), telemetry));
    link.publish_telemetry();
    let publisher = {
        let link = Arc::clone(&link);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TELEMETRY_PERIOD);
            loop {
                ticker.tick().await;
                link.publish_telemetry();
            }
        })
    };

    let mut decision_loop = DecisionLoop::new(&config, inputs, link, Arc::clone(&clock));
    if config.oracle.enabled {
        let oracle = OllamaOracle::from_config(&config.oracle).context("failed to create oracle client")?;
        decision_loop = decision_loop.with_oracle(Arc::new(oracle));
    } else {
        warn!("Oracle disabled, automated control will hold");
    }
    if let Some(path) = &config.audit.path {
        let audit = AuditLog::open(path).with_context(|| format!("failed to open audit log {path}"))?;
        decision_loop = decision_loop.with_audit(audit);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let console = tokio::spawn(operator::run_console(
        operator,
        decision_loop.subscribe_status(),
        scene_tx,
        Arc::clone(&clock),
        config.vehicle.default_takeoff_altitude_m,
        shutdown_tx.clone(),
    ));

    let mut loop_task = tokio::spawn(decision_loop.run(shutdown_rx));
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            shutdown_tx.send_replace(true);
            (&mut loop_task).await
        }
        result = &mut loop_task => result,
    };

    publisher.abort();
    scene_publisher.abort();
    console.abort();

    match result.context("decision loop task failed")? {
        Ok(counters) => {
            info!(
                cycles = counters.cycles,
                human = counters.human_commands,
                automated = counters.automated_commands,
                failsafe = counters.failsafe_commands,
                "PilotGate node stopped"
            );
            Ok(())
        }
        Err(violation) => {
            error!(%violation, "Invariant violation, aborting");
            std::process::abort();
        }
    }
}

fn parse_args(args: &[String]) -> anyhow::Result<NodeArgs> {
    let mut parsed = NodeArgs::default();
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        match arg.as_str() {
            "--config" => match args_iter.next() {
                Some(path) => parsed.config = Some(PathBuf::from(path)),
                None => bail!("--config was provided without a path"),
            },
            "--json-logs" => parsed.json_logs = true,
            "--version-json" => parsed.version_json = true,
            other => bail!("unknown argument '{other}' (expected --config <path>, --json-logs, --version-json)"),
        }
    }
    Ok(parsed)
}
