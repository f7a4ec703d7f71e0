//! Line-oriented operator console
//!
//! Commands, one per line:
//!
//! ```text
//! arm | disarm | land | hold | rth
//! takeoff [altitude_m]
//! goto <lat> <lon> <altitude_m>
//! follow <target_id> <distance_m> <altitude_m>
//! detect [label] [distance_m]
//! clear
//! release | status | exit
//! ```
//!
//! `detect` and `clear` edit the simulated perception scene. The scene is
//! re-published while it holds detections; cleared detections age out of the
//! context after the observation TTL.

use pilotgate_c2_router::{GateStatus, OperatorCommand, OperatorHandle, VehicleCommand};
use pilotgate_context::RawDetection;
use pilotgate_core::Clock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const DEFAULT_DETECTION_LABEL: &str = "person";
const DEFAULT_DETECTION_DISTANCE_M: f32 = 15.0;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unknown command '{0}' (try: arm, takeoff [alt], land, goto <lat> <lon> <alt>, follow <target> <dist> <alt>, hold, rth, disarm, detect [label] [dist], clear, release, status, exit)")]
    UnknownCommand(String),

    #[error("{command}: missing argument <{argument}>")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("{command}: '{value}' is not a number")]
    InvalidNumber { command: &'static str, value: String },

    #[error("{command}: unexpected argument '{value}'")]
    UnexpectedArgument { command: &'static str, value: String },
}

/// Parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Assert an override with this command
    Override(VehicleCommand),
    /// Hand control back to automation
    Release,
    /// Add a simulated detection to the scene
    Detect { label: String, distance_m: f32 },
    /// Empty the simulated scene
    ClearDetections,
    Status,
    Exit,
}

impl ConsoleCommand {
    /// Operator command stamped at `issued_at_ns`; `None` for local commands
    pub fn to_operator_command(&self, issued_at_ns: u64) -> Option<OperatorCommand> {
        match self {
            ConsoleCommand::Override(command) => Some(OperatorCommand::assert(command.clone(), issued_at_ns)),
            ConsoleCommand::Release => Some(OperatorCommand::release(issued_at_ns)),
            ConsoleCommand::Detect { .. }
            | ConsoleCommand::ClearDetections
            | ConsoleCommand::Status
            | ConsoleCommand::Exit => None,
        }
    }
}

/// Parse one console line; blank lines yield `None`
pub fn parse_line(line: &str, default_takeoff_altitude_m: f32) -> Result<Option<ConsoleCommand>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let verb = verb.to_ascii_lowercase();

    let command = match verb.as_str() {
        "arm" => ConsoleCommand::Override(VehicleCommand::Arm),
        "disarm" => ConsoleCommand::Override(VehicleCommand::Disarm),
        "land" => ConsoleCommand::Override(VehicleCommand::Land),
        "hold" => ConsoleCommand::Override(VehicleCommand::Hold),
        "rth" => ConsoleCommand::Override(VehicleCommand::ReturnToHome),
        "takeoff" => {
            let altitude_m = match words.next() {
                Some(value) => number::<f32>("takeoff", value)?,
                None => default_takeoff_altitude_m,
            };
            ConsoleCommand::Override(VehicleCommand::TakeOff { altitude_m })
        }
        "goto" => {
            let lat = number::<f64>("goto", required("goto", "lat", words.next())?)?;
            let lon = number::<f64>("goto", required("goto", "lon", words.next())?)?;
            let alt_m = number::<f32>("goto", required("goto", "alt", words.next())?)?;
            ConsoleCommand::Override(VehicleCommand::GotoLocation { lat, lon, alt_m })
        }
        "follow" => {
            let target_id = required("follow", "target", words.next())?.to_string();
            let follow_distance_m = number::<f32>("follow", required("follow", "distance", words.next())?)?;
            let alt_m = number::<f32>("follow", required("follow", "alt", words.next())?)?;
            ConsoleCommand::Override(VehicleCommand::FollowTarget {
                target_id,
                follow_distance_m,
                alt_m,
            })
        }
        "detect" => {
            let label = words.next().unwrap_or(DEFAULT_DETECTION_LABEL).to_ascii_lowercase();
            let distance_m = match words.next() {
                Some(value) => number::<f32>("detect", value)?,
                None => DEFAULT_DETECTION_DISTANCE_M,
            };
            ConsoleCommand::Detect { label, distance_m }
        }
        "clear" => ConsoleCommand::ClearDetections,
        "release" => ConsoleCommand::Release,
        "status" => ConsoleCommand::Status,
        "exit" | "quit" => ConsoleCommand::Exit,
        _ => return Err(ParseError::UnknownCommand(verb)),
    };

    if let Some(extra) = words.next() {
        return Err(ParseError::UnexpectedArgument {
            command: command_name(&command),
            value: extra.to_string(),
        });
    }
    Ok(Some(command))
}

fn command_name(command: &ConsoleCommand) -> &'static str {
    match command {
        ConsoleCommand::Override(c) => c.name(),
        ConsoleCommand::Release => "release",
        ConsoleCommand::Detect { .. } => "detect",
        ConsoleCommand::ClearDetections => "clear",
        ConsoleCommand::Status => "status",
        ConsoleCommand::Exit => "exit",
    }
}

fn required<'a>(
    command: &'static str,
    argument: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, ParseError> {
    value.ok_or(ParseError::MissingArgument { command, argument })
}

fn number<T: std::str::FromStr>(command: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        command,
        value: value.to_string(),
    })
}

/// Read commands from stdin until `exit` or end of input
///
/// `exit` and end of input both flip `shutdown`.
pub async fn run_console(
    operator: OperatorHandle,
    status: watch::Receiver<GateStatus>,
    scene: watch::Sender<Vec<RawDetection>>,
    clock: Arc<dyn Clock>,
    default_takeoff_altitude_m: f32,
    shutdown: watch::Sender<bool>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Operator console closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Operator console read failed");
                break;
            }
        };

        let command = match parse_line(&line, default_takeoff_altitude_m) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match command {
            ConsoleCommand::Status => println!("{}", status.borrow().summary()),
            ConsoleCommand::Exit => break,
            ConsoleCommand::Detect { label, distance_m } => {
                scene.send_modify(|detections| {
                    let detection = simulated_detection(detections.len() + 1, &label, distance_m, clock.now_ns());
                    detections.push(detection);
                });
                info!(%label, distance_m, "Simulated detection added");
            }
            ConsoleCommand::ClearDetections => {
                scene.send_replace(Vec::new());
                info!("Simulated detections cleared");
            }
            other => {
                if let Some(operator_command) = other.to_operator_command(clock.now_ns()) {
                    if operator.submit(operator_command).await.is_err() {
                        warn!("Decision loop stopped, operator command dropped");
                        break;
                    }
                    info!(command = ?other, "Operator command queued");
                }
            }
        }
    }

    shutdown.send_replace(true);
}

/// Detection placed straight ahead of the vehicle
pub fn simulated_detection(n: usize, label: &str, distance_m: f32, now_ns: u64) -> RawDetection {
    RawDetection {
        id: Some(format!("sim-{n}")),
        label: label.to_string(),
        confidence: 0.9,
        distance_m: Some(distance_m),
        relative_position: Some("ahead_center".to_string()),
        offset_ned_m: None,
        timestamp_ns: now_ns,
    }
}

/// Re-publish the simulated scene every `period` while it is not empty
///
/// Every publish re-stamps the detections so they stay fresh in the
/// context. An emptied scene is published once.
pub async fn run_scene_publisher(
    mut scene: watch::Receiver<Vec<RawDetection>>,
    perception: watch::Sender<Vec<RawDetection>>,
    clock: Arc<dyn Clock>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    let mut published_any = false;
    loop {
        ticker.tick().await;
        let now_ns = clock.now_ns();
        let detections: Vec<RawDetection> = scene
            .borrow_and_update()
            .iter()
            .cloned()
            .map(|detection| RawDetection {
                timestamp_ns: now_ns,
                ..detection
            })
            .collect();
        if detections.is_empty() {
            if published_any {
                debug!("Simulated scene emptied");
                perception.send_replace(Vec::new());
                published_any = false;
            }
            continue;
        }
        perception.send_replace(detections);
        published_any = true;
    }
}
