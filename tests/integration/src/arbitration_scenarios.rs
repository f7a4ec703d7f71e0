//! Arbitration scenarios through the full decision loop
//!
//! Each test drives a `DecisionLoop` over a simulated vehicle with a
//! scripted oracle whose reply for cycle N is delivered in cycle N+1.

use crate::test_utils::{test_config, Rig, ScriptedOracle};
use pilotgate_c2_router::{
    CommandOutcome, CommandSource, GateState, LinkCommand, OperatorCommand, VehicleCommand,
};
use pilotgate_context::RawDetection;
use pilotgate_core::Clock;
use std::sync::Arc;
use std::time::Duration;

fn person(id: &str, timestamp_ns: u64) -> RawDetection {
    RawDetection {
        id: Some(id.to_string()),
        label: "person".to_string(),
        confidence: 0.9,
        distance_m: Some(15.0),
        relative_position: Some("ahead_center".to_string()),
        offset_ned_m: None,
        timestamp_ns,
    }
}

const FOLLOW_REPLY: &str = r#"{"action": "follow_target", "parameters": {"target_id": "trk-1", "follow_distance_m": 10, "altitude_m": 15}, "reason": "track person"}"#;

const GOTO_REPLY: &str = r#"{"action": "goto_location", "parameters": {"lat": 47.3980, "lon": 8.5460, "altitude_m": 25.0}, "reason": "survey"}"#;

#[tokio::test]
async fn test_takeoff_proposed_while_disarmed_is_rejected() {
    let oracle = Arc::new(ScriptedOracle::always(r#"{"action": "takeoff", "reason": "start mission"}"#));
    let mut rig = Rig::with_oracle(&test_config(), oracle);

    let first = rig.step().await;
    assert_eq!(first.resolved.command, VehicleCommand::Hold);
    assert_eq!(first.resolved.rationale, "no proposal");

    let second = rig.step().await;
    assert_eq!(second.resolved.source, CommandSource::Automated);
    assert_eq!(second.resolved.command, VehicleCommand::TakeOff { altitude_m: 10.0 });
    match &second.outcome {
        CommandOutcome::Rejected { reason, .. } => assert!(reason.contains("not armed"), "{reason}"),
        other => panic!("expected rejection, got {other:?}"),
    }

    let status = rig.decision_loop.status();
    assert!(status.last_rejection.unwrap().contains("not armed"));
    assert_eq!(status.state, GateState::Automated);
    assert!(!rig
        .link
        .sent_commands()
        .iter()
        .any(|c| matches!(c, LinkCommand::Takeoff { .. })));
}

#[tokio::test]
async fn test_operator_hold_beats_same_cycle_proposal() {
    let oracle = Arc::new(ScriptedOracle::always(GOTO_REPLY));
    let mut rig = Rig::with_oracle(&test_config(), oracle);
    rig.step().await;

    // Proposal for snapshot 1 and the operator's Hold land in the same cycle
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Hold, now));
    let report = rig.step().await;

    assert_eq!(report.resolved.source, CommandSource::Human);
    assert_eq!(report.resolved.command, VehicleCommand::Hold);
    assert!(!report.resolved.reissue);
    assert_eq!(report.state, GateState::HumanOverride);
    assert!(!rig
        .link
        .sent_commands()
        .iter()
        .any(|c| matches!(c, LinkCommand::Goto { .. })));
}

#[tokio::test]
async fn test_release_returns_control_to_oracle() {
    let oracle = Arc::new(ScriptedOracle::always(r#"{"action": "arm", "reason": "prepare"}"#));
    let mut rig = Rig::with_oracle(&test_config(), oracle);

    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Hold, now));
    let asserted = rig.step().await;
    assert_eq!(asserted.resolved.source, CommandSource::Human);

    // Override keeps winning over the pending Arm proposal
    let held = rig.step().await;
    assert_eq!(held.resolved.source, CommandSource::Human);
    assert_eq!(held.resolved.command, VehicleCommand::Hold);
    assert!(held.resolved.reissue);

    rig.operator(OperatorCommand::release);
    let released = rig.step().await;
    assert_eq!(released.state, GateState::Automated);
    assert_eq!(released.resolved.source, CommandSource::Automated);
    assert_eq!(released.resolved.command, VehicleCommand::Arm);
    assert!(released.outcome.is_accepted());
    assert!(rig.link.sent_commands().contains(&LinkCommand::Arm));
}

#[tokio::test]
async fn test_operator_flight_through_the_gate() {
    let mut rig = Rig::new(&test_config());

    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Arm, now));
    assert!(rig.step().await.outcome.is_accepted());

    rig.operator(|now| OperatorCommand::assert(VehicleCommand::TakeOff { altitude_m: 15.0 }, now));
    assert!(rig.step().await.outcome.is_accepted());

    rig.operator(|now| {
        OperatorCommand::assert(
            VehicleCommand::GotoLocation {
                lat: 47.398,
                lon: 8.546,
                alt_m: 20.0,
            },
            now,
        )
    });
    assert!(rig.step().await.outcome.is_accepted());

    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Land, now));
    assert!(rig.step().await.outcome.is_accepted());

    assert_eq!(
        rig.link.sent_commands(),
        vec![
            LinkCommand::Arm,
            LinkCommand::Takeoff { altitude_m: 15.0 },
            LinkCommand::Goto {
                lat: 47.398,
                lon: 8.546,
                alt_m: 20.0
            },
            LinkCommand::Land,
        ]
    );
}

#[tokio::test]
async fn test_proposal_stays_in_effect_between_oracle_replies() {
    let mut config = test_config();
    config.oracle.interval_cycles = 5;
    let oracle = Arc::new(ScriptedOracle::always(r#"{"action": "arm", "reason": "prepare"}"#));
    let mut rig = Rig::with_oracle(&config, oracle.clone());

    let reports = rig.steps(8).await;
    assert_eq!(reports[0].resolved.command, VehicleCommand::Hold);
    for (i, report) in reports.iter().enumerate().skip(1) {
        assert_eq!(report.resolved.command, VehicleCommand::Arm, "cycle {}", i + 1);
        assert_eq!(report.resolved.source, CommandSource::Automated);
        assert_eq!(report.resolved.rationale, "prepare");
        assert!(report.outcome.is_accepted());
    }
    assert!(!reports[1].resolved.reissue);
    assert!(reports[2..6].iter().all(|r| r.resolved.reissue));

    // Requests at cycles 1 and 6 only
    assert_eq!(oracle.requests().len(), 2);
    assert_eq!(rig.link.sent_commands(), vec![LinkCommand::Hold, LinkCommand::Arm]);
}

#[tokio::test]
async fn test_slow_oracle_request_runs_to_completion() {
    let mut config = test_config();
    config.oracle.timeout_ms = 5_000;
    let oracle = Arc::new(
        ScriptedOracle::always(r#"{"action": "arm"}"#).with_delay(Duration::from_millis(300)),
    );
    let mut rig = Rig::with_oracle(&config, oracle.clone());

    // Cycles run without waiting on the oracle; the request outlives several of them
    for _ in 0..4 {
        rig.clock.advance_ms(100);
        rig.link.publish_telemetry();
        let report = rig.decision_loop.run_cycle().await.unwrap();
        assert_eq!(report.resolved.command, VehicleCommand::Hold);
        assert_eq!(report.state, GateState::Automated);
        tokio::task::yield_now().await;
    }
    assert_eq!(oracle.requests().len(), 1);
    assert!(rig.decision_loop.oracle_in_flight());
    assert_eq!(rig.decision_loop.arbiter().oracle_failures(), 0);

    rig.decision_loop.oracle_settled().await;
    let report = rig.step().await;
    assert_eq!(report.resolved.command, VehicleCommand::Arm);
    assert_eq!(rig.decision_loop.arbiter().oracle_failures(), 0);
}

#[tokio::test]
async fn test_oracle_waits_for_a_detection() {
    let mut config = test_config();
    config.oracle.require_trigger = true;
    let oracle = Arc::new(ScriptedOracle::always(r#"{"action": "arm", "reason": "person ahead"}"#));
    let mut rig = Rig::with_oracle(&config, oracle.clone());

    for report in rig.steps(3).await {
        assert_eq!(report.resolved.command, VehicleCommand::Hold);
        assert_eq!(report.resolved.rationale, "no active trigger");
    }
    assert!(oracle.requests().is_empty());

    rig.handles.perception.send_replace(vec![person("trk-1", rig.clock.now_ns())]);
    rig.step().await;
    assert_eq!(oracle.requests().len(), 1);

    let report = rig.step().await;
    assert_eq!(report.resolved.command, VehicleCommand::Arm);
    assert_eq!(report.resolved.rationale, "person ahead");
}

#[tokio::test]
async fn test_follow_keeps_oracle_engaged_without_detections() {
    let mut config = test_config();
    config.oracle.require_trigger = true;
    let oracle = Arc::new(ScriptedOracle::always(FOLLOW_REPLY));
    let mut rig = Rig::with_oracle(&config, oracle.clone());
    rig.handles.perception.send_replace(vec![person("trk-1", rig.clock.now_ns())]);

    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Arm, now));
    rig.step().await;
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::TakeOff { altitude_m: 12.0 }, now));
    rig.step().await;
    rig.operator(OperatorCommand::release);
    let report = rig.step().await;

    assert_eq!(report.resolved.source, CommandSource::Automated);
    assert!(report.outcome.is_accepted());
    assert!(rig.decision_loop.arbiter().is_following());
    assert_eq!(
        rig.link.sent_commands().last(),
        Some(&LinkCommand::Follow {
            target_id: "trk-1".to_string(),
            distance_m: 10.0,
            alt_m: 15.0,
        })
    );

    // The detection ages out; the follow alone keeps the queries going
    rig.clock.advance_ms(6_000);
    let before = oracle.requests().len();
    let reports = rig.steps(3).await;
    assert!(rig.decision_loop.current_snapshot().unwrap().observations.is_empty());
    assert_eq!(oracle.requests().len(), before + 3);
    assert!(reports
        .iter()
        .all(|r| matches!(r.resolved.command, VehicleCommand::FollowTarget { .. })));
}

#[tokio::test]
async fn test_proposed_land_hands_control_back() {
    let oracle = Arc::new(ScriptedOracle::always(r#"{"action": "land", "reason": "done"}"#));
    let mut rig = Rig::with_oracle(&test_config(), oracle.clone());

    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Arm, now));
    rig.step().await;
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::TakeOff { altitude_m: 12.0 }, now));
    rig.step().await;
    rig.operator(OperatorCommand::release);
    let landing = rig.step().await;
    assert_eq!(landing.resolved.command, VehicleCommand::Land);
    assert!(landing.outcome.is_accepted());
    assert!(rig.decision_loop.status().automation_paused);

    // The request launched with the landing cycle is the last one
    rig.step().await;
    let requests = oracle.requests().len();
    for report in rig.steps(3).await {
        assert_eq!(report.resolved.command, VehicleCommand::Land);
        assert!(report.resolved.reissue);
    }
    assert_eq!(oracle.requests().len(), requests);
    assert_eq!(
        rig.link.sent_commands().iter().filter(|c| **c == LinkCommand::Land).count(),
        1
    );

    rig.operator(OperatorCommand::release);
    rig.steps(2).await;
    assert!(!rig.decision_loop.status().automation_paused);
    assert!(oracle.requests().len() > requests);
}
