//! Dispatch idempotence and audit chain tests

use crate::test_utils::{test_config, Rig, ScriptedOracle};
use pilotgate_c2_router::{
    AuditLog, CommandOutcome, CommandSource, LinkCommand, OperatorCommand, VehicleCommand,
};
use pilotgate_context::{MissionObjective, MissionStage, RawDetection};
use pilotgate_core::Clock;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_repeated_hold_is_sent_once() {
    let mut rig = Rig::new(&test_config());

    let reports = rig.steps(4).await;
    assert!(matches!(reports[0].outcome, CommandOutcome::Accepted { forwarded: true, .. }));
    for report in &reports[1..] {
        assert_eq!(report.outcome.class(), reports[0].outcome.class());
        assert!(matches!(
            report.outcome,
            CommandOutcome::Accepted {
                forwarded: false,
                attempts: 0,
                ..
            }
        ));
    }
    assert_eq!(rig.link.sent_commands(), vec![LinkCommand::Hold]);
}

#[tokio::test]
async fn test_held_land_is_not_resent_after_touchdown() {
    let mut rig = Rig::new(&test_config());
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Arm, now));
    rig.step().await;
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::TakeOff { altitude_m: 10.0 }, now));
    rig.step().await;
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Land, now));
    assert!(rig.step().await.outcome.is_accepted());

    // Vehicle is on the ground now; the re-issued Land is already in effect
    for report in rig.steps(3).await {
        assert!(report.resolved.reissue);
        assert!(matches!(report.outcome, CommandOutcome::Accepted { forwarded: false, .. }));
    }
    let lands = rig
        .link
        .sent_commands()
        .into_iter()
        .filter(|c| *c == LinkCommand::Land)
        .count();
    assert_eq!(lands, 1);
}

#[tokio::test]
async fn test_slow_link_times_out_and_retries() {
    let mut rig = Rig::new(&test_config());
    rig.link.set_ack_delay(Some(Duration::from_millis(300)));

    let report = rig.step().await;
    assert!(matches!(report.outcome, CommandOutcome::Failed { attempts: 3, .. }));
    assert_eq!(rig.decision_loop.arbiter().link_failures(), 1);

    rig.link.set_ack_delay(None);
    let report = rig.step().await;
    assert!(matches!(report.outcome, CommandOutcome::Accepted { forwarded: true, attempts: 1, .. }));
    assert_eq!(rig.decision_loop.arbiter().link_failures(), 0);
}

#[tokio::test]
async fn test_every_cycle_is_audited_in_order() {
    let oracle = Arc::new(ScriptedOracle::always(r#"{"action": "arm"}"#));
    let mut rig = Rig::build(&test_config(), |dl| {
        dl.with_oracle(oracle)
            .with_audit(AuditLog::open_in_memory().unwrap())
    });

    rig.step().await;
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Hold, now));
    rig.step().await;
    rig.operator(OperatorCommand::release);
    rig.step().await;

    let audit = rig.decision_loop.audit().unwrap();
    assert_eq!(audit.verify_chain().unwrap(), 3);

    let entries = audit.entries(1, 10).unwrap();
    let sources: Vec<CommandSource> = entries.iter().map(|e| e.resolved.source).collect();
    assert_eq!(
        sources,
        vec![CommandSource::Automated, CommandSource::Human, CommandSource::Automated]
    );
    assert_eq!(entries[2].resolved.command, VehicleCommand::Arm);
    assert_eq!(entries[1].prev_hash, entries[0].entry_hash);
    assert!(entries.iter().all(|e| e.outcome.seq() == e.resolved.seq));
}

#[tokio::test]
async fn test_snapshot_carries_detections_and_objective() {
    let oracle = Arc::new(ScriptedOracle::always(r#"{"action": "hold"}"#));
    let mut rig = Rig::with_oracle(&test_config(), oracle);
    rig.decision_loop
        .set_objective(MissionObjective::new("survey the north field", MissionStage::Surveillance));

    let detection = |id: &str, label: &str, confidence: f32, timestamp_ns: u64| RawDetection {
        id: Some(id.to_string()),
        label: label.to_string(),
        confidence,
        distance_m: Some(12.0),
        relative_position: Some("ahead_center".to_string()),
        offset_ned_m: None,
        timestamp_ns,
    };
    let now = rig.clock.now_ns();
    rig.handles.perception.send_replace(vec![
        detection("trk-1", "person", 0.9, now),
        detection("trk-2", "tree", 0.2, now),
    ]);

    rig.step().await;
    let snapshot = rig.decision_loop.current_snapshot().unwrap();
    assert_eq!(snapshot.observations.len(), 1);
    assert_eq!(snapshot.observations[0].detection_id.as_deref(), Some("trk-1"));
    assert_eq!(snapshot.objective.goal, "survey the north field");
}
