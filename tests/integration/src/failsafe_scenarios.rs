//! Failsafe entry and recovery through the full decision loop

use crate::test_utils::{test_config, Rig, ScriptedOracle};
use pilotgate_c2_router::{
    CommandOutcome, CommandSource, FailsafeCause, GateState, LinkCommand, OperatorCommand,
    OracleError, VehicleCommand,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_five_oracle_timeouts_enter_failsafe_once() {
    // Replies take longer than the 50 ms oracle timeout
    let oracle = Arc::new(ScriptedOracle::always(r#"{"action": "hold"}"#).with_delay(Duration::from_millis(200)));
    let mut rig = Rig::with_oracle(&test_config(), oracle);

    // Cycle 1 launches the first request; cycles 2..=5 see timeouts 1..=4
    for report in rig.steps(5).await {
        assert_eq!(report.resolved.source, CommandSource::Automated);
        assert_eq!(report.state, GateState::Automated);
    }
    assert_eq!(rig.decision_loop.arbiter().oracle_failures(), 4);

    let entered = rig.step().await;
    assert_eq!(entered.state, GateState::Failsafe);
    assert_eq!(entered.resolved.source, CommandSource::Failsafe);
    assert_eq!(entered.resolved.command, VehicleCommand::Hold);

    for report in rig.steps(3).await {
        assert_eq!(report.resolved.source, CommandSource::Failsafe);
        assert_eq!(report.resolved.command, VehicleCommand::Hold);
    }
    let status = rig.decision_loop.status();
    assert_eq!(status.failsafe_cause, Some(FailsafeCause::OracleUnavailable));
    assert_eq!(status.counters.failsafe_entries, 1);
}

#[tokio::test]
async fn test_failsafe_ignores_operator_and_recovers_to_automated() {
    let failures = (0..5).map(|_| Err(OracleError::Timeout)).collect();
    let oracle = Arc::new(ScriptedOracle::scripted(
        failures,
        Ok(r#"{"action": "arm", "reason": "resume"}"#.to_string()),
    ));
    let mut rig = Rig::with_oracle(&test_config(), oracle);

    let reports = rig.steps(6).await;
    assert_eq!(reports[5].state, GateState::Failsafe);

    // Operator input is ignored while failsafe holds
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Disarm, now));
    let ignored = rig.step().await;
    assert_eq!(ignored.resolved.source, CommandSource::Failsafe);
    assert_eq!(rig.decision_loop.status().counters.operator_commands_ignored, 1);

    // Proposals arrive again: three healthy cycles in total clear failsafe
    let recovering = rig.steps(2).await;
    assert!(recovering.iter().all(|r| r.resolved.source == CommandSource::Failsafe));
    assert_eq!(recovering[1].state, GateState::Automated);

    let resumed = rig.step().await;
    assert_eq!(resumed.resolved.source, CommandSource::Automated);
    assert_eq!(resumed.resolved.command, VehicleCommand::Arm);
    assert!(resumed.outcome.is_accepted());
}

#[tokio::test]
async fn test_telemetry_loss_enters_failsafe_and_recovers() {
    let mut rig = Rig::new(&test_config());
    rig.step().await;

    rig.telemetry_enabled = false;
    rig.clock.advance_ms(2_500);
    let lost = rig.step().await;
    assert_eq!(lost.state, GateState::Failsafe);
    assert_eq!(lost.resolved.command, VehicleCommand::Hold);
    assert_eq!(
        rig.decision_loop.status().failsafe_cause,
        Some(FailsafeCause::TelemetryLost)
    );

    rig.telemetry_enabled = true;
    let reports = rig.steps(3).await;
    assert!(reports.iter().all(|r| r.resolved.source == CommandSource::Failsafe));
    assert_eq!(reports[2].state, GateState::Automated);
    assert_eq!(rig.step().await.resolved.source, CommandSource::Automated);
}

#[tokio::test]
async fn test_critical_battery_in_flight_forces_land() {
    let mut config = test_config();
    config.arbitration.failsafe_action = pilotgate_core::SafeAction::Hold;
    let mut rig = Rig::new(&config);

    rig.operator(|now| OperatorCommand::assert(VehicleCommand::Arm, now));
    rig.step().await;
    rig.operator(|now| OperatorCommand::assert(VehicleCommand::TakeOff { altitude_m: 12.0 }, now));
    assert!(rig.step().await.outcome.is_accepted());

    rig.link.set_battery_percent(15.0);
    let report = rig.step().await;
    assert_eq!(report.state, GateState::Failsafe);
    assert_eq!(report.resolved.command, VehicleCommand::Land);
    assert!(report.outcome.is_accepted());
    assert_eq!(
        rig.decision_loop.status().failsafe_cause,
        Some(FailsafeCause::CriticalBattery)
    );
    assert_eq!(rig.link.sent_commands().last(), Some(&LinkCommand::Land));
}

#[tokio::test]
async fn test_repeated_link_failures_enter_failsafe() {
    let mut rig = Rig::new(&test_config());
    rig.link.fail_next(u32::MAX);

    for report in rig.steps(3).await {
        assert_eq!(report.resolved.source, CommandSource::Automated);
        assert!(matches!(report.outcome, CommandOutcome::Failed { attempts: 3, .. }));
    }

    let report = rig.step().await;
    assert_eq!(report.state, GateState::Failsafe);
    assert_eq!(
        rig.decision_loop.status().failsafe_cause,
        Some(FailsafeCause::LinkFailures)
    );
}
