//! Cobolt lasers against the simulated head.

use scope_core::capabilities::{Device, LightSource, SoftwareTriggered, TriggerMode, TriggerType};
use scope_core::error::DeviceError;
use scope_driver_cobolt::{CoboltConfig, CoboltLaser, CoboltVariant, CurrentModel};
use scope_driver_mock::{CoboltHandle, CoboltModel, SimulatedPort, WireLog};
use std::time::Duration;

async fn laser(variant: CoboltVariant) -> (CoboltLaser, CoboltHandle, WireLog) {
    let model = CoboltModel::new("SN-7");
    let handle = model.handle();
    let (connection, log) = SimulatedPort::connection("cobolt", model, Duration::from_millis(100));
    let laser = CoboltLaser::with_connection(connection, &CoboltConfig::new("sim", variant))
        .await
        .unwrap();
    (laser, handle, log)
}

fn smc(power_mw: f64) -> String {
    format!("smc {:.4}", CurrentModel::default().current_ma(power_mw))
}

#[tokio::test]
async fn test_standard_initialisation() {
    let (laser, handle, log) = laser(CoboltVariant::Standard).await;
    assert_eq!(laser.serial_number(), "SN-7");
    assert_eq!(log.received(), vec!["sn?", "@cobas 0", "@cobasdr 0", "@cob1"]);

    let state = handle.snapshot();
    assert!(state.on);
    assert!(!state.autostart);
    assert!(!state.direct_control);
}

#[tokio::test]
async fn test_standard_half_power() {
    let (laser, _handle, log) = laser(CoboltVariant::Standard).await;
    log.clear();

    laser.set_power(0.5).await.unwrap();
    assert_eq!(log.received(), vec!["@cobasp 0.0600"]);
    assert_eq!(laser.power_setpoint(), 0.5);

    let power = laser.power().await.unwrap();
    assert!((power - 0.5).abs() < 1e-9, "read back {}", power);
}

#[tokio::test]
async fn test_power_out_of_range_sends_nothing() {
    let (laser, _handle, log) = laser(CoboltVariant::Standard).await;
    log.clear();

    assert!(laser.set_power(1.5).await.is_err());
    assert!(laser.set_power(-0.1).await.is_err());
    assert!(log.received().is_empty());
}

#[tokio::test]
async fn test_busy_reply_is_retried_once() {
    let (laser, handle, log) = laser(CoboltVariant::Standard).await;
    laser.set_power(0.25).await.unwrap();
    handle.inject_busy(1);
    log.clear();

    let power = laser.power().await.unwrap();
    assert!((power - 0.25).abs() < 1e-9);
    assert_eq!(log.count_received("pa?"), 2);
}

#[tokio::test]
async fn test_persistent_busy_gives_up() {
    let (laser, handle, log) = laser(CoboltVariant::Standard).await;
    handle.inject_busy(10);
    log.clear();

    assert!(laser.power().await.is_err());
    assert_eq!(log.count_received("pa?"), 3);
}

#[tokio::test]
async fn test_power_reads_zero_when_off() {
    let (laser, _handle, _log) = laser(CoboltVariant::Standard).await;
    laser.set_power(0.5).await.unwrap();
    assert!(laser.disable().await.unwrap());

    assert!(!laser.is_enabled().await.unwrap());
    assert_eq!(laser.power().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_refused_enable_reports_false() {
    let (laser, handle, log) = laser(CoboltVariant::Standard).await;
    assert!(laser.disable().await.unwrap());
    handle.set_refuse_enable(true);
    log.clear();

    assert!(!laser.enable().await.unwrap());
    assert_eq!(log.count_received("f?"), 1);
    assert!(!handle.snapshot().on);
}

#[tokio::test]
async fn test_refused_disable_reports_false() {
    let (laser, handle, log) = laser(CoboltVariant::Standard).await;
    handle.set_refuse_disable(true);
    log.clear();

    assert!(!laser.disable().await.unwrap());
    assert_eq!(log.count_received("l?"), 2);
    assert_eq!(log.count_received("f?"), 1);
    assert!(handle.snapshot().on);
    assert!(laser.is_enabled().await.unwrap());
}

#[tokio::test]
async fn test_status_lines() {
    let (laser, _handle, _log) = laser(CoboltVariant::Standard).await;
    let status = laser.status().await.unwrap();
    assert_eq!(status.len(), 5);
    assert_eq!(status[0], "Emission on? 1");
    assert_eq!(status[4], "Head operating hours: 1234.56");
}

#[tokio::test]
async fn test_dpl_initialisation() {
    let (laser, handle, log) = laser(CoboltVariant::Dpl06).await;
    assert_eq!(
        log.received(),
        vec![
            "sn?".to_string(),
            "@cobas 0".to_string(),
            "@cobasdr 1".to_string(),
            "slth 650.0000".to_string(),
            smc(0.0),
        ]
    );
    assert!(laser.is_standby());

    let state = handle.snapshot();
    assert!(state.direct_control);
    assert!(!state.on);
    assert_eq!(state.low_current_ma, 650.0);
}

#[tokio::test]
async fn test_dpl_power_goes_through_current() {
    let (laser, _handle, log) = laser(CoboltVariant::Dpl06).await;
    assert!(laser.enable().await.unwrap());
    log.clear();

    laser.set_power(0.5).await.unwrap();
    assert_eq!(log.received(), vec![smc(60.0)]);

    let power = laser.power().await.unwrap();
    assert!((power - 0.5).abs() < 1e-3, "read back {}", power);
    assert_eq!(laser.modulation_low_current().await.unwrap(), 650.0);
}

#[tokio::test]
async fn test_dpl_trigger_returns_to_standby() {
    let (laser, handle, log) = laser(CoboltVariant::Dpl06).await;
    laser.set_exposure(Duration::from_millis(30));
    log.clear();

    laser.trigger().await.unwrap();
    assert!(!laser.is_standby());
    assert_eq!(log.received(), vec![smc(100.0)]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(laser.is_standby());
    assert_eq!(log.received(), vec![smc(100.0), smc(0.12)]);

    let expected = CurrentModel::default().current_ma(0.12);
    assert!((handle.snapshot().modulation_current_ma - expected).abs() < 1e-3);
}

#[tokio::test]
async fn test_refused_current_keeps_standby() {
    let (laser, handle, log) = laser(CoboltVariant::Dpl06).await;
    assert!(laser.enable().await.unwrap());
    handle.set_refuse_current(true);
    log.clear();

    let err = laser.trigger().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeviceError>(),
        Some(DeviceError::Refused { .. })
    ));
    assert!(laser.is_standby());
    assert_eq!(log.received(), vec![smc(100.0)]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(log.received(), vec![smc(100.0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_lets_standby_on_the_wire_finish() {
    let model = CoboltModel::new("SN-7");
    let (connection, log) = SimulatedPort::connection_with_latency(
        "cobolt",
        model,
        Duration::from_millis(200),
        Duration::from_millis(40),
    );
    let laser = CoboltLaser::with_connection(
        connection,
        &CoboltConfig::new("sim", CoboltVariant::Dpl06),
    )
    .await
    .unwrap();
    laser.set_exposure(Duration::from_millis(10));
    laser.trigger().await.unwrap();
    log.clear();

    // The standby command goes out at 10 ms and is answered at 50 ms.
    tokio::time::sleep(Duration::from_millis(25)).await;
    laser.shutdown().await.unwrap();

    assert_eq!(
        log.received(),
        vec![smc(0.12), "l0".to_string(), "@cob0".to_string()]
    );
    assert!(laser.is_standby());
}

#[tokio::test]
async fn test_shutdown_cancels_pending_standby() {
    let (laser, _handle, log) = laser(CoboltVariant::Dpl06).await;
    laser.set_exposure(Duration::from_millis(50));
    laser.trigger().await.unwrap();
    log.clear();

    laser.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(log.received(), vec!["l0", "@cob0"]);
}

#[tokio::test]
async fn test_trigger_modes() {
    let (dpl, _handle, _log) = laser(CoboltVariant::Dpl06).await;
    assert_eq!(dpl.trigger_type(), TriggerType::Software);
    assert_eq!(dpl.trigger_mode(), TriggerMode::Once);
    dpl.set_trigger(TriggerType::Software, TriggerMode::Once)
        .await
        .unwrap();
    assert!(dpl
        .set_trigger(TriggerType::Hardware, TriggerMode::Once)
        .await
        .is_err());
    assert!(dpl
        .set_trigger(TriggerType::Software, TriggerMode::Strobe)
        .await
        .is_err());

    let (standard, _handle, _log) = laser(CoboltVariant::Standard).await;
    assert!(standard.set_standby(false).await.is_err());
}
