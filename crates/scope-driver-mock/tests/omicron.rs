//! Omicron LuxX lasers against the simulated controller, with ad-hoc frames.

use scope_core::capabilities::{Device, LightSource, SoftwareTriggered, TriggerMode, TriggerType};
use scope_core::error::DeviceError;
use scope_driver_mock::{OmicronHandle, OmicronModel, SimulatedPort, WireLog};
use scope_driver_omicron::{LatchedFailure, OmicronConfig, OmicronLaser, OperationMode, Status};
use std::time::Duration;

const RELEASES: OperationMode =
    OperationMode::BIAS_LEVEL_RELEASE.union(OperationMode::OPERATING_LEVEL_RELEASE);

fn started_mode() -> OperationMode {
    OperationMode::AUTO_POWERUP | OperationMode::USB_ADHOC_MODE | OperationMode::APC_MODE
}

async fn laser(model: OmicronModel) -> (OmicronLaser, OmicronHandle, WireLog) {
    let handle = model.handle();
    let (connection, log) = SimulatedPort::connection("omicron", model, Duration::from_millis(100));
    let laser = OmicronLaser::with_connection(connection, &OmicronConfig::new("sim"))
        .await
        .unwrap();
    (laser, handle, log)
}

#[tokio::test]
async fn test_initialisation_sequence() {
    let (laser, handle, log) = laser(OmicronModel::new(100.0)).await;
    assert_eq!(
        log.received(),
        vec!["?LOf|", "?GFw|", "?GSN|", "?GSI|", "?GMP|", "?GOM|", "?SOMa100|", "?MDP|"]
    );

    let info = laser.info();
    assert_eq!(info.model_code, "LuxX");
    assert_eq!(info.device_id, "488-100");
    assert_eq!(info.firmware, "3.1.7");
    assert_eq!(info.serial_number, "OM-MOCK-0042");
    assert_eq!(info.wavelength_nm, 488.0);
    assert_eq!(info.max_power_mw, 100.0);

    assert_eq!(handle.snapshot().mode, started_mode());
    assert_eq!(laser.cached_state().operation_mode, Some(started_mode()));
    assert!(!laser.is_enabled().await.unwrap());
}

#[tokio::test]
async fn test_power_is_applied_on_enable() {
    let (laser, handle, log) = laser(OmicronModel::new(100.0)).await;
    log.clear();

    laser.set_power(0.5).await.unwrap();
    assert!(log.received().is_empty());

    assert!(laser.enable().await.unwrap());
    assert_eq!(log.received(), vec!["?LOn|", "?SLP7ff|"]);
    assert_eq!(handle.snapshot().level, 0x7ff);
    assert_eq!(laser.level().await.unwrap(), 0x7ff);

    let power = laser.power().await.unwrap();
    assert!((power - 0.49988).abs() < 1e-9, "read back {}", power);
}

#[tokio::test]
async fn test_power_written_while_on() {
    let (laser, handle, log) = laser(OmicronModel::new(100.0)).await;
    assert!(laser.enable().await.unwrap());
    log.clear();

    laser.set_power(1.0).await.unwrap();
    assert_eq!(log.received(), vec!["?SLPfff|"]);
    assert_eq!(handle.snapshot().level, 0xfff);

    assert!(laser.disable().await.unwrap());
    assert!(!laser.is_enabled().await.unwrap());
    assert_eq!(laser.power().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_refused_enable_reports_false() {
    let (laser, handle, log) = laser(OmicronModel::new(100.0)).await;
    handle.set_refuse_on(true);
    log.clear();

    assert!(!laser.enable().await.unwrap());
    assert!(!laser.is_enabled().await.unwrap());
    assert_eq!(log.received(), vec!["?LOn|", "?GAS|", "?GLF|"]);
}

#[tokio::test]
async fn test_refused_disable_reports_false() {
    let (laser, handle, log) = laser(OmicronModel::new(100.0)).await;
    assert!(laser.enable().await.unwrap());
    handle.set_refuse_off(true);
    log.clear();

    assert!(!laser.disable().await.unwrap());
    assert_eq!(log.received(), vec!["?LOf|", "?GAS|"]);
    assert!(handle.snapshot().on);
    assert!(laser.is_enabled().await.unwrap());
}

#[tokio::test]
async fn test_refused_mode_keeps_trigger_and_standby() {
    let (laser, handle, _log) = laser(OmicronModel::new(100.0)).await;
    handle.set_refuse_mode(true);

    let err = laser
        .set_trigger(TriggerType::Hardware, TriggerMode::Once)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeviceError>(),
        Some(DeviceError::Refused { .. })
    ));
    assert_eq!(laser.trigger_type(), TriggerType::Software);

    assert!(laser.trigger().await.is_err());
    assert!(laser.is_standby());
    assert_eq!(handle.snapshot().mode, started_mode());
    assert_eq!(laser.cached_state().operation_mode, Some(started_mode()));
}

#[tokio::test]
async fn test_reset_clears_latched_failure() {
    let (laser, handle, _log) = laser(OmicronModel::new(100.0)).await;
    handle.set_failure(LatchedFailure::EXTERNAL_INTERLOCK);

    assert_eq!(
        laser.latched_failure().await.unwrap(),
        LatchedFailure::EXTERNAL_INTERLOCK
    );
    assert!(laser.status_register().await.unwrap().contains(Status::ERROR));
    assert!(!laser.enable().await.unwrap());

    laser.reset().await.unwrap();
    assert!(laser.latched_failure().await.unwrap().is_empty());
    assert!(laser.enable().await.unwrap());
}

#[tokio::test]
async fn test_queued_frame_updates_cache_only() {
    let (laser, handle, _log) = laser(OmicronModel::new(100.0)).await;
    handle.queue_frame("$TPP12.500");
    handle.queue_frame("$GOMa118");

    assert_eq!(laser.info().serial_number, "OM-MOCK-0042");
    let status = laser.status_register().await.unwrap();
    assert!(status.contains(Status::KEY_SWITCH));

    let state = laser.cached_state();
    assert_eq!(state.temporal_power_mw, Some(12.5));
    assert_eq!(state.operation_mode, Some(started_mode() | RELEASES));
    assert_eq!(state.status, Some(status));
    assert_eq!(state.frames.temporal_power, 1);
    assert_eq!(state.frames.operation_mode, 1);
}

#[tokio::test]
async fn test_random_frames_applied_exactly_once() {
    let (laser, _handle, log) = laser(OmicronModel::new(100.0).with_adhoc(0.4, Some(7))).await;
    laser.set_power(0.5).await.unwrap();
    assert!(laser.enable().await.unwrap());

    for _ in 0..40 {
        let power = laser.diode_power_mw().await.unwrap();
        assert!((power - 49.988).abs() < 1e-9, "synchronous read returned {}", power);
        laser.status_register().await.unwrap();
    }

    let frames = laser.cached_state().frames;
    assert!(frames.diode_power + frames.status + frames.temporal_power > 0);
    assert_eq!(frames.diode_power as usize, log.count_sent_prefix("$MDP"));
    assert_eq!(frames.status as usize, log.count_sent_prefix("$GAS"));
    assert_eq!(frames.temporal_power as usize, log.count_sent_prefix("$TPP"));
}

#[tokio::test]
async fn test_software_trigger_leaves_standby_for_one_exposure() {
    let (laser, handle, log) = laser(OmicronModel::new(100.0)).await;
    laser.set_exposure(Duration::from_millis(30));
    log.clear();

    laser.trigger().await.unwrap();
    assert!(!laser.is_standby());
    assert_eq!(handle.snapshot().mode, started_mode() | RELEASES);
    assert_eq!(log.received(), vec!["?GOM|", "?SOMa118|"]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(laser.is_standby());
    assert_eq!(handle.snapshot().mode, started_mode());
}

#[tokio::test]
async fn test_hardware_trigger_mode() {
    let (laser, handle, log) = laser(OmicronModel::new(100.0)).await;

    laser
        .set_trigger(TriggerType::Hardware, TriggerMode::Once)
        .await
        .unwrap();
    assert_eq!(laser.trigger_type(), TriggerType::Hardware);
    let mode = handle.snapshot().mode;
    assert!(mode.contains(RELEASES));
    assert!(!mode.contains(OperationMode::APC_MODE));

    log.clear();
    laser.trigger().await.unwrap();
    assert!(log.received().is_empty());

    assert!(laser
        .set_trigger(TriggerType::Software, TriggerMode::Bulb)
        .await
        .is_err());
    assert_eq!(laser.trigger_type(), TriggerType::Hardware);
}

#[tokio::test]
async fn test_shutdown_turns_emission_off() {
    let (laser, handle, _log) = laser(OmicronModel::new(100.0)).await;
    assert!(laser.enable().await.unwrap());
    laser.set_exposure(Duration::from_millis(50));
    laser.trigger().await.unwrap();

    laser.shutdown().await.unwrap();
    assert!(!handle.snapshot().on);
    assert!(!laser.is_enabled().await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!laser.is_standby());
}

#[tokio::test]
async fn test_status_lines() {
    let (laser, _handle, _log) = laser(OmicronModel::new(100.0)).await;
    let status = laser.status().await.unwrap();
    assert_eq!(status.len(), 4);
    assert!(status[0].starts_with("Status:"));
    assert_eq!(status[3], "Diode power: 0 mW");
}
