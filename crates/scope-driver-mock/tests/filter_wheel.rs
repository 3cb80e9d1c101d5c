//! Serial and stepper filter wheels against simulated hardware.

use scope_core::capabilities::FilterWheel;
use scope_core::error::DeviceError;
use scope_driver_mock::{Fw102cModel, MockStepper, SimulatedPort, WireEvent, WireLog};
use scope_driver_thorlabs::{FilterWheelConfig, StepperFilterWheel, ThorlabsFilterWheel, WheelModel};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(300);

async fn wheel(model: Fw102cModel, config: &FilterWheelConfig) -> (ThorlabsFilterWheel, WireLog) {
    let (connection, log) = SimulatedPort::connection("fw", model, TIMEOUT);
    let wheel = ThorlabsFilterWheel::with_connection(connection, config)
        .await
        .unwrap();
    (wheel, log)
}

#[tokio::test]
async fn test_angle_table_slot_three() {
    let mut config = FilterWheelConfig::new("sim");
    config.positions = Some(vec![0, 300, 240, 180, 120, 60]);
    let (wheel, log) = wheel(Fw102cModel::new(6).at(0), &config).await;

    wheel.set_position(3).await.unwrap();
    assert_eq!(wheel.position().await.unwrap(), 3);
    assert_eq!(log.received(), vec!["pcount?", "pos=180", "pos?"]);
}

#[tokio::test]
async fn test_every_slot_round_trips() {
    let (wheel, _log) = wheel(Fw102cModel::new(12), &FilterWheelConfig::new("sim")).await;
    assert_eq!(wheel.position_count(), 12);
    for slot in (0..12).rev() {
        wheel.set_position(slot).await.unwrap();
        assert_eq!(wheel.position().await.unwrap(), slot);
    }
}

#[tokio::test]
async fn test_unknown_device_position_is_an_error() {
    let mut config = FilterWheelConfig::new("sim");
    config.positions = Some(vec![0, 300, 240, 180, 120, 60]);
    let (wheel, _log) = wheel(Fw102cModel::new(6).at(17), &config).await;

    let err = wheel.current_slot().await.unwrap_err();
    assert!(matches!(err, DeviceError::UnknownPosition { .. }));
}

#[tokio::test]
async fn test_wrong_model_fails_initialisation() {
    let mut config = FilterWheelConfig::new("sim");
    config.model = Some(WheelModel::Fw102c);
    let (connection, _log) = SimulatedPort::connection("fw", Fw102cModel::new(12), TIMEOUT);

    let err = ThorlabsFilterWheel::with_connection(connection, &config)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DeviceError::Initialization(_)));
}

/// Checks that every command's echo (and value, for queries) was sent
/// before the next command arrived.
fn assert_no_interleaving(log: &WireLog) {
    let events: Vec<WireEvent> = log
        .events()
        .into_iter()
        .filter(|e| !matches!(e, WireEvent::Sent(chunk) if chunk == "> "))
        .collect();

    for (i, event) in events.iter().enumerate() {
        let WireEvent::Received(command) = event else {
            continue;
        };
        let expected_lines = if command.ends_with('?') { 2 } else { 1 };
        let answer: Vec<&WireEvent> = events[i + 1..]
            .iter()
            .take_while(|e| matches!(e, WireEvent::Sent(_)))
            .collect();
        assert!(
            answer.len() >= expected_lines,
            "{} answered by {:?}",
            command,
            answer
        );
        assert_eq!(answer[0], &WireEvent::Sent(format!("{}\r", command)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_never_interleave() {
    let (connection, log) = SimulatedPort::connection_with_latency(
        "fw",
        Fw102cModel::new(6),
        Duration::from_secs(1),
        Duration::from_millis(1),
    );
    let wheel = Arc::new(
        ThorlabsFilterWheel::with_connection(connection, &FilterWheelConfig::new("sim"))
            .await
            .unwrap(),
    );

    let mover = {
        let wheel = wheel.clone();
        tokio::spawn(async move {
            for i in 0..30 {
                wheel.set_position(i % 6).await.unwrap();
            }
        })
    };
    let reader = {
        let wheel = wheel.clone();
        tokio::spawn(async move {
            for _ in 0..30 {
                assert!(wheel.position().await.unwrap() < 6);
            }
        })
    };
    mover.await.unwrap();
    reader.await.unwrap();

    assert_eq!(log.count_received("pos?"), 30);
    assert_no_interleaving(&log);
}

#[tokio::test]
async fn test_stepper_wheel_round_trip() {
    let wheel = StepperFilterWheel::fw103m("fw103m", MockStepper::new())
        .await
        .unwrap();
    for slot in 0..6 {
        wheel.set_position(slot).await.unwrap();
        assert_eq!(wheel.position().await.unwrap(), slot);
    }
}
