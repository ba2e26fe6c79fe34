//! Speed scenario: 200 Hz plant, `speed` sampled at 100 Hz, `accel` held by a constant actuator.

use std::{thread, time::Duration};

use ncs_emulation::{
    config::PlantConfig,
    demo::speed::{speed_plant, ACCEL, DEFAULT_SPEED_LIMIT, SPEED},
    net::protocol::{Batch, BatchKind},
    plant::actuator::Delivery,
    utils::metrics::RecorderHandle,
    Value, ValueMap,
};

fn config(duration_secs: Option<f64>) -> PlantConfig {
    let mut config = PlantConfig {
        tick_rate_hz: 200,
        duration_secs,
        ..PlantConfig::default()
    };
    config.sensor_rates.insert(SPEED.into(), 100);
    config
}

fn accel(seq: u64, value: f64) -> Batch {
    let mut values = ValueMap::new();
    values.insert(ACCEL.into(), Value::Float(value));
    Batch::new(BatchKind::Actuation, seq, values)
}

fn speed_of(store: &ncs_emulation::VariableStore) -> f64 {
    store.get(SPEED).and_then(|v| v.as_f64()).unwrap()
}

#[test]
fn speed_stays_at_rest_without_commands() {
    let plant = speed_plant(&config(Some(1.0)), DEFAULT_SPEED_LIMIT, RecorderHandle::null()).unwrap();
    let store = plant.store().clone();

    let report = plant.run().unwrap();
    assert!(report.ticks >= 150 && report.ticks <= 200, "ticks={}", report.ticks);
    assert_eq!(speed_of(&store), 0.0);
}

#[test]
fn command_delivered_before_start_integrates_over_the_run() {
    let plant = speed_plant(&config(Some(1.0)), DEFAULT_SPEED_LIMIT, RecorderHandle::null()).unwrap();
    let store = plant.store().clone();
    let bank = plant.actuators();
    assert!(matches!(bank.deliver(&accel(1, 1.0)).unwrap(), Delivery::Accepted { applied: 1, .. }));

    let report = plant.run().unwrap();
    let speed = speed_of(&store);
    // The first tick advances with the initial accel of 0; the rest integrate the measured dt.
    assert!((speed - report.elapsed.as_secs_f64()).abs() < 0.02, "speed={} elapsed={:?}", speed, report.elapsed);
    assert!((speed - 1.0).abs() < 0.05, "speed={}", speed);
}

#[test]
fn speed_follows_a_command_sent_mid_run() {
    let plant = speed_plant(&config(None), DEFAULT_SPEED_LIMIT, RecorderHandle::null()).unwrap();
    let store = plant.store().clone();
    let handle = plant.spawn().unwrap();

    thread::sleep(Duration::from_secs(1));
    assert_eq!(speed_of(&store), 0.0);

    handle.actuators().deliver(&accel(1, 1.0)).unwrap();
    thread::sleep(Duration::from_secs(1));
    let report = handle.stop().unwrap();

    let speed = speed_of(&store);
    assert!((speed - 1.0).abs() < 0.1, "speed={}", speed);
    assert!(report.ticks >= 300, "ticks={}", report.ticks);
}
