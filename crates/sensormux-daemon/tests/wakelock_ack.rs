//! Wakelock arbitration around wake-up sensor events.

mod common;

use std::time::Duration;

use common::*;
use sensormux_core::event::FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK;
use sensormux_core::types;
use sensormux_core::SensorEvent;
use sensormux_daemon::service::OperatingMode;

fn prox_event(ts_ms: i64, distance: f32) -> SensorEvent {
    SensorEvent::data(handles::PROX_WAKE, types::TYPE_PROXIMITY, ts_ms * 1_000_000, &[distance])
}

#[test]
fn wake_event_holds_the_wakelock_until_acked() {
    let harness = Harness::new();
    let (conn, receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::PROX_WAKE, 0, 0).expect("enable");

    harness.hal.push_event(prox_event(30, 1.0));

    let events = recv_events(&receiver, 1);
    assert_ne!(events[0].flags & FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK, 0);
    assert!(harness.service.is_wake_lock_held(), "held until the client acknowledges");
    assert!(conn.needs_wake_lock());
    assert_eq!(harness.hal.wake_lock_handled_total(), 1);

    conn.ack_wake_up_events(1);
    assert!(wait_until(|| !harness.service.is_wake_lock_held()));
    assert!(!conn.needs_wake_lock());
    assert_eq!(harness.wake_lock.acquire_count(), 1);
}

#[test]
fn unacknowledged_wake_events_time_out_and_release() {
    let harness = HarnessBuilder::new().ack_timeout(Duration::from_millis(150)).build();
    let (conn, receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::PROX_WAKE, 0, 0).expect("enable");

    harness.hal.push_event(prox_event(30, 1.0));
    let _ = recv_events(&receiver, 1);
    assert!(harness.service.is_wake_lock_held());

    // No ack: the receiver's deadline force-resets every refcount.
    assert!(wait_until(|| !harness.service.is_wake_lock_held()));
    assert!(!conn.needs_wake_lock());
}

#[test]
fn non_wake_events_do_not_touch_the_wakelock() {
    let harness = Harness::new();
    let (conn, receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::ACCEL, 20_000_000, 0).expect("enable");

    harness.hal.push_event(SensorEvent::data(
        handles::ACCEL,
        types::TYPE_ACCELEROMETER,
        1_000_000,
        &[0.0, 0.0, 9.8],
    ));
    let events = recv_events(&receiver, 1);
    assert_eq!(events[0].flags & FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK, 0);
    assert_eq!(harness.wake_lock.acquire_count(), 0);
}

#[test]
fn on_change_replay_of_a_wake_sensor_charges_the_new_subscriber() {
    let harness = Harness::new();
    let (conn_a, recv_a) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection a");
    conn_a.enable(handles::PROX_WAKE, 0, 0).expect("enable a");
    harness.hal.push_event(prox_event(10, 5.0));
    let _ = recv_events(&recv_a, 1);
    conn_a.ack_wake_up_events(1);
    assert!(wait_until(|| !harness.service.is_wake_lock_held()));

    // B joins while the record is live: the cached value is replayed and
    // must be acknowledged like any other wake event.
    let (conn_b, recv_b) = harness
        .service
        .create_event_connection(&other_caller(), OperatingMode::Normal)
        .expect("connection b");
    conn_b.enable(handles::PROX_WAKE, 0, 0).expect("enable b");

    let replayed = recv_events(&recv_b, 1);
    assert_eq!(replayed[0].sensor, handles::PROX_WAKE);
    assert_eq!(replayed[0].values()[0], 5.0);
    assert_ne!(replayed[0].flags & FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK, 0);
    assert!(harness.service.is_wake_lock_held());

    conn_b.ack_wake_up_events(1);
    assert!(wait_until(|| !harness.service.is_wake_lock_held()));
}
