//! Flush pairing, on-change replay semantics, and one-shot auto-disable.

mod common;

use std::time::Duration;

use common::*;
use sensormux_core::types;
use sensormux_core::{SensorEvent, SensorServiceError};
use sensormux_daemon::service::OperatingMode;

fn light_event(ts_ms: i64, lux: f32) -> SensorEvent {
    SensorEvent::data(handles::LIGHT, types::TYPE_LIGHT, ts_ms * 1_000_000, &[lux])
}

#[test]
fn flush_completion_reaches_only_the_requester() {
    let harness = Harness::new();
    harness.hal.set_auto_flush_complete(false);

    let (conn_a, recv_a) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection a");
    let (conn_b, recv_b) = harness
        .service
        .create_event_connection(&other_caller(), OperatingMode::Normal)
        .expect("connection b");
    conn_a.enable(handles::ACCEL, 20_000_000, 0).expect("enable a");
    conn_b.enable(handles::ACCEL, 20_000_000, 0).expect("enable b");

    conn_a.flush().expect("flush");
    assert_eq!(harness.hal.flush_calls().iter().filter(|h| **h == handles::ACCEL).count(), 2,
        "one join flush for b, one explicit flush for a");

    // The driver completes the flushes in request order: b's join flush
    // first, then a's explicit one.
    harness.hal.push_event(SensorEvent::flush_complete(handles::ACCEL, 1));
    harness.hal.push_event(SensorEvent::flush_complete(handles::ACCEL, 2));

    let b_marker = recv_events(&recv_b, 1);
    assert!(b_marker[0].is_flush_complete());
    let a_marker = recv_events(&recv_a, 1);
    assert!(a_marker[0].is_flush_complete());
    assert_eq!(a_marker[0].source_handle(), handles::ACCEL);

    // Exactly one each.
    assert_no_event(&recv_a, Duration::from_millis(150));
    assert_no_event(&recv_b, Duration::from_millis(150));
}

#[test]
fn multiple_flushes_pair_fifo() {
    let harness = Harness::new();
    harness.hal.set_auto_flush_complete(false);

    let (conn, receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::ACCEL, 20_000_000, 0).expect("enable");

    conn.flush().expect("flush 1");
    conn.flush().expect("flush 2");
    harness.hal.push_events(vec![
        SensorEvent::flush_complete(handles::ACCEL, 1),
        SensorEvent::flush_complete(handles::ACCEL, 2),
    ]);

    let markers = recv_events(&receiver, 2);
    assert!(markers.iter().all(|m| m.is_flush_complete()));
    assert_no_event(&receiver, Duration::from_millis(150));
}

#[test]
fn flush_on_a_one_shot_sensor_is_rejected() {
    let harness = Harness::new();
    let (conn, _receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::ONE_SHOT, 0, 0).expect("enable");
    assert_eq!(conn.flush(), Err(SensorServiceError::InvalidOperation));
}

#[test]
fn on_change_replay_is_delivered_exactly_once() {
    let harness = Harness::new();
    let (conn_a, recv_a) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection a");
    conn_a.enable(handles::LIGHT, 0, 0).expect("enable a");
    harness.hal.push_event(light_event(10, 120.0));
    let _ = recv_events(&recv_a, 1);

    let (conn_b, recv_b) = harness
        .service
        .create_event_connection(&other_caller(), OperatingMode::Normal)
        .expect("connection b");
    conn_b.enable(handles::LIGHT, 0, 0).expect("enable b");

    let replayed = recv_events(&recv_b, 1);
    assert_eq!(replayed[0].values()[0], 120.0);

    // A fresh value afterwards, never a second replay.
    harness.hal.push_event(light_event(30, 250.0));
    let fresh = recv_events(&recv_b, 1);
    assert_eq!(fresh[0].values()[0], 250.0);
    assert_no_event(&recv_b, Duration::from_millis(150));
}

#[test]
fn record_teardown_marks_the_cached_value_stale() {
    let harness = Harness::new();
    let (conn_a, recv_a) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection a");
    conn_a.enable(handles::LIGHT, 0, 0).expect("enable a");
    harness.hal.push_event(light_event(10, 120.0));
    let _ = recv_events(&recv_a, 1);

    // Last subscriber leaves: the active record is destroyed.
    conn_a.disable(handles::LIGHT).expect("disable a");
    assert!(!harness.hal.activation(handles::LIGHT));

    let (conn_b, recv_b) = harness
        .service
        .create_event_connection(&other_caller(), OperatingMode::Normal)
        .expect("connection b");
    conn_b.enable(handles::LIGHT, 0, 0).expect("enable b");
    assert_no_event(&recv_b, Duration::from_millis(200));
}

#[test]
fn one_shot_subscription_auto_disables_after_delivery() {
    let harness = Harness::new();
    let (conn, receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::ONE_SHOT, 0, 0).expect("enable");
    assert!(harness.hal.activation(handles::ONE_SHOT));

    harness.hal.push_event(SensorEvent::data(
        handles::ONE_SHOT,
        types::TYPE_STEP_DETECTOR,
        1_000_000,
        &[1.0],
    ));
    let events = recv_events(&receiver, 1);
    assert_eq!(events[0].sensor, handles::ONE_SHOT);

    assert!(wait_until(|| !conn.has_sensor(handles::ONE_SHOT)));
    assert!(wait_until(|| !harness.hal.activation(handles::ONE_SHOT)));

    // A second trigger is not delivered.
    harness.hal.push_event(SensorEvent::data(
        handles::ONE_SHOT,
        types::TYPE_STEP_DETECTOR,
        2_000_000,
        &[1.0],
    ));
    assert_no_event(&receiver, Duration::from_millis(150));
}

#[test]
fn disable_without_subscription_reports_bad_value() {
    let harness = Harness::new();
    let (conn, _receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    assert_eq!(conn.disable(handles::ACCEL), Err(SensorServiceError::BadValue));
}
