//! Dynamic sensor lifecycle, HAL reconnection, and anonymized identity.

mod common;

use common::*;
use sensormux_core::event::EventPayload;
use sensormux_core::sensor::{ReportingMode, SensorDescriptor, SensorUuid};
use sensormux_core::types;
use sensormux_core::SensorEvent;
use sensormux_daemon::collaborators::CallerIdentity;
use sensormux_daemon::service::OperatingMode;

const DYNAMIC_HANDLE: i32 = 0x4000_0001;
const DYNAMIC_UUID: SensorUuid = SensorUuid([0xD7; 16]);

fn dynamic_descriptor() -> SensorDescriptor {
    SensorDescriptor::new(DYNAMIC_HANDLE, types::TYPE_LIGHT, "external-light")
        .with_reporting_mode(ReportingMode::OnChange)
        .with_uuid(DYNAMIC_UUID)
}

fn connect_event() -> SensorEvent {
    SensorEvent::dynamic_sensor_meta(
        handles::DYNAMIC_META,
        1_000_000,
        true,
        DYNAMIC_HANDLE,
        DYNAMIC_UUID,
        Some(Box::new(dynamic_descriptor())),
    )
}

fn disconnect_event() -> SensorEvent {
    SensorEvent::dynamic_sensor_meta(
        handles::DYNAMIC_META,
        2_000_000,
        false,
        DYNAMIC_HANDLE,
        DYNAMIC_UUID,
        None,
    )
}

#[test]
fn dynamic_sensor_registers_and_deregisters() {
    let harness = Harness::new();
    let system = CallerIdentity::system();

    harness.hal.push_event(connect_event());
    assert!(wait_until(|| {
        harness.service.dynamic_sensor_list(&system).iter().any(|s| s.handle == DYNAMIC_HANDLE)
    }));
    assert_eq!(harness.hal.dynamic_connection_calls(), vec![(DYNAMIC_HANDLE, true)]);

    let listed = harness.service.dynamic_sensor_list(&system);
    let dynamic = listed.iter().find(|s| s.handle == DYNAMIC_HANDLE).expect("listed");
    assert!(dynamic.is_dynamic);

    let (conn, receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(DYNAMIC_HANDLE, 0, 0).expect("enable dynamic");
    harness.hal.push_event(SensorEvent::data(
        DYNAMIC_HANDLE,
        types::TYPE_LIGHT,
        3_000_000,
        &[17.0],
    ));
    let events = recv_events(&receiver, 1);
    assert_eq!(events[0].values()[0], 17.0);

    harness.hal.push_event(disconnect_event());
    assert!(wait_until(|| !conn.has_sensor(DYNAMIC_HANDLE)));
    assert!(wait_until(|| harness.service.dynamic_sensor_list(&system).is_empty()));
    assert_eq!(
        harness.hal.dynamic_connection_calls(),
        vec![(DYNAMIC_HANDLE, true), (DYNAMIC_HANDLE, false)]
    );
}

#[test]
fn dynamic_handles_are_never_reused() {
    let harness = Harness::new();
    let system = CallerIdentity::system();

    harness.hal.push_event(connect_event());
    assert!(wait_until(|| {
        harness.service.dynamic_sensor_list(&system).iter().any(|s| s.handle == DYNAMIC_HANDLE)
    }));
    harness.hal.push_event(disconnect_event());
    assert!(wait_until(|| harness.service.dynamic_sensor_list(&system).is_empty()));

    // A second announcement with the retired handle is refused. A trailing
    // accel delivery acts as the barrier proving the batch was processed.
    let (conn, receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::ACCEL, 20_000_000, 0).expect("enable accel");
    harness.hal.push_event(connect_event());
    harness.hal.push_event(SensorEvent::data(
        handles::ACCEL,
        types::TYPE_ACCELEROMETER,
        9_000_000,
        &[0.0, 0.0, 9.8],
    ));
    let _ = recv_events(&receiver, 1);
    assert!(harness.service.dynamic_sensor_list(&system).is_empty());
    assert_eq!(
        harness.hal.dynamic_connection_calls(),
        vec![(DYNAMIC_HANDLE, true), (DYNAMIC_HANDLE, false)]
    );
}

#[test]
fn hal_reconnection_announces_clean_disconnects() {
    let harness = Harness::new();
    let system = CallerIdentity::system();

    harness.hal.push_event(connect_event());
    assert!(wait_until(|| {
        harness.service.dynamic_sensor_list(&system).iter().any(|s| s.handle == DYNAMIC_HANDLE)
    }));
    harness.hal.set_dynamic_handles(vec![DYNAMIC_HANDLE]);

    let (conn, receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(DYNAMIC_HANDLE, 0, 0).expect("enable dynamic");

    harness.hal.make_dead(true);

    // Every connection is told about the disconnect, subscription or not.
    let events = recv_events(&receiver, 1);
    match &events[0].payload {
        EventPayload::DynamicSensorMeta { connected, handle, .. } => {
            assert!(!connected);
            assert_eq!(*handle, DYNAMIC_HANDLE);
        }
        other => panic!("expected a dynamic-sensor disconnect, got {other:?}"),
    }
    assert!(wait_until(|| harness.hal.reconnect_calls() == 1));
    assert!(harness.service.dynamic_sensor_list(&system).is_empty());
    assert!(!conn.has_sensor(DYNAMIC_HANDLE));

    // The stream keeps flowing after the reconnect.
    conn.enable(handles::ACCEL, 20_000_000, 0).expect("enable accel");
    harness.hal.push_event(SensorEvent::data(
        handles::ACCEL,
        types::TYPE_ACCELEROMETER,
        5_000_000,
        &[0.0, 0.0, 9.8],
    ));
    let after = recv_events(&receiver, 1);
    assert_eq!(after[0].sensor, handles::ACCEL);
}

#[test]
fn listings_anonymize_uuids_and_derive_stable_ids() {
    let harness = Harness::new();
    let caller = app_caller();

    let first = harness.service.sensor_list(&caller);
    let accel_entry = first.iter().find(|s| s.handle == handles::ACCEL).expect("accel listed");
    assert!(accel_entry.uuid.is_zero(), "apps never see the raw uuid");
    assert_ne!(accel_entry.id, 0);
    assert_ne!(accel_entry.id, -1);

    let second = harness.service.sensor_list(&caller);
    let again = second.iter().find(|s| s.handle == handles::ACCEL).expect("accel listed");
    assert_eq!(accel_entry.id, again.id, "ids are stable for one app");

    let other = harness.service.sensor_list(&other_caller());
    let other_entry = other.iter().find(|s| s.handle == handles::ACCEL).expect("accel listed");
    assert_ne!(accel_entry.id, other_entry.id, "ids differ across apps");

    let system = harness.service.sensor_list(&CallerIdentity::system());
    let system_entry = system.iter().find(|s| s.handle == handles::ACCEL).expect("accel listed");
    assert_eq!(system_entry.uuid, SensorUuid([0xA1; 16]), "system sees the raw uuid");
}
