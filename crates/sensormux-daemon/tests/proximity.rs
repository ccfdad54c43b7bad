//! Proximity-active listener registration and ordered notification.

mod common;

use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use sensormux_core::SensorServiceError;
use sensormux_daemon::service::OperatingMode;
use sensormux_daemon::ProximityActiveListener;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<bool>>,
}

impl ProximityActiveListener for Recorder {
    fn on_proximity_active(&self, active: bool) {
        self.seen.lock().push(active);
    }
}

#[test]
fn listeners_observe_transitions_in_order() {
    let harness = Harness::new();
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn ProximityActiveListener> = recorder.clone();

    harness.service.add_proximity_active_listener(listener.clone()).expect("add");
    // A new listener is told the current state right away.
    assert!(wait_until(|| recorder.seen.lock().as_slice() == [false]));

    let (conn, _receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::PROX_WAKE, 0, 0).expect("enable prox");
    assert!(wait_until(|| recorder.seen.lock().as_slice() == [false, true]));

    conn.disable(handles::PROX_WAKE).expect("disable prox");
    assert!(wait_until(|| recorder.seen.lock().as_slice() == [false, true, false]));
}

#[test]
fn listener_registration_is_checked() {
    let harness = Harness::new();
    let listener: Arc<dyn ProximityActiveListener> = Arc::new(Recorder::default());

    harness.service.add_proximity_active_listener(listener.clone()).expect("add");
    assert_eq!(
        harness.service.add_proximity_active_listener(listener.clone()),
        Err(SensorServiceError::AlreadyExists)
    );
    harness.service.remove_proximity_active_listener(&listener).expect("remove");
    assert_eq!(
        harness.service.remove_proximity_active_listener(&listener),
        Err(SensorServiceError::NameNotFound)
    );
}
