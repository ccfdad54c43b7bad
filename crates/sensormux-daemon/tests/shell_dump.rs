//! The shell command surface and the diagnostic dump.

mod common;

use common::*;
use sensormux_core::sensor::SensorDescriptor;
use sensormux_core::types;
use sensormux_core::SensorServiceError;
use sensormux_daemon::collaborators::CallerIdentity;
use sensormux_daemon::service::OperatingMode;
use sensormux_daemon::shell::shell_command;

fn head_tracker() -> SensorDescriptor {
    SensorDescriptor::new(handles::HEAD_TRACKER, types::TYPE_HEAD_TRACKER, "test-ht")
}

fn root_caller() -> CallerIdentity {
    CallerIdentity::new(0, 1, "root")
}

fn run_shell(harness: &Harness, args: &[&str]) -> (Result<(), SensorServiceError>, String, String) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
    let result = shell_command(&harness.service, &root_caller(), &args, &mut out, &mut err);
    (result, String::from_utf8_lossy(&out).into_owned(), String::from_utf8_lossy(&err).into_owned())
}

#[test]
fn shell_requires_the_management_permission() {
    let harness = HarnessBuilder::new().permissions(StaticPermissions::granting(&[])).build();
    let (result, _, _) = run_shell(&harness, &["get-uid-state", "com.example.app"]);
    assert_eq!(result, Err(SensorServiceError::PermissionDenied));
}

#[test]
fn uid_state_override_round_trip() {
    let packages = MapPackageManager::default();
    packages.uids.lock().insert("com.example.app".to_string(), 10_100);
    let harness = HarnessBuilder::new().packages(packages).build();

    let (result, out, _) = run_shell(&harness, &["get-uid-state", "com.example.app"]);
    result.expect("get");
    assert_eq!(out.trim(), "idle");

    let (result, _, _) = run_shell(&harness, &["set-uid-state", "com.example.app", "active"]);
    result.expect("set");
    let (_, out, _) = run_shell(&harness, &["get-uid-state", "com.example.app"]);
    assert_eq!(out.trim(), "active");

    let (result, _, _) = run_shell(&harness, &["reset-uid-state", "com.example.app"]);
    result.expect("reset");
    let (_, out, _) = run_shell(&harness, &["get-uid-state", "com.example.app"]);
    assert_eq!(out.trim(), "idle");
}

#[test]
fn uid_state_honors_the_user_flag() {
    let packages = MapPackageManager::default();
    packages.uids.lock().insert("com.example.app".to_string(), 10_100);
    let harness = HarnessBuilder::new().packages(packages).build();

    let (result, _, _) =
        run_shell(&harness, &["set-uid-state", "com.example.app", "active", "--user", "1"]);
    result.expect("set");
    assert!(harness.service.is_uid_active(110_100));
    assert!(!harness.service.is_uid_active(10_100));
}

#[test]
fn unknown_package_and_bad_arguments_fail() {
    let harness = Harness::new();
    let (result, _, err) = run_shell(&harness, &["get-uid-state", "com.missing"]);
    assert_eq!(result, Err(SensorServiceError::BadValue));
    assert!(err.contains("Unknown package"));

    let (result, _, err) = run_shell(&harness, &["set-uid-state", "com.example.app", "sideways"]);
    assert_eq!(result, Err(SensorServiceError::BadValue));
    assert!(err.contains("active or idle"));

    let (result, _, err) = run_shell(&harness, &["definitely-not-a-command"]);
    assert_eq!(result, Err(SensorServiceError::BadValue));
    assert!(err.contains("Sensor service commands"));
}

#[test]
fn help_prints_the_command_list() {
    let harness = Harness::new();
    let (result, out, _) = run_shell(&harness, &["help"]);
    result.expect("help");
    assert!(out.contains("set-uid-state"));
    assert!(out.contains("restrict-ht"));
}

#[test]
fn head_tracker_restriction_is_shell_toggled() {
    let mut sensors = default_sensors();
    sensors.push(head_tracker());
    let harness = HarnessBuilder::new().sensors(sensors).build();

    let (conn, _receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    assert_eq!(
        conn.enable(handles::HEAD_TRACKER, 0, 0),
        Err(SensorServiceError::PermissionDenied)
    );

    let (result, _, _) = run_shell(&harness, &["unrestrict-ht"]);
    result.expect("unrestrict");
    conn.enable(handles::HEAD_TRACKER, 0, 0).expect("enable after unrestrict");

    conn.disable(handles::HEAD_TRACKER).expect("disable");
    let (result, _, _) = run_shell(&harness, &["restrict-ht"]);
    result.expect("restrict");
    assert_eq!(
        conn.enable(handles::HEAD_TRACKER, 0, 0),
        Err(SensorServiceError::PermissionDenied)
    );
}

#[test]
fn dump_denies_callers_without_the_dump_permission() {
    let harness = HarnessBuilder::new().permissions(StaticPermissions::granting(&[])).build();
    let text = harness.service.dump(&app_caller(), &[]).expect("dump");
    assert!(text.contains("Permission Denial"));
}

#[test]
fn text_dump_lists_the_service_state() {
    let harness = Harness::new();
    let (conn, _receiver) = harness
        .service
        .create_event_connection(&app_caller(), OperatingMode::Normal)
        .expect("connection");
    conn.enable(handles::ACCEL, 20_000_000, 0).expect("enable");

    let text = harness.service.dump(&root_caller(), &[]).expect("dump");
    assert!(text.contains("Sensor List:"));
    assert!(text.contains("test-accel"));
    assert!(text.contains("WakeLock Status: not held"));
    assert!(text.contains("Mode: NORMAL"));
    assert!(text.contains("Sensor Privacy: disabled"));
    assert!(text.contains("1 open event connections"));
    assert!(text.contains("Previous Registrations:"));
    assert!(text.contains("com.example.app"), "registration ring names the package");
}

#[test]
fn proto_dump_is_machine_readable() {
    let harness = Harness::new();
    let raw = harness
        .service
        .dump(&root_caller(), &["--proto".to_string()])
        .expect("dump");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(value["operating_mode"], "NORMAL");
    assert!(value["sensors"].as_array().is_some_and(|sensors| !sensors.is_empty()));
}

#[test]
fn dump_arguments_drive_mode_transitions() {
    let harness = Harness::new();
    let text = harness
        .service
        .dump(&root_caller(), &["restrict".to_string(), "com.test".to_string()])
        .expect("dump");
    assert_eq!(harness.service.operating_mode(), OperatingMode::Restricted);
    assert!(text.contains("RESTRICTED : com.test"));

    let text = harness.service.dump(&root_caller(), &["enable".to_string()]).expect("dump");
    assert_eq!(harness.service.operating_mode(), OperatingMode::Normal);
    assert!(text.contains("Mode: NORMAL"));
}
