//! Shared harness for the service integration tests: a scripted HAL,
//! recording collaborators, and descriptor helpers.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use sensormux_core::sensor::{ReportingMode, SensorDescriptor, SensorUuid};
use sensormux_core::types;
use sensormux_core::SensorEvent;
use sensormux_daemon::collaborators::{
    AllowAllAppOps, CallerIdentity, PackageManager, PermissionChecker, PrivacyListener,
    PrivacyManager, PrivacyToggle, LogOnlySchedulingPolicy, WakeLock,
};
use sensormux_daemon::connection::ClientEventReceiver;
use sensormux_daemon::hal::synthetic::SyntheticHal;
use sensormux_daemon::hal::{
    DirectFormat, DirectMemoryDescriptor, DirectMemoryKind, RateLevel, RuntimeSensorCallback,
};
use sensormux_daemon::service::{SensorService, ServiceConfig, ServiceDeps};

pub mod handles {
    pub const ACCEL: i32 = 1;
    pub const GYRO: i32 = 2;
    pub const MAG: i32 = 3;
    pub const LIGHT: i32 = 4;
    pub const PROX_WAKE: i32 = 5;
    pub const ONE_SHOT: i32 = 6;
    pub const DYNAMIC_META: i32 = 7;
    pub const STEP_COUNTER: i32 = 8;
    pub const HEAD_TRACKER: i32 = 9;
}

pub fn accel() -> SensorDescriptor {
    SensorDescriptor::new(handles::ACCEL, types::TYPE_ACCELEROMETER, "test-accel")
        .with_delays(10_000_000, 1_000_000_000)
        .with_uuid(SensorUuid([0xA1; 16]))
}

pub fn gyro() -> SensorDescriptor {
    SensorDescriptor::new(handles::GYRO, types::TYPE_GYROSCOPE, "test-gyro")
        .with_delays(2_500_000, 1_000_000_000)
        .with_uuid(SensorUuid([0xA2; 16]))
}

pub fn mag() -> SensorDescriptor {
    SensorDescriptor::new(handles::MAG, types::TYPE_MAGNETIC_FIELD, "test-mag")
        .with_delays(20_000_000, 1_000_000_000)
        .with_uuid(SensorUuid([0xA3; 16]))
}

pub fn light_on_change() -> SensorDescriptor {
    SensorDescriptor::new(handles::LIGHT, types::TYPE_LIGHT, "test-light")
        .with_reporting_mode(ReportingMode::OnChange)
        .with_uuid(SensorUuid([0xA4; 16]))
}

pub fn prox_wake() -> SensorDescriptor {
    SensorDescriptor::new(handles::PROX_WAKE, types::TYPE_PROXIMITY, "test-prox")
        .with_reporting_mode(ReportingMode::OnChange)
        .with_wake_up(true)
        .with_uuid(SensorUuid([0xA5; 16]))
}

pub fn one_shot() -> SensorDescriptor {
    SensorDescriptor::new(handles::ONE_SHOT, types::TYPE_STEP_DETECTOR, "test-one-shot")
        .with_reporting_mode(ReportingMode::OneShot)
        .with_uuid(SensorUuid([0xA6; 16]))
}

pub fn dynamic_meta_sensor() -> SensorDescriptor {
    SensorDescriptor::new(handles::DYNAMIC_META, types::TYPE_DYNAMIC_SENSOR_META, "dynamic-meta")
        .with_reporting_mode(ReportingMode::Special)
}

pub fn default_sensors() -> Vec<SensorDescriptor> {
    vec![accel(), light_on_change(), prox_wake(), one_shot(), dynamic_meta_sensor()]
}

pub fn app_caller() -> CallerIdentity {
    CallerIdentity::new(10_100, 4321, "com.example.app")
}

pub fn other_caller() -> CallerIdentity {
    CallerIdentity::new(10_200, 4322, "com.other")
}

#[derive(Default)]
pub struct RecordingWakeLock {
    pub acquires: Mutex<Vec<String>>,
    pub releases: Mutex<Vec<String>>,
    held: AtomicBool,
}

impl RecordingWakeLock {
    pub fn held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.lock().len()
    }
}

impl WakeLock for RecordingWakeLock {
    fn acquire(&self, name: &str) {
        self.acquires.lock().push(name.to_string());
        self.held.store(true, Ordering::SeqCst);
    }

    fn release(&self, name: &str) {
        self.releases.lock().push(name.to_string());
        self.held.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MapPackageManager {
    pub uids: Mutex<HashMap<String, u32>>,
    pub target_sdk: Mutex<HashMap<String, i32>>,
    pub debuggable: Mutex<HashSet<String>>,
    pub features: Mutex<HashSet<String>>,
}

impl PackageManager for MapPackageManager {
    fn get_package_uid(&self, package: &str, _user_id: i32) -> Option<u32> {
        self.uids.lock().get(package).copied()
    }

    fn get_target_sdk_version(&self, package: &str) -> Option<i32> {
        self.target_sdk.lock().get(package).copied()
    }

    fn has_system_feature(&self, feature: &str) -> bool {
        self.features.lock().contains(feature)
    }

    fn is_package_debuggable(&self, package: &str) -> bool {
        self.debuggable.lock().contains(package)
    }
}

/// Grants exactly the listed permissions (to every caller).
#[derive(Default)]
pub struct StaticPermissions {
    pub granted: Mutex<HashSet<String>>,
    pub grant_all: bool,
}

impl StaticPermissions {
    pub fn granting_all() -> Self {
        Self { granted: Mutex::new(HashSet::new()), grant_all: true }
    }

    pub fn granting(permissions: &[&str]) -> Self {
        Self {
            granted: Mutex::new(permissions.iter().map(ToString::to_string).collect()),
            grant_all: false,
        }
    }
}

impl PermissionChecker for StaticPermissions {
    fn check_permission(&self, permission: &str, _pid: i32, _uid: u32) -> bool {
        self.grant_all || self.granted.lock().contains(permission)
    }
}

/// Privacy manager whose toggles tests can flip; listeners are notified
/// synchronously, mirroring the platform callback.
#[derive(Default)]
pub struct TogglePrivacyManager {
    sensor: AtomicBool,
    mic: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn PrivacyListener>>>,
}

impl TogglePrivacyManager {
    pub fn set_sensor_privacy(&self, enabled: bool) {
        self.sensor.store(enabled, Ordering::SeqCst);
        for listener in self.listeners.lock().iter() {
            listener.on_privacy_changed(PrivacyToggle::AllSensors, enabled);
        }
    }

    pub fn set_mic_toggle(&self, enabled: bool) {
        self.mic.store(enabled, Ordering::SeqCst);
        for listener in self.listeners.lock().iter() {
            listener.on_privacy_changed(PrivacyToggle::Microphone, enabled);
        }
    }
}

impl PrivacyManager for TogglePrivacyManager {
    fn is_sensor_privacy_enabled(&self) -> bool {
        self.sensor.load(Ordering::SeqCst)
    }

    fn is_mic_toggle_enabled(&self) -> bool {
        self.mic.load(Ordering::SeqCst)
    }

    fn add_listener(&self, listener: Arc<dyn PrivacyListener>) {
        self.listeners.lock().push(listener);
    }
}

/// Runtime-sensor backend that records configuration traffic.
#[derive(Default)]
pub struct RecordingRuntimeCallback {
    pub configurations: Mutex<Vec<(i32, bool, i64, i64)>>,
    pub direct_created: Mutex<u32>,
    pub direct_configs: Mutex<Vec<(i32, i32, RateLevel)>>,
    pub direct_destroyed: Mutex<Vec<i32>>,
}

impl RuntimeSensorCallback for RecordingRuntimeCallback {
    fn on_configuration_changed(
        &self,
        handle: i32,
        enabled: bool,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
    ) -> Result<(), sensormux_core::SensorServiceError> {
        self.configurations.lock().push((handle, enabled, sampling_period_ns, max_batch_latency_ns));
        Ok(())
    }

    fn on_direct_channel_created(
        &self,
        _mem: &DirectMemoryDescriptor,
    ) -> Result<i32, sensormux_core::SensorServiceError> {
        let mut created = self.direct_created.lock();
        *created += 1;
        Ok(1000 + *created as i32)
    }

    fn on_direct_channel_configured(
        &self,
        channel: i32,
        sensor: i32,
        rate: RateLevel,
    ) -> Result<i32, sensormux_core::SensorServiceError> {
        self.direct_configs.lock().push((channel, sensor, rate));
        Ok(channel)
    }

    fn on_direct_channel_destroyed(&self, channel: i32) {
        self.direct_destroyed.lock().push(channel);
    }
}

pub struct Harness {
    pub hal: Arc<SyntheticHal>,
    pub service: Arc<SensorService>,
    pub wake_lock: Arc<RecordingWakeLock>,
    pub packages: Arc<MapPackageManager>,
    pub permissions: Arc<StaticPermissions>,
    pub privacy: Arc<TogglePrivacyManager>,
    _data_dir: TempDir,
}

pub struct HarnessBuilder {
    sensors: Vec<SensorDescriptor>,
    user_build: bool,
    automotive: bool,
    ack_timeout: Duration,
    permissions: Option<StaticPermissions>,
    packages: Option<MapPackageManager>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            sensors: default_sensors(),
            user_build: true,
            automotive: false,
            ack_timeout: Duration::from_secs(1),
            permissions: None,
            packages: None,
        }
    }

    pub fn sensors(mut self, sensors: Vec<SensorDescriptor>) -> Self {
        self.sensors = sensors;
        self
    }

    pub fn engineering_build(mut self) -> Self {
        self.user_build = false;
        self
    }

    pub fn automotive(mut self) -> Self {
        self.automotive = true;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn permissions(mut self, permissions: StaticPermissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn packages(mut self, packages: MapPackageManager) -> Self {
        self.packages = Some(packages);
        self
    }

    pub fn build(self) -> Harness {
        let data_dir = TempDir::new().expect("tempdir");
        let hal = Arc::new(SyntheticHal::new(self.sensors));
        let wake_lock = Arc::new(RecordingWakeLock::default());
        let packages = Arc::new(self.packages.unwrap_or_default());
        let permissions =
            Arc::new(self.permissions.unwrap_or_else(StaticPermissions::granting_all));
        let privacy = Arc::new(TogglePrivacyManager::default());

        let deps = ServiceDeps {
            hal: hal.clone(),
            wake_lock: wake_lock.clone(),
            package_manager: packages.clone(),
            permissions: permissions.clone(),
            app_ops: Arc::new(AllowAllAppOps),
            privacy: privacy.clone(),
            scheduling: Arc::new(LogOnlySchedulingPolicy),
        };
        let config = ServiceConfig {
            data_dir: data_dir.path().to_path_buf(),
            is_user_build: self.user_build,
            automotive: self.automotive,
            ack_timeout: self.ack_timeout,
            ..ServiceConfig::default()
        };
        let service = SensorService::start(deps, config).expect("service start");
        Harness {
            hal,
            service,
            wake_lock,
            packages,
            permissions,
            privacy,
            _data_dir: data_dir,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        HarnessBuilder::new().build()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.service.begin_shutdown();
        self.hal.close();
        self.service.join();
    }
}

pub fn ashmem_descriptor(size: usize) -> DirectMemoryDescriptor {
    let file = tempfile::tempfile().expect("tempfile");
    file.set_len(size as u64).expect("set_len");
    DirectMemoryDescriptor {
        kind: DirectMemoryKind::Ashmem(std::os::fd::OwnedFd::from(file)),
        format: DirectFormat::SensorsEvent,
        size,
    }
}

/// Receives `count` events, failing the test on a stall.
pub fn recv_events(receiver: &ClientEventReceiver, count: usize) -> Vec<SensorEvent> {
    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while events.len() < count && Instant::now() < deadline {
        if let Some(event) = receiver.recv_timeout(Duration::from_millis(200)) {
            events.push(event);
        }
    }
    assert_eq!(events.len(), count, "timed out waiting for events: got {events:?}");
    events
}

pub fn assert_no_event(receiver: &ClientEventReceiver, wait: Duration) {
    if let Some(event) = receiver.recv_timeout(wait) {
        panic!("unexpected event delivered: {event:?}");
    }
}

/// Polls until `cond` holds or the deadline passes.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
