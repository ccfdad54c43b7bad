// Copyright (c) 2025 the sensormux contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! The sensor multiplexing service.
//!
//! One coarse lock guards the registry, the active-sensor records, the
//! operating mode and the connection holder. The dispatch, runtime-sensor
//! and ack-receiver threads are spawned at start; fanout to clients always
//! runs on a snapshot taken under the lock, never with the lock held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use sensormux_core::error::fatal;
use sensormux_core::event::{self, AdditionalInfoValues, EventPayload, SensorEvent,
    FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK, WIRE_EVENT_SIZE};
use sensormux_core::fusion::{plan_virtual_sensors, FusionState, SensorInventory, VirtualSensorKind};
use sensormux_core::identity::IdentityKey;
use sensormux_core::recent::RecentEventLog;
use sensormux_core::registry::SensorRegistry;
use sensormux_core::ring::{RegistrationRecord, RegistrationRing, DEFAULT_RING_CAPACITY};
use sensormux_core::sensor::{ReportingMode, SensorDescriptor, SensorUuid};
use sensormux_core::types::{self, SensorHandle};
use sensormux_core::{SensorResult, SensorServiceError};

use crate::collaborators::{
    AppOpsChecker, CallerIdentity, PackageManager, PermissionChecker, PrivacyListener,
    PrivacyManager, PrivacyToggle, SchedulingPolicy, UidState, WakeLock, AllowAllAppOps,
    DisabledPrivacyManager, EmptyPackageManager, LogOnlySchedulingPolicy, NoopWakeLock,
    PermitAllPermissions, PERMISSION_DUMP, PERMISSION_LOCATION_HARDWARE,
};
use crate::connection::{ClientEventReceiver, SensorEventConnection};
use crate::direct::SensorDirectConnection;
use crate::dispatch;
use crate::dump::DumpSnapshot;
use crate::hal::{
    DirectFormat, DirectMemoryDescriptor, HalError, HalMode, RateLevel, RuntimeSensorCallback,
    SensorHal,
};
use crate::holder::{ConnectionHolder, ConnectionId};
use crate::notifier::{ProximityActiveListener, ProximityNotifier};
use crate::policy::PolicyEngine;

pub const WAKE_LOCK_NAME: &str = "SensorService_wakelock";

/// Largest batch one dispatch cycle can carry, fanout expansion included.
pub(crate) const MAX_RECEIVE_BUFFER_EVENT_COUNT: usize = 256;

const SOCKET_BUFFER_SIZE_NON_BATCHED: usize = 4 * 1024;
const MAX_SOCKET_BUFFER_SIZE_BATCHED: usize = 100 * 1024;

pub(crate) fn monotonic_now_ns() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos().min(i64::MAX as u128) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Normal,
    Restricted,
    DataInjection,
    ReplayDataInjection,
    HalBypassReplayInjection,
}

impl OperatingMode {
    pub fn is_injection(self) -> bool {
        matches!(
            self,
            Self::DataInjection | Self::ReplayDataInjection | Self::HalBypassReplayInjection
        )
    }

    /// Mode names accepted by the dump argument surface.
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "enable" => Some(Self::Normal),
            "restrict" => Some(Self::Restricted),
            "data_injection" => Some(Self::DataInjection),
            "replay_data_injection" => Some(Self::ReplayDataInjection),
            "hal_bypass_replay_data_injection" => Some(Self::HalBypassReplayInjection),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Restricted => "RESTRICTED",
            Self::DataInjection => "DATA_INJECTION",
            Self::ReplayDataInjection => "REPLAY_DATA_INJECTION",
            Self::HalBypassReplayInjection => "HAL_BYPASS_REPLAY_DATA_INJECTION",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding the persisted hmac key.
    pub data_dir: PathBuf,
    /// Replay-style injection modes are refused on user builds.
    pub is_user_build: bool,
    /// Expose debug sensors in the default listing.
    pub expose_debug_sensors: bool,
    /// Automotive products also synthesize the limited-axes IMU family.
    pub automotive: bool,
    /// Wake-event acknowledgement deadline before refcounts are reset.
    pub ack_timeout: Duration,
    pub registration_ring_capacity: usize,
    /// Overrides the computed per-client buffer budget.
    pub socket_buffer_bytes: Option<usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/sensormux"),
            is_user_build: true,
            expose_debug_sensors: false,
            automotive: false,
            ack_timeout: Duration::from_secs(5),
            registration_ring_capacity: DEFAULT_RING_CAPACITY,
            socket_buffer_bytes: None,
        }
    }
}

/// The platform collaborators the service is wired with.
pub struct ServiceDeps {
    pub hal: Arc<dyn SensorHal>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub package_manager: Arc<dyn PackageManager>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub app_ops: Arc<dyn AppOpsChecker>,
    pub privacy: Arc<dyn PrivacyManager>,
    pub scheduling: Arc<dyn SchedulingPolicy>,
}

impl ServiceDeps {
    /// Permissive wiring for development images and tests.
    pub fn development(hal: Arc<dyn SensorHal>) -> Self {
        Self {
            hal,
            wake_lock: Arc::new(NoopWakeLock),
            package_manager: Arc::new(EmptyPackageManager),
            permissions: Arc::new(PermitAllPermissions),
            app_ops: Arc::new(AllowAllAppOps),
            privacy: Arc::new(DisabledPrivacyManager),
            scheduling: Arc::new(LogOnlySchedulingPolicy),
        }
    }
}

struct ActiveSensorRecord {
    connections: Vec<ConnectionId>,
    pending_flushes: VecDeque<ConnectionId>,
}

impl ActiveSensorRecord {
    fn new(first: ConnectionId) -> Self {
        Self { connections: vec![first], pending_flushes: VecDeque::new() }
    }

    /// True when the connection was not yet an owner.
    fn add_connection(&mut self, id: ConnectionId) -> bool {
        if self.connections.contains(&id) {
            return false;
        }
        self.connections.push(id);
        true
    }

    /// Removes an owner (and its queued flush responses); true when the
    /// record is now empty and must be destroyed.
    fn remove_connection(&mut self, id: ConnectionId) -> bool {
        self.connections.retain(|c| *c != id);
        self.pending_flushes.retain(|c| *c != id);
        self.connections.is_empty()
    }

    fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn push_pending_flush(&mut self, id: ConnectionId) {
        self.pending_flushes.push_back(id);
    }

    fn pop_pending_flush(&mut self) -> Option<ConnectionId> {
        self.pending_flushes.pop_front()
    }
}

enum Backend {
    Hardware,
    Runtime { callback: Arc<dyn RuntimeSensorCallback> },
    Virtual(VirtualSensorKind),
}

struct ServiceState {
    registry: SensorRegistry,
    virtual_kinds: HashMap<SensorHandle, VirtualSensorKind>,
    fusion: FusionState,
    fusion_base_handles: HashMap<i32, SensorHandle>,
    fusion_base_refcounts: HashMap<i32, u32>,
    recent: RecentEventLog,
    active_sensors: HashMap<SensorHandle, ActiveSensorRecord>,
    active_virtual_sensors: HashSet<SensorHandle>,
    holder: ConnectionHolder,
    ring: RegistrationRing,
    operating_mode: OperatingMode,
    allow_listed_package: String,
    runtime_callbacks: HashMap<i32, Arc<dyn RuntimeSensorCallback>>,
    next_runtime_handle: SensorHandle,
    next_connection_id: ConnectionId,
    dynamic_meta_handle: Option<SensorHandle>,
    prox_sensor_handles: Vec<SensorHandle>,
    proximity_listeners: Vec<Arc<dyn ProximityActiveListener>>,
    last_reported_prox_active: bool,
    wake_lock_acquired: bool,
    socket_buffer_bytes: usize,
    runtime_thread_started: bool,
}

pub struct SensorService {
    hal: Arc<dyn SensorHal>,
    wake_lock: Arc<dyn WakeLock>,
    app_ops: Arc<dyn AppOpsChecker>,
    scheduling: Arc<dyn SchedulingPolicy>,
    pub(crate) policy: PolicyEngine,
    identity: IdentityKey,
    config: ServiceConfig,
    state: Mutex<ServiceState>,
    ack_gate: Mutex<()>,
    ack_cv: Condvar,
    runtime_queue: Mutex<VecDeque<SensorEvent>>,
    runtime_cv: Condvar,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    notifier: Mutex<ProximityNotifier>,
    weak_self: Weak<SensorService>,
}

struct ServiceAsPrivacyListener {
    service: Weak<SensorService>,
}

impl PrivacyListener for ServiceAsPrivacyListener {
    fn on_privacy_changed(&self, toggle: PrivacyToggle, enabled: bool) {
        let Some(service) = self.service.upgrade() else { return };
        match toggle {
            PrivacyToggle::AllSensors => service.on_sensor_privacy_changed(enabled),
            PrivacyToggle::Microphone => service.on_mic_privacy_changed(enabled),
        }
    }
}

impl SensorService {
    /// Builds the catalog from the HAL, synthesizes the missing virtual
    /// sensors, and spawns the dispatch and ack threads.
    pub fn start(deps: ServiceDeps, config: ServiceConfig) -> SensorResult<Arc<Self>> {
        let identity = IdentityKey::initialize(&config.data_dir);
        deps.hal.init_check().map_err(|_| SensorServiceError::NoInit)?;

        let hal_sensors = deps.hal.sensor_list();
        if hal_sensors.is_empty() {
            tracing::error!("hal reported no sensors");
            return Err(SensorServiceError::NoInit);
        }

        let automotive = config.automotive
            || deps.package_manager.has_system_feature(crate::collaborators::FEATURE_AUTOMOTIVE);

        let mut registry = SensorRegistry::new();
        let mut inventory = SensorInventory::default();
        let mut dynamic_meta_handle = None;
        let mut prox_sensor_handles = Vec::new();
        let mut fusion_base_handles: HashMap<i32, SensorHandle> = HashMap::new();
        let mut batching_supported = false;

        for descriptor in hal_sensors {
            inventory.observe(descriptor.sensor_type);
            if descriptor.sensor_type == types::TYPE_DYNAMIC_SENSOR_META {
                dynamic_meta_handle = Some(descriptor.handle);
            }
            if descriptor.sensor_type == types::TYPE_PROXIMITY {
                prox_sensor_handles.push(descriptor.handle);
            }
            if descriptor.fifo_max_event_count > 0 {
                batching_supported = true;
            }
            fusion_base_handles.entry(descriptor.sensor_type).or_insert(descriptor.handle);
            let handle = descriptor.handle;
            if !registry.add(descriptor, false, false, types::DEFAULT_DEVICE_ID) {
                tracing::warn!(handle, "duplicate hal sensor handle, skipping");
            }
        }

        let mut virtual_kinds = HashMap::new();
        let mut next_virtual = types::VIRTUAL_SENSOR_HANDLE_BASE;
        for planned in plan_virtual_sensors(&inventory, automotive) {
            while !registry.is_new_handle(next_virtual) {
                next_virtual += 1;
            }
            let descriptor = virtual_descriptor(planned.kind, next_virtual);
            if registry.add(descriptor, planned.is_debug, true, types::DEFAULT_DEVICE_ID) {
                virtual_kinds.insert(next_virtual, planned.kind);
            }
            next_virtual += 1;
        }

        let socket_buffer_bytes = config.socket_buffer_bytes.unwrap_or_else(|| {
            let wanted = if batching_supported {
                MAX_SOCKET_BUFFER_SIZE_BATCHED
            } else {
                SOCKET_BUFFER_SIZE_NON_BATCHED
            };
            wanted.min(system_max_socket_buffer().unwrap_or(wanted))
        });

        let state = ServiceState {
            registry,
            virtual_kinds,
            fusion: FusionState::new(),
            fusion_base_handles,
            fusion_base_refcounts: HashMap::new(),
            recent: RecentEventLog::new(),
            active_sensors: HashMap::new(),
            active_virtual_sensors: HashSet::new(),
            holder: ConnectionHolder::default(),
            ring: RegistrationRing::new(config.registration_ring_capacity),
            operating_mode: OperatingMode::Normal,
            allow_listed_package: String::new(),
            runtime_callbacks: HashMap::new(),
            next_runtime_handle: types::RUNTIME_SENSOR_HANDLE_BASE,
            next_connection_id: 1,
            dynamic_meta_handle,
            prox_sensor_handles,
            proximity_listeners: Vec::new(),
            last_reported_prox_active: false,
            wake_lock_acquired: false,
            socket_buffer_bytes,
            runtime_thread_started: false,
        };

        let policy = PolicyEngine::new(
            Arc::clone(&deps.package_manager),
            Arc::clone(&deps.permissions),
            Arc::clone(&deps.app_ops),
        );
        policy.set_sensor_privacy(deps.privacy.is_sensor_privacy_enabled());
        policy.set_mic_toggle(deps.privacy.is_mic_toggle_enabled());

        let service = Arc::new_cyclic(|weak| SensorService {
            hal: Arc::clone(&deps.hal),
            wake_lock: Arc::clone(&deps.wake_lock),
            app_ops: Arc::clone(&deps.app_ops),
            scheduling: Arc::clone(&deps.scheduling),
            policy,
            identity,
            config,
            state: Mutex::new(state),
            ack_gate: Mutex::new(()),
            ack_cv: Condvar::new(),
            runtime_queue: Mutex::new(VecDeque::new()),
            runtime_cv: Condvar::new(),
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
            notifier: Mutex::new(ProximityNotifier::new()),
            weak_self: weak.clone(),
        });

        deps.privacy.add_listener(Arc::new(ServiceAsPrivacyListener {
            service: Arc::downgrade(&service),
        }));

        let dispatch_service = Arc::clone(&service);
        let dispatch_thread = std::thread::Builder::new()
            .name("sensormux-dispatch".to_string())
            .spawn(move || dispatch::run_dispatch_loop(dispatch_service))
            .map_err(|_| SensorServiceError::NoInit)?;

        let ack_service = Arc::clone(&service);
        let ack_thread = std::thread::Builder::new()
            .name("sensormux-ack".to_string())
            .spawn(move || dispatch::run_ack_receiver(ack_service))
            .map_err(|_| SensorServiceError::NoInit)?;

        service.threads.lock().extend([dispatch_thread, ack_thread]);
        tracing::info!(
            sensors = service.state.lock().registry.len(),
            socket_buffer_bytes,
            "sensormux service started"
        );
        Ok(service)
    }

    pub(crate) fn hal(&self) -> &dyn SensorHal {
        self.hal.as_ref()
    }

    pub(crate) fn elevate_dispatch_thread(&self) {
        self.scheduling.elevate_dispatch_thread();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flags the worker threads to exit. The HAL must unblock its `poll`
    /// (driver teardown) for the dispatch thread to observe the flag.
    pub fn begin_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.runtime_cv.notify_all();
        self.ack_cv.notify_all();
    }

    /// Joins the worker threads after [`Self::begin_shutdown`].
    pub fn join(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            let _ = thread.join();
        }
        self.notifier.lock().shutdown();
    }

    // ----- connections -----

    /// Creates an event connection. `requested_mode` is `Normal` or one of
    /// the injection modes; a data-injection connection is only allowed
    /// while the service operates in that mode and only for the
    /// allowlisted package.
    pub fn create_event_connection(
        &self,
        caller: &CallerIdentity,
        requested_mode: OperatingMode,
    ) -> SensorResult<(Arc<SensorEventConnection>, ClientEventReceiver)> {
        if requested_mode != OperatingMode::Normal && !requested_mode.is_injection() {
            return Err(SensorServiceError::BadValue);
        }
        self.policy.reset_target_sdk_cache(&caller.op_package);

        let mut state = self.state.lock();
        if requested_mode == OperatingMode::DataInjection {
            if state.operating_mode != OperatingMode::DataInjection {
                tracing::warn!("data-injection connection refused outside data-injection mode");
                return Err(SensorServiceError::InvalidOperation);
            }
            if !is_allow_listed(&state.allow_listed_package, &caller.package) {
                tracing::warn!(
                    package = %caller.package,
                    "data-injection connection refused for non-allowlisted package"
                );
                return Err(SensorServiceError::InvalidOperation);
            }
        }

        let (service_side, client_side) =
            UnixDatagram::pair().map_err(|_| SensorServiceError::TransactionFailed)?;
        service_side
            .set_nonblocking(true)
            .map_err(|_| SensorServiceError::TransactionFailed)?;

        let id = state.next_connection_id;
        state.next_connection_id += 1;

        let package = if caller.package.is_empty() {
            format!("unknown_package_pid_{}", caller.pid)
        } else {
            caller.package.clone()
        };
        let op_package =
            if caller.op_package.is_empty() { package.clone() } else { caller.op_package.clone() };

        let connection = Arc::new(SensorEventConnection::new(
            id,
            caller.uid,
            caller.pid,
            package,
            op_package,
            requested_mode.is_injection(),
            service_side,
            state.socket_buffer_bytes / WIRE_EVENT_SIZE,
            Arc::clone(&self.app_ops),
            self.weak_self.clone(),
        ));
        if requested_mode.is_injection() {
            state.holder.add_event_connection_if_not_present(&connection);
        }
        Ok((connection, ClientEventReceiver::new(client_side)))
    }

    /// Registers a direct channel over client-supplied shared memory.
    pub fn create_direct_connection(
        &self,
        caller: &CallerIdentity,
        device_id: i32,
        mem: &DirectMemoryDescriptor,
    ) -> SensorResult<Arc<SensorDirectConnection>> {
        self.policy.reset_target_sdk_cache(&caller.op_package);
        let mut state = self.state.lock();

        if self.policy.sensor_privacy_enabled() {
            tracing::warn!("direct connections are refused while sensor privacy is enabled");
            return Err(SensorServiceError::InvalidOperation);
        }
        if mem.format != DirectFormat::SensorsEvent {
            return Err(SensorServiceError::BadValue);
        }
        for existing in state.holder.snapshot_direct_connections() {
            if existing.is_equivalent(mem) {
                tracing::warn!("duplicate direct channel request for the same memory");
                return Err(SensorServiceError::BadValue);
            }
        }
        let region = mem.region_size().map_err(|_| SensorServiceError::BadValue)?;
        if region < mem.size as u64 || mem.size < WIRE_EVENT_SIZE {
            tracing::warn!(claimed = mem.size, actual = region, "direct memory size mismatch");
            return Err(SensorServiceError::BadValue);
        }

        let dup = mem.duplicate().map_err(|_| SensorServiceError::BadValue)?;
        let channel = if device_id == types::DEFAULT_DEVICE_ID {
            self.hal
                .register_direct_channel(&dup)
                .map_err(|_| SensorServiceError::TransactionFailed)?
        } else {
            let callback = state
                .runtime_callbacks
                .get(&device_id)
                .cloned()
                .ok_or(SensorServiceError::BadValue)?;
            callback.on_direct_channel_created(&dup)?
        };
        if channel <= 0 {
            return Err(SensorServiceError::BadValue);
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        let connection = Arc::new(SensorDirectConnection::new(
            id,
            caller.uid,
            caller.pid,
            caller.op_package.clone(),
            device_id,
            dup,
            channel,
            self.weak_self.clone(),
        ));
        state.holder.add_direct_connection(&connection);
        Ok(connection)
    }

    pub(crate) fn cleanup_event_connection(&self, connection: &Arc<SensorEventConnection>) {
        let mut state = self.state.lock();
        for handle in connection.active_sensor_handles() {
            match self.cleanup_without_disable_locked(&mut state, connection, handle) {
                Ok(true) => {
                    let _ = self.backend_activate_locked(&mut state, handle, false, 0, 0);
                }
                Ok(false) | Err(_) => {}
            }
        }
        state.holder.remove_event_connection(connection.id());
        if connection.needs_wake_lock() {
            connection.reset_wake_lock_ref_count();
        }
        self.check_wake_lock_state_locked(&mut state);
    }

    pub(crate) fn cleanup_direct_connection(&self, connection: &Arc<SensorDirectConnection>) {
        let mut state = self.state.lock();
        if connection.device_id() == types::DEFAULT_DEVICE_ID {
            if let Err(err) = self.hal.unregister_direct_channel(connection.channel_handle()) {
                tracing::warn!(error = %err, "direct channel unregistration failed");
            }
        } else if let Some(callback) = state.runtime_callbacks.get(&connection.device_id()) {
            callback.on_direct_channel_destroyed(connection.channel_handle());
        } else {
            tracing::warn!(device = connection.device_id(), "runtime callback missing");
        }
        state.holder.remove_direct_connection(connection.id());
    }

    // ----- subscriptions -----

    pub(crate) fn enable(
        &self,
        connection: &Arc<SensorEventConnection>,
        handle: SensorHandle,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
    ) -> SensorResult<()> {
        if !self.is_running() {
            return Err(SensorServiceError::NoInit);
        }
        let caller = caller_of(connection);
        let mut state = self.state.lock();
        let entry = state.registry.lookup(handle).ok_or(SensorServiceError::BadValue)?;
        let descriptor = entry.descriptor.clone();
        if !self.policy.can_access(&descriptor, &caller, "enable") {
            return Err(SensorServiceError::PermissionDenied);
        }
        if state.operating_mode != OperatingMode::Normal
            && !state.operating_mode.is_injection()
            && !is_allow_listed(&state.allow_listed_package, connection.package_name())
        {
            return Err(SensorServiceError::InvalidOperation);
        }

        let sampling_period_ns =
            self.policy.adjust_sampling_period(sampling_period_ns, &caller)?;
        let sampling_period_ns = descriptor.clamp_period(sampling_period_ns);

        let record_existed = state.active_sensors.contains_key(&handle);
        let mut replay = None;
        if record_existed {
            let newly_joined = state
                .active_sensors
                .get_mut(&handle)
                .is_some_and(|record| record.add_connection(connection.id()));
            if newly_joined && descriptor.reporting_mode == ReportingMode::OnChange {
                replay = state.recent.last_if_current(handle);
            }
        } else {
            state.active_sensors.insert(handle, ActiveSensorRecord::new(connection.id()));
            if state.virtual_kinds.contains_key(&handle) {
                state.active_virtual_sensors.insert(handle);
            }
            // A record was just created, so any cached value predates this
            // activation and must not be replayed.
            if descriptor.reporting_mode == ReportingMode::OnChange {
                state.recent.mark_stale(handle);
            }
        }

        if let Some(mut cached) = replay {
            cached.sensor = handle;
            if descriptor.is_wake_up {
                cached.flags |= FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK;
                if !state.wake_lock_acquired {
                    self.set_wake_lock_locked(&mut state, true);
                }
            }
            connection.send_one_event(&cached);
            if state.wake_lock_acquired && !connection.needs_wake_lock() {
                self.check_wake_lock_state_locked(&mut state);
            }
        }

        let app_op = if descriptor.requires_permission() { descriptor.required_app_op } else { None };
        let one_shot = descriptor.reporting_mode == ReportingMode::OneShot;
        if connection.add_sensor(handle, sampling_period_ns, max_batch_latency_ns, app_op, one_shot)
        {
            state.holder.add_event_connection_if_not_present(connection);
        } else {
            tracing::warn!(handle, connection = connection.id(), "sensor already enabled");
        }

        let mut result = self.backend_batch_locked(
            &mut state,
            handle,
            0,
            sampling_period_ns,
            max_batch_latency_ns,
        );

        // Ask for a flush before activating so that a subscriber joining an
        // already-running continuous sensor does not see the batched
        // backlog; its events are gated until the flush completes.
        if result.is_ok() && descriptor.reporting_mode == ReportingMode::Continuous {
            let others = state
                .active_sensors
                .get(&handle)
                .map_or(0, ActiveSensorRecord::connection_count);
            if others > 1 {
                connection.set_first_flush_pending(handle, true);
                match self.backend_flush_locked(&mut state, handle) {
                    Ok(()) => {
                        if let Some(record) = state.active_sensors.get_mut(&handle) {
                            record.push_pending_flush(connection.id());
                        }
                    }
                    Err(_) => connection.set_first_flush_pending(handle, false),
                }
            }
        }

        if result.is_ok() {
            result = self.backend_activate_locked(
                &mut state,
                handle,
                true,
                sampling_period_ns,
                max_batch_latency_ns,
            );
        }

        if result.is_err() {
            let _ = self.cleanup_without_disable_locked(&mut state, connection, handle);
        }

        state.ring.push(RegistrationRecord {
            recorded_at: SystemTime::now(),
            package: connection.package_name().to_string(),
            handle,
            sampling_period_ns,
            max_batch_latency_ns,
            activated: true,
            result,
        });
        result
    }

    pub(crate) fn disable(
        &self,
        connection: &Arc<SensorEventConnection>,
        handle: SensorHandle,
    ) -> SensorResult<()> {
        if !self.is_running() {
            return Err(SensorServiceError::NoInit);
        }
        let mut state = self.state.lock();
        let result = match self.cleanup_without_disable_locked(&mut state, connection, handle) {
            Ok(true) => self.backend_activate_locked(&mut state, handle, false, 0, 0),
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };
        state.ring.push(RegistrationRecord {
            recorded_at: SystemTime::now(),
            package: connection.package_name().to_string(),
            handle,
            sampling_period_ns: 0,
            max_batch_latency_ns: 0,
            activated: false,
            result,
        });
        result
    }

    pub(crate) fn set_event_rate(
        &self,
        connection: &Arc<SensorEventConnection>,
        handle: SensorHandle,
        sampling_period_ns: i64,
    ) -> SensorResult<()> {
        if !self.is_running() {
            return Err(SensorServiceError::NoInit);
        }
        if sampling_period_ns < 0 {
            return Err(SensorServiceError::BadValue);
        }
        let caller = caller_of(connection);
        let mut state = self.state.lock();
        let descriptor = state
            .registry
            .descriptor(handle)
            .cloned()
            .ok_or(SensorServiceError::BadValue)?;
        if !self.policy.can_access(&descriptor, &caller, "configure") {
            return Err(SensorServiceError::PermissionDenied);
        }
        let period = self.policy.adjust_sampling_period(sampling_period_ns, &caller)?;
        let period = period.max(descriptor.min_delay_ns);
        self.backend_batch_locked(&mut state, handle, 0, period, 0)?;
        connection.update_sampling_period(handle, period);
        Ok(())
    }

    /// Requests a flush-complete marker on every sensor this connection
    /// subscribes to. One-shot sensors reject the request.
    pub(crate) fn flush(&self, connection: &Arc<SensorEventConnection>) -> SensorResult<()> {
        if !self.is_running() {
            return Err(SensorServiceError::NoInit);
        }
        let caller = caller_of(connection);
        let mut state = self.state.lock();
        let mut result = Ok(());
        for handle in connection.active_sensor_handles() {
            let Some(entry) = state.registry.lookup(handle) else { continue };
            let descriptor = entry.descriptor.clone();
            if descriptor.reporting_mode == ReportingMode::OneShot {
                tracing::warn!(handle, "flush called on a one-shot sensor");
                result = Err(SensorServiceError::InvalidOperation);
                continue;
            }
            if !self.policy.can_access(&descriptor, &caller, "flush") {
                result = Err(SensorServiceError::InvalidOperation);
                continue;
            }
            let is_software = state.virtual_kinds.contains_key(&handle)
                || state.registry.device_id_of(handle) != types::DEFAULT_DEVICE_ID;
            if is_software {
                // Software sensors have no hardware fifo; complete the
                // flush immediately.
                connection.add_pending_flush(handle);
                let marker = SensorEvent::flush_complete(handle, monotonic_now_ns());
                connection.send_events(
                    std::slice::from_ref(&marker),
                    &[Some(connection.id())],
                );
            } else {
                match self.hal.flush(handle) {
                    Ok(()) => {
                        connection.add_pending_flush(handle);
                        if let Some(record) = state.active_sensors.get_mut(&handle) {
                            record.push_pending_flush(connection.id());
                        }
                    }
                    Err(err) => result = Err(map_hal_error(err)),
                }
            }
        }
        result
    }

    // ----- data injection and operation parameters -----

    pub(crate) fn inject_sensor_data_for_connection(
        &self,
        connection: &Arc<SensorEventConnection>,
        event: &SensorEvent,
    ) -> SensorResult<()> {
        if !connection.is_data_injection() {
            return Err(SensorServiceError::InvalidOperation);
        }
        let state = self.state.lock();
        if !state.operating_mode.is_injection() {
            return Err(SensorServiceError::InvalidOperation);
        }
        if state.operating_mode == OperatingMode::HalBypassReplayInjection {
            // Bypass the driver entirely: feed the event straight into the
            // secondary dispatch path.
            drop(state);
            return self.send_runtime_sensor_event(event.clone());
        }
        drop(state);
        self.hal.inject_sensor_data(event).map_err(map_hal_error)
    }

    /// Feeds an additional-info parameter (local gravity, geomagnetic
    /// field, dock state, ...) to the HAL as a BEGIN/payload/END triple.
    pub fn set_operation_parameter(
        &self,
        caller: &CallerIdentity,
        handle: SensorHandle,
        kind: i32,
        floats: &[f32],
        ints: &[i32],
    ) -> SensorResult<()> {
        if !self.policy.check_caller_permission(PERMISSION_LOCATION_HARDWARE, caller) {
            return Err(SensorServiceError::PermissionDenied);
        }

        let values = match kind {
            event::AINFO_LOCAL_GEOMAGNETIC_FIELD => {
                if floats.len() != 3 || handle != -1 {
                    return Err(SensorServiceError::BadValue);
                }
                AdditionalInfoValues::Floats(floats.to_vec())
            }
            event::AINFO_LOCAL_GRAVITY => {
                if floats.len() != 1 || handle != -1 {
                    return Err(SensorServiceError::BadValue);
                }
                AdditionalInfoValues::Floats(floats.to_vec())
            }
            event::AINFO_DOCK_STATE
            | event::AINFO_HIGH_PERFORMANCE_MODE
            | event::AINFO_MAGNETIC_FIELD_CALIBRATION => {
                if ints.len() != 1 || handle != -1 {
                    return Err(SensorServiceError::BadValue);
                }
                AdditionalInfoValues::Ints(ints.to_vec())
            }
            custom if (event::AINFO_CUSTOM_START..event::AINFO_DEBUGGING_START)
                .contains(&custom) =>
            {
                if !ints.is_empty() || floats.len() > 13 || handle < 0 {
                    return Err(SensorServiceError::BadValue);
                }
                AdditionalInfoValues::Floats(floats.to_vec())
            }
            _ => return Err(SensorServiceError::BadValue),
        };

        let mut timestamp = monotonic_now_ns();
        for (info_kind, payload) in [
            (event::AINFO_BEGIN, AdditionalInfoValues::Ints(Vec::new())),
            (kind, values),
            (event::AINFO_END, AdditionalInfoValues::Ints(Vec::new())),
        ] {
            let event = SensorEvent {
                sensor: handle,
                event_type: types::TYPE_ADDITIONAL_INFO,
                timestamp_ns: timestamp,
                flags: 0,
                payload: EventPayload::AdditionalInfo { kind: info_kind, serial: 0, values: payload },
            };
            timestamp += 1;
            self.hal.inject_sensor_data(&event).map_err(map_hal_error)?;
        }
        Ok(())
    }

    // ----- direct channel configuration -----

    pub(crate) fn configure_direct_channel(
        &self,
        connection: &Arc<SensorDirectConnection>,
        handle: SensorHandle,
        rate: RateLevel,
    ) -> SensorResult<i32> {
        let mut state = self.state.lock();
        let sink = self.direct_rate_sink_locked(&state, connection)?;

        if handle == -1 && rate == RateLevel::Stop {
            connection.stop_all(&*sink);
            return Ok(0);
        }

        let descriptor = state
            .registry
            .descriptor(handle)
            .cloned()
            .ok_or(SensorServiceError::BadValue)?;
        if state.registry.device_id_of(handle) != connection.device_id() {
            tracing::warn!(
                handle,
                device = connection.device_id(),
                "direct channel and sensor belong to different devices"
            );
            return Err(SensorServiceError::BadValue);
        }
        let caller = CallerIdentity::new(connection.uid(), 0, connection.op_package());
        if !self.policy.can_access(&descriptor, &caller, "configure direct") {
            return Err(SensorServiceError::PermissionDenied);
        }
        if !self.has_sensor_access_locked(&state, connection.uid(), connection.op_package()) {
            return Err(SensorServiceError::InvalidOperation);
        }
        let rate = self.policy.adjust_rate_level(rate, &caller)?;
        let token = sink(handle, rate)?;
        connection.record_rate(handle, rate);
        drop(state);
        self.check_and_report_prox_state();
        Ok(token)
    }

    /// Resolves the backend a direct connection configures rates against.
    fn direct_rate_sink_locked<'a>(
        &'a self,
        state: &ServiceState,
        connection: &'a Arc<SensorDirectConnection>,
    ) -> SensorResult<Box<dyn Fn(SensorHandle, RateLevel) -> SensorResult<i32> + 'a>> {
        if connection.device_id() == types::DEFAULT_DEVICE_ID {
            let hal = Arc::clone(&self.hal);
            let channel = connection.channel_handle();
            Ok(Box::new(move |handle, rate| {
                hal.configure_direct_channel(channel, handle, rate).map_err(map_hal_error)
            }))
        } else {
            let callback = state
                .runtime_callbacks
                .get(&connection.device_id())
                .cloned()
                .ok_or(SensorServiceError::BadValue)?;
            let channel = connection.channel_handle();
            Ok(Box::new(move |handle, rate| {
                callback.on_direct_channel_configured(channel, handle, rate)
            }))
        }
    }

    // ----- runtime sensors -----

    pub fn register_runtime_sensor(
        &self,
        mut descriptor: SensorDescriptor,
        device_id: i32,
        callback: Arc<dyn RuntimeSensorCallback>,
    ) -> SensorResult<SensorHandle> {
        let mut state = self.state.lock();
        let mut handle = state.next_runtime_handle;
        while !state.registry.is_new_handle(handle) {
            handle += 1;
            if handle >= types::RUNTIME_SENSOR_HANDLE_END {
                tracing::error!("runtime sensor handle range exhausted");
                return Err(SensorServiceError::BadValue);
            }
        }
        state.next_runtime_handle = handle + 1;
        descriptor.handle = handle;
        tracing::info!(
            handle,
            sensor_type = descriptor.sensor_type,
            name = %descriptor.name,
            "registering runtime sensor"
        );
        if !state.registry.add(descriptor, false, false, device_id) {
            fatal("runtime sensor registration collided with a fresh handle");
        }
        state.runtime_callbacks.entry(device_id).or_insert(callback);
        self.ensure_runtime_thread_locked(&mut state);
        Ok(handle)
    }

    fn ensure_runtime_thread_locked(&self, state: &mut ServiceState) {
        if state.runtime_thread_started {
            return;
        }
        state.runtime_thread_started = true;
        if let Some(service) = self.weak_self.upgrade() {
            match std::thread::Builder::new()
                .name("sensormux-runtime".to_string())
                .spawn(move || dispatch::run_runtime_loop(service))
            {
                Ok(thread) => self.threads.lock().push(thread),
                Err(err) => {
                    tracing::error!(error = %err, "failed to start runtime sensor thread");
                }
            }
        }
    }

    pub fn unregister_runtime_sensor(&self, handle: SensorHandle) -> SensorResult<()> {
        let mut state = self.state.lock();
        let device_id = state.registry.device_id_of(handle);
        if !self.unregister_sensor_locked(&mut state, handle) {
            tracing::error!(handle, "runtime sensor release error");
            return Err(SensorServiceError::BadValue);
        }
        let connections = state.holder.snapshot_event_connections();
        for connection in &connections {
            connection.remove_sensor(handle);
        }
        if !state.registry.device_has_sensors(device_id) {
            state.runtime_callbacks.remove(&device_id);
        }
        Ok(())
    }

    /// Queues an event produced by a runtime sensor's user-space backend.
    /// Hal-bypass injection reuses the same path.
    pub fn send_runtime_sensor_event(&self, event: SensorEvent) -> SensorResult<()> {
        {
            let mut state = self.state.lock();
            self.ensure_runtime_thread_locked(&mut state);
        }
        self.runtime_queue.lock().push_back(event);
        self.runtime_cv.notify_all();
        Ok(())
    }

    // ----- listings and identity -----

    /// The sensors this caller may see, with rate capping applied and
    /// uuids replaced by anonymized per-app ids.
    pub fn sensor_list(&self, caller: &CallerIdentity) -> Vec<SensorDescriptor> {
        let state = self.state.lock();
        let mut sensors = if self.config.expose_debug_sensors {
            state.registry.user_debug_sensors()
        } else {
            state.registry.user_sensors()
        };
        drop(state);
        self.policy.reset_target_sdk_cache(&caller.op_package);
        let capped = self.policy.is_rate_capped(caller);
        for sensor in &mut sensors {
            if capped && types::is_rate_capped_type(sensor.sensor_type) {
                sensor.cap_min_delay(types::CAPPED_SAMPLING_PERIOD_NS);
            }
        }
        self.anonymize_for_caller(&mut sensors, caller);
        sensors
    }

    pub fn dynamic_sensor_list(&self, caller: &CallerIdentity) -> Vec<SensorDescriptor> {
        let state = self.state.lock();
        let mut sensors: Vec<_> = state
            .registry
            .dynamic_sensors()
            .into_iter()
            .filter(|sensor| {
                let ok = self.policy.can_access(sensor, caller, "see");
                if !ok {
                    tracing::info!(sensor = %sensor.name, "skipped inaccessible dynamic sensor");
                }
                ok
            })
            .collect();
        drop(state);
        self.anonymize_for_caller(&mut sensors, caller);
        sensors
    }

    pub fn runtime_sensor_list(
        &self,
        caller: &CallerIdentity,
        device_id: i32,
    ) -> Vec<SensorDescriptor> {
        let state = self.state.lock();
        let mut sensors: Vec<_> = state
            .registry
            .device_sensors(device_id)
            .into_iter()
            .filter(|sensor| self.policy.can_access(sensor, caller, "see"))
            .collect();
        drop(state);
        self.anonymize_for_caller(&mut sensors, caller);
        sensors
    }

    fn anonymize_for_caller(&self, sensors: &mut [SensorDescriptor], caller: &CallerIdentity) {
        for sensor in sensors {
            sensor.id = self.identity.id_from_uuid(&sensor.uuid, caller.uid);
            if !caller.is_audio_server_or_system() {
                sensor.anonymize_uuid();
            }
        }
    }

    // ----- operating mode -----

    pub fn operating_mode(&self) -> OperatingMode {
        self.state.lock().operating_mode
    }

    pub fn allow_listed_package(&self) -> String {
        self.state.lock().allow_listed_package.clone()
    }

    pub fn change_operating_mode(
        &self,
        target: OperatingMode,
        allow_listed_package: Option<&str>,
    ) -> SensorResult<()> {
        let mut state = self.state.lock();
        if state.operating_mode == target {
            return Ok(());
        }
        if target != OperatingMode::Normal && allow_listed_package.is_none() {
            return Err(SensorServiceError::InvalidOperation);
        }
        match target {
            OperatingMode::Normal => {
                if state.operating_mode == OperatingMode::Restricted {
                    state.operating_mode = OperatingMode::Normal;
                    self.enable_all_sensors_locked(&mut state);
                }
                if state.operating_mode == OperatingMode::ReplayDataInjection {
                    self.hal.disable_all_sensors();
                }
                if state.operating_mode.is_injection() {
                    self.reset_to_normal_mode_locked(&mut state)?;
                }
                state.allow_listed_package.clear();
                Ok(())
            }
            OperatingMode::Restricted => {
                if state.operating_mode != OperatingMode::Normal {
                    return Err(SensorServiceError::InvalidOperation);
                }
                state.operating_mode = OperatingMode::Restricted;
                if let Some(package) = allow_listed_package {
                    state.allow_listed_package = package.to_string();
                }
                self.disable_all_sensors_locked(&mut state);
                Ok(())
            }
            OperatingMode::ReplayDataInjection | OperatingMode::HalBypassReplayInjection
                if self.config.is_user_build =>
            {
                tracing::warn!("replay-style injection refused on a user build");
                Err(SensorServiceError::InvalidOperation)
            }
            OperatingMode::DataInjection
            | OperatingMode::ReplayDataInjection
            | OperatingMode::HalBypassReplayInjection => {
                if state.operating_mode != OperatingMode::Normal {
                    return Err(SensorServiceError::InvalidOperation);
                }
                self.hal.disable_all_sensors();
                let result = if target == OperatingMode::HalBypassReplayInjection {
                    // The driver never learns about hal-bypass replay; the
                    // injected stream bypasses it entirely.
                    Ok(())
                } else {
                    self.hal.set_mode(HalMode::DataInjection).map_err(map_hal_error)
                };
                if result.is_ok() {
                    state.operating_mode = target;
                }
                if result.is_err() || target == OperatingMode::ReplayDataInjection {
                    self.hal.enable_all_sensors();
                }
                if let Some(package) = allow_listed_package {
                    state.allow_listed_package = package.to_string();
                }
                result
            }
        }
    }

    fn reset_to_normal_mode_locked(&self, state: &mut ServiceState) -> SensorResult<()> {
        self.hal.set_mode(HalMode::Normal).map_err(map_hal_error)?;
        state.operating_mode = OperatingMode::Normal;
        self.hal.enable_all_sensors();
        self.check_and_report_prox_state_locked(state);
        Ok(())
    }

    // ----- privacy, uid state, rate capping -----

    pub fn on_sensor_privacy_changed(&self, enabled: bool) {
        self.policy.set_sensor_privacy(enabled);
        let mut state = self.state.lock();
        if enabled {
            self.disable_all_sensors_locked(&mut state);
        } else {
            self.enable_all_sensors_locked(&mut state);
        }
    }

    pub fn on_mic_privacy_changed(&self, enabled: bool) {
        self.policy.set_mic_toggle(enabled);
        let state = self.state.lock();
        let direct = state.holder.snapshot_direct_connections();
        let event_connections = state.holder.snapshot_event_connections();
        for connection in &direct {
            if let Ok(sink) = self.direct_rate_sink_locked(&state, connection) {
                if enabled {
                    connection.cap_rates(&*sink);
                } else {
                    connection.uncap_rates(&*sink);
                }
            }
        }
        // Event connections: re-batch capped-type subscriptions. Requested
        // periods stay recorded in the subscription, so lifting the toggle
        // restores them.
        for connection in &event_connections {
            for handle in connection.active_sensor_handles() {
                let Some(descriptor) = state.registry.descriptor(handle) else { continue };
                if !types::is_rate_capped_type(descriptor.sensor_type) {
                    continue;
                }
                let Some(requested) = connection.sampling_period_of(handle) else { continue };
                let effective = if enabled {
                    requested.max(types::CAPPED_SAMPLING_PERIOD_NS)
                } else {
                    requested
                };
                let _ = self.hal.batch(handle, 0, effective, 0);
            }
        }
    }

    pub fn is_uid_active(&self, uid: u32) -> bool {
        self.policy.is_uid_active(uid)
    }

    pub fn on_uid_active(&self, uid: u32) {
        let changed = self.policy.uid.lock().note_active(uid);
        if changed {
            self.on_uid_state_changed(uid, UidState::Active);
        }
    }

    pub fn on_uid_idle(&self, uid: u32) {
        let changed = self.policy.uid.lock().note_idle(uid);
        if changed {
            self.on_uid_state_changed(uid, UidState::Idle);
        }
    }

    pub fn on_uid_gone(&self, uid: u32) {
        self.on_uid_idle(uid);
    }

    pub fn set_uid_override(&self, uid: u32, active: bool) {
        let changed = self.policy.uid.lock().set_override(uid, active);
        if changed {
            self.on_uid_state_changed(
                uid,
                if active { UidState::Active } else { UidState::Idle },
            );
        }
    }

    pub fn clear_uid_override(&self, uid: u32) {
        let changed = self.policy.uid.lock().clear_override(uid);
        if changed {
            let state = if self.policy.is_uid_active(uid) { UidState::Active } else { UidState::Idle };
            self.on_uid_state_changed(uid, state);
        }
    }

    fn on_uid_state_changed(&self, uid: u32, uid_state: UidState) {
        let mut state = self.state.lock();
        for connection in state.holder.snapshot_event_connections() {
            if connection.uid() == uid {
                self.hal.set_uid_state_for_connection(connection.id(), uid_state);
            }
        }
        for connection in state.holder.snapshot_direct_connections() {
            if connection.uid() == uid {
                let has_access =
                    self.has_sensor_access_locked(&state, uid, connection.op_package());
                if let Ok(sink) = self.direct_rate_sink_locked(&state, &connection) {
                    if has_access {
                        connection.resume_all(&*sink);
                    } else {
                        connection.pause_all(&*sink);
                    }
                }
            }
        }
        self.check_and_report_prox_state_locked(&mut state);
    }

    fn has_sensor_access_locked(&self, state: &ServiceState, uid: u32, op_package: &str) -> bool {
        self.policy.has_sensor_access(uid)
            && !(state.operating_mode == OperatingMode::Restricted
                && !is_allow_listed(&state.allow_listed_package, op_package))
    }

    fn disable_all_sensors_locked(&self, state: &mut ServiceState) {
        for connection in state.holder.snapshot_direct_connections() {
            let has_access =
                self.has_sensor_access_locked(state, connection.uid(), connection.op_package());
            if let Ok(sink) = self.direct_rate_sink_locked(state, &connection) {
                if has_access {
                    connection.resume_all(&*sink);
                } else {
                    connection.pause_all(&*sink);
                }
            }
        }
        self.hal.disable_all_sensors();
        self.check_and_report_prox_state_locked(state);
        // A flush issued before the disable will never complete; drop the
        // queued responses so they cannot be mispaired later.
        for record in state.active_sensors.values_mut() {
            record.pending_flushes.clear();
        }
    }

    fn enable_all_sensors_locked(&self, state: &mut ServiceState) {
        if state.operating_mode == OperatingMode::Restricted
            || self.policy.sensor_privacy_enabled()
        {
            tracing::warn!(
                mode = state.operating_mode.label(),
                privacy = self.policy.sensor_privacy_enabled(),
                "sensors cannot be re-enabled"
            );
            return;
        }
        self.hal.enable_all_sensors();
        for connection in state.holder.snapshot_direct_connections() {
            let has_access =
                self.has_sensor_access_locked(state, connection.uid(), connection.op_package());
            if let Ok(sink) = self.direct_rate_sink_locked(state, &connection) {
                if has_access {
                    connection.resume_all(&*sink);
                } else {
                    connection.pause_all(&*sink);
                }
            }
        }
        self.check_and_report_prox_state_locked(state);
    }

    // ----- proximity listeners -----

    pub fn add_proximity_active_listener(
        &self,
        listener: Arc<dyn ProximityActiveListener>,
    ) -> SensorResult<()> {
        let mut state = self.state.lock();
        if state.proximity_listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return Err(SensorServiceError::AlreadyExists);
        }
        state.proximity_listeners.push(Arc::clone(&listener));
        let current = state.last_reported_prox_active;
        self.notifier.lock().notify(current, vec![listener]);
        Ok(())
    }

    pub fn remove_proximity_active_listener(
        &self,
        listener: &Arc<dyn ProximityActiveListener>,
    ) -> SensorResult<()> {
        let mut state = self.state.lock();
        let before = state.proximity_listeners.len();
        state.proximity_listeners.retain(|l| !Arc::ptr_eq(l, listener));
        if state.proximity_listeners.len() == before {
            return Err(SensorServiceError::NameNotFound);
        }
        Ok(())
    }

    fn check_and_report_prox_state(&self) {
        let mut state = self.state.lock();
        self.check_and_report_prox_state_locked(&mut state);
    }

    fn check_and_report_prox_state_locked(&self, state: &mut ServiceState) {
        if state.prox_sensor_handles.is_empty() {
            return;
        }
        let is_active =
            state.prox_sensor_handles.iter().any(|handle| self.hal.is_sensor_active(*handle));
        if is_active != state.last_reported_prox_active {
            state.last_reported_prox_active = is_active;
            self.notifier.lock().notify(is_active, state.proximity_listeners.clone());
        }
    }

    // ----- wakelock arbitration -----

    pub fn is_wake_lock_held(&self) -> bool {
        self.state.lock().wake_lock_acquired
    }

    fn set_wake_lock_locked(&self, state: &mut ServiceState, acquire: bool) {
        if acquire {
            if !state.wake_lock_acquired {
                self.wake_lock.acquire(WAKE_LOCK_NAME);
                state.wake_lock_acquired = true;
            }
            // Kick the ack receiver so its timeout starts counting.
            self.ack_cv.notify_all();
        } else if state.wake_lock_acquired {
            self.wake_lock.release(WAKE_LOCK_NAME);
            state.wake_lock_acquired = false;
        }
    }

    fn check_wake_lock_state_locked(&self, state: &mut ServiceState) {
        if !state.wake_lock_acquired {
            return;
        }
        let any_needs = state
            .holder
            .snapshot_event_connections()
            .iter()
            .any(|connection| connection.needs_wake_lock());
        if !any_needs {
            self.set_wake_lock_locked(state, false);
        }
    }

    /// Called by a connection after a wake-event acknowledgement.
    pub(crate) fn note_wake_ack(&self) {
        let mut state = self.state.lock();
        self.check_wake_lock_state_locked(&mut state);
        drop(state);
        self.ack_cv.notify_all();
    }

    pub(crate) fn reset_all_wake_lock_ref_counts(&self) {
        let mut state = self.state.lock();
        for connection in state.holder.snapshot_event_connections() {
            connection.reset_wake_lock_ref_count();
        }
        tracing::warn!("wake event acknowledgement timed out; releasing the wakelock");
        self.set_wake_lock_locked(&mut state, false);
    }

    // ----- dispatch engine (called from the dispatch/runtime threads) -----

    pub(crate) fn poll_max_events(&self) -> usize {
        let virtual_count = self.state.lock().virtual_kinds.len();
        (MAX_RECEIVE_BUFFER_EVENT_COUNT / (1 + virtual_count)).max(1)
    }

    pub(crate) fn process_hal_batch(&self, mut events: Vec<SensorEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &mut events {
            event.flags = 0;
        }

        let mut state = self.state.lock();

        let mut wake_events = 0_u32;
        for event in &mut events {
            let handle = event.source_handle();
            let wake = state
                .registry
                .descriptor(handle)
                .is_some_and(|descriptor| descriptor.is_wake_up);
            if wake {
                event.flags |= FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK;
                wake_events += 1;
            }
        }
        if wake_events > 0 {
            if !state.wake_lock_acquired {
                self.set_wake_lock_locked(&mut state, true);
            }
            self.hal.write_wake_lock_handled(wake_events);
        }

        for event in &events {
            state.recent.record(event);
        }

        if !state.active_virtual_sensors.is_empty() {
            for event in &events {
                state.fusion.process(event);
            }
            let active: Vec<SensorHandle> =
                state.active_virtual_sensors.iter().copied().collect();
            let mut appended = Vec::new();
            'expansion: for event in &events {
                for handle in &active {
                    if events.len() + appended.len() >= MAX_RECEIVE_BUFFER_EVENT_COUNT {
                        tracing::error!(
                            count = events.len(),
                            appended = appended.len(),
                            "event buffer too small to hold all virtual events"
                        );
                        break 'expansion;
                    }
                    let Some(kind) = state.virtual_kinds.get(handle) else { continue };
                    if let Some(output) = kind.process(&state.fusion, event, *handle) {
                        state.recent.record(&output);
                        appended.push(output);
                    }
                }
            }
            if !appended.is_empty() {
                events.extend(appended);
                event::sort_by_timestamp(&mut events);
            }
        }

        let mut flush_destinations = vec![None; events.len()];
        for (i, event) in events.iter().enumerate() {
            if event.is_flush_complete() {
                if let Some(record) = state.active_sensors.get_mut(&event.source_handle()) {
                    flush_destinations[i] = record.pop_pending_flush();
                }
            }
        }

        let connections = state.holder.snapshot_event_connections();
        for event in &events {
            if event.event_type == types::TYPE_DYNAMIC_SENSOR_META {
                if let EventPayload::DynamicSensorMeta { connected, handle, uuid, descriptor } =
                    &event.payload
                {
                    if *connected {
                        self.register_dynamic_sensor_locked(
                            &mut state,
                            *handle,
                            *uuid,
                            descriptor.as_deref(),
                        );
                    } else {
                        self.disconnect_dynamic_sensor_locked(&mut state, *handle, &connections);
                    }
                }
            }
        }

        drop(state);

        let mut one_shot_cleanups = Vec::new();
        for connection in &connections {
            connection.send_events(&events, &flush_destinations);
            if connection.has_one_shot_sensors() {
                let triggered = connection.triggered_one_shot_handles(&events);
                if !triggered.is_empty() {
                    one_shot_cleanups.push((Arc::clone(connection), triggered));
                }
            }
        }

        let mut state = self.state.lock();
        for (connection, handles) in one_shot_cleanups {
            for handle in handles {
                if let Ok(true) =
                    self.cleanup_without_disable_locked(&mut state, &connection, handle)
                {
                    let _ = self.backend_activate_locked(&mut state, handle, false, 0, 0);
                }
            }
        }
        self.check_wake_lock_state_locked(&mut state);
    }

    pub(crate) fn process_runtime_batch(&self, mut events: Vec<SensorEvent>) {
        if events.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for event in &events {
            state.recent.record(event);
        }
        event::sort_by_timestamp(&mut events);
        let connections = state.holder.snapshot_event_connections();
        drop(state);

        let mut one_shot_cleanups = Vec::new();
        for connection in &connections {
            connection.send_events(&events, &[]);
            if connection.has_one_shot_sensors() {
                let triggered = connection.triggered_one_shot_handles(&events);
                if !triggered.is_empty() {
                    one_shot_cleanups.push((Arc::clone(connection), triggered));
                }
            }
        }
        if !one_shot_cleanups.is_empty() {
            let mut state = self.state.lock();
            for (connection, handles) in one_shot_cleanups {
                for handle in handles {
                    if let Ok(true) =
                        self.cleanup_without_disable_locked(&mut state, &connection, handle)
                    {
                        let _ = self.backend_activate_locked(&mut state, handle, false, 0, 0);
                    }
                }
            }
        }
    }

    /// Blocks until runtime events are queued; `None` on shutdown.
    pub(crate) fn wait_runtime_events(&self) -> Option<Vec<SensorEvent>> {
        let mut queue = self.runtime_queue.lock();
        while queue.is_empty() {
            if !self.is_running() {
                return None;
            }
            self.runtime_cv.wait(&mut queue);
        }
        let n = queue.len().min(MAX_RECEIVE_BUFFER_EVENT_COUNT);
        Some(queue.drain(..n).collect())
    }

    /// One ack-receiver wait cycle: armed with the timeout while the
    /// wakelock is held, parked otherwise.
    pub(crate) fn ack_receiver_cycle(&self) {
        let held = self.is_wake_lock_held();
        let mut gate = self.ack_gate.lock();
        if !self.is_running() {
            return;
        }
        if held {
            let result = self.ack_cv.wait_for(&mut gate, self.config.ack_timeout);
            if result.timed_out() && self.is_wake_lock_held() {
                self.reset_all_wake_lock_ref_counts();
            }
        } else {
            // Bounded park: an acquisition racing past the notify is
            // picked up on the next cycle at the latest.
            let _ = self.ack_cv.wait_for(&mut gate, self.config.ack_timeout);
        }
    }

    /// Dead HAL in a reconnecting state: announce a clean disconnect for
    /// every known dynamic sensor to every client, then reconnect.
    pub(crate) fn handle_hal_reconnection(&self) {
        let mut state = self.state.lock();
        let connections = state.holder.snapshot_event_connections();
        let dynamic_handles = self.hal.get_dynamic_sensor_handles();
        if let Some(meta_handle) = state.dynamic_meta_handle {
            for handle in dynamic_handles {
                let event = SensorEvent::dynamic_sensor_meta(
                    meta_handle,
                    monotonic_now_ns(),
                    false,
                    handle,
                    SensorUuid::ZERO,
                    None,
                );
                self.disconnect_dynamic_sensor_locked(&mut state, handle, &connections);
                for connection in &connections {
                    connection.send_one_event(&event);
                }
            }
        } else if !dynamic_handles.is_empty() {
            tracing::error!("no dynamic meta sensor handle; skipping disconnect announcements");
        }
        drop(state);
        self.hal.reconnect();
    }

    // ----- internals -----

    fn register_dynamic_sensor_locked(
        &self,
        state: &mut ServiceState,
        handle: SensorHandle,
        uuid: SensorUuid,
        descriptor: Option<&SensorDescriptor>,
    ) {
        if !state.registry.is_new_handle(handle) {
            tracing::error!(handle, "dynamic sensor handle was used before; cannot reuse");
            return;
        }
        let mut descriptor = match descriptor {
            Some(d) => d.clone(),
            None => SensorDescriptor::new(handle, types::TYPE_DYNAMIC_SENSOR_META, "dynamic"),
        };
        descriptor.handle = handle;
        descriptor.is_dynamic = true;
        descriptor.uuid = uuid;
        tracing::info!(
            handle,
            sensor_type = descriptor.sensor_type,
            name = %descriptor.name,
            "dynamic sensor connected"
        );
        self.hal.handle_dynamic_sensor_connection(handle, true);
        if !state.registry.add(descriptor, false, false, types::DEFAULT_DEVICE_ID) {
            fatal("dynamic sensor registration collided with a fresh handle");
        }
    }

    fn disconnect_dynamic_sensor_locked(
        &self,
        state: &mut ServiceState,
        handle: SensorHandle,
        connections: &[Arc<SensorEventConnection>],
    ) {
        tracing::info!(handle, "dynamic sensor disconnected");
        self.hal.handle_dynamic_sensor_connection(handle, false);
        if !self.unregister_sensor_locked(state, handle) {
            tracing::error!(handle, "dynamic sensor release error");
        }
        for connection in connections {
            connection.remove_sensor(handle);
        }
    }

    fn unregister_sensor_locked(&self, state: &mut ServiceState, handle: SensorHandle) -> bool {
        state.recent.remove(handle);
        state.active_sensors.remove(&handle);
        state.active_virtual_sensors.remove(&handle);
        state.registry.remove(handle)
    }

    /// Removes one subscription; returns whether the active record emptied
    /// and was destroyed (the caller then deactivates the backend).
    fn cleanup_without_disable_locked(
        &self,
        state: &mut ServiceState,
        connection: &Arc<SensorEventConnection>,
        handle: SensorHandle,
    ) -> SensorResult<bool> {
        let Some(record) = state.active_sensors.get_mut(&handle) else {
            return Err(SensorServiceError::BadValue);
        };
        connection.remove_sensor(handle);
        let destroyed = record.remove_connection(connection.id());
        if destroyed {
            state.active_sensors.remove(&handle);
            state.active_virtual_sensors.remove(&handle);
        }
        if !connection.has_any_sensor() && !connection.is_data_injection() {
            state.holder.remove_event_connection(connection.id());
        }
        Ok(destroyed)
    }

    fn backend_of_locked(&self, state: &ServiceState, handle: SensorHandle) -> Option<Backend> {
        if let Some(kind) = state.virtual_kinds.get(&handle) {
            return Some(Backend::Virtual(*kind));
        }
        let device_id = state.registry.device_id_of(handle);
        if device_id != types::DEFAULT_DEVICE_ID {
            let callback = state.runtime_callbacks.get(&device_id)?;
            return Some(Backend::Runtime { callback: Arc::clone(callback) });
        }
        state.registry.lookup(handle).map(|_| Backend::Hardware)
    }

    fn backend_batch_locked(
        &self,
        state: &mut ServiceState,
        handle: SensorHandle,
        flags: u32,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
    ) -> SensorResult<()> {
        match self.backend_of_locked(state, handle).ok_or(SensorServiceError::BadValue)? {
            Backend::Hardware => self
                .hal
                .batch(handle, flags, sampling_period_ns, max_batch_latency_ns)
                .map_err(map_hal_error),
            Backend::Runtime { callback } => callback.on_configuration_changed(
                handle,
                state.active_sensors.contains_key(&handle),
                sampling_period_ns,
                max_batch_latency_ns,
            ),
            Backend::Virtual(_) => Ok(()),
        }
    }

    fn backend_flush_locked(
        &self,
        state: &mut ServiceState,
        handle: SensorHandle,
    ) -> SensorResult<()> {
        match self.backend_of_locked(state, handle).ok_or(SensorServiceError::BadValue)? {
            Backend::Hardware => self.hal.flush(handle).map_err(map_hal_error),
            // Software backends have no fifo to drain.
            Backend::Runtime { .. } | Backend::Virtual(_) => Ok(()),
        }
    }

    fn backend_activate_locked(
        &self,
        state: &mut ServiceState,
        handle: SensorHandle,
        enabled: bool,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
    ) -> SensorResult<()> {
        match self.backend_of_locked(state, handle).ok_or(SensorServiceError::BadValue)? {
            Backend::Hardware => self.hal.activate(handle, enabled).map_err(map_hal_error).map(
                |()| {
                    self.check_and_report_prox_state_locked(state);
                },
            ),
            Backend::Runtime { callback } => callback.on_configuration_changed(
                handle,
                enabled,
                sampling_period_ns,
                max_batch_latency_ns,
            ),
            Backend::Virtual(kind) => self.activate_virtual_locked(state, kind, enabled),
        }
    }

    /// Drives the physical base sensors a virtual sensor fuses over,
    /// refcounted across all active virtual sensors.
    fn activate_virtual_locked(
        &self,
        state: &mut ServiceState,
        kind: VirtualSensorKind,
        enabled: bool,
    ) -> SensorResult<()> {
        if enabled {
            let mut activated = Vec::new();
            for base_type in kind.required_input_types() {
                let count = state.fusion_base_refcounts.entry(*base_type).or_insert(0);
                *count += 1;
                if *count == 1 {
                    let Some(base_handle) =
                        state.fusion_base_handles.get(base_type).copied()
                    else {
                        continue;
                    };
                    let period = state
                        .registry
                        .descriptor(base_handle)
                        .map_or(0, |d| d.min_delay_ns);
                    let result = self
                        .hal
                        .batch(base_handle, 0, period, 0)
                        .and_then(|()| self.hal.activate(base_handle, true));
                    if let Err(err) = result {
                        for undo in activated {
                            let _ = self.hal.activate(undo, false);
                        }
                        // Roll the refcounts back too.
                        for undo_type in kind.required_input_types() {
                            if let Some(c) = state.fusion_base_refcounts.get_mut(undo_type) {
                                *c = c.saturating_sub(1);
                            }
                            if *undo_type == *base_type {
                                break;
                            }
                        }
                        return Err(map_hal_error(err));
                    }
                    activated.push(base_handle);
                }
            }
            Ok(())
        } else {
            for base_type in kind.required_input_types() {
                if let Some(count) = state.fusion_base_refcounts.get_mut(base_type) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        if let Some(base_handle) = state.fusion_base_handles.get(base_type) {
                            let _ = self.hal.activate(*base_handle, false);
                        }
                    }
                }
            }
            Ok(())
        }
    }

    // ----- diagnostics -----

    /// The diagnostic dump. With a mode-name argument a mode transition is
    /// performed first; `--proto` selects the machine-readable encoding.
    pub fn dump(&self, caller: &CallerIdentity, args: &[String]) -> SensorResult<String> {
        if !self.policy.check_caller_permission(PERMISSION_DUMP, caller) {
            return Ok(format!(
                "Permission Denial: cannot dump the sensor service from pid={} uid={}\n",
                caller.pid, caller.uid
            ));
        }
        if args.len() > 2 {
            return Err(SensorServiceError::InvalidOperation);
        }
        if let Some(first) = args.first() {
            if let Some(mode) = OperatingMode::parse(first) {
                self.change_operating_mode(mode, args.get(1).map(String::as_str))?;
            }
        }
        let snapshot = self.dump_snapshot(caller);
        if args.first().is_some_and(|a| a == "--proto") {
            Ok(snapshot.render_json())
        } else {
            Ok(snapshot.render_text())
        }
    }

    fn dump_snapshot(&self, caller: &CallerIdentity) -> DumpSnapshot {
        let state = self.state.lock();
        let mut sensors = Vec::new();
        state.registry.for_each(|entry| {
            sensors.push((entry.descriptor.clone(), entry.is_virtual, entry.device_id));
            true
        });
        let recent_lines = sensors
            .iter()
            .filter_map(|(descriptor, _, _)| {
                let masked = !caller.is_privileged() && descriptor.requires_permission();
                state
                    .recent
                    .dump_line(descriptor.handle, masked)
                    .map(|line| (descriptor.name.clone(), line))
            })
            .collect();
        let active = state
            .active_sensors
            .iter()
            .filter(|(handle, _)| self.hal.is_sensor_active(**handle)
                || state.virtual_kinds.contains_key(*handle))
            .map(|(handle, record)| {
                (state.registry.name_of(*handle), *handle, record.connection_count())
            })
            .collect();
        DumpSnapshot {
            sensors,
            fusion_initialized: state.fusion.is_initialized(),
            fusion_orientation: state.fusion.orientation_quat(),
            recent_lines,
            active_sensors: active,
            socket_buffer_bytes: state.socket_buffer_bytes,
            socket_buffer_events: state.socket_buffer_bytes / WIRE_EVENT_SIZE,
            wake_lock_acquired: state.wake_lock_acquired,
            operating_mode: state.operating_mode,
            allow_listed_package: state.allow_listed_package.clone(),
            sensor_privacy: self.policy.sensor_privacy_enabled(),
            event_connections: state
                .holder
                .snapshot_event_connections()
                .iter()
                .map(|c| {
                    let mut text = String::new();
                    c.dump_text(&mut text);
                    (text, c.dump_json())
                })
                .collect(),
            direct_connections: state
                .holder
                .snapshot_direct_connections()
                .iter()
                .map(|c| {
                    let mut text = String::new();
                    c.dump_text(&mut text);
                    (text, c.dump_json())
                })
                .collect(),
            registrations: state.ring.iter_recent_first().map(ToString::to_string).collect(),
        }
    }
}

fn caller_of(connection: &Arc<SensorEventConnection>) -> CallerIdentity {
    CallerIdentity {
        uid: connection.uid(),
        pid: connection.pid(),
        package: connection.package_name().to_string(),
        op_package: connection.op_package().to_string(),
    }
}

fn is_allow_listed(allow_listed_package: &str, package: &str) -> bool {
    !allow_listed_package.is_empty() && package.contains(allow_listed_package)
}

fn map_hal_error(err: HalError) -> SensorServiceError {
    match err {
        HalError::DeadObject => SensorServiceError::DeadObject,
        HalError::Transaction => SensorServiceError::TransactionFailed,
        HalError::Unsupported => SensorServiceError::Unsupported,
        HalError::BadValue => SensorServiceError::BadValue,
    }
}

fn virtual_descriptor(kind: VirtualSensorKind, handle: SensorHandle) -> SensorDescriptor {
    SensorDescriptor::new(handle, kind.output_type(), kind.name())
        .with_delays(5_000_000, 0)
        .with_uuid(SensorUuid::ALL_ONES)
}

fn system_max_socket_buffer() -> Option<usize> {
    let raw = std::fs::read_to_string("/proc/sys/net/core/wmem_max").ok()?;
    raw.trim().parse().ok()
}
