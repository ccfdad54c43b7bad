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

//! Access policy.
//!
//! Decides who may see and drive which sensor: permission and app-op
//! gates, the head-tracker restriction, uid active/idle state with shell
//! overrides, the sensor-privacy and microphone-toggle mirrors, and the
//! sampling-rate cap with its debuggable-package surfacing rule.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use sensormux_core::sensor::SensorDescriptor;
use sensormux_core::types::{
    self, CAPPED_SAMPLING_PERIOD_NS, FIRST_APPLICATION_UID, TARGET_SDK_RATE_CAP_START,
    TARGET_SDK_STEP_PERMISSION_CUTOFF,
};
use sensormux_core::{SensorResult, SensorServiceError};

use crate::collaborators::{
    AppOpMode, AppOpsChecker, CallerIdentity, PackageManager, PermissionChecker,
    PERMISSION_HIGH_SAMPLING_RATE,
};
use crate::hal::{RateLevel, CAPPED_DIRECT_RATE_LEVEL};

/// Uid active/idle bookkeeping. Shell overrides win over observed state;
/// system uids are always active.
#[derive(Debug, Default)]
pub struct UidPolicy {
    active_uids: HashSet<u32>,
    override_uids: HashMap<u32, bool>,
}

impl UidPolicy {
    pub fn is_uid_active(&self, uid: u32) -> bool {
        if uid < FIRST_APPLICATION_UID {
            return true;
        }
        if let Some(active) = self.override_uids.get(&uid) {
            return *active;
        }
        self.active_uids.contains(&uid)
    }

    /// Returns true when the effective state changed.
    pub fn note_active(&mut self, uid: u32) -> bool {
        let was = self.is_uid_active(uid);
        self.active_uids.insert(uid);
        was != self.is_uid_active(uid)
    }

    pub fn note_idle(&mut self, uid: u32) -> bool {
        let was = self.is_uid_active(uid);
        self.active_uids.remove(&uid);
        was != self.is_uid_active(uid)
    }

    pub fn set_override(&mut self, uid: u32, active: bool) -> bool {
        let was = self.is_uid_active(uid);
        self.override_uids.insert(uid, active);
        was != self.is_uid_active(uid)
    }

    pub fn clear_override(&mut self, uid: u32) -> bool {
        let was = self.is_uid_active(uid);
        self.override_uids.remove(&uid);
        was != self.is_uid_active(uid)
    }
}

pub struct PolicyEngine {
    package_manager: Arc<dyn PackageManager>,
    permissions: Arc<dyn PermissionChecker>,
    app_ops: Arc<dyn AppOpsChecker>,
    pub uid: Mutex<UidPolicy>,
    sensor_privacy: AtomicBool,
    mic_toggle: AtomicBool,
    ht_restricted: AtomicBool,
    target_sdk_cache: Mutex<HashMap<String, Option<i32>>>,
}

impl PolicyEngine {
    pub fn new(
        package_manager: Arc<dyn PackageManager>,
        permissions: Arc<dyn PermissionChecker>,
        app_ops: Arc<dyn AppOpsChecker>,
    ) -> Self {
        Self {
            package_manager,
            permissions,
            app_ops,
            uid: Mutex::new(UidPolicy::default()),
            sensor_privacy: AtomicBool::new(false),
            mic_toggle: AtomicBool::new(false),
            ht_restricted: AtomicBool::new(true),
            target_sdk_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_uid_active(&self, uid: u32) -> bool {
        self.uid.lock().is_uid_active(uid)
    }

    pub fn sensor_privacy_enabled(&self) -> bool {
        self.sensor_privacy.load(Ordering::SeqCst)
    }

    pub fn set_sensor_privacy(&self, enabled: bool) {
        self.sensor_privacy.store(enabled, Ordering::SeqCst);
    }

    pub fn mic_toggle_enabled(&self) -> bool {
        self.mic_toggle.load(Ordering::SeqCst)
    }

    pub fn set_mic_toggle(&self, enabled: bool) {
        self.mic_toggle.store(enabled, Ordering::SeqCst);
    }

    pub fn ht_restricted(&self) -> bool {
        self.ht_restricted.load(Ordering::SeqCst)
    }

    pub fn set_ht_restricted(&self, restricted: bool) {
        self.ht_restricted.store(restricted, Ordering::SeqCst);
    }

    pub fn package_manager(&self) -> &dyn PackageManager {
        self.package_manager.as_ref()
    }

    pub fn check_caller_permission(&self, permission: &str, caller: &CallerIdentity) -> bool {
        self.permissions.check_permission(permission, caller.pid, caller.uid)
    }

    /// Target SDK lookups hit the package manager once per package; the
    /// cache is invalidated when a package reconnects.
    pub fn target_sdk(&self, package: &str) -> Option<i32> {
        let mut cache = self.target_sdk_cache.lock();
        if let Some(cached) = cache.get(package) {
            return *cached;
        }
        let sdk = self.package_manager.get_target_sdk_version(package);
        cache.insert(package.to_string(), sdk);
        sdk
    }

    pub fn reset_target_sdk_cache(&self, package: &str) {
        self.target_sdk_cache.lock().remove(package);
    }

    /// Permission and app-op gate for one sensor.
    pub fn can_access(
        &self,
        sensor: &SensorDescriptor,
        caller: &CallerIdentity,
        operation: &str,
    ) -> bool {
        if sensor.sensor_type == types::TYPE_HEAD_TRACKER
            && !caller.is_audio_server_or_system()
        {
            if self.ht_restricted() {
                tracing::warn!(
                    package = %caller.op_package,
                    sensor = %sensor.name,
                    operation,
                    "head-tracker sensor access denied outside the system"
                );
                return false;
            }
            tracing::info!(
                package = %caller.op_package,
                "permitting head-tracker access outside the system"
            );
        }

        if !sensor.requires_permission() {
            return true;
        }

        let target_sdk = self.target_sdk(&caller.op_package);
        let legacy_step = matches!(
            sensor.sensor_type,
            types::TYPE_STEP_COUNTER | types::TYPE_STEP_DETECTOR
        ) && target_sdk.is_some_and(|sdk| sdk > 0 && sdk <= TARGET_SDK_STEP_PERMISSION_CUTOFF);

        let allowed = if legacy_step || caller.is_system() {
            true
        } else if self.permissions.check_permission(
            &sensor.required_permission,
            caller.pid,
            caller.uid,
        ) {
            match sensor.required_app_op {
                Some(op) => {
                    self.app_ops.check_op(op, caller.uid, &caller.op_package) == AppOpMode::Allowed
                }
                None => true,
            }
        } else {
            false
        };

        if !allowed {
            tracing::warn!(
                package = %caller.op_package,
                sensor = %sensor.name,
                permission = %sensor.required_permission,
                operation,
                "sensor access denied"
            );
        }
        allowed
    }

    /// Whether the caller's sampling rate is capped: targets the modern SDK
    /// and lacks the high-sampling-rate permission.
    pub fn is_rate_capped(&self, caller: &CallerIdentity) -> bool {
        let Some(target_sdk) = self.target_sdk(&caller.op_package) else {
            return false;
        };
        if target_sdk < TARGET_SDK_RATE_CAP_START {
            return false;
        }
        !self.permissions.check_permission(PERMISSION_HIGH_SAMPLING_RATE, caller.pid, caller.uid)
    }

    /// Raises a too-fast sampling request to the cap. A debuggable package
    /// gets the violation surfaced instead of a silent clamp.
    pub fn adjust_sampling_period(
        &self,
        requested_period_ns: i64,
        caller: &CallerIdentity,
    ) -> SensorResult<i64> {
        if requested_period_ns >= CAPPED_SAMPLING_PERIOD_NS {
            return Ok(requested_period_ns);
        }
        if self.is_rate_capped(caller) {
            if self.package_manager.is_package_debuggable(&caller.op_package) {
                return Err(SensorServiceError::PermissionDenied);
            }
            return Ok(CAPPED_SAMPLING_PERIOD_NS);
        }
        if self.mic_toggle_enabled() {
            return Ok(CAPPED_SAMPLING_PERIOD_NS);
        }
        Ok(requested_period_ns)
    }

    /// The direct-channel analogue of [`Self::adjust_sampling_period`].
    pub fn adjust_rate_level(
        &self,
        requested: RateLevel,
        caller: &CallerIdentity,
    ) -> SensorResult<RateLevel> {
        if requested <= CAPPED_DIRECT_RATE_LEVEL {
            return Ok(requested);
        }
        if self.is_rate_capped(caller) {
            if self.package_manager.is_package_debuggable(&caller.op_package) {
                return Err(SensorServiceError::PermissionDenied);
            }
            return Ok(CAPPED_DIRECT_RATE_LEVEL);
        }
        if self.mic_toggle_enabled() {
            return Ok(CAPPED_DIRECT_RATE_LEVEL);
        }
        Ok(requested)
    }

    /// Uid-level access, before any operating-mode restriction.
    pub fn has_sensor_access(&self, uid: u32) -> bool {
        !self.sensor_privacy_enabled() && self.is_uid_active(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AllowAllAppOps, PermitAllPermissions};

    struct DenyAllPermissions;

    impl PermissionChecker for DenyAllPermissions {
        fn check_permission(&self, _permission: &str, _pid: i32, _uid: u32) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct StubPackages {
        target_sdk: Option<i32>,
        debuggable: bool,
    }

    impl PackageManager for StubPackages {
        fn get_package_uid(&self, _package: &str, _user_id: i32) -> Option<u32> {
            None
        }

        fn get_target_sdk_version(&self, _package: &str) -> Option<i32> {
            self.target_sdk
        }

        fn has_system_feature(&self, _feature: &str) -> bool {
            false
        }

        fn is_package_debuggable(&self, _package: &str) -> bool {
            self.debuggable
        }
    }

    fn engine(packages: StubPackages, grant_permissions: bool) -> PolicyEngine {
        let permissions: Arc<dyn PermissionChecker> = if grant_permissions {
            Arc::new(PermitAllPermissions)
        } else {
            Arc::new(DenyAllPermissions)
        };
        PolicyEngine::new(Arc::new(packages), permissions, Arc::new(AllowAllAppOps))
    }

    fn app_caller() -> CallerIdentity {
        CallerIdentity::new(10_100, 321, "com.example.app")
    }

    #[test]
    fn uid_policy_overrides_win() {
        let mut uid = UidPolicy::default();
        assert!(!uid.is_uid_active(10_100));
        uid.note_active(10_100);
        assert!(uid.is_uid_active(10_100));
        uid.set_override(10_100, false);
        assert!(!uid.is_uid_active(10_100));
        uid.clear_override(10_100);
        assert!(uid.is_uid_active(10_100));
    }

    #[test]
    fn system_uids_are_always_active() {
        let uid = UidPolicy::default();
        assert!(uid.is_uid_active(types::SYSTEM_UID));
    }

    #[test]
    fn sensor_without_permission_is_open() {
        let engine = engine(StubPackages::default(), false);
        let sensor = SensorDescriptor::new(1, types::TYPE_LIGHT, "light");
        assert!(engine.can_access(&sensor, &app_caller(), "enable"));
    }

    #[test]
    fn permission_gate_denies_without_grant() {
        let engine = engine(StubPackages::default(), false);
        let sensor = SensorDescriptor::new(1, types::TYPE_HEAD_TRACKER, "ht")
            .with_permission("BODY_SENSORS", true);
        assert!(!engine.can_access(&sensor, &app_caller(), "enable"));
    }

    #[test]
    fn head_tracker_restriction_can_be_lifted() {
        let engine = engine(StubPackages::default(), true);
        let sensor = SensorDescriptor::new(1, types::TYPE_HEAD_TRACKER, "ht");
        assert!(!engine.can_access(&sensor, &app_caller(), "enable"));
        engine.set_ht_restricted(false);
        assert!(engine.can_access(&sensor, &app_caller(), "enable"));
    }

    #[test]
    fn legacy_step_sensor_carveout() {
        let engine = engine(StubPackages { target_sdk: Some(28), debuggable: false }, false);
        let sensor = SensorDescriptor::new(1, types::TYPE_STEP_COUNTER, "steps")
            .with_permission("ACTIVITY_RECOGNITION", true);
        assert!(engine.can_access(&sensor, &app_caller(), "enable"));
    }

    #[test]
    fn modern_sdk_without_permission_is_rate_capped() {
        let engine = engine(StubPackages { target_sdk: Some(34), debuggable: false }, false);
        assert!(engine.is_rate_capped(&app_caller()));
        assert_eq!(
            engine.adjust_sampling_period(1_000_000, &app_caller()),
            Ok(CAPPED_SAMPLING_PERIOD_NS)
        );
    }

    #[test]
    fn debuggable_rate_cap_violation_is_surfaced() {
        let engine = engine(StubPackages { target_sdk: Some(34), debuggable: true }, false);
        assert_eq!(
            engine.adjust_sampling_period(1_000_000, &app_caller()),
            Err(SensorServiceError::PermissionDenied)
        );
    }

    #[test]
    fn mic_toggle_caps_everyone() {
        let engine = engine(StubPackages { target_sdk: Some(30), debuggable: false }, true);
        assert_eq!(engine.adjust_sampling_period(1_000_000, &app_caller()), Ok(1_000_000));
        engine.set_mic_toggle(true);
        assert_eq!(
            engine.adjust_sampling_period(1_000_000, &app_caller()),
            Ok(CAPPED_SAMPLING_PERIOD_NS)
        );
        assert_eq!(
            engine.adjust_rate_level(RateLevel::VeryFast, &app_caller()),
            Ok(CAPPED_DIRECT_RATE_LEVEL)
        );
    }

    #[test]
    fn slow_requests_pass_untouched() {
        let engine = engine(StubPackages { target_sdk: Some(34), debuggable: true }, false);
        assert_eq!(
            engine.adjust_sampling_period(CAPPED_SAMPLING_PERIOD_NS, &app_caller()),
            Ok(CAPPED_SAMPLING_PERIOD_NS)
        );
        assert_eq!(engine.adjust_rate_level(RateLevel::Normal, &app_caller()), Ok(RateLevel::Normal));
    }
}
