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

//! Opaque platform collaborators.
//!
//! The service talks to the package manager, the permission and app-op
//! services, the privacy manager, the wakelock primitive and the thread
//! scheduler through these seams. Production wires platform
//! implementations; the bundled ones are permissive defaults for
//! development and tests.

use std::sync::Arc;

use sensormux_core::types::{AUDIO_SERVER_UID, SYSTEM_UID};

pub const PERMISSION_DUMP: &str = "DUMP";
pub const PERMISSION_MANAGE_SENSORS: &str = "MANAGE_SENSORS";
pub const PERMISSION_HIGH_SAMPLING_RATE: &str = "HIGH_SAMPLING_RATE_SENSORS";
pub const PERMISSION_LOCATION_HARDWARE: &str = "LOCATION_HARDWARE";

pub const FEATURE_AUTOMOTIVE: &str = "hardware.type.automotive";

/// Who is calling. Produced by the transport layer; the core treats it as
/// authoritative.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub uid: u32,
    pub pid: i32,
    /// Package the connection is attributed to.
    pub package: String,
    /// Package checked against app-ops; usually equal to `package`.
    pub op_package: String,
}

impl CallerIdentity {
    pub fn new(uid: u32, pid: i32, package: &str) -> Self {
        Self { uid, pid, package: package.to_string(), op_package: package.to_string() }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_UID, 0, "system")
    }

    pub fn is_system(&self) -> bool {
        self.uid == SYSTEM_UID
    }

    pub fn is_audio_server_or_system(&self) -> bool {
        self.uid == SYSTEM_UID || self.uid == AUDIO_SERVER_UID
    }

    /// Privileged callers see unmasked dump data and raw uuids.
    pub fn is_privileged(&self) -> bool {
        self.uid == 0
    }
}

pub trait PackageManager: Send + Sync {
    fn get_package_uid(&self, package: &str, user_id: i32) -> Option<u32>;
    fn get_target_sdk_version(&self, package: &str) -> Option<i32>;
    fn has_system_feature(&self, feature: &str) -> bool;
    fn is_package_debuggable(&self, package: &str) -> bool;
}

pub trait PermissionChecker: Send + Sync {
    fn check_permission(&self, permission: &str, pid: i32, uid: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppOpMode {
    Allowed,
    Ignored,
    Errored,
}

pub trait AppOpsChecker: Send + Sync {
    fn check_op(&self, op: i32, uid: u32, package: &str) -> AppOpMode;
}

/// The system suspend-blocker. Acquisition must be idempotent per name.
pub trait WakeLock: Send + Sync {
    fn acquire(&self, name: &str);
    fn release(&self, name: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyToggle {
    AllSensors,
    Microphone,
}

pub trait PrivacyListener: Send + Sync {
    fn on_privacy_changed(&self, toggle: PrivacyToggle, enabled: bool);
}

pub trait PrivacyManager: Send + Sync {
    fn is_sensor_privacy_enabled(&self) -> bool;
    fn is_mic_toggle_enabled(&self) -> bool;
    fn add_listener(&self, listener: Arc<dyn PrivacyListener>);
}

/// Raises the dispatch thread to realtime scheduling once it is running.
pub trait SchedulingPolicy: Send + Sync {
    fn elevate_dispatch_thread(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidState {
    Active,
    Idle,
}

// Bundled permissive defaults.

/// Grants every permission; suitable for development images only.
#[derive(Debug, Default)]
pub struct PermitAllPermissions;

impl PermissionChecker for PermitAllPermissions {
    fn check_permission(&self, _permission: &str, _pid: i32, _uid: u32) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct AllowAllAppOps;

impl AppOpsChecker for AllowAllAppOps {
    fn check_op(&self, _op: i32, _uid: u32, _package: &str) -> AppOpMode {
        AppOpMode::Allowed
    }
}

/// Package manager with no package database: every lookup misses and no
/// feature is declared.
#[derive(Debug, Default)]
pub struct EmptyPackageManager;

impl PackageManager for EmptyPackageManager {
    fn get_package_uid(&self, _package: &str, _user_id: i32) -> Option<u32> {
        None
    }

    fn get_target_sdk_version(&self, _package: &str) -> Option<i32> {
        None
    }

    fn has_system_feature(&self, _feature: &str) -> bool {
        false
    }

    fn is_package_debuggable(&self, _package: &str) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self, name: &str) {
        tracing::debug!(name, "wakelock acquire (noop)");
    }

    fn release(&self, name: &str) {
        tracing::debug!(name, "wakelock release (noop)");
    }
}

#[derive(Debug, Default)]
pub struct DisabledPrivacyManager;

impl PrivacyManager for DisabledPrivacyManager {
    fn is_sensor_privacy_enabled(&self) -> bool {
        false
    }

    fn is_mic_toggle_enabled(&self) -> bool {
        false
    }

    fn add_listener(&self, _listener: Arc<dyn PrivacyListener>) {}
}

/// Logs instead of elevating; platform images install a real policy.
#[derive(Debug, Default)]
pub struct LogOnlySchedulingPolicy;

impl SchedulingPolicy for LogOnlySchedulingPolicy {
    fn elevate_dispatch_thread(&self) {
        tracing::debug!("dispatch thread elevation not available on this build");
    }
}
