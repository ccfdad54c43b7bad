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

//! The driver boundary.
//!
//! [`SensorHal`] is the opaque contract the dispatch engine is written
//! against. [`synthetic::SyntheticHal`] is a scriptable in-process
//! implementation used by the development binary and the integration
//! tests.

pub mod synthetic;

use std::io;
use std::os::fd::OwnedFd;

use thiserror::Error;

use sensormux_core::sensor::SensorDescriptor;
use sensormux_core::types::SensorHandle;
use sensormux_core::SensorEvent;

use crate::collaborators::UidState;
use crate::holder::ConnectionId;

pub type HalResult<T> = Result<T, HalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HalError {
    /// The driver connection dropped; poll callers must consult
    /// [`SensorHal::is_reconnecting`] before treating this as fatal.
    #[error("hal connection dead")]
    DeadObject,

    #[error("hal transaction failed")]
    Transaction,

    #[error("operation not supported by this hal")]
    Unsupported,

    #[error("hal rejected argument")]
    BadValue,
}

/// Modes the HAL itself understands. Replay-style injection is a service
/// posture and never reaches the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalMode {
    Normal,
    DataInjection,
}

/// Direct-channel report rate grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RateLevel {
    Stop,
    Normal,
    Fast,
    VeryFast,
}

/// Rate grade ceiling applied while the caller is rate capped.
pub const CAPPED_DIRECT_RATE_LEVEL: RateLevel = RateLevel::Normal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectFormat {
    /// The fixed wire event layout; the only supported format.
    SensorsEvent,
}

#[derive(Debug)]
pub enum DirectMemoryKind {
    /// Anonymous shared memory backed by a file descriptor.
    Ashmem(OwnedFd),
    /// Graphics allocator buffer, identified by an opaque token.
    GraphicsBuffer { token: u64 },
}

/// Client-supplied shared memory for a direct channel.
#[derive(Debug)]
pub struct DirectMemoryDescriptor {
    pub kind: DirectMemoryKind,
    pub format: DirectFormat,
    /// Size the client claims; validated against the backing region.
    pub size: usize,
}

impl DirectMemoryDescriptor {
    /// Duplicates the descriptor, cloning any owned native handle. The
    /// clone has independent lifetime and is what the service stores.
    pub fn duplicate(&self) -> io::Result<Self> {
        let kind = match &self.kind {
            DirectMemoryKind::Ashmem(fd) => DirectMemoryKind::Ashmem(fd.try_clone()?),
            DirectMemoryKind::GraphicsBuffer { token } => {
                DirectMemoryKind::GraphicsBuffer { token: *token }
            }
        };
        Ok(Self { kind, format: self.format, size: self.size })
    }

    /// Actual size of the backing region, when the kind allows inspection.
    pub fn region_size(&self) -> io::Result<u64> {
        match &self.kind {
            DirectMemoryKind::Ashmem(fd) => {
                let file = std::fs::File::from(fd.try_clone()?);
                Ok(file.metadata()?.len())
            }
            DirectMemoryKind::GraphicsBuffer { .. } => Ok(self.size as u64),
        }
    }

    /// Whether two descriptors name the same underlying memory.
    pub fn is_equivalent(&self, other: &DirectMemoryDescriptor) -> bool {
        match (&self.kind, &other.kind) {
            (DirectMemoryKind::Ashmem(a), DirectMemoryKind::Ashmem(b)) => {
                same_region(a, b).unwrap_or(false)
            }
            (
                DirectMemoryKind::GraphicsBuffer { token: a },
                DirectMemoryKind::GraphicsBuffer { token: b },
            ) => a == b,
            _ => false,
        }
    }
}

#[cfg(unix)]
fn same_region(a: &OwnedFd, b: &OwnedFd) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let meta_a = std::fs::File::from(a.try_clone()?).metadata()?;
    let meta_b = std::fs::File::from(b.try_clone()?).metadata()?;
    Ok(meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino())
}

#[cfg(not(unix))]
fn same_region(_a: &OwnedFd, _b: &OwnedFd) -> io::Result<bool> {
    Ok(false)
}

/// The hardware abstraction layer, as seen by the service.
///
/// `poll` blocks on the dispatch thread. Every other operation is expected
/// to return promptly; the service calls them with its outer lock held.
pub trait SensorHal: Send + Sync {
    fn init_check(&self) -> HalResult<()>;
    fn sensor_list(&self) -> Vec<SensorDescriptor>;
    fn poll(&self, max_events: usize) -> HalResult<Vec<SensorEvent>>;
    fn activate(&self, handle: SensorHandle, enabled: bool) -> HalResult<()>;
    fn batch(
        &self,
        handle: SensorHandle,
        flags: u32,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
    ) -> HalResult<()>;
    fn flush(&self, handle: SensorHandle) -> HalResult<()>;
    fn inject_sensor_data(&self, event: &SensorEvent) -> HalResult<()>;
    fn set_mode(&self, mode: HalMode) -> HalResult<()>;
    /// Tells the driver how many wake-up events the service has taken
    /// responsibility for, so it can release its own wakelock.
    fn write_wake_lock_handled(&self, count: u32);
    fn register_direct_channel(&self, mem: &DirectMemoryDescriptor) -> HalResult<i32>;
    fn configure_direct_channel(
        &self,
        channel: i32,
        sensor: SensorHandle,
        rate: RateLevel,
    ) -> HalResult<i32>;
    fn unregister_direct_channel(&self, channel: i32) -> HalResult<()>;
    fn handle_dynamic_sensor_connection(&self, handle: SensorHandle, connected: bool);
    fn is_reconnecting(&self) -> bool;
    fn reconnect(&self);
    fn get_dynamic_sensor_handles(&self) -> Vec<SensorHandle>;
    fn enable_all_sensors(&self);
    fn disable_all_sensors(&self);
    fn set_uid_state_for_connection(&self, connection: ConnectionId, state: UidState);
    fn is_sensor_active(&self, handle: SensorHandle) -> bool;
}

/// User-space backend for sensors of one runtime device. Configuration and
/// direct-channel requests for runtime sensors are forwarded here instead
/// of the HAL.
pub trait RuntimeSensorCallback: Send + Sync {
    fn on_configuration_changed(
        &self,
        handle: SensorHandle,
        enabled: bool,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
    ) -> Result<(), sensormux_core::SensorServiceError>;
    fn on_direct_channel_created(
        &self,
        mem: &DirectMemoryDescriptor,
    ) -> Result<i32, sensormux_core::SensorServiceError>;
    fn on_direct_channel_configured(
        &self,
        channel: i32,
        sensor: SensorHandle,
        rate: RateLevel,
    ) -> Result<i32, sensormux_core::SensorServiceError>;
    fn on_direct_channel_destroyed(&self, channel: i32);
}
