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

//! Shared-memory direct channels.
//!
//! Events for a direct connection bypass the event socket entirely: the
//! HAL (or the runtime-sensor backend) writes into client-supplied shared
//! memory. The service only manages the lifecycle and the configured
//! rates. Two independent backup sets support the pause/resume discipline
//! (restricted mode, idle uid, sensor privacy) and the microphone-toggle
//! rate cap; they compose and are restored independently.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use sensormux_core::types::SensorHandle;
use sensormux_core::{SensorResult, SensorServiceError};

use crate::hal::{DirectMemoryDescriptor, RateLevel, CAPPED_DIRECT_RATE_LEVEL};
use crate::holder::ConnectionId;
use crate::service::SensorService;

/// Applies one rate change on the channel's backend (HAL or runtime
/// callback). Invoked with the connection lock held.
pub(crate) type RateSink<'a> = &'a dyn Fn(SensorHandle, RateLevel) -> SensorResult<i32>;

#[derive(Default)]
struct DirectState {
    activated: HashMap<SensorHandle, RateLevel>,
    activated_backup: HashMap<SensorHandle, RateLevel>,
    mic_rate_backup: HashMap<SensorHandle, RateLevel>,
    destroyed: bool,
}

pub struct SensorDirectConnection {
    id: ConnectionId,
    uid: u32,
    pid: i32,
    op_package: String,
    device_id: i32,
    mem: DirectMemoryDescriptor,
    channel_handle: i32,
    service: Weak<SensorService>,
    state: Mutex<DirectState>,
}

impl SensorDirectConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnectionId,
        uid: u32,
        pid: i32,
        op_package: String,
        device_id: i32,
        mem: DirectMemoryDescriptor,
        channel_handle: i32,
        service: Weak<SensorService>,
    ) -> Self {
        Self {
            id,
            uid,
            pid,
            op_package,
            device_id,
            mem,
            channel_handle,
            service,
            state: Mutex::new(DirectState::default()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn op_package(&self) -> &str {
        &self.op_package
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn channel_handle(&self) -> i32 {
        self.channel_handle
    }

    pub(crate) fn memory(&self) -> &DirectMemoryDescriptor {
        &self.mem
    }

    pub fn is_equivalent(&self, mem: &DirectMemoryDescriptor) -> bool {
        self.mem.is_equivalent(mem)
    }

    /// Configures the report rate for one sensor on this channel. Returns
    /// the backend's report token. `handle` of -1 with `Stop` stops every
    /// active sensor on the channel.
    pub fn configure_channel(
        self: &Arc<Self>,
        handle: SensorHandle,
        rate: RateLevel,
    ) -> SensorResult<i32> {
        let service = self.service.upgrade().ok_or(SensorServiceError::NoInit)?;
        service.configure_direct_channel(self, handle, rate)
    }

    /// Idempotent teardown; unregisters the channel from its backend and
    /// drops the connection from the holder.
    pub fn destroy(self: &Arc<Self>) {
        if std::mem::replace(&mut self.state.lock().destroyed, true) {
            return;
        }
        if let Some(service) = self.service.upgrade() {
            service.cleanup_direct_connection(self);
        }
    }

    pub fn current_rates(&self) -> HashMap<SensorHandle, RateLevel> {
        self.state.lock().activated.clone()
    }

    pub fn backup_rates(&self) -> HashMap<SensorHandle, RateLevel> {
        self.state.lock().activated_backup.clone()
    }

    pub(crate) fn record_rate(&self, handle: SensorHandle, rate: RateLevel) {
        let mut state = self.state.lock();
        if rate == RateLevel::Stop {
            state.activated.remove(&handle);
            state.mic_rate_backup.remove(&handle);
        } else {
            state.activated.insert(handle, rate);
        }
    }

    /// Stops every active sensor without keeping a backup.
    pub(crate) fn stop_all(&self, sink: RateSink<'_>) {
        let mut state = self.state.lock();
        for handle in state.activated.keys().copied().collect::<Vec<_>>() {
            let _ = sink(handle, RateLevel::Stop);
        }
        state.activated.clear();
        state.activated_backup.clear();
        state.mic_rate_backup.clear();
    }

    /// Stops every active sensor, remembering rates for [`Self::resume_all`].
    /// A second pause while already paused is a no-op.
    pub(crate) fn pause_all(&self, sink: RateSink<'_>) {
        let mut state = self.state.lock();
        if state.activated.is_empty() {
            return;
        }
        let taken = std::mem::take(&mut state.activated);
        for handle in taken.keys().copied() {
            let _ = sink(handle, RateLevel::Stop);
        }
        state.activated_backup = taken;
    }

    /// Restores rates saved by [`Self::pause_all`].
    pub(crate) fn resume_all(&self, sink: RateSink<'_>) {
        let mut state = self.state.lock();
        if state.activated_backup.is_empty() {
            return;
        }
        let restored = std::mem::take(&mut state.activated_backup);
        for (handle, rate) in &restored {
            let _ = sink(*handle, *rate);
        }
        state.activated = restored;
    }

    /// Applies the microphone-toggle cap: rates above the cap are reduced
    /// with the originals saved to the mic backup. Applies to whichever of
    /// the live or paused set currently holds the rates.
    pub(crate) fn cap_rates(&self, sink: RateSink<'_>) {
        let mut state = self.state.lock();
        let paused = state.activated.is_empty() && !state.activated_backup.is_empty();
        let rates = if paused { &mut state.activated_backup } else { &mut state.activated };
        let mut saved = Vec::new();
        for (handle, rate) in rates.iter_mut() {
            if *rate > CAPPED_DIRECT_RATE_LEVEL {
                saved.push((*handle, *rate));
                *rate = CAPPED_DIRECT_RATE_LEVEL;
                if !paused {
                    let _ = sink(*handle, CAPPED_DIRECT_RATE_LEVEL);
                }
            }
        }
        state.mic_rate_backup.extend(saved);
    }

    /// Reverses [`Self::cap_rates`].
    pub(crate) fn uncap_rates(&self, sink: RateSink<'_>) {
        let mut state = self.state.lock();
        let backup = std::mem::take(&mut state.mic_rate_backup);
        for (handle, rate) in backup {
            if state.activated.contains_key(&handle) {
                state.activated.insert(handle, rate);
                let _ = sink(handle, rate);
            } else if state.activated_backup.contains_key(&handle) {
                state.activated_backup.insert(handle, rate);
            }
        }
    }

    pub(crate) fn dump_text(&self, out: &mut String) {
        let state = self.state.lock();
        let _ = writeln!(
            out,
            "  uid={} pid={} package={} device={} channel={} size={}",
            self.uid, self.pid, self.op_package, self.device_id, self.channel_handle, self.mem.size,
        );
        for (handle, rate) in &state.activated {
            let _ = writeln!(out, "    handle=0x{handle:08x} rate={rate:?}");
        }
        for (handle, rate) in &state.activated_backup {
            let _ = writeln!(out, "    handle=0x{handle:08x} rate={rate:?} (paused)");
        }
    }

    pub(crate) fn dump_json(&self) -> serde_json::Value {
        let state = self.state.lock();
        let rates = |map: &HashMap<SensorHandle, RateLevel>| {
            map.iter()
                .map(|(handle, rate)| {
                    serde_json::json!({ "handle": handle, "rate": format!("{rate:?}") })
                })
                .collect::<Vec<_>>()
        };
        serde_json::json!({
            "id": self.id,
            "uid": self.uid,
            "package": self.op_package,
            "device_id": self.device_id,
            "channel": self.channel_handle,
            "size": self.mem.size,
            "rates": rates(&state.activated),
            "paused_rates": rates(&state.activated_backup),
        })
    }
}
