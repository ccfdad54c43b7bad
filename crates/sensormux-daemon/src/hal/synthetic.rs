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

//! A scriptable in-process HAL.
//!
//! Events are fed in from the outside and drained by the dispatch thread's
//! `poll`. Every driver-facing call is recorded so tests can assert on the
//! exact traffic; failure injection knobs cover the unwind paths. The
//! development binary uses it as a stand-in driver.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::{Condvar, Mutex};

use sensormux_core::sensor::SensorDescriptor;
use sensormux_core::types::SensorHandle;
use sensormux_core::SensorEvent;

use super::{DirectMemoryDescriptor, HalError, HalMode, HalResult, RateLevel, SensorHal};
use crate::collaborators::UidState;
use crate::holder::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCall {
    pub handle: SensorHandle,
    pub sampling_period_ns: i64,
    pub max_batch_latency_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectConfigCall {
    pub channel: i32,
    pub sensor: SensorHandle,
    pub rate: RateLevel,
}

#[derive(Debug, Default)]
struct Inner {
    sensors: Vec<SensorDescriptor>,
    queue: VecDeque<SensorEvent>,
    activations: HashMap<SensorHandle, bool>,
    batch_calls: Vec<BatchCall>,
    flush_calls: Vec<SensorHandle>,
    injected: Vec<SensorEvent>,
    set_mode_calls: Vec<HalMode>,
    wake_lock_handled_total: u32,
    direct_channels: HashSet<i32>,
    next_channel: i32,
    direct_configs: Vec<DirectConfigCall>,
    dynamic_handles: Vec<SensorHandle>,
    dynamic_connection_calls: Vec<(SensorHandle, bool)>,
    uid_state_calls: Vec<(ConnectionId, UidState)>,
    enable_all_calls: u32,
    disable_all_calls: u32,
    reconnect_calls: u32,
    dead: bool,
    reconnecting: bool,
    closed: bool,
    auto_flush_complete: bool,
    auto_timestamp_ns: i64,
    fail_batch: HashSet<SensorHandle>,
    fail_activate: HashSet<SensorHandle>,
    fail_flush: HashSet<SensorHandle>,
    fail_set_mode: bool,
    fail_direct_register: bool,
}

pub struct SyntheticHal {
    inner: Mutex<Inner>,
    poll_cv: Condvar,
}

impl SyntheticHal {
    pub fn new(sensors: Vec<SensorDescriptor>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sensors,
                next_channel: 1,
                auto_flush_complete: true,
                // Flush markers synthesized here sort after scripted samples.
                auto_timestamp_ns: 1 << 40,
                ..Inner::default()
            }),
            poll_cv: Condvar::new(),
        }
    }

    /// Queues events for the next poll and wakes the dispatch thread.
    pub fn push_events(&self, events: Vec<SensorEvent>) {
        let mut inner = self.inner.lock();
        inner.queue.extend(events);
        self.poll_cv.notify_all();
    }

    pub fn push_event(&self, event: SensorEvent) {
        self.push_events(vec![event]);
    }

    /// Drops the driver connection. With `reconnecting` the service is
    /// expected to run its reconnection protocol.
    pub fn make_dead(&self, reconnecting: bool) {
        let mut inner = self.inner.lock();
        inner.dead = true;
        inner.reconnecting = reconnecting;
        self.poll_cv.notify_all();
    }

    /// Permanently unblocks poll so the dispatch thread can exit.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.poll_cv.notify_all();
    }

    pub fn set_auto_flush_complete(&self, enabled: bool) {
        self.inner.lock().auto_flush_complete = enabled;
    }

    pub fn set_dynamic_handles(&self, handles: Vec<SensorHandle>) {
        self.inner.lock().dynamic_handles = handles;
    }

    pub fn fail_batch_for(&self, handle: SensorHandle) {
        self.inner.lock().fail_batch.insert(handle);
    }

    pub fn fail_activate_for(&self, handle: SensorHandle) {
        self.inner.lock().fail_activate.insert(handle);
    }

    pub fn fail_flush_for(&self, handle: SensorHandle) {
        self.inner.lock().fail_flush.insert(handle);
    }

    pub fn fail_set_mode(&self, fail: bool) {
        self.inner.lock().fail_set_mode = fail;
    }

    pub fn fail_direct_register(&self, fail: bool) {
        self.inner.lock().fail_direct_register = fail;
    }

    // Recorded-traffic accessors.

    pub fn activation(&self, handle: SensorHandle) -> bool {
        self.inner.lock().activations.get(&handle).copied().unwrap_or(false)
    }

    pub fn batch_calls(&self) -> Vec<BatchCall> {
        self.inner.lock().batch_calls.clone()
    }

    pub fn flush_calls(&self) -> Vec<SensorHandle> {
        self.inner.lock().flush_calls.clone()
    }

    pub fn injected(&self) -> Vec<SensorEvent> {
        self.inner.lock().injected.clone()
    }

    pub fn set_mode_calls(&self) -> Vec<HalMode> {
        self.inner.lock().set_mode_calls.clone()
    }

    pub fn wake_lock_handled_total(&self) -> u32 {
        self.inner.lock().wake_lock_handled_total
    }

    pub fn direct_configs(&self) -> Vec<DirectConfigCall> {
        self.inner.lock().direct_configs.clone()
    }

    pub fn has_direct_channel(&self, channel: i32) -> bool {
        self.inner.lock().direct_channels.contains(&channel)
    }

    pub fn dynamic_connection_calls(&self) -> Vec<(SensorHandle, bool)> {
        self.inner.lock().dynamic_connection_calls.clone()
    }

    pub fn enable_all_calls(&self) -> u32 {
        self.inner.lock().enable_all_calls
    }

    pub fn disable_all_calls(&self) -> u32 {
        self.inner.lock().disable_all_calls
    }

    pub fn reconnect_calls(&self) -> u32 {
        self.inner.lock().reconnect_calls
    }

    pub fn uid_state_calls(&self) -> Vec<(ConnectionId, UidState)> {
        self.inner.lock().uid_state_calls.clone()
    }
}

impl SensorHal for SyntheticHal {
    fn init_check(&self) -> HalResult<()> {
        Ok(())
    }

    fn sensor_list(&self) -> Vec<SensorDescriptor> {
        self.inner.lock().sensors.clone()
    }

    fn poll(&self, max_events: usize) -> HalResult<Vec<SensorEvent>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.dead || inner.closed {
                return Err(HalError::DeadObject);
            }
            if !inner.queue.is_empty() {
                break;
            }
            self.poll_cv.wait(&mut inner);
        }
        let n = inner.queue.len().min(max_events.max(1));
        Ok(inner.queue.drain(..n).collect())
    }

    fn activate(&self, handle: SensorHandle, enabled: bool) -> HalResult<()> {
        let mut inner = self.inner.lock();
        if enabled && inner.fail_activate.contains(&handle) {
            return Err(HalError::Transaction);
        }
        inner.activations.insert(handle, enabled);
        Ok(())
    }

    fn batch(
        &self,
        handle: SensorHandle,
        _flags: u32,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
    ) -> HalResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_batch.contains(&handle) {
            return Err(HalError::BadValue);
        }
        inner.batch_calls.push(BatchCall { handle, sampling_period_ns, max_batch_latency_ns });
        Ok(())
    }

    fn flush(&self, handle: SensorHandle) -> HalResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_flush.contains(&handle) {
            return Err(HalError::Unsupported);
        }
        inner.flush_calls.push(handle);
        if inner.auto_flush_complete {
            inner.auto_timestamp_ns += 1;
            let ts = inner.auto_timestamp_ns;
            inner.queue.push_back(SensorEvent::flush_complete(handle, ts));
            self.poll_cv.notify_all();
        }
        Ok(())
    }

    fn inject_sensor_data(&self, event: &SensorEvent) -> HalResult<()> {
        self.inner.lock().injected.push(event.clone());
        Ok(())
    }

    fn set_mode(&self, mode: HalMode) -> HalResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_set_mode {
            return Err(HalError::Unsupported);
        }
        inner.set_mode_calls.push(mode);
        Ok(())
    }

    fn write_wake_lock_handled(&self, count: u32) {
        self.inner.lock().wake_lock_handled_total += count;
    }

    fn register_direct_channel(&self, _mem: &DirectMemoryDescriptor) -> HalResult<i32> {
        let mut inner = self.inner.lock();
        if inner.fail_direct_register {
            return Err(HalError::Transaction);
        }
        let channel = inner.next_channel;
        inner.next_channel += 1;
        inner.direct_channels.insert(channel);
        Ok(channel)
    }

    fn configure_direct_channel(
        &self,
        channel: i32,
        sensor: SensorHandle,
        rate: RateLevel,
    ) -> HalResult<i32> {
        let mut inner = self.inner.lock();
        if !inner.direct_channels.contains(&channel) {
            return Err(HalError::BadValue);
        }
        inner.direct_configs.push(DirectConfigCall { channel, sensor, rate });
        Ok(channel)
    }

    fn unregister_direct_channel(&self, channel: i32) -> HalResult<()> {
        self.inner.lock().direct_channels.remove(&channel);
        Ok(())
    }

    fn handle_dynamic_sensor_connection(&self, handle: SensorHandle, connected: bool) {
        let mut inner = self.inner.lock();
        inner.dynamic_connection_calls.push((handle, connected));
        if !connected {
            inner.dynamic_handles.retain(|h| *h != handle);
        }
    }

    fn is_reconnecting(&self) -> bool {
        self.inner.lock().reconnecting
    }

    fn reconnect(&self) {
        let mut inner = self.inner.lock();
        inner.reconnect_calls += 1;
        inner.dead = false;
        inner.reconnecting = false;
    }

    fn get_dynamic_sensor_handles(&self) -> Vec<SensorHandle> {
        self.inner.lock().dynamic_handles.clone()
    }

    fn enable_all_sensors(&self) {
        self.inner.lock().enable_all_calls += 1;
    }

    fn disable_all_sensors(&self) {
        self.inner.lock().disable_all_calls += 1;
    }

    fn set_uid_state_for_connection(&self, connection: ConnectionId, state: UidState) {
        self.inner.lock().uid_state_calls.push((connection, state));
    }

    fn is_sensor_active(&self, handle: SensorHandle) -> bool {
        self.activation(handle)
    }
}
