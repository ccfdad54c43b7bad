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

//! Per-client event connection.
//!
//! A connection owns the service side of a local datagram pair, its
//! subscription map, the pending-flush and first-flush bookkeeping, the
//! wake-event refcount, and a bounded park-and-retry cache for a slow
//! client. Everything here is guarded by the connection's own lock; the
//! service's outer lock is never taken from inside it.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use sensormux_core::event::{self, FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK, WIRE_EVENT_SIZE};
use sensormux_core::types::SensorHandle;
use sensormux_core::{SensorEvent, SensorResult, SensorServiceError};

use crate::collaborators::{AppOpMode, AppOpsChecker};
use crate::holder::ConnectionId;
use crate::service::SensorService;

#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    pub sampling_period_ns: i64,
    pub max_batch_latency_ns: i64,
    pub app_op: Option<i32>,
    pub one_shot: bool,
    pub first_flush_pending: bool,
    pub pending_flush_count: u32,
}

#[derive(Default)]
struct ConnectionState {
    subscriptions: HashMap<SensorHandle, Subscription>,
    cache: VecDeque<SensorEvent>,
    wake_lock_ref_count: u32,
    events_sent: u64,
    events_dropped: u64,
    destroyed: bool,
}

pub struct SensorEventConnection {
    id: ConnectionId,
    uid: u32,
    pid: i32,
    package_name: String,
    op_package: String,
    data_injection: bool,
    socket: UnixDatagram,
    cache_capacity: usize,
    app_ops: Arc<dyn AppOpsChecker>,
    service: Weak<SensorService>,
    state: Mutex<ConnectionState>,
}

impl SensorEventConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnectionId,
        uid: u32,
        pid: i32,
        package_name: String,
        op_package: String,
        data_injection: bool,
        socket: UnixDatagram,
        cache_capacity: usize,
        app_ops: Arc<dyn AppOpsChecker>,
        service: Weak<SensorService>,
    ) -> Self {
        Self {
            id,
            uid,
            pid,
            package_name,
            op_package,
            data_injection,
            socket,
            cache_capacity: cache_capacity.max(1),
            app_ops,
            service,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn op_package(&self) -> &str {
        &self.op_package
    }

    pub fn is_data_injection(&self) -> bool {
        self.data_injection
    }

    fn service(&self) -> SensorResult<Arc<SensorService>> {
        self.service.upgrade().ok_or(SensorServiceError::NoInit)
    }

    // Client-facing surface.

    pub fn enable(
        self: &Arc<Self>,
        handle: SensorHandle,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
    ) -> SensorResult<()> {
        self.service()?.enable(self, handle, sampling_period_ns, max_batch_latency_ns)
    }

    pub fn disable(self: &Arc<Self>, handle: SensorHandle) -> SensorResult<()> {
        self.service()?.disable(self, handle)
    }

    pub fn set_event_rate(
        self: &Arc<Self>,
        handle: SensorHandle,
        sampling_period_ns: i64,
    ) -> SensorResult<()> {
        self.service()?.set_event_rate(self, handle, sampling_period_ns)
    }

    pub fn flush(self: &Arc<Self>) -> SensorResult<()> {
        self.service()?.flush(self)
    }

    pub fn inject_sensor_data(self: &Arc<Self>, event: &SensorEvent) -> SensorResult<()> {
        self.service()?.inject_sensor_data_for_connection(self, event)
    }

    /// Out-of-band acknowledgement of delivered wake-up events.
    pub fn ack_wake_up_events(self: &Arc<Self>, count: u32) {
        {
            let mut state = self.state.lock();
            state.wake_lock_ref_count = state.wake_lock_ref_count.saturating_sub(count);
        }
        if let Some(service) = self.service.upgrade() {
            service.note_wake_ack();
        }
    }

    /// Idempotent teardown: drops subscriptions, deactivates sensors left
    /// without subscribers, and removes the connection from the holder.
    pub fn destroy(self: &Arc<Self>) {
        if std::mem::replace(&mut self.state.lock().destroyed, true) {
            return;
        }
        if let Some(service) = self.service.upgrade() {
            service.cleanup_event_connection(self);
        }
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }

    // Subscription bookkeeping, driven by the service under its own lock.

    pub(crate) fn add_sensor(
        &self,
        handle: SensorHandle,
        sampling_period_ns: i64,
        max_batch_latency_ns: i64,
        app_op: Option<i32>,
        one_shot: bool,
    ) -> bool {
        let mut state = self.state.lock();
        match state.subscriptions.entry(handle) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let sub = entry.get_mut();
                sub.sampling_period_ns = sampling_period_ns;
                sub.max_batch_latency_ns = max_batch_latency_ns;
                false
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Subscription {
                    sampling_period_ns,
                    max_batch_latency_ns,
                    app_op,
                    one_shot,
                    first_flush_pending: false,
                    pending_flush_count: 0,
                });
                true
            }
        }
    }

    pub(crate) fn remove_sensor(&self, handle: SensorHandle) -> bool {
        self.state.lock().subscriptions.remove(&handle).is_some()
    }

    pub fn has_sensor(&self, handle: SensorHandle) -> bool {
        self.state.lock().subscriptions.contains_key(&handle)
    }

    pub fn has_any_sensor(&self) -> bool {
        !self.state.lock().subscriptions.is_empty()
    }

    pub(crate) fn has_one_shot_sensors(&self) -> bool {
        self.state.lock().subscriptions.values().any(|sub| sub.one_shot)
    }

    pub fn active_sensor_handles(&self) -> Vec<SensorHandle> {
        self.state.lock().subscriptions.keys().copied().collect()
    }

    pub(crate) fn sampling_period_of(&self, handle: SensorHandle) -> Option<i64> {
        self.state.lock().subscriptions.get(&handle).map(|sub| sub.sampling_period_ns)
    }

    pub(crate) fn update_sampling_period(&self, handle: SensorHandle, sampling_period_ns: i64) {
        if let Some(sub) = self.state.lock().subscriptions.get_mut(&handle) {
            sub.sampling_period_ns = sampling_period_ns;
        }
    }

    pub(crate) fn set_first_flush_pending(&self, handle: SensorHandle, pending: bool) {
        if let Some(sub) = self.state.lock().subscriptions.get_mut(&handle) {
            sub.first_flush_pending = pending;
        }
    }

    pub(crate) fn add_pending_flush(&self, handle: SensorHandle) {
        if let Some(sub) = self.state.lock().subscriptions.get_mut(&handle) {
            sub.pending_flush_count += 1;
        }
    }

    /// One-shot subscriptions triggered by this batch, for auto-disable.
    pub(crate) fn triggered_one_shot_handles(&self, events: &[SensorEvent]) -> Vec<SensorHandle> {
        let state = self.state.lock();
        let mut handles: Vec<SensorHandle> = events
            .iter()
            .filter(|event| !event.is_flush_complete())
            .map(SensorEvent::source_handle)
            .filter(|handle| {
                state.subscriptions.get(handle).is_some_and(|sub| sub.one_shot)
            })
            .collect();
        handles.dedup();
        handles
    }

    pub fn needs_wake_lock(&self) -> bool {
        self.state.lock().wake_lock_ref_count > 0
    }

    pub(crate) fn reset_wake_lock_ref_count(&self) {
        self.state.lock().wake_lock_ref_count = 0;
    }

    /// Delivers the filtered slice of a dispatch batch to this client.
    ///
    /// `flush_destinations` runs parallel to `events`; a flush-complete
    /// marker is delivered only to the connection the matching `flush`
    /// call is owed to.
    pub(crate) fn send_events(
        &self,
        events: &[SensorEvent],
        flush_destinations: &[Option<ConnectionId>],
    ) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        for (i, event) in events.iter().enumerate() {
            let deliver = if event.is_flush_complete() {
                if flush_destinations.get(i).copied().flatten() != Some(self.id) {
                    continue;
                }
                if let Some(sub) = state.subscriptions.get_mut(&event.source_handle()) {
                    sub.pending_flush_count = sub.pending_flush_count.saturating_sub(1);
                    sub.first_flush_pending = false;
                }
                true
            } else {
                match state.subscriptions.get(&event.sensor) {
                    None => false,
                    Some(sub) if sub.first_flush_pending => false,
                    Some(sub) => match sub.app_op {
                        Some(op) => {
                            self.app_ops.check_op(op, self.uid, &self.op_package)
                                == AppOpMode::Allowed
                        }
                        None => true,
                    },
                }
            };
            if deliver {
                self.deliver_locked(&mut state, event);
            }
        }
    }

    /// Pushes a single synthesized event (on-change replay, virtual flush
    /// completion) to the client.
    pub(crate) fn send_one_event(&self, event: &SensorEvent) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        self.deliver_locked(&mut state, event);
    }

    fn deliver_locked(&self, state: &mut ConnectionState, event: &SensorEvent) {
        if event.flags & FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK != 0 {
            state.wake_lock_ref_count += 1;
        }
        self.drain_cache_locked(state);
        if state.cache.is_empty() && self.try_write(event) {
            state.events_sent += 1;
        } else {
            self.park_in_cache_locked(state, event.clone());
        }
    }

    fn drain_cache_locked(&self, state: &mut ConnectionState) {
        while let Some(front) = state.cache.front() {
            if self.try_write(front) {
                state.cache.pop_front();
                state.events_sent += 1;
            } else {
                break;
            }
        }
    }

    /// Bounded cache; a full cache drops the oldest non-wake event first.
    fn park_in_cache_locked(&self, state: &mut ConnectionState, event: SensorEvent) {
        if state.cache.len() >= self.cache_capacity {
            let victim = state
                .cache
                .iter()
                .position(|cached| cached.flags & FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK == 0)
                .unwrap_or(0);
            if let Some(dropped) = state.cache.remove(victim) {
                if dropped.flags & FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK != 0 {
                    // The client will never see this wake event; stop
                    // charging the wakelock for it.
                    state.wake_lock_ref_count = state.wake_lock_ref_count.saturating_sub(1);
                }
                state.events_dropped += 1;
                tracing::debug!(
                    connection = self.id,
                    sensor = dropped.sensor,
                    "client cache full, dropped oldest event"
                );
            }
        }
        state.cache.push_back(event);
    }

    fn try_write(&self, event: &SensorEvent) -> bool {
        match self.socket.send(&event::encode(event)) {
            Ok(_) => true,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(err) => {
                tracing::debug!(connection = self.id, error = %err, "client socket write failed");
                false
            }
        }
    }

    pub(crate) fn dump_text(&self, out: &mut String) {
        let state = self.state.lock();
        let _ = writeln!(
            out,
            "  uid={} pid={} package={} wake_refs={} sent={} dropped={} cached={}{}",
            self.uid,
            self.pid,
            self.package_name,
            state.wake_lock_ref_count,
            state.events_sent,
            state.events_dropped,
            state.cache.len(),
            if self.data_injection { " (data-injection)" } else { "" },
        );
        for (handle, sub) in &state.subscriptions {
            let _ = writeln!(
                out,
                "    handle=0x{handle:08x} period={}ns latency={}ns pending_flush={} first_flush_pending={}",
                sub.sampling_period_ns,
                sub.max_batch_latency_ns,
                sub.pending_flush_count,
                sub.first_flush_pending,
            );
        }
    }

    pub(crate) fn dump_json(&self) -> serde_json::Value {
        let state = self.state.lock();
        serde_json::json!({
            "id": self.id,
            "uid": self.uid,
            "pid": self.pid,
            "package": self.package_name,
            "data_injection": self.data_injection,
            "wake_lock_ref_count": state.wake_lock_ref_count,
            "events_sent": state.events_sent,
            "events_dropped": state.events_dropped,
            "cached": state.cache.len(),
            "subscriptions": state
                .subscriptions
                .iter()
                .map(|(handle, sub)| {
                    serde_json::json!({
                        "handle": handle,
                        "sampling_period_ns": sub.sampling_period_ns,
                        "max_batch_latency_ns": sub.max_batch_latency_ns,
                        "pending_flush_count": sub.pending_flush_count,
                        "first_flush_pending": sub.first_flush_pending,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

/// Client half of an event connection: a blocking receiver over the local
/// datagram pair.
pub struct ClientEventReceiver {
    socket: UnixDatagram,
}

impl ClientEventReceiver {
    pub(crate) fn new(socket: UnixDatagram) -> Self {
        Self { socket }
    }

    /// Blocks up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SensorEvent> {
        self.socket.set_read_timeout(Some(timeout)).ok()?;
        let mut buf = [0_u8; WIRE_EVENT_SIZE];
        match self.socket.recv(&mut buf) {
            Ok(n) => event::decode(&buf[..n]),
            Err(_) => None,
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<SensorEvent> {
        self.socket.set_nonblocking(true).ok()?;
        let mut buf = [0_u8; WIRE_EVENT_SIZE];
        let result = self.socket.recv(&mut buf);
        let _ = self.socket.set_nonblocking(false);
        match result {
            Ok(n) => event::decode(&buf[..n]),
            Err(_) => None,
        }
    }
}
