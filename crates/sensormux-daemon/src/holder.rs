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

//! Connection bookkeeping.
//!
//! The holder owns the strong references; everything else refers to a
//! connection by its numeric id. It lives inside the service's outer lock,
//! and `snapshot_*` is the only way state crosses out of the critical
//! section: fanout iterates the snapshot without the lock held.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::SensorEventConnection;
use crate::direct::SensorDirectConnection;

/// Process-unique connection id. Ids are never reused.
pub type ConnectionId = u64;

#[derive(Default)]
pub struct ConnectionHolder {
    event_connections: BTreeMap<ConnectionId, Arc<SensorEventConnection>>,
    direct_connections: BTreeMap<ConnectionId, Arc<SensorDirectConnection>>,
}

impl ConnectionHolder {
    pub fn add_event_connection_if_not_present(&mut self, connection: &Arc<SensorEventConnection>) {
        self.event_connections.entry(connection.id()).or_insert_with(|| Arc::clone(connection));
    }

    pub fn remove_event_connection(&mut self, id: ConnectionId) {
        self.event_connections.remove(&id);
    }

    pub fn add_direct_connection(&mut self, connection: &Arc<SensorDirectConnection>) {
        self.direct_connections.insert(connection.id(), Arc::clone(connection));
    }

    pub fn remove_direct_connection(&mut self, id: ConnectionId) {
        self.direct_connections.remove(&id);
    }

    /// Strong references to the live event connections, safe to use after
    /// the outer lock is dropped.
    pub fn snapshot_event_connections(&self) -> Vec<Arc<SensorEventConnection>> {
        self.event_connections.values().cloned().collect()
    }

    pub fn snapshot_direct_connections(&self) -> Vec<Arc<SensorDirectConnection>> {
        self.direct_connections.values().cloned().collect()
    }

    pub fn event_connection_count(&self) -> usize {
        self.event_connections.len()
    }

    pub fn direct_connection_count(&self) -> usize {
        self.direct_connections.len()
    }
}
