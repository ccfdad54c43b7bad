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

//! Diagnostic dump rendering.
//!
//! The service assembles a [`DumpSnapshot`] under its lock; rendering to
//! the human-readable text form or the `--proto` machine-readable JSON
//! form happens afterwards, off the lock.

use std::fmt::Write as _;

use sensormux_core::sensor::SensorDescriptor;
use sensormux_core::types::SensorHandle;

use crate::service::OperatingMode;

pub(crate) struct DumpSnapshot {
    pub sensors: Vec<(SensorDescriptor, bool, i32)>,
    pub fusion_initialized: bool,
    pub fusion_orientation: [f32; 4],
    pub recent_lines: Vec<(String, String)>,
    pub active_sensors: Vec<(String, SensorHandle, usize)>,
    pub socket_buffer_bytes: usize,
    pub socket_buffer_events: usize,
    pub wake_lock_acquired: bool,
    pub operating_mode: OperatingMode,
    pub allow_listed_package: String,
    pub sensor_privacy: bool,
    pub event_connections: Vec<(String, serde_json::Value)>,
    pub direct_connections: Vec<(String, serde_json::Value)>,
    pub registrations: Vec<String>,
}

impl DumpSnapshot {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str("Sensor List:\n");
        for (sensor, is_virtual, device_id) in &self.sensors {
            let _ = writeln!(
                out,
                "  0x{:08x} {:<40} type={:<3} mode={:?}{}{}{}",
                sensor.handle,
                sensor.name,
                sensor.sensor_type,
                sensor.reporting_mode,
                if sensor.is_wake_up { " wake-up" } else { "" },
                if *is_virtual { " virtual" } else { "" },
                if *device_id != 0 { " runtime" } else { "" },
            );
        }

        out.push_str("Fusion State:\n");
        let q = self.fusion_orientation;
        let _ = writeln!(
            out,
            "  {} q=[{:.4}, {:.4}, {:.4}, {:.4}]",
            if self.fusion_initialized { "initialized" } else { "uninitialized" },
            q[0],
            q[1],
            q[2],
            q[3],
        );

        out.push_str("Recent Sensor Events:\n");
        for (name, line) in &self.recent_lines {
            let _ = writeln!(out, "  {name}: {line}");
        }

        out.push_str("Active Sensors:\n");
        for (name, handle, connections) in &self.active_sensors {
            let _ = writeln!(out, "  {name} (handle=0x{handle:08x}, connections={connections})");
        }

        let _ = writeln!(
            out,
            "Socket Buffer Size = {} bytes ({} events)",
            self.socket_buffer_bytes, self.socket_buffer_events
        );
        let _ = writeln!(
            out,
            "WakeLock Status: {}",
            if self.wake_lock_acquired { "acquired" } else { "not held" }
        );
        if self.operating_mode == OperatingMode::Normal {
            let _ = writeln!(out, "Mode: NORMAL");
        } else {
            let _ = writeln!(
                out,
                "Mode: {} : {}",
                self.operating_mode.label(),
                self.allow_listed_package
            );
        }
        let _ = writeln!(
            out,
            "Sensor Privacy: {}",
            if self.sensor_privacy { "enabled" } else { "disabled" }
        );

        let _ = writeln!(out, "{} open event connections", self.event_connections.len());
        for (i, (text, _)) in self.event_connections.iter().enumerate() {
            let _ = writeln!(out, "Connection {i}:");
            out.push_str(text);
        }
        let _ = writeln!(out, "{} open direct connections", self.direct_connections.len());
        for (i, (text, _)) in self.direct_connections.iter().enumerate() {
            let _ = writeln!(out, "Direct connection {i}:");
            out.push_str(text);
        }

        out.push_str("Previous Registrations:\n");
        for line in &self.registrations {
            let _ = writeln!(out, "  {line}");
        }
        out
    }

    pub fn render_json(&self) -> String {
        let value = serde_json::json!({
            "sensors": self
                .sensors
                .iter()
                .map(|(sensor, is_virtual, device_id)| {
                    serde_json::json!({
                        "descriptor": sensor,
                        "virtual": is_virtual,
                        "device_id": device_id,
                    })
                })
                .collect::<Vec<_>>(),
            "fusion": {
                "initialized": self.fusion_initialized,
                "orientation": self.fusion_orientation,
            },
            "recent_events": self
                .recent_lines
                .iter()
                .map(|(name, line)| serde_json::json!({ "sensor": name, "entry": line }))
                .collect::<Vec<_>>(),
            "active_sensors": self
                .active_sensors
                .iter()
                .map(|(name, handle, connections)| {
                    serde_json::json!({
                        "name": name,
                        "handle": handle,
                        "connections": connections,
                    })
                })
                .collect::<Vec<_>>(),
            "socket_buffer_bytes": self.socket_buffer_bytes,
            "socket_buffer_events": self.socket_buffer_events,
            "wake_lock_acquired": self.wake_lock_acquired,
            "operating_mode": self.operating_mode.label(),
            "allow_listed_package": self.allow_listed_package,
            "sensor_privacy": self.sensor_privacy,
            "event_connections": self
                .event_connections
                .iter()
                .map(|(_, json)| json.clone())
                .collect::<Vec<_>>(),
            "direct_connections": self
                .direct_connections
                .iter()
                .map(|(_, json)| json.clone())
                .collect::<Vec<_>>(),
            "previous_registrations": self.registrations,
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }
}
