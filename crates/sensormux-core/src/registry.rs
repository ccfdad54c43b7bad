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

//! The sensor catalog.
//!
//! Handles are allocated once for the lifetime of the process. Removing a
//! sensor retires its handle; a later `add` with the same handle is
//! rejected so that stale subscriptions can never alias a new sensor.

use std::collections::{BTreeMap, HashSet};

use crate::sensor::SensorDescriptor;
use crate::types::{SensorHandle, DEFAULT_DEVICE_ID};

#[derive(Debug, Clone)]
pub struct SensorEntry {
    pub descriptor: SensorDescriptor,
    pub device_id: i32,
    pub is_debug: bool,
    pub is_virtual: bool,
}

#[derive(Debug, Default)]
pub struct SensorRegistry {
    entries: BTreeMap<SensorHandle, SensorEntry>,
    retired: HashSet<SensorHandle>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sensor under its descriptor handle. Fails when the handle is
    /// live or was ever used before.
    pub fn add(
        &mut self,
        descriptor: SensorDescriptor,
        is_debug: bool,
        is_virtual: bool,
        device_id: i32,
    ) -> bool {
        let handle = descriptor.handle;
        if !self.is_new_handle(handle) {
            return false;
        }
        self.entries.insert(handle, SensorEntry { descriptor, device_id, is_debug, is_virtual });
        true
    }

    /// Removes a sensor and retires its handle for good.
    pub fn remove(&mut self, handle: SensorHandle) -> bool {
        if self.entries.remove(&handle).is_some() {
            self.retired.insert(handle);
            true
        } else {
            false
        }
    }

    /// True when `handle` has never been registered in this process.
    pub fn is_new_handle(&self, handle: SensorHandle) -> bool {
        !self.entries.contains_key(&handle) && !self.retired.contains(&handle)
    }

    pub fn lookup(&self, handle: SensorHandle) -> Option<&SensorEntry> {
        self.entries.get(&handle)
    }

    pub fn descriptor(&self, handle: SensorHandle) -> Option<&SensorDescriptor> {
        self.entries.get(&handle).map(|entry| &entry.descriptor)
    }

    pub fn for_each<F: FnMut(&SensorEntry) -> bool>(&self, mut f: F) {
        for entry in self.entries.values() {
            if !f(entry) {
                break;
            }
        }
    }

    pub fn has_any_sensor(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sensors exposed to ordinary clients: everything not marked debug.
    pub fn user_sensors(&self) -> Vec<SensorDescriptor> {
        self.entries
            .values()
            .filter(|entry| !entry.is_debug)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Sensors exposed when the debug knob is set: the full catalog.
    pub fn user_debug_sensors(&self) -> Vec<SensorDescriptor> {
        self.entries.values().map(|entry| entry.descriptor.clone()).collect()
    }

    pub fn dynamic_sensors(&self) -> Vec<SensorDescriptor> {
        self.entries
            .values()
            .filter(|entry| entry.descriptor.is_dynamic)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn device_sensors(&self, device_id: i32) -> Vec<SensorDescriptor> {
        self.entries
            .values()
            .filter(|entry| entry.device_id == device_id)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn device_id_of(&self, handle: SensorHandle) -> i32 {
        self.entries.get(&handle).map_or(DEFAULT_DEVICE_ID, |entry| entry.device_id)
    }

    pub fn device_has_sensors(&self, device_id: i32) -> bool {
        self.entries.values().any(|entry| entry.device_id == device_id)
    }

    pub fn name_of(&self, handle: SensorHandle) -> String {
        self.entries
            .get(&handle)
            .map_or_else(|| format!("unknown(0x{handle:08x})"), |e| e.descriptor.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::ReportingMode;
    use crate::types;
    use proptest::prelude::*;

    fn accel(handle: SensorHandle) -> SensorDescriptor {
        SensorDescriptor::new(handle, types::TYPE_ACCELEROMETER, "accel")
    }

    #[test]
    fn add_rejects_live_and_retired_handles() {
        let mut registry = SensorRegistry::new();
        assert!(registry.add(accel(1), false, false, 0));
        assert!(!registry.add(accel(1), false, false, 0));
        assert!(registry.remove(1));
        assert!(!registry.is_new_handle(1));
        assert!(!registry.add(accel(1), false, false, 0), "retired handle must not be reused");
    }

    #[test]
    fn remove_of_unknown_handle_fails() {
        let mut registry = SensorRegistry::new();
        assert!(!registry.remove(17));
    }

    #[test]
    fn debug_sensors_are_hidden_from_user_listing() {
        let mut registry = SensorRegistry::new();
        registry.add(accel(1), false, false, 0);
        registry.add(
            SensorDescriptor::new(2, types::TYPE_GYROSCOPE, "gyro-debug"),
            true,
            true,
            0,
        );
        assert_eq!(registry.user_sensors().len(), 1);
        assert_eq!(registry.user_debug_sensors().len(), 2);
    }

    #[test]
    fn device_views_partition_by_device_id() {
        let mut registry = SensorRegistry::new();
        registry.add(accel(1), false, false, 0);
        registry.add(
            SensorDescriptor::new(0x5F00_0000, types::TYPE_LIGHT, "remote-light")
                .with_reporting_mode(ReportingMode::OnChange),
            false,
            false,
            7,
        );
        assert_eq!(registry.device_sensors(7).len(), 1);
        assert_eq!(registry.device_id_of(0x5F00_0000), 7);
        assert_eq!(registry.device_id_of(1), types::DEFAULT_DEVICE_ID);
        assert!(registry.device_has_sensors(7));
        registry.remove(0x5F00_0000);
        assert!(!registry.device_has_sensors(7));
    }

    proptest! {
        #[test]
        fn successful_adds_never_collide(handles in proptest::collection::vec(any::<i32>(), 1..64)) {
            let mut registry = SensorRegistry::new();
            let mut accepted = Vec::new();
            for handle in handles {
                if registry.add(accel(handle), false, false, 0) {
                    accepted.push(handle);
                }
            }
            let unique: std::collections::HashSet<_> = accepted.iter().copied().collect();
            prop_assert_eq!(unique.len(), accepted.len());
        }
    }
}
