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

//! Per-handle last-value cache.
//!
//! Backs on-change replay for new subscribers and the privileged dump. An
//! entry can be marked stale when its sensor is re-activated, so that a
//! value produced during a previous activation is never replayed.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::event::SensorEvent;
use crate::types::{self, SensorHandle};

#[derive(Debug)]
struct RecentEntry {
    last: SensorEvent,
    stale: bool,
    total: u64,
}

#[derive(Debug, Default)]
pub struct RecentEventLog {
    entries: HashMap<SensorHandle, RecentEntry>,
}

impl RecentEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample. Bookkeeping events (flush markers, dynamic-sensor
    /// meta, additional info) are not samples and are ignored.
    pub fn record(&mut self, event: &SensorEvent) {
        if types::is_bookkeeping_type(event.event_type) {
            return;
        }
        let entry = self.entries.entry(event.sensor).or_insert_with(|| RecentEntry {
            last: event.clone(),
            stale: false,
            total: 0,
        });
        entry.last = event.clone();
        entry.stale = false;
        entry.total += 1;
    }

    pub fn mark_stale(&mut self, handle: SensorHandle) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.stale = true;
        }
    }

    /// The last value for `handle`, unless it predates the current
    /// activation.
    pub fn last_if_current(&self, handle: SensorHandle) -> Option<SensorEvent> {
        self.entries.get(&handle).filter(|entry| !entry.stale).map(|entry| entry.last.clone())
    }

    pub fn remove(&mut self, handle: SensorHandle) {
        self.entries.remove(&handle);
    }

    pub fn has_entry(&self, handle: SensorHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// One dump line per recorded sensor; sample values are masked for
    /// callers without access to the sensor's data.
    pub fn dump_line(&self, handle: SensorHandle, masked: bool) -> Option<String> {
        let entry = self.entries.get(&handle)?;
        let mut line = String::new();
        let _ = write!(
            line,
            "last={} ts={} total={}",
            if entry.stale { "stale" } else { "current" },
            entry.last.timestamp_ns,
            entry.total,
        );
        if masked {
            line.push_str(" data=<masked>");
        } else {
            let _ = write!(line, " data={:?}", entry.last.values());
        }
        Some(line)
    }
}
