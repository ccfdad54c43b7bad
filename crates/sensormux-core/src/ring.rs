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

//! Bounded ring of recent subscription changes, kept for forensic dumping.

use std::fmt;
use std::time::SystemTime;

use crate::error::SensorServiceError;
use crate::types::SensorHandle;

pub const DEFAULT_RING_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    pub recorded_at: SystemTime,
    pub package: String,
    pub handle: SensorHandle,
    pub sampling_period_ns: i64,
    pub max_batch_latency_ns: i64,
    pub activated: bool,
    pub result: Result<(), SensorServiceError>,
}

impl fmt::Display for RegistrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let age = self.recorded_at.elapsed().map(|d| d.as_secs()).unwrap_or(0);
        let outcome = match &self.result {
            Ok(()) => "ok".to_string(),
            Err(err) => err.to_string(),
        };
        if self.activated {
            write!(
                f,
                "{}s ago: + handle=0x{:08x} pkg={} period={}ns latency={}ns ({outcome})",
                age, self.handle, self.package, self.sampling_period_ns, self.max_batch_latency_ns,
            )
        } else {
            write!(f, "{}s ago: - handle=0x{:08x} pkg={} ({outcome})", age, self.handle, self.package)
        }
    }
}

/// Fixed-capacity ring; empty slots hold a sentinel (`None`) until the ring
/// wraps for the first time.
#[derive(Debug)]
pub struct RegistrationRing {
    slots: Vec<Option<RegistrationRecord>>,
    next: usize,
}

impl RegistrationRing {
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![None; capacity.max(1)], next: 0 }
    }

    pub fn push(&mut self, record: RegistrationRecord) {
        let slot_count = self.slots.len();
        self.slots[self.next] = Some(record);
        self.next = (self.next + 1) % slot_count;
    }

    /// Records in reverse-chronological order, skipping sentinel slots.
    pub fn iter_recent_first(&self) -> impl Iterator<Item = &RegistrationRecord> {
        let slot_count = self.slots.len();
        (1..=slot_count)
            .map(move |back| &self.slots[(self.next + slot_count - back) % slot_count])
            .filter_map(|slot| slot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handle: SensorHandle) -> RegistrationRecord {
        RegistrationRecord {
            recorded_at: SystemTime::now(),
            package: "com.example.app".to_string(),
            handle,
            sampling_period_ns: 20_000_000,
            max_batch_latency_ns: 0,
            activated: true,
            result: Ok(()),
        }
    }

    #[test]
    fn iterates_recent_first_and_skips_sentinels() {
        let mut ring = RegistrationRing::new(4);
        ring.push(record(1));
        ring.push(record(2));
        let handles: Vec<_> = ring.iter_recent_first().map(|r| r.handle).collect();
        assert_eq!(handles, vec![2, 1]);
    }

    #[test]
    fn wraps_and_overwrites_oldest() {
        let mut ring = RegistrationRing::new(3);
        for handle in 1..=5 {
            ring.push(record(handle));
        }
        let handles: Vec<_> = ring.iter_recent_first().map(|r| r.handle).collect();
        assert_eq!(handles, vec![5, 4, 3]);
    }

    #[test]
    fn failed_registrations_render_their_error() {
        let mut failed = record(9);
        failed.result = Err(SensorServiceError::PermissionDenied);
        let line = failed.to_string();
        assert!(line.contains("permission denied"));
    }
}
