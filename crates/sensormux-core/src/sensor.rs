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

//! Sensor identity and static capabilities.

use serde::Serialize;

use crate::types::SensorHandle;

/// Hardware-reported sensor uuid. All zeros means "uuid unsupported"; all
/// ones means "identify by type and name".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SensorUuid(pub [u8; 16]);

impl SensorUuid {
    pub const ZERO: SensorUuid = SensorUuid([0; 16]);
    pub const ALL_ONES: SensorUuid = SensorUuid([0xFF; 16]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn is_all_ones(&self) -> bool {
        self.0.iter().all(|b| *b == 0xFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReportingMode {
    Continuous,
    OnChange,
    OneShot,
    Special,
}

/// Static description of one sensor: identity plus capabilities. The
/// per-request dynamic state (subscriptions, rates) lives elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescriptor {
    pub handle: SensorHandle,
    pub sensor_type: i32,
    pub name: String,
    pub vendor: String,
    pub version: i32,
    pub reporting_mode: ReportingMode,
    pub min_delay_ns: i64,
    pub max_delay_ns: i64,
    pub fifo_reserved_event_count: u32,
    pub fifo_max_event_count: u32,
    pub required_permission: String,
    pub permission_is_runtime: bool,
    pub required_app_op: Option<i32>,
    pub is_wake_up: bool,
    pub is_dynamic: bool,
    pub uuid: SensorUuid,
    /// Anonymized per-app id substituted for the uuid when listing sensors;
    /// zero until derived.
    pub id: i32,
}

impl SensorDescriptor {
    pub fn new(handle: SensorHandle, sensor_type: i32, name: &str) -> Self {
        Self {
            handle,
            sensor_type,
            name: name.to_string(),
            vendor: String::new(),
            version: 1,
            reporting_mode: ReportingMode::Continuous,
            min_delay_ns: 0,
            max_delay_ns: 0,
            fifo_reserved_event_count: 0,
            fifo_max_event_count: 0,
            required_permission: String::new(),
            permission_is_runtime: false,
            required_app_op: None,
            is_wake_up: false,
            is_dynamic: false,
            uuid: SensorUuid::ZERO,
            id: 0,
        }
    }

    pub fn with_reporting_mode(mut self, mode: ReportingMode) -> Self {
        self.reporting_mode = mode;
        self
    }

    pub fn with_delays(mut self, min_delay_ns: i64, max_delay_ns: i64) -> Self {
        self.min_delay_ns = min_delay_ns;
        self.max_delay_ns = max_delay_ns;
        self
    }

    pub fn with_fifo(mut self, reserved: u32, max: u32) -> Self {
        self.fifo_reserved_event_count = reserved;
        self.fifo_max_event_count = max;
        self
    }

    pub fn with_permission(mut self, permission: &str, runtime: bool) -> Self {
        self.required_permission = permission.to_string();
        self.permission_is_runtime = runtime;
        self
    }

    pub fn with_app_op(mut self, op: i32) -> Self {
        self.required_app_op = Some(op);
        self
    }

    pub fn with_wake_up(mut self, wake_up: bool) -> Self {
        self.is_wake_up = wake_up;
        self
    }

    pub fn with_uuid(mut self, uuid: SensorUuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn as_dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self
    }

    pub fn requires_permission(&self) -> bool {
        !self.required_permission.is_empty()
    }

    /// Clamps a requested sampling period into the sensor's supported range.
    pub fn clamp_period(&self, period_ns: i64) -> i64 {
        let mut period = period_ns;
        if self.max_delay_ns > 0 && period > self.max_delay_ns {
            period = self.max_delay_ns;
        }
        if period < self.min_delay_ns {
            period = self.min_delay_ns;
        }
        period
    }

    /// Raises the advertised minimum delay for rate-capped callers.
    pub fn cap_min_delay(&mut self, floor_ns: i64) {
        if self.min_delay_ns < floor_ns {
            self.min_delay_ns = floor_ns;
        }
    }

    /// Zeroes the uuid before the descriptor is exposed to a caller that
    /// must not see stable hardware identifiers.
    pub fn anonymize_uuid(&mut self) {
        self.uuid = SensorUuid::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;

    #[test]
    fn clamp_period_respects_both_bounds() {
        let sensor = SensorDescriptor::new(1, types::TYPE_ACCELEROMETER, "accel")
            .with_delays(10_000_000, 100_000_000);
        assert_eq!(sensor.clamp_period(5_000_000), 10_000_000);
        assert_eq!(sensor.clamp_period(50_000_000), 50_000_000);
        assert_eq!(sensor.clamp_period(500_000_000), 100_000_000);
    }

    #[test]
    fn clamp_period_ignores_unset_max() {
        let sensor =
            SensorDescriptor::new(1, types::TYPE_LIGHT, "light").with_delays(1_000_000, 0);
        assert_eq!(sensor.clamp_period(i64::MAX), i64::MAX);
    }

    #[test]
    fn cap_min_delay_only_raises() {
        let mut sensor = SensorDescriptor::new(1, types::TYPE_GYROSCOPE, "gyro")
            .with_delays(2_000_000, 100_000_000);
        sensor.cap_min_delay(5_000_000);
        assert_eq!(sensor.min_delay_ns, 5_000_000);
        sensor.cap_min_delay(1_000_000);
        assert_eq!(sensor.min_delay_ns, 5_000_000);
    }

    #[test]
    fn uuid_sentinels() {
        assert!(SensorUuid::ZERO.is_zero());
        assert!(SensorUuid::ALL_ONES.is_all_ones());
        assert!(!SensorUuid([1; 16]).is_zero());
    }
}
