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

//! Sensor events and the fixed-layout wire codec.
//!
//! Every subscriber receives events as fixed-size records over a local
//! datagram stream; one record per datagram, [`WIRE_EVENT_SIZE`] bytes,
//! little-endian fields.

use crate::sensor::{SensorDescriptor, SensorUuid};
use crate::types::{self, SensorHandle};

/// Set on delivered wake-up sensor events; the client must acknowledge
/// receipt before the service may release the wakelock on its behalf.
pub const FLAG_WAKE_UP_SENSOR_EVENT_NEEDS_ACK: u32 = 1;

/// Number of payload value slots in a data event.
pub const EVENT_DATA_SLOTS: usize = 16;

/// Size of one encoded event record.
pub const WIRE_EVENT_SIZE: usize = 104;

const WIRE_VERSION: u32 = 1;
const META_DATA_FLUSH_COMPLETE: u32 = 1;
const ADDITIONAL_INFO_VALUE_SLOTS: usize = 13;

// Additional-info payload kinds.
pub const AINFO_BEGIN: i32 = 0x0;
pub const AINFO_END: i32 = 0x1;
pub const AINFO_LOCAL_GEOMAGNETIC_FIELD: i32 = 0x3_0000;
pub const AINFO_LOCAL_GRAVITY: i32 = 0x3_0001;
pub const AINFO_DOCK_STATE: i32 = 0x3_0002;
pub const AINFO_HIGH_PERFORMANCE_MODE: i32 = 0x3_0003;
pub const AINFO_MAGNETIC_FIELD_CALIBRATION: i32 = 0x3_0004;
pub const AINFO_CUSTOM_START: i32 = 0x1000_0000;
pub const AINFO_DEBUGGING_START: i32 = 0x4000_0000;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorEvent {
    pub sensor: SensorHandle,
    pub event_type: i32,
    pub timestamp_ns: i64,
    pub flags: u32,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// A sample; up to [`EVENT_DATA_SLOTS`] values, unused slots zero.
    Data([f32; EVENT_DATA_SLOTS]),
    /// Flush-complete marker for `sensor`.
    MetaData { sensor: SensorHandle },
    /// Dynamic sensor connect/disconnect announcement.
    DynamicSensorMeta {
        connected: bool,
        handle: SensorHandle,
        uuid: SensorUuid,
        /// Present only on the connect announcement coming out of the HAL;
        /// never carried over the client wire.
        descriptor: Option<Box<SensorDescriptor>>,
    },
    AdditionalInfo {
        kind: i32,
        serial: i32,
        values: AdditionalInfoValues,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdditionalInfoValues {
    Floats(Vec<f32>),
    Ints(Vec<i32>),
}

impl SensorEvent {
    pub fn data(sensor: SensorHandle, event_type: i32, timestamp_ns: i64, values: &[f32]) -> Self {
        let mut slots = [0.0_f32; EVENT_DATA_SLOTS];
        for (slot, value) in slots.iter_mut().zip(values) {
            *slot = *value;
        }
        Self { sensor, event_type, timestamp_ns, flags: 0, payload: EventPayload::Data(slots) }
    }

    pub fn flush_complete(sensor: SensorHandle, timestamp_ns: i64) -> Self {
        Self {
            sensor: 0,
            event_type: types::TYPE_META_DATA,
            timestamp_ns,
            flags: 0,
            payload: EventPayload::MetaData { sensor },
        }
    }

    pub fn dynamic_sensor_meta(
        meta_sensor: SensorHandle,
        timestamp_ns: i64,
        connected: bool,
        handle: SensorHandle,
        uuid: SensorUuid,
        descriptor: Option<Box<SensorDescriptor>>,
    ) -> Self {
        Self {
            sensor: meta_sensor,
            event_type: types::TYPE_DYNAMIC_SENSOR_META,
            timestamp_ns,
            flags: 0,
            payload: EventPayload::DynamicSensorMeta { connected, handle, uuid, descriptor },
        }
    }

    /// The sensor this event is attributed to for routing purposes. For a
    /// flush-complete marker that is the flushed sensor, not the meta
    /// pseudo-sensor.
    pub fn source_handle(&self) -> SensorHandle {
        match &self.payload {
            EventPayload::MetaData { sensor } => *sensor,
            _ => self.sensor,
        }
    }

    pub fn is_flush_complete(&self) -> bool {
        self.event_type == types::TYPE_META_DATA
    }

    pub fn values(&self) -> &[f32] {
        match &self.payload {
            EventPayload::Data(slots) => slots,
            _ => &[],
        }
    }
}

/// Stable in-place sort by timestamp; events with equal timestamps keep
/// their arrival order.
pub fn sort_by_timestamp(events: &mut [SensorEvent]) {
    events.sort_by_key(|event| event.timestamp_ns);
}

pub fn encode(event: &SensorEvent) -> [u8; WIRE_EVENT_SIZE] {
    let mut buf = [0_u8; WIRE_EVENT_SIZE];
    buf[0..4].copy_from_slice(&WIRE_VERSION.to_le_bytes());
    buf[4..8].copy_from_slice(&event.sensor.to_le_bytes());
    buf[8..12].copy_from_slice(&event.event_type.to_le_bytes());
    buf[12..16].copy_from_slice(&event.flags.to_le_bytes());
    buf[16..24].copy_from_slice(&event.timestamp_ns.to_le_bytes());
    let body = &mut buf[24..88];
    match &event.payload {
        EventPayload::Data(slots) => {
            for (i, value) in slots.iter().enumerate() {
                body[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
        EventPayload::MetaData { sensor } => {
            body[0..4].copy_from_slice(&META_DATA_FLUSH_COMPLETE.to_le_bytes());
            body[4..8].copy_from_slice(&sensor.to_le_bytes());
        }
        EventPayload::DynamicSensorMeta { connected, handle, uuid, .. } => {
            body[0] = u8::from(*connected);
            body[4..8].copy_from_slice(&handle.to_le_bytes());
            body[8..24].copy_from_slice(&uuid.0);
        }
        EventPayload::AdditionalInfo { kind, serial, values } => {
            body[0..4].copy_from_slice(&kind.to_le_bytes());
            body[4..8].copy_from_slice(&serial.to_le_bytes());
            match values {
                AdditionalInfoValues::Floats(floats) => {
                    body[8] = floats.len().min(ADDITIONAL_INFO_VALUE_SLOTS) as u8;
                    body[9] = 1;
                    for (i, v) in floats.iter().take(ADDITIONAL_INFO_VALUE_SLOTS).enumerate() {
                        body[12 + i * 4..16 + i * 4].copy_from_slice(&v.to_le_bytes());
                    }
                }
                AdditionalInfoValues::Ints(ints) => {
                    body[8] = ints.len().min(ADDITIONAL_INFO_VALUE_SLOTS) as u8;
                    body[9] = 0;
                    for (i, v) in ints.iter().take(ADDITIONAL_INFO_VALUE_SLOTS).enumerate() {
                        body[12 + i * 4..16 + i * 4].copy_from_slice(&v.to_le_bytes());
                    }
                }
            }
        }
    }
    buf
}

/// Decodes one wire record. Returns `None` for a record of the wrong size
/// or an unknown version; a malformed record never panics.
pub fn decode(buf: &[u8]) -> Option<SensorEvent> {
    if buf.len() != WIRE_EVENT_SIZE {
        return None;
    }
    if u32::from_le_bytes(buf[0..4].try_into().ok()?) != WIRE_VERSION {
        return None;
    }
    let sensor = i32::from_le_bytes(buf[4..8].try_into().ok()?);
    let event_type = i32::from_le_bytes(buf[8..12].try_into().ok()?);
    let flags = u32::from_le_bytes(buf[12..16].try_into().ok()?);
    let timestamp_ns = i64::from_le_bytes(buf[16..24].try_into().ok()?);
    let body = &buf[24..88];
    let payload = match event_type {
        types::TYPE_META_DATA => EventPayload::MetaData {
            sensor: i32::from_le_bytes(body[4..8].try_into().ok()?),
        },
        types::TYPE_DYNAMIC_SENSOR_META => {
            let mut uuid = [0_u8; 16];
            uuid.copy_from_slice(&body[8..24]);
            EventPayload::DynamicSensorMeta {
                connected: body[0] != 0,
                handle: i32::from_le_bytes(body[4..8].try_into().ok()?),
                uuid: SensorUuid(uuid),
                descriptor: None,
            }
        }
        types::TYPE_ADDITIONAL_INFO => {
            let kind = i32::from_le_bytes(body[0..4].try_into().ok()?);
            let serial = i32::from_le_bytes(body[4..8].try_into().ok()?);
            let count = (body[8] as usize).min(ADDITIONAL_INFO_VALUE_SLOTS);
            let values = if body[9] != 0 {
                AdditionalInfoValues::Floats(
                    (0..count)
                        .filter_map(|i| {
                            body[12 + i * 4..16 + i * 4].try_into().ok().map(f32::from_le_bytes)
                        })
                        .collect(),
                )
            } else {
                AdditionalInfoValues::Ints(
                    (0..count)
                        .filter_map(|i| {
                            body[12 + i * 4..16 + i * 4].try_into().ok().map(i32::from_le_bytes)
                        })
                        .collect(),
                )
            };
            EventPayload::AdditionalInfo { kind, serial, values }
        }
        _ => {
            let mut slots = [0.0_f32; EVENT_DATA_SLOTS];
            for (i, slot) in slots.iter_mut().enumerate() {
                *slot = f32::from_le_bytes(body[i * 4..i * 4 + 4].try_into().ok()?);
            }
            EventPayload::Data(slots)
        }
    };
    Some(SensorEvent { sensor, event_type, timestamp_ns, flags, payload })
}
