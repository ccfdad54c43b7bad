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

//! sensormux-core
//!
//! The hardware-independent core of the *sensormux* sensor multiplexing
//! service:
//! - the sensor and event data model plus the fixed-layout wire codec
//! - the sensor registry (stable, never-reused handles)
//! - the virtual-sensor fusion engine
//! - the recent-event log backing on-change replay and the diagnostic dump
//! - the anonymized dynamic-sensor identity module (persisted HMAC key)
//! - the registration ring used for forensic dumping

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod event;
pub mod fusion;
pub mod identity;
pub mod recent;
pub mod registry;
pub mod ring;
pub mod sensor;
pub mod types;

pub use crate::error::{SensorResult, SensorServiceError};
pub use crate::event::{EventPayload, SensorEvent};
pub use crate::sensor::{ReportingMode, SensorDescriptor, SensorUuid};
pub use crate::types::SensorHandle;
