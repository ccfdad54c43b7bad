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

//! sensormux-daemon
//!
//! The privileged sensor multiplexing service: it enumerates sensors from
//! the HAL, synthesizes virtual fusion sensors, multiplexes one hardware
//! stream to any number of subscribers with independent rates, enforces
//! permission/privacy/uid policy, arbitrates the system wakelock for
//! wake-up events, and manages shared-memory direct channels.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod collaborators;
pub mod connection;
pub mod direct;
mod dispatch;
mod dump;
pub mod hal;
mod holder;
mod notifier;
pub mod policy;
pub mod service;
pub mod shell;

pub use crate::collaborators::CallerIdentity;
pub use crate::holder::ConnectionId;
pub use crate::notifier::ProximityActiveListener;
pub use crate::service::{OperatingMode, SensorService, ServiceConfig};
