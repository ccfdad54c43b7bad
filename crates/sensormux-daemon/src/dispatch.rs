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

//! The worker threads.
//!
//! The dispatch thread is the single producer for hardware events: it
//! blocks in the HAL's `poll` and runs the whole per-batch pipeline. The
//! runtime thread drains the injected-event queue for user-space-backed
//! sensors. The ack receiver enforces the wake-event acknowledgement
//! deadline.

use std::sync::Arc;

use sensormux_core::error::fatal;

use crate::hal::HalError;
use crate::service::SensorService;

pub(crate) fn run_dispatch_loop(service: Arc<SensorService>) {
    tracing::debug!("dispatch thread starting");
    service.elevate_dispatch_thread();
    let max_events = service.poll_max_events();
    loop {
        match service.hal().poll(max_events) {
            Ok(events) => service.process_hal_batch(events),
            Err(HalError::DeadObject) => {
                if !service.is_running() {
                    break;
                }
                if service.hal().is_reconnecting() {
                    service.handle_hal_reconnection();
                    continue;
                }
                tracing::error!("sensor poll failed: hal connection dead");
                if service.is_running() {
                    fatal("dispatch loop lost the hal");
                }
                break;
            }
            Err(err) => {
                if !service.is_running() {
                    break;
                }
                tracing::error!(error = %err, "sensor poll failed");
                fatal("dispatch loop cannot poll the hal");
            }
        }
    }
    tracing::debug!("dispatch thread exiting");
}

pub(crate) fn run_runtime_loop(service: Arc<SensorService>) {
    tracing::debug!("runtime sensor thread starting");
    while let Some(events) = service.wait_runtime_events() {
        service.process_runtime_batch(events);
    }
    tracing::debug!("runtime sensor thread exiting");
}

pub(crate) fn run_ack_receiver(service: Arc<SensorService>) {
    tracing::debug!("ack receiver thread starting");
    while service.is_running() {
        service.ack_receiver_cycle();
    }
    tracing::debug!("ack receiver thread exiting");
}
