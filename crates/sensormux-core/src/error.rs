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

use thiserror::Error;

pub type SensorResult<T> = Result<T, SensorServiceError>;

/// Error kinds surfaced by the service API.
///
/// `DeadObject` is handled internally by the HAL reconnection protocol and
/// is never returned to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorServiceError {
    #[error("service is still initializing")]
    NoInit,

    #[error("bad value")]
    BadValue,

    #[error("invalid operation")]
    InvalidOperation,

    #[error("permission denied")]
    PermissionDenied,

    #[error("already exists")]
    AlreadyExists,

    #[error("name not found")]
    NameNotFound,

    #[error("unsupported")]
    Unsupported,

    #[error("transaction failed")]
    TransactionFailed,

    #[error("dead object")]
    DeadObject,
}

/// Sink for unrecoverable internal inconsistencies. Logs and aborts the
/// process; recoverable failures return a [`SensorServiceError`] instead.
pub fn fatal(msg: &str) -> ! {
    tracing::error!(target: "sensormux", "fatal inconsistency: {msg}");
    std::process::abort();
}
