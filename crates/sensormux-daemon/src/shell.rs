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

//! The shell command surface.
//!
//! This is a remote-facing API: every argument is validated and the
//! endpoint requires the sensor-management permission.

use std::io::Write;

use sensormux_core::types::UIDS_PER_USER;
use sensormux_core::{SensorResult, SensorServiceError};

use crate::collaborators::{CallerIdentity, PERMISSION_MANAGE_SENSORS};
use crate::service::SensorService;

/// Runs one shell command against the service, writing results to `out`
/// and diagnostics to `err`. `Ok(())` maps to exit code 0.
pub fn shell_command(
    service: &SensorService,
    caller: &CallerIdentity,
    args: &[String],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> SensorResult<()> {
    if !service.policy.check_caller_permission(PERMISSION_MANAGE_SENSORS, caller) {
        return Err(SensorServiceError::PermissionDenied);
    }
    let Some(command) = args.first() else {
        return Err(SensorServiceError::BadValue);
    };
    match command.as_str() {
        "set-uid-state" => handle_set_uid_state(service, &args[1..], err),
        "reset-uid-state" => handle_reset_uid_state(service, &args[1..], err),
        "get-uid-state" => handle_get_uid_state(service, &args[1..], out, err),
        "restrict-ht" => {
            service.policy.set_ht_restricted(true);
            Ok(())
        }
        "unrestrict-ht" => {
            service.policy.set_ht_restricted(false);
            Ok(())
        }
        "help" if args.len() == 1 => {
            print_help(out);
            Ok(())
        }
        _ => {
            print_help(err);
            Err(SensorServiceError::BadValue)
        }
    }
}

fn handle_set_uid_state(
    service: &SensorService,
    args: &[String],
    err: &mut dyn Write,
) -> SensorResult<()> {
    // package + active|idle, optionally --user N.
    if !(args.len() == 2 || args.len() == 4) {
        print_help(err);
        return Err(SensorServiceError::BadValue);
    }
    let active = match args[1].as_str() {
        "active" => true,
        "idle" => false,
        other => {
            let _ = writeln!(err, "Expected active or idle but got: '{other}'");
            return Err(SensorServiceError::BadValue);
        }
    };
    let user_id = parse_user(&args[2..], err)?;
    let uid = uid_for_package(service, &args[0], user_id, err)?;
    service.set_uid_override(uid, active);
    Ok(())
}

fn handle_reset_uid_state(
    service: &SensorService,
    args: &[String],
    err: &mut dyn Write,
) -> SensorResult<()> {
    if !(args.len() == 1 || args.len() == 3) {
        print_help(err);
        return Err(SensorServiceError::BadValue);
    }
    let user_id = parse_user(&args[1..], err)?;
    let uid = uid_for_package(service, &args[0], user_id, err)?;
    service.clear_uid_override(uid);
    Ok(())
}

fn handle_get_uid_state(
    service: &SensorService,
    args: &[String],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> SensorResult<()> {
    if !(args.len() == 1 || args.len() == 3) {
        print_help(err);
        return Err(SensorServiceError::BadValue);
    }
    let user_id = parse_user(&args[1..], err)?;
    let uid = uid_for_package(service, &args[0], user_id, err)?;
    let state = if service.policy.is_uid_active(uid) { "active" } else { "idle" };
    let _ = writeln!(out, "{state}");
    Ok(())
}

fn parse_user(args: &[String], err: &mut dyn Write) -> SensorResult<i32> {
    match args {
        [] => Ok(0),
        [flag, value] if flag == "--user" => value.parse().map_err(|_| {
            let _ = writeln!(err, "Invalid user: '{value}'");
            SensorServiceError::BadValue
        }),
        _ => {
            print_help(err);
            Err(SensorServiceError::BadValue)
        }
    }
}

fn uid_for_package(
    service: &SensorService,
    package: &str,
    user_id: i32,
    err: &mut dyn Write,
) -> SensorResult<u32> {
    let Some(uid) = service.policy.package_manager().get_package_uid(package, 0) else {
        let _ = writeln!(err, "Unknown package: '{package}'");
        return Err(SensorServiceError::BadValue);
    };
    if user_id < 0 {
        let _ = writeln!(err, "Invalid user: {user_id}");
        return Err(SensorServiceError::BadValue);
    }
    Ok(user_id as u32 * UIDS_PER_USER + uid % UIDS_PER_USER)
}

fn print_help(out: &mut dyn Write) {
    let _ = writeln!(
        out,
        "Sensor service commands:\n\
         \x20 get-uid-state <PACKAGE> [--user USER_ID] gets the uid state\n\
         \x20 set-uid-state <PACKAGE> <active|idle> [--user USER_ID] overrides the uid state\n\
         \x20 reset-uid-state <PACKAGE> [--user USER_ID] clears the uid state override\n\
         \x20 restrict-ht restricts the head-tracker sensors to system clients\n\
         \x20 unrestrict-ht lifts the head-tracker restriction\n\
         \x20 help print this message"
    );
}
