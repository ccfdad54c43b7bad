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

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sensormux_core::sensor::{ReportingMode, SensorDescriptor, SensorUuid};
use sensormux_core::types;
use sensormux_daemon::hal::synthetic::SyntheticHal;
use sensormux_daemon::service::{SensorService, ServiceConfig, ServiceDeps};

#[derive(Debug, Parser)]
#[command(name = "sensormuxd")]
#[command(about = "Sensor multiplexing service daemon")]
struct Args {
    #[arg(long, default_value = "./data/sensormux")]
    data_dir: PathBuf,

    #[arg(long, default_value = "info")]
    log: String,

    /// Synthesize the limited-axes IMU family.
    #[arg(long, default_value_t = false)]
    automotive: bool,

    /// Refuse replay-style injection modes.
    #[arg(long, default_value_t = true)]
    user_build: bool,

    /// Expose debug sensors in the default listing.
    #[arg(long, default_value_t = false)]
    debug_sensors: bool,

    /// Override the computed per-client socket buffer budget.
    #[arg(long)]
    socket_buffer_bytes: Option<usize>,

    /// Wake-event acknowledgement timeout in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    ack_timeout_ms: u64,
}

/// Stand-in driver for development images; a platform build replaces it
/// with the real HAL binding.
fn development_hal() -> Arc<SyntheticHal> {
    let sensors = vec![
        SensorDescriptor::new(1, types::TYPE_ACCELEROMETER, "Development Accelerometer")
            .with_delays(2_500_000, 1_000_000_000)
            .with_uuid(SensorUuid([1; 16])),
        SensorDescriptor::new(2, types::TYPE_GYROSCOPE, "Development Gyroscope")
            .with_delays(2_500_000, 1_000_000_000)
            .with_uuid(SensorUuid([2; 16])),
        SensorDescriptor::new(3, types::TYPE_MAGNETIC_FIELD, "Development Magnetometer")
            .with_delays(10_000_000, 1_000_000_000)
            .with_uuid(SensorUuid([3; 16])),
        SensorDescriptor::new(4, types::TYPE_LIGHT, "Development Light Sensor")
            .with_reporting_mode(ReportingMode::OnChange)
            .with_uuid(SensorUuid([4; 16])),
    ];
    Arc::new(SyntheticHal::new(sensors))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&args.log)).init();

    std::fs::create_dir_all(&args.data_dir)?;

    let hal = development_hal();
    let config = ServiceConfig {
        data_dir: args.data_dir.clone(),
        is_user_build: args.user_build,
        expose_debug_sensors: args.debug_sensors,
        automotive: args.automotive,
        ack_timeout: Duration::from_millis(args.ack_timeout_ms),
        socket_buffer_bytes: args.socket_buffer_bytes,
        ..ServiceConfig::default()
    };

    tracing::info!(
        data_dir = %args.data_dir.display(),
        automotive = args.automotive,
        user_build = args.user_build,
        "starting sensormux daemon"
    );

    let service = SensorService::start(ServiceDeps::development(hal.clone()), config)?;

    // Foreground development run: stdin EOF is the stop signal.
    tracing::info!("daemon running; close stdin to stop");
    let mut buf = String::new();
    while std::io::stdin().read_line(&mut buf).is_ok_and(|n| n > 0) {
        buf.clear();
    }

    service.begin_shutdown();
    hal.close();
    service.join();
    Ok(())
}
