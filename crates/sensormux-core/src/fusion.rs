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

//! Virtual-sensor fusion.
//!
//! One shared [`FusionState`] consumes physical accelerometer, gyroscope
//! and magnetometer samples; the [`VirtualSensorKind`]s are pure functions
//! over that state, each producing at most one derived sample per input
//! event. Two attitude estimates are kept: the nine-axis one (gyro
//! integration, accel tilt correction, mag yaw correction) and the game
//! one, which never consults the magnetometer.

use std::collections::HashSet;

use crate::event::SensorEvent;
use crate::types::{self, SensorHandle};

const GRAVITY_FILTER_ALPHA: f32 = 0.8;
const ACCEL_CORRECTION_GAIN: f32 = 0.02;
const MAG_CORRECTION_GAIN: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vec3 {
    x: f32,
    y: f32,
    z: f32,
}

impl Vec3 {
    const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
    const UP: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 1.0 };

    fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn from_values(values: &[f32]) -> Self {
        Self {
            x: values.first().copied().unwrap_or(0.0),
            y: values.get(1).copied().unwrap_or(0.0),
            z: values.get(2).copied().unwrap_or(0.0),
        }
    }

    fn add(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    fn sub(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    fn scale(self, factor: f32) -> Vec3 {
        Vec3::new(self.x * factor, self.y * factor, self.z * factor)
    }

    fn cross(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    fn norm(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn normalized(self) -> Option<Vec3> {
        let n = self.norm();
        if n > f32::EPSILON {
            Some(self.scale(1.0 / n))
        } else {
            None
        }
    }
}

/// Unit quaternion mapping device coordinates into world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Quat {
    w: f32,
    x: f32,
    y: f32,
    z: f32,
}

impl Quat {
    const IDENTITY: Quat = Quat { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    fn mul(self, o: Quat) -> Quat {
        Quat {
            w: self.w * o.w - self.x * o.x - self.y * o.y - self.z * o.z,
            x: self.w * o.x + self.x * o.w + self.y * o.z - self.z * o.y,
            y: self.w * o.y - self.x * o.z + self.y * o.w + self.z * o.x,
            z: self.w * o.z + self.x * o.y - self.y * o.x + self.z * o.w,
        }
    }

    fn conjugate(self) -> Quat {
        Quat { w: self.w, x: -self.x, y: -self.y, z: -self.z }
    }

    fn normalized(self) -> Quat {
        let n = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if n > f32::EPSILON {
            Quat { w: self.w / n, x: self.x / n, y: self.y / n, z: self.z / n }
        } else {
            Quat::IDENTITY
        }
    }

    fn rotate(self, v: Vec3) -> Vec3 {
        let qv = Quat { w: 0.0, x: v.x, y: v.y, z: v.z };
        let out = self.mul(qv).mul(self.conjugate());
        Vec3::new(out.x, out.y, out.z)
    }

    /// Right-multiplies a small device-frame rotation `w` (radians).
    fn integrate(self, w: Vec3) -> Quat {
        let half = w.scale(0.5);
        let delta = Quat { w: 1.0, x: half.x, y: half.y, z: half.z };
        self.mul(delta).normalized()
    }
}

#[derive(Debug)]
pub struct FusionState {
    orientation: Quat,
    game_orientation: Quat,
    gravity: Vec3,
    last_accel: Option<Vec3>,
    last_mag: Option<Vec3>,
    last_gyro_timestamp_ns: Option<i64>,
    initialized: bool,
}

impl Default for FusionState {
    fn default() -> Self {
        Self::new()
    }
}

impl FusionState {
    pub fn new() -> Self {
        Self {
            orientation: Quat::IDENTITY,
            game_orientation: Quat::IDENTITY,
            gravity: Vec3::ZERO,
            last_accel: None,
            last_mag: None,
            last_gyro_timestamp_ns: None,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// `[x, y, z, w]` of the nine-axis attitude, for the diagnostic dump.
    pub fn orientation_quat(&self) -> [f32; 4] {
        [self.orientation.x, self.orientation.y, self.orientation.z, self.orientation.w]
    }

    /// Folds one physical sample into the shared state.
    pub fn process(&mut self, event: &SensorEvent) {
        match event.event_type {
            types::TYPE_ACCELEROMETER | types::TYPE_ACCELEROMETER_UNCALIBRATED => {
                self.on_accel(Vec3::from_values(event.values()));
            }
            types::TYPE_MAGNETIC_FIELD | types::TYPE_MAGNETIC_FIELD_UNCALIBRATED => {
                self.on_mag(Vec3::from_values(event.values()));
            }
            types::TYPE_GYROSCOPE | types::TYPE_GYROSCOPE_UNCALIBRATED => {
                self.on_gyro(Vec3::from_values(event.values()), event.timestamp_ns);
            }
            _ => {}
        }
    }

    fn on_accel(&mut self, accel: Vec3) {
        self.last_accel = Some(accel);
        if !self.initialized {
            self.gravity = accel;
            self.initialized = true;
            return;
        }
        self.gravity =
            self.gravity.scale(GRAVITY_FILTER_ALPHA).add(accel.scale(1.0 - GRAVITY_FILTER_ALPHA));
        if let Some(measured) = accel.normalized() {
            self.orientation =
                correct(self.orientation, measured, Vec3::UP, ACCEL_CORRECTION_GAIN);
            self.game_orientation =
                correct(self.game_orientation, measured, Vec3::UP, ACCEL_CORRECTION_GAIN);
        }
    }

    fn on_mag(&mut self, mag: Vec3) {
        self.last_mag = Some(mag);
        if !self.initialized {
            return;
        }
        // Only the component orthogonal to gravity carries heading.
        let Some(up) = self.gravity.normalized() else { return };
        let horizontal = mag.sub(up.scale(mag.x * up.x + mag.y * up.y + mag.z * up.z));
        if let Some(north) = horizontal.normalized() {
            self.orientation =
                correct(self.orientation, north, Vec3::new(0.0, 1.0, 0.0), MAG_CORRECTION_GAIN);
        }
    }

    fn on_gyro(&mut self, rate: Vec3, timestamp_ns: i64) {
        if let Some(last) = self.last_gyro_timestamp_ns {
            let dt = (timestamp_ns - last) as f32 * 1e-9;
            if dt > 0.0 && dt < 1.0 {
                let delta = rate.scale(dt);
                self.orientation = self.orientation.integrate(delta);
                self.game_orientation = self.game_orientation.integrate(delta);
            }
        }
        self.last_gyro_timestamp_ns = Some(timestamp_ns);
    }
}

/// Nudges `attitude` so that `reference_world`, brought into the device
/// frame, lines up better with the measured direction.
fn correct(attitude: Quat, measured_device: Vec3, reference_world: Vec3, gain: f32) -> Quat {
    let predicted = attitude.conjugate().rotate(reference_world);
    let error = measured_device.cross(predicted);
    attitude.integrate(error.scale(gain))
}

/// Closed-form attitude from one accelerometer and one magnetometer sample.
fn attitude_from_accel_mag(accel: Vec3, mag: Vec3) -> Option<Quat> {
    let up = accel.normalized()?;
    let east = mag.cross(up).normalized()?;
    let north = up.cross(east);
    // Rows of the world-from-device rotation matrix.
    let (r0, r1, r2) = (east, north, up);
    let trace = r0.x + r1.y + r2.z;
    let quat = if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        Quat { w: 0.25 * s, x: (r2.y - r1.z) / s, y: (r0.z - r2.x) / s, z: (r1.x - r0.y) / s }
    } else if r0.x > r1.y && r0.x > r2.z {
        let s = (1.0 + r0.x - r1.y - r2.z).sqrt() * 2.0;
        Quat { w: (r2.y - r1.z) / s, x: 0.25 * s, y: (r0.y + r1.x) / s, z: (r0.z + r2.x) / s }
    } else if r1.y > r2.z {
        let s = (1.0 + r1.y - r0.x - r2.z).sqrt() * 2.0;
        Quat { w: (r0.z - r2.x) / s, x: (r0.y + r1.x) / s, y: 0.25 * s, z: (r1.z + r2.y) / s }
    } else {
        let s = (1.0 + r2.z - r0.x - r1.y).sqrt() * 2.0;
        Quat { w: (r1.x - r0.y) / s, x: (r0.z + r2.x) / s, y: (r1.z + r2.y) / s, z: 0.25 * s }
    };
    Some(quat.normalized())
}

fn rotation_vector_values(q: Quat) -> [f32; 5] {
    // Keep the scalar part non-negative so the encoding is unique.
    let q = if q.w < 0.0 { Quat { w: -q.w, x: -q.x, y: -q.y, z: -q.z } } else { q };
    [q.x, q.y, q.z, q.w, -1.0]
}

/// The software-synthesizable virtual sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualSensorKind {
    Gravity,
    LinearAcceleration,
    RotationVector,
    GameRotationVector,
    GeomagneticRotationVector,
    Orientation,
    LimitedAxesImu { base_type: i32 },
}

impl VirtualSensorKind {
    pub fn output_type(&self) -> i32 {
        match self {
            Self::Gravity => types::TYPE_GRAVITY,
            Self::LinearAcceleration => types::TYPE_LINEAR_ACCELERATION,
            Self::RotationVector => types::TYPE_ROTATION_VECTOR,
            Self::GameRotationVector => types::TYPE_GAME_ROTATION_VECTOR,
            Self::GeomagneticRotationVector => types::TYPE_GEOMAGNETIC_ROTATION_VECTOR,
            Self::Orientation => types::TYPE_ORIENTATION,
            Self::LimitedAxesImu { base_type } => match *base_type {
                types::TYPE_ACCELEROMETER => types::TYPE_ACCELEROMETER_LIMITED_AXES,
                types::TYPE_GYROSCOPE => types::TYPE_GYROSCOPE_LIMITED_AXES,
                types::TYPE_ACCELEROMETER_UNCALIBRATED => {
                    types::TYPE_ACCELEROMETER_LIMITED_AXES_UNCALIBRATED
                }
                _ => types::TYPE_GYROSCOPE_LIMITED_AXES_UNCALIBRATED,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gravity => "Gravity Sensor",
            Self::LinearAcceleration => "Linear Acceleration Sensor",
            Self::RotationVector => "Rotation Vector Sensor",
            Self::GameRotationVector => "Game Rotation Vector Sensor",
            Self::GeomagneticRotationVector => "Geomagnetic Rotation Vector Sensor",
            Self::Orientation => "Orientation Sensor",
            Self::LimitedAxesImu { base_type } => match *base_type {
                types::TYPE_ACCELEROMETER => "Accelerometer Limited Axes Sensor",
                types::TYPE_GYROSCOPE => "Gyroscope Limited Axes Sensor",
                types::TYPE_ACCELEROMETER_UNCALIBRATED => {
                    "Accelerometer Limited Axes Uncalibrated Sensor"
                }
                _ => "Gyroscope Limited Axes Uncalibrated Sensor",
            },
        }
    }

    /// Physical sensor types this virtual sensor needs activated.
    pub fn required_input_types(&self) -> &'static [i32] {
        const ACCEL_GYRO: &[i32] = &[types::TYPE_ACCELEROMETER, types::TYPE_GYROSCOPE];
        const ACCEL_GYRO_MAG: &[i32] =
            &[types::TYPE_ACCELEROMETER, types::TYPE_GYROSCOPE, types::TYPE_MAGNETIC_FIELD];
        const ACCEL_MAG: &[i32] = &[types::TYPE_ACCELEROMETER, types::TYPE_MAGNETIC_FIELD];
        match self {
            Self::Gravity | Self::LinearAcceleration | Self::GameRotationVector => ACCEL_GYRO,
            Self::RotationVector | Self::Orientation => ACCEL_GYRO_MAG,
            Self::GeomagneticRotationVector => ACCEL_MAG,
            Self::LimitedAxesImu { base_type } => match *base_type {
                types::TYPE_ACCELEROMETER => &[types::TYPE_ACCELEROMETER],
                types::TYPE_GYROSCOPE => &[types::TYPE_GYROSCOPE],
                types::TYPE_ACCELEROMETER_UNCALIBRATED => {
                    &[types::TYPE_ACCELEROMETER_UNCALIBRATED]
                }
                _ => &[types::TYPE_GYROSCOPE_UNCALIBRATED],
            },
        }
    }

    /// At most one derived sample per input event; `None` when this input
    /// type does not trigger an output for the kind.
    pub fn process(
        &self,
        state: &FusionState,
        input: &SensorEvent,
        output_handle: SensorHandle,
    ) -> Option<SensorEvent> {
        let out = |values: &[f32]| {
            SensorEvent::data(output_handle, self.output_type(), input.timestamp_ns, values)
        };
        match self {
            Self::Gravity => {
                if input.event_type != types::TYPE_ACCELEROMETER || !state.initialized {
                    return None;
                }
                let g = state.gravity;
                Some(out(&[g.x, g.y, g.z]))
            }
            Self::LinearAcceleration => {
                if input.event_type != types::TYPE_ACCELEROMETER || !state.initialized {
                    return None;
                }
                let linear = state.last_accel?.sub(state.gravity);
                Some(out(&[linear.x, linear.y, linear.z]))
            }
            Self::RotationVector => {
                if input.event_type != types::TYPE_GYROSCOPE || !state.initialized {
                    return None;
                }
                Some(out(&rotation_vector_values(state.orientation)))
            }
            Self::GameRotationVector => {
                if input.event_type != types::TYPE_GYROSCOPE || !state.initialized {
                    return None;
                }
                Some(out(&rotation_vector_values(state.game_orientation)))
            }
            Self::GeomagneticRotationVector => {
                if input.event_type != types::TYPE_ACCELEROMETER {
                    return None;
                }
                let attitude = attitude_from_accel_mag(state.last_accel?, state.last_mag?)?;
                Some(out(&rotation_vector_values(attitude)))
            }
            Self::Orientation => {
                if input.event_type != types::TYPE_GYROSCOPE || !state.initialized {
                    return None;
                }
                let q = state.orientation;
                // Legacy euler output, degrees: azimuth [0, 360), pitch, roll.
                let azimuth = (2.0 * (q.w * q.z + q.x * q.y))
                    .atan2(1.0 - 2.0 * (q.y * q.y + q.z * q.z))
                    .to_degrees();
                let pitch =
                    (2.0 * (q.w * q.x + q.y * q.z)).clamp(-1.0, 1.0).asin().to_degrees();
                let roll = (2.0 * (q.w * q.y - q.x * q.z))
                    .atan2(1.0 - 2.0 * (q.x * q.x + q.y * q.y))
                    .to_degrees();
                let azimuth = if azimuth < 0.0 { azimuth + 360.0 } else { azimuth };
                Some(out(&[azimuth, pitch, roll]))
            }
            Self::LimitedAxesImu { base_type } => {
                if input.event_type != *base_type {
                    return None;
                }
                let v = |i: usize| input.values().get(i).copied().unwrap_or(0.0);
                let uncalibrated = matches!(
                    *base_type,
                    types::TYPE_ACCELEROMETER_UNCALIBRATED | types::TYPE_GYROSCOPE_UNCALIBRATED
                );
                if uncalibrated {
                    // x, y, z, bias x/y/z, axis-supported x/y/z.
                    Some(out(&[v(0), v(1), v(2), v(3), v(4), v(5), 1.0, 1.0, 1.0]))
                } else {
                    Some(out(&[v(0), v(1), v(2), 1.0, 1.0, 1.0]))
                }
            }
        }
    }
}

/// One planned software sensor: synthesized at init, flagged debug when the
/// HAL already provides the equivalent fusion output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedVirtualSensor {
    pub kind: VirtualSensorKind,
    pub is_debug: bool,
}

#[derive(Debug, Default)]
pub struct SensorInventory {
    pub has_accel: bool,
    pub has_accel_uncalibrated: bool,
    pub has_gyro: bool,
    pub has_gyro_uncalibrated: bool,
    pub has_mag: bool,
    pub hal_fusion_types: HashSet<i32>,
}

impl SensorInventory {
    pub fn observe(&mut self, sensor_type: i32) {
        match sensor_type {
            types::TYPE_ACCELEROMETER => self.has_accel = true,
            types::TYPE_ACCELEROMETER_UNCALIBRATED => self.has_accel_uncalibrated = true,
            types::TYPE_GYROSCOPE => self.has_gyro = true,
            types::TYPE_GYROSCOPE_UNCALIBRATED => self.has_gyro_uncalibrated = true,
            types::TYPE_MAGNETIC_FIELD => self.has_mag = true,
            types::TYPE_GRAVITY
            | types::TYPE_LINEAR_ACCELERATION
            | types::TYPE_ROTATION_VECTOR
            | types::TYPE_GEOMAGNETIC_ROTATION_VECTOR
            | types::TYPE_GAME_ROTATION_VECTOR => {
                self.hal_fusion_types.insert(sensor_type);
            }
            _ => {}
        }
    }

    fn any_gyro(&self) -> bool {
        self.has_gyro || self.has_gyro_uncalibrated
    }

    fn needs(&self, sensor_type: i32) -> bool {
        !self.hal_fusion_types.contains(&sensor_type)
    }
}

/// Decides which virtual sensors to synthesize: the complement of what the
/// HAL already supplies, given the physical base sensors present.
pub fn plan_virtual_sensors(
    inventory: &SensorInventory,
    automotive: bool,
) -> Vec<PlannedVirtualSensor> {
    let mut planned = Vec::new();
    if inventory.any_gyro() && inventory.has_accel && inventory.has_mag {
        let need_rotation = inventory.needs(types::TYPE_ROTATION_VECTOR);
        planned.push(PlannedVirtualSensor {
            kind: VirtualSensorKind::RotationVector,
            is_debug: !need_rotation,
        });
        planned.push(PlannedVirtualSensor {
            kind: VirtualSensorKind::Orientation,
            is_debug: !need_rotation,
        });
    }
    if inventory.has_accel && inventory.any_gyro() {
        planned.push(PlannedVirtualSensor {
            kind: VirtualSensorKind::Gravity,
            is_debug: !inventory.needs(types::TYPE_GRAVITY),
        });
        planned.push(PlannedVirtualSensor {
            kind: VirtualSensorKind::LinearAcceleration,
            is_debug: !inventory.needs(types::TYPE_LINEAR_ACCELERATION),
        });
        planned.push(PlannedVirtualSensor {
            kind: VirtualSensorKind::GameRotationVector,
            is_debug: !inventory.needs(types::TYPE_GAME_ROTATION_VECTOR),
        });
    }
    if inventory.has_accel && inventory.has_mag {
        planned.push(PlannedVirtualSensor {
            kind: VirtualSensorKind::GeomagneticRotationVector,
            is_debug: !inventory.needs(types::TYPE_GEOMAGNETIC_ROTATION_VECTOR),
        });
    }
    if automotive {
        for (present, base_type) in [
            (inventory.has_accel, types::TYPE_ACCELEROMETER),
            (inventory.has_gyro, types::TYPE_GYROSCOPE),
            (inventory.has_accel_uncalibrated, types::TYPE_ACCELEROMETER_UNCALIBRATED),
            (inventory.has_gyro_uncalibrated, types::TYPE_GYROSCOPE_UNCALIBRATED),
        ] {
            if present {
                planned.push(PlannedVirtualSensor {
                    kind: VirtualSensorKind::LimitedAxesImu { base_type },
                    is_debug: false,
                });
            }
        }
    }
    planned
}
