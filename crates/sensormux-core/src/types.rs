//! Sensor type codes, handle ranges and service-wide constants.

/// Stable 32-bit sensor identity. A handle uniquely identifies a sensor for
/// the lifetime of the process and is never reused.
pub type SensorHandle = i32;

/// Device id of the platform itself; runtime sensors carry a non-zero id.
pub const DEFAULT_DEVICE_ID: i32 = 0;

// Well-known sensor type codes. Dynamic sensors may report vendor types
// outside this list; the service treats the type as opaque except where a
// rule below names it.
pub const TYPE_META_DATA: i32 = 0;
pub const TYPE_ACCELEROMETER: i32 = 1;
pub const TYPE_MAGNETIC_FIELD: i32 = 2;
pub const TYPE_ORIENTATION: i32 = 3;
pub const TYPE_GYROSCOPE: i32 = 4;
pub const TYPE_LIGHT: i32 = 5;
pub const TYPE_PROXIMITY: i32 = 8;
pub const TYPE_GRAVITY: i32 = 9;
pub const TYPE_LINEAR_ACCELERATION: i32 = 10;
pub const TYPE_ROTATION_VECTOR: i32 = 11;
pub const TYPE_MAGNETIC_FIELD_UNCALIBRATED: i32 = 14;
pub const TYPE_GAME_ROTATION_VECTOR: i32 = 15;
pub const TYPE_GYROSCOPE_UNCALIBRATED: i32 = 16;
pub const TYPE_STEP_DETECTOR: i32 = 18;
pub const TYPE_STEP_COUNTER: i32 = 19;
pub const TYPE_GEOMAGNETIC_ROTATION_VECTOR: i32 = 20;
pub const TYPE_DYNAMIC_SENSOR_META: i32 = 32;
pub const TYPE_ADDITIONAL_INFO: i32 = 33;
pub const TYPE_ACCELEROMETER_UNCALIBRATED: i32 = 35;
pub const TYPE_HEAD_TRACKER: i32 = 37;
pub const TYPE_ACCELEROMETER_LIMITED_AXES: i32 = 38;
pub const TYPE_GYROSCOPE_LIMITED_AXES: i32 = 39;
pub const TYPE_ACCELEROMETER_LIMITED_AXES_UNCALIBRATED: i32 = 40;
pub const TYPE_GYROSCOPE_LIMITED_AXES_UNCALIBRATED: i32 = 41;

/// Handle range reserved for runtime sensors, allocated sequentially.
pub const RUNTIME_SENSOR_HANDLE_BASE: SensorHandle = 0x5F00_0000;
pub const RUNTIME_SENSOR_HANDLE_END: SensorHandle = 0x6000_0000;

/// Handle range for software-synthesized virtual sensors.
pub const VIRTUAL_SENSOR_HANDLE_BASE: SensorHandle = 0x0700_0000;

/// Sampling-period floor applied to rate-capped callers (200 Hz).
pub const CAPPED_SAMPLING_PERIOD_NS: i64 = 5_000_000;

/// Target SDK level at or below which the step sensors do not require the
/// activity-recognition permission.
pub const TARGET_SDK_STEP_PERMISSION_CUTOFF: i32 = 28;

/// Target SDK level from which the high-sampling-rate permission is
/// required to escape the rate cap.
pub const TARGET_SDK_RATE_CAP_START: i32 = 31;

pub const SYSTEM_UID: u32 = 1000;
pub const AUDIO_SERVER_UID: u32 = 1041;

/// Uids below this belong to system services and are always considered
/// active by the uid policy.
pub const FIRST_APPLICATION_UID: u32 = 10_000;

/// Uid slots per user, used by the shell surface to resolve `--user`.
pub const UIDS_PER_USER: u32 = 100_000;

/// Sensor types whose sampling rate is capped for callers without the
/// high-sampling-rate permission.
pub fn is_rate_capped_type(sensor_type: i32) -> bool {
    matches!(
        sensor_type,
        TYPE_ACCELEROMETER
            | TYPE_ACCELEROMETER_UNCALIBRATED
            | TYPE_GYROSCOPE
            | TYPE_GYROSCOPE_UNCALIBRATED
            | TYPE_MAGNETIC_FIELD
            | TYPE_MAGNETIC_FIELD_UNCALIBRATED
    )
}

/// Events of these types carry bookkeeping rather than samples and are
/// excluded from the recent-event log.
pub fn is_bookkeeping_type(event_type: i32) -> bool {
    matches!(
        event_type,
        TYPE_META_DATA | TYPE_DYNAMIC_SENSOR_META | TYPE_ADDITIONAL_INFO
    )
}
