//! Telemetry wire model.
//!
//! The structs here serialize 1:1 to the JSON the broker-side consumers
//! ingest. Field order in each struct is the canonical key order on the
//! wire; absent optional sections are emitted as `null`. Consumers
//! deduplicate frames by `messageId`.
//!
//! The same structs double as the sensor snapshot payloads held in the
//! snapshot registers — each carries a `sampled_at` millisecond stamp
//! (the sensor's own clock) that never reaches the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Whether a frame was minted while the link was up (`online`) or while
/// offline (`queued`). Embedded in the payload so downstream consumers
/// can tell live frames from replays; never changed once the frame
/// enters the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    Online,
    Queued,
}

impl std::fmt::Display for TransmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransmissionMode::Online => write!(f, "online"),
            TransmissionMode::Queued => write!(f, "queued"),
        }
    }
}

/// GNSS fix. The only mandatory section — a frame is never minted
/// without one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsSection {
    /// Latitude (decimal degrees, WGS-84)
    pub lat: f64,
    /// Longitude (decimal degrees, WGS-84)
    pub lon: f64,
    /// Altitude above MSL (m)
    pub alt: f64,
    /// Ground speed (m/s)
    pub speed: f64,
    /// Course over ground (degrees from true north)
    pub bearing: f64,
    /// Horizontal accuracy estimate (m)
    pub accuracy: f64,
    /// Satellites used in the fix
    pub satellites: Option<u32>,
    /// Horizontal accuracy, receiver-reported (m)
    pub h_acc: Option<f64>,
    /// Vertical accuracy (m)
    pub v_acc: Option<f64>,
    /// Speed accuracy (m/s)
    pub s_acc: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub pdop: Option<f64>,
    /// Timestamp reported by the GNSS receiver itself (ms epoch)
    pub gps_timestamp: Option<u64>,
    /// When the adapter published this reading (ms epoch); not on the wire
    #[serde(skip)]
    pub sampled_at: u64,
}

/// Inertial readings: raw accelerometer/gyroscope plus derived
/// magnitudes, with optional magnetometer, linear acceleration,
/// gravity, and rotation-quaternion blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImuSection {
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub accel_magnitude: f64,
    pub gyro_magnitude: f64,
    pub mag_x: Option<f64>,
    pub mag_y: Option<f64>,
    pub mag_z: Option<f64>,
    pub linear_accel_x: Option<f64>,
    pub linear_accel_y: Option<f64>,
    pub linear_accel_z: Option<f64>,
    pub gravity_x: Option<f64>,
    pub gravity_y: Option<f64>,
    pub gravity_z: Option<f64>,
    pub rotation_vector_x: Option<f64>,
    pub rotation_vector_y: Option<f64>,
    pub rotation_vector_z: Option<f64>,
    pub rotation_vector_w: Option<f64>,
    #[serde(skip)]
    pub sampled_at: u64,
}

impl ImuSection {
    /// Euclidean magnitude of a three-axis reading.
    pub fn magnitude(x: f64, y: f64, z: f64) -> f64 {
        (x * x + y * y + z * z).sqrt()
    }
}

/// Device attitude derived from the fused orientation sensor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrientationSection {
    /// Rotation about the vertical axis (degrees, 0 = north)
    pub azimuth: f64,
    /// Rotation about the lateral axis (degrees)
    pub pitch: f64,
    /// Rotation about the longitudinal axis (degrees)
    pub roll: f64,
    /// Row-major 3x3 rotation matrix, when the platform exposes it
    pub rotation_matrix: Option<[f64; 9]>,
    #[serde(skip)]
    pub sampled_at: u64,
}

/// Battery status as reported by the platform power manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatterySection {
    /// Charge level (percent, 0-100)
    pub level: f64,
    /// Pack temperature (°C)
    pub temperature: f64,
    /// Charging state, e.g. `charging`, `discharging`, `full`
    pub status: String,
    /// Pack voltage (V)
    pub voltage: f64,
    /// Health string, e.g. `good`, `overheat`
    pub health: String,
    /// Chemistry, e.g. `Li-ion`
    pub technology: String,
    /// Remaining charge (µAh), when the platform exposes it
    pub charge_counter: Option<i64>,
    /// Design capacity (µAh), when the platform exposes it
    pub full_capacity: Option<i64>,
    #[serde(skip)]
    pub sampled_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiSection {
    pub ssid: String,
    /// Received signal strength (dBm)
    pub rssi: i32,
    pub link_speed_mbps: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalStrength {
    /// Signal power (dBm)
    pub dbm: i32,
    /// Platform-normalised level (0-4)
    pub level: i32,
    /// Arbitrary strength units, when reported
    pub asu: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellInfo {
    pub mcc: Option<u16>,
    pub mnc: Option<u16>,
    /// Tracking/location area code
    pub tac: Option<u32>,
    pub cell_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellularSection {
    /// Radio access technology, e.g. `LTE`, `NR`
    pub network_type: String,
    pub signal_strength: Option<SignalStrength>,
    pub cell_info: Option<CellInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivitySection {
    pub wifi: Option<WifiSection>,
    pub cellular: Option<CellularSection>,
}

/// Battery + connectivity rollup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSection {
    pub battery: Option<BatterySection>,
    pub connectivity: Option<ConnectivitySection>,
}

/// One 1 Hz telemetry frame. Immutable once minted; `message_id` is the
/// server-side deduplication key and survives every retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub message_id: Uuid,
    pub device_id: String,
    /// Current operator's registration; a sentinel when nobody is
    /// logged in.
    pub matricula: String,
    /// Wall-clock mint time (ms since the Unix epoch)
    pub timestamp: u64,
    pub transmission_mode: TransmissionMode,
    pub gps: GpsSection,
    pub imu: Option<ImuSection>,
    pub orientation: Option<OrientationSection>,
    pub system: Option<SystemSection>,
}

/// Discrete event payload (login, status change, heartbeat): the frame
/// envelope minus the sensor sections, plus an event type and a flat
/// string map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub message_id: Uuid,
    pub device_id: String,
    pub matricula: String,
    pub timestamp: u64,
    pub transmission_mode: TransmissionMode,
    pub event_type: String,
    pub data: BTreeMap<String, String>,
}

impl TelemetryEvent {
    /// Build an event stamped with a fresh id and the current wall clock.
    pub fn new(
        device_id: &str,
        matricula: &str,
        event_type: &str,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            matricula: matricula.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            transmission_mode: TransmissionMode::Online,
            event_type: event_type.to_string(),
            data,
        }
    }
}
