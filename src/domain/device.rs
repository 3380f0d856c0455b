//! Wearable device (collar) model and its telemetry

use crate::domain::types::{AnimalId, DeviceId, OwnerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A paired wearable device.
///
/// `shared_secret` is base64 of 32 random bytes, generated once at pairing.
/// It is skipped on serialization so listings can never leak it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WearableDevice {
    pub id: DeviceId,
    pub owner: OwnerId,
    /// Hex identifier the device presents on the wire
    pub external_id: String,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub shared_secret: String,
    pub animal_id: Option<AnimalId>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_latitude: Option<f64>,
    pub last_longitude: Option<f64>,
    pub last_accuracy: Option<f32>,
    pub battery_voltage: Option<f32>,
    pub battery_percent: Option<f32>,
    /// Last version the collar reported during a firmware check
    #[serde(default)]
    pub firmware_version: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Returned once, at pairing time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingResult {
    pub id: DeviceId,
    pub external_id: String,
    pub shared_secret: String,
    pub name: String,
}

/// Partial update for a device
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub animal_id: Option<AnimalId>,
    pub is_active: Option<bool>,
}

/// One GPS fix as uploaded by a device (compact wire names)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleInput {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub alt: Option<f32>,
    #[serde(default)]
    pub acc: Option<f32>,
    #[serde(default)]
    pub spd: Option<f32>,
    #[serde(default)]
    pub hdg: Option<f32>,
    #[serde(default)]
    pub sat: Option<u8>,
    /// Battery voltage in volts
    #[serde(default)]
    pub bat: Option<f32>,
    /// Device clock, epoch seconds
    pub ts: i64,
}

/// Persisted location sample. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub device_id: DeviceId,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f32>,
    pub accuracy: Option<f32>,
    pub speed: Option<f32>,
    pub heading: Option<f32>,
    pub satellites: Option<u8>,
    pub battery_voltage: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Last-known state derived from the newest sample of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f32>,
    pub battery_voltage: Option<f32>,
    pub battery_percent: Option<f32>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub battery_percent: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivitySummary {
    pub total_distance_m: f64,
    pub active_minutes: u32,
    pub max_speed: f64,
    pub avg_speed: f64,
    pub sample_count: usize,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ActivitySummary {
    pub fn empty(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            total_distance_m: 0.0,
            active_minutes: 0,
            max_speed: 0.0,
            avg_speed: 0.0,
            sample_count: 0,
            from,
            to,
        }
    }
}
