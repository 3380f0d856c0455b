//! Location telemetry ingest and activity metrics

use crate::domain::device::{
    ActivitySummary, CurrentLocation, DeviceFix, LocationSample, SampleInput,
};
use crate::domain::types::{from_epoch_secs, DeviceId, OwnerId};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::infra::store::{DeviceDirectory, SampleStore, StoreResult};
use chrono::{DateTime, Timelike, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Speeds above this count as activity (m/s)
const ACTIVE_SPEED_MPS: f64 = 0.2;

/// LiPo discharge curve anchors, millivolts to percent, descending
const DISCHARGE_CURVE: [(f32, f32); 7] = [
    (4200.0, 100.0),
    (4100.0, 90.0),
    (3950.0, 70.0),
    (3800.0, 40.0),
    (3700.0, 20.0),
    (3500.0, 5.0),
    (3200.0, 0.0),
];

/// Battery percentage for a cell voltage, interpolated along the discharge curve
pub fn voltage_to_percent(volts: f32) -> f32 {
    let mv = volts * 1000.0;
    let (top_mv, top_pct) = DISCHARGE_CURVE[0];
    if mv >= top_mv {
        return top_pct;
    }
    for pair in DISCHARGE_CURVE.windows(2) {
        let (hi_mv, hi_pct) = pair[0];
        let (lo_mv, lo_pct) = pair[1];
        if mv > lo_mv {
            let pct = lo_pct + (mv - lo_mv) / (hi_mv - lo_mv) * (hi_pct - lo_pct);
            return pct.clamp(0.0, 100.0);
        }
    }
    0.0
}

/// Great-circle distance in metres
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Distance, active minutes and speeds over samples sorted by timestamp
pub fn summarize(samples: &[LocationSample], from: DateTime<Utc>, to: DateTime<Utc>) -> ActivitySummary {
    if samples.is_empty() {
        return ActivitySummary::empty(from, to);
    }

    let mut distance = 0.0;
    let mut max_speed: f64 = 0.0;
    let mut speed_sum = 0.0;
    let mut speed_count = 0u32;
    let mut active_minutes = BTreeSet::new();

    for pair in samples.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        distance += haversine_m(prev.latitude, prev.longitude, curr.latitude, curr.longitude);

        let Some(speed) = curr.speed.map(f64::from) else {
            continue;
        };
        if speed > ACTIVE_SPEED_MPS {
            speed_sum += speed;
            speed_count += 1;
            max_speed = max_speed.max(speed);
            let minute = curr.timestamp.with_second(0).and_then(|t| t.with_nanosecond(0));
            active_minutes.insert(minute.unwrap_or(curr.timestamp));
        }
    }

    let avg_speed = if speed_count > 0 { speed_sum / speed_count as f64 } else { 0.0 };
    let first = samples.first().map(|s| s.timestamp).unwrap_or(from);
    let last = samples.last().map(|s| s.timestamp).unwrap_or(to);

    ActivitySummary {
        total_distance_m: round_to(distance, 1),
        active_minutes: active_minutes.len() as u32,
        max_speed: round_to(max_speed, 2),
        avg_speed: round_to(avg_speed, 2),
        sample_count: samples.len(),
        from: first,
        to: last,
    }
}

pub struct TelemetryIngest {
    devices: Arc<dyn DeviceDirectory>,
    samples: Arc<dyn SampleStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl TelemetryIngest {
    pub fn new(
        devices: Arc<dyn DeviceDirectory>,
        samples: Arc<dyn SampleStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { devices, samples, clock, metrics }
    }

    /// Persist a batch from the device `external_id`.
    ///
    /// Returns the number of stored samples; 0 for an unknown device. The
    /// device's last-known state, last-seen time included, comes from the
    /// newest sample by timestamp.
    pub fn upload_batch(&self, external_id: &str, batch: &[SampleInput]) -> StoreResult<usize> {
        let Some(device) = self.devices.device_by_external_id(external_id)? else {
            self.metrics.record_telemetry_unknown_device();
            debug!(device = %external_id, len = batch.len(), "telemetry_unknown_device");
            return Ok(0);
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let received_at = self.clock.now();
        let rows: Vec<LocationSample> = batch
            .iter()
            .map(|s| LocationSample {
                device_id: device.id,
                latitude: s.lat,
                longitude: s.lng,
                altitude: s.alt,
                accuracy: s.acc,
                speed: s.spd,
                heading: s.hdg,
                satellites: s.sat,
                battery_voltage: s.bat,
                timestamp: from_epoch_secs(s.ts),
                received_at,
            })
            .collect();

        // first of equal timestamps wins
        let newest = rows
            .iter()
            .reduce(|best, s| if s.timestamp > best.timestamp { s } else { best })
            .map(|s| DeviceFix {
                latitude: s.latitude,
                longitude: s.longitude,
                accuracy: s.accuracy,
                battery_voltage: s.battery_voltage,
                battery_percent: s.battery_voltage.map(voltage_to_percent),
                seen_at: s.timestamp,
            });

        let stored = self.samples.append_samples(rows)?;
        if let Some(fix) = newest {
            self.devices.record_fix(device.id, &fix)?;
        }

        self.metrics.record_telemetry_samples(stored as u64);
        info!(device = %external_id, owner = %device.owner, samples = stored, "telemetry_batch_stored");
        Ok(stored)
    }

    /// Samples between `from` and `to` inclusive, oldest first. `None` when
    /// the device is not the owner's.
    pub fn location_history(
        &self,
        owner: OwnerId,
        device: DeviceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Option<Vec<LocationSample>>> {
        if self.devices.device(owner, device)?.is_none() {
            return Ok(None);
        }
        self.samples.samples_between(device, from, to).map(Some)
    }

    /// Last-known position, `None` until the device has reported a fix
    pub fn current_location(
        &self,
        owner: OwnerId,
        device: DeviceId,
    ) -> StoreResult<Option<CurrentLocation>> {
        let Some(device) = self.devices.device(owner, device)? else {
            return Ok(None);
        };
        let (Some(latitude), Some(longitude)) = (device.last_latitude, device.last_longitude) else {
            return Ok(None);
        };
        Ok(Some(CurrentLocation {
            latitude,
            longitude,
            accuracy: device.last_accuracy,
            timestamp: device.last_seen_at,
            battery_percent: device.battery_percent,
        }))
    }

    pub fn activity_summary(
        &self,
        owner: OwnerId,
        device: DeviceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Option<ActivitySummary>> {
        if self.devices.device(owner, device)?.is_none() {
            return Ok(None);
        }
        let samples = self.samples.samples_between(device, from, to)?;
        Ok(Some(summarize(&samples, from, to)))
    }
}
