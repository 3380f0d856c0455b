//! Door admission model: per-owner policy, fingerprints and the access log record

use crate::domain::types::{AnimalId, DoorSide, EventKind, OwnerId, TransitDirection};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_AUTO_CLOSE_SECS: u32 = 10;

/// Stored perceptual hash of one reference photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub id: u64,
    pub animal_id: AnimalId,
    pub owner: OwnerId,
    pub hash: String,
}

/// Wall-clock window during which the door stays shut.
///
/// Both bounds are inclusive. A window whose start is after its end wraps
/// midnight, so `22:00..06:00` still holds the door shut at 06:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl NightWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            now >= self.start && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }
}

/// Admission policy for one owner's door
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorPolicy {
    pub owner: OwnerId,
    pub enabled: bool,
    pub auto_close_enabled: bool,
    pub auto_close_delay_secs: u32,
    pub min_confidence: f64,
    pub night_mode_enabled: bool,
    pub night_start: Option<NaiveTime>,
    pub night_end: Option<NaiveTime>,
    /// Opaque access credential; `None` for doors provisioned before credentials existed
    pub api_key: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DoorPolicy {
    pub fn with_defaults(owner: OwnerId, now: DateTime<Utc>) -> Self {
        Self {
            owner,
            enabled: true,
            auto_close_enabled: true,
            auto_close_delay_secs: DEFAULT_AUTO_CLOSE_SECS,
            min_confidence: DEFAULT_CONFIDENCE_THRESHOLD,
            night_mode_enabled: false,
            night_start: None,
            night_end: None,
            api_key: None,
            updated_at: now,
        }
    }

    /// Night window, only when night mode is on and both bounds are set
    pub fn night_window(&self) -> Option<NightWindow> {
        if !self.night_mode_enabled {
            return None;
        }
        match (self.night_start, self.night_end) {
            (Some(start), Some(end)) => Some(NightWindow::new(start, end)),
            _ => None,
        }
    }

    /// Apply only the supplied fields
    pub fn apply(&mut self, patch: &DoorPolicyPatch, now: DateTime<Utc>) {
        if let Some(v) = patch.enabled {
            self.enabled = v;
        }
        if let Some(v) = patch.auto_close_enabled {
            self.auto_close_enabled = v;
        }
        if let Some(v) = patch.auto_close_delay_secs {
            self.auto_close_delay_secs = v;
        }
        if let Some(v) = patch.min_confidence {
            self.min_confidence = v.clamp(0.0, 1.0);
        }
        if let Some(v) = patch.night_mode_enabled {
            self.night_mode_enabled = v;
        }
        if let Some(v) = patch.night_start {
            self.night_start = Some(v);
        }
        if let Some(v) = patch.night_end {
            self.night_end = Some(v);
        }
        if let Some(v) = &patch.api_key {
            self.api_key = Some(v.clone());
        }
        self.updated_at = now;
    }
}

/// Partial update for a door policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoorPolicyPatch {
    pub enabled: Option<bool>,
    pub auto_close_enabled: Option<bool>,
    pub auto_close_delay_secs: Option<u32>,
    pub min_confidence: Option<f64>,
    pub night_mode_enabled: Option<bool>,
    pub night_start: Option<NaiveTime>,
    pub night_end: Option<NaiveTime>,
    pub api_key: Option<String>,
}

/// Immutable record of one admission decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    /// Assigned by the event log on append
    pub id: u64,
    /// `None` only when no policy could be resolved for the request
    pub owner: Option<OwnerId>,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub animal_id: Option<AnimalId>,
    pub confidence: Option<f64>,
    pub image_path: Option<String>,
    pub reason: Option<String>,
    pub side: Option<DoorSide>,
    pub direction: Option<TransitDirection>,
}
