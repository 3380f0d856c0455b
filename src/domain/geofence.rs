//! Versioned geofence policies and boundary-crossing events

use crate::domain::types::{DeviceId, EventKind, GeofenceId, OwnerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceShape {
    Polygon,
    Circle,
    Corridor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceRule {
    Allow,
    Deny,
}

/// Buzzer pattern played by the device on a crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPattern {
    Silent,
    Short,
    Long,
    Continuous,
}

/// Boundary policy. `version` starts at 1 and is bumped by exactly one on
/// every mutation; devices use it as their sync cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofencePolicy {
    pub id: GeofenceId,
    pub owner: OwnerId,
    pub name: String,
    pub shape: FenceShape,
    pub rule: FenceRule,
    /// Geometry payload (GeoJSON). Must parse as JSON; otherwise passed
    /// through untouched.
    pub boundary: String,
    pub alert: AlertPattern,
    pub is_active: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewGeofence {
    pub name: String,
    pub shape: FenceShape,
    pub rule: FenceRule,
    pub boundary: String,
    #[serde(default = "default_alert")]
    pub alert: AlertPattern,
}

fn default_alert() -> AlertPattern {
    AlertPattern::Short
}

/// Reject a boundary that is not a JSON document
pub fn check_boundary(boundary: &str) -> Result<(), serde_json::Error> {
    serde_json::from_str::<serde::de::IgnoredAny>(boundary).map(|_| ())
}

/// Partial update. Shape is fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GeofencePatch {
    pub name: Option<String>,
    pub rule: Option<FenceRule>,
    pub boundary: Option<String>,
    pub alert: Option<AlertPattern>,
    pub is_active: Option<bool>,
}

impl GeofencePolicy {
    /// Apply supplied fields and bump the version, whether or not anything changed
    pub fn apply(&mut self, patch: &GeofencePatch, now: DateTime<Utc>) {
        if let Some(v) = &patch.name {
            self.name = v.clone();
        }
        if let Some(v) = patch.rule {
            self.rule = v;
        }
        if let Some(v) = &patch.boundary {
            self.boundary = v.clone();
        }
        if let Some(v) = patch.alert {
            self.alert = v;
        }
        if let Some(v) = patch.is_active {
            self.is_active = v;
        }
        self.version += 1;
        self.updated_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossingKind {
    Entered,
    Exited,
    Breach,
}

impl CrossingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossingKind::Entered => "entered",
            CrossingKind::Exited => "exited",
            CrossingKind::Breach => "breach",
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            CrossingKind::Entered => EventKind::GeofenceEntered,
            CrossingKind::Exited => EventKind::GeofenceExited,
            CrossingKind::Breach => EventKind::GeofenceBreach,
        }
    }
}

/// Crossing as reported by a device (compact wire names)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingInput {
    pub fence_id: GeofenceId,
    #[serde(rename = "type")]
    pub kind: CrossingKind,
    pub lat: f64,
    pub lng: f64,
    pub ts: i64,
}

/// Immutable record of a boundary crossing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub id: u64,
    pub policy_id: GeofenceId,
    pub device_id: DeviceId,
    pub kind: CrossingKind,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// Incremental sync response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub version: u64,
    pub fences: Vec<GeofencePolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence() -> GeofencePolicy {
        GeofencePolicy {
            id: GeofenceId(1),
            owner: OwnerId(1),
            name: "yard".to_string(),
            shape: FenceShape::Polygon,
            rule: FenceRule::Allow,
            boundary: "{}".to_string(),
            alert: AlertPattern::Short,
            is_active: true,
            version: 1,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_empty_patch_still_bumps_version() {
        let mut f = fence();
        f.apply(&GeofencePatch::default(), Utc::now());
        assert_eq!(f.version, 2);
        assert_eq!(f.name, "yard");
        assert!(f.updated_at.is_some());
    }

    #[test]
    fn test_crossing_input_wire_format() {
        let input: CrossingInput =
            serde_json::from_str(r#"{"fence_id":3,"type":"breach","lat":1.5,"lng":2.5,"ts":10}"#)
                .unwrap();
        assert_eq!(input.fence_id, GeofenceId(3));
        assert_eq!(input.kind, CrossingKind::Breach);
        assert_eq!(input.kind.event_kind(), EventKind::GeofenceBreach);
    }
}
