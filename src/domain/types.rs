//! Shared identifiers and small enums used across the engine

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype wrapper for owner (tenant) IDs to provide type safety
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct OwnerId(pub i64);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for individual (animal) IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AnimalId(pub i64);

impl std::fmt::Display for AnimalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal (storage) ID of a wearable device. The external ID presented by
/// the device itself is a hex string, see `WearableDevice::external_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DeviceId(pub i64);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct GeofenceId(pub i64);

impl std::fmt::Display for GeofenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Convert device-supplied epoch seconds into a UTC timestamp.
/// Out-of-range values clamp to the epoch rather than failing the batch.
pub fn from_epoch_secs(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or(DateTime::UNIX_EPOCH)
}

/// Which physical sensor of the door triggered a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorSide {
    Inside,
    Outside,
}

impl DoorSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorSide::Inside => "inside",
            DoorSide::Outside => "outside",
        }
    }

    /// Inside sensor means the animal is leaving; outside means it is coming in
    pub fn direction(&self) -> TransitDirection {
        match self {
            DoorSide::Inside => TransitDirection::Exiting,
            DoorSide::Outside => TransitDirection::Entering,
        }
    }
}

impl std::str::FromStr for DoorSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inside" => Ok(DoorSide::Inside),
            "outside" => Ok(DoorSide::Outside),
            other => Err(format!("unknown door side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitDirection {
    Entering,
    Exiting,
}

impl TransitDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitDirection::Entering => "Entering",
            TransitDirection::Exiting => "Exiting",
        }
    }
}

/// Closed set of event kinds the engine records and notifies about.
///
/// Adding a variant forces every `match` over this enum (event recording,
/// notification preferences, message rendering) to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    AccessGranted,
    EntryGranted,
    ExitGranted,
    AccessDenied,
    UnknownAnimal,
    GeofenceEntered,
    GeofenceExited,
    GeofenceBreach,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AccessGranted => "AccessGranted",
            EventKind::EntryGranted => "EntryGranted",
            EventKind::ExitGranted => "ExitGranted",
            EventKind::AccessDenied => "AccessDenied",
            EventKind::UnknownAnimal => "UnknownAnimal",
            EventKind::GeofenceEntered => "GeofenceEntered",
            EventKind::GeofenceExited => "GeofenceExited",
            EventKind::GeofenceBreach => "GeofenceBreach",
        }
    }

    /// Event kind recorded for a granted admission
    pub fn granted_for(side: Option<DoorSide>) -> Self {
        match side {
            Some(DoorSide::Outside) => EventKind::EntryGranted,
            Some(DoorSide::Inside) => EventKind::ExitGranted,
            None => EventKind::AccessGranted,
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "accessgranted" => EventKind::AccessGranted,
            "entrygranted" => EventKind::EntryGranted,
            "exitgranted" => EventKind::ExitGranted,
            "accessdenied" => EventKind::AccessDenied,
            "unknownanimal" => EventKind::UnknownAnimal,
            "geofenceentered" => EventKind::GeofenceEntered,
            "geofenceexited" => EventKind::GeofenceExited,
            "geofencebreach" => EventKind::GeofenceBreach,
            other => return Err(format!("unknown event kind: {other}")),
        };
        Ok(kind)
    }
}

/// Individual (animal) as seen by the engine. CRUD lives elsewhere; only the
/// allow flag and name are read here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    pub id: AnimalId,
    pub owner: OwnerId,
    pub name: String,
    pub is_allowed: bool,
}
