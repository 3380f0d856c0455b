//! Storage collaborator interfaces
//!
//! The engine only talks to storage through these traits. Every method that
//! reads and then writes a record (version bump, last-seen, policy
//! auto-create) must do so atomically in the implementation, so concurrent
//! callers serialise at the storage layer instead of in the services.

use crate::domain::device::{DeviceFix, DevicePatch, LocationSample, WearableDevice};
use crate::domain::door::{AccessEvent, DoorPolicy, DoorPolicyPatch, FingerprintRecord};
use crate::domain::firmware::FirmwareRelease;
use crate::domain::geofence::{GeofenceEvent, GeofencePatch, GeofencePolicy, NewGeofence};
use crate::domain::notification::NotificationPreferences;
use crate::domain::types::{AnimalId, DeviceId, GeofenceId, Individual, OwnerId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Highest device and geofence ids already referenced by durable records.
/// A store seeded with a floor never hands out an id at or below it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdFloor {
    pub device: i64,
    pub geofence: i64,
}

pub trait FingerprintStore: Send + Sync {
    /// All fingerprints owned by `owner`, ordered by record id
    fn fingerprints_for_owner(&self, owner: OwnerId) -> StoreResult<Vec<FingerprintRecord>>;

    fn individual(&self, owner: OwnerId, id: AnimalId) -> StoreResult<Option<Individual>>;
}

pub trait PolicyStore: Send + Sync {
    fn policy_by_api_key(&self, api_key: &str) -> StoreResult<Option<DoorPolicy>>;

    /// Every policy that has no credential configured
    fn policies_without_api_key(&self) -> StoreResult<Vec<DoorPolicy>>;

    /// Owner's policy, created with defaults on first read
    fn policy_or_default(&self, owner: OwnerId, now: DateTime<Utc>) -> StoreResult<DoorPolicy>;

    fn update_policy(
        &self,
        owner: OwnerId,
        patch: &DoorPolicyPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<DoorPolicy>;
}

pub trait DeviceDirectory: Send + Sync {
    /// Insert a new device; the store assigns `id`, never reusing one that
    /// was handed out before. Duplicate external IDs conflict.
    fn insert_device(&self, device: WearableDevice) -> StoreResult<WearableDevice>;

    fn device_by_external_id(&self, external_id: &str) -> StoreResult<Option<WearableDevice>>;

    fn device(&self, owner: OwnerId, id: DeviceId) -> StoreResult<Option<WearableDevice>>;

    fn devices_for_owner(&self, owner: OwnerId) -> StoreResult<Vec<WearableDevice>>;

    fn update_device(
        &self,
        owner: OwnerId,
        id: DeviceId,
        patch: &DevicePatch,
    ) -> StoreResult<Option<WearableDevice>>;

    fn remove_device(&self, owner: OwnerId, id: DeviceId) -> StoreResult<bool>;

    fn touch_device(&self, id: DeviceId, seen_at: DateTime<Utc>) -> StoreResult<()>;

    fn record_fix(&self, id: DeviceId, fix: &DeviceFix) -> StoreResult<()>;

    /// Remember the version a device reported and mark it seen
    fn record_firmware(&self, id: DeviceId, version: &str, seen_at: DateTime<Utc>) -> StoreResult<()>;
}

pub trait SampleStore: Send + Sync {
    fn append_samples(&self, samples: Vec<LocationSample>) -> StoreResult<usize>;

    /// Samples with `from <= timestamp <= to`, ascending by timestamp
    fn samples_between(
        &self,
        device: DeviceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LocationSample>>;
}

pub trait GeofenceStore: Send + Sync {
    /// Insert with version 1, active; the store assigns a never-reused `id`
    fn insert_geofence(
        &self,
        owner: OwnerId,
        fence: &NewGeofence,
        now: DateTime<Utc>,
    ) -> StoreResult<GeofencePolicy>;

    fn geofence(&self, owner: OwnerId, id: GeofenceId) -> StoreResult<Option<GeofencePolicy>>;

    fn geofences_for_owner(&self, owner: OwnerId) -> StoreResult<Vec<GeofencePolicy>>;

    /// Patch and bump the version in one atomic step
    fn update_geofence(
        &self,
        owner: OwnerId,
        id: GeofenceId,
        patch: &GeofencePatch,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<GeofencePolicy>>;

    fn remove_geofence(&self, owner: OwnerId, id: GeofenceId) -> StoreResult<bool>;

    /// Active fences of `owner` with `version > since`, ordered by id
    fn active_geofences_since(&self, owner: OwnerId, since: u64)
        -> StoreResult<Vec<GeofencePolicy>>;
}

/// Append-only log of decisions and crossings. Records are never mutated.
pub trait EventLog: Send + Sync {
    /// Append and return the stored record with its assigned id
    fn append_access_event(&self, event: AccessEvent) -> StoreResult<AccessEvent>;

    /// Append a whole batch or nothing
    fn append_geofence_events(&self, events: Vec<GeofenceEvent>) -> StoreResult<usize>;

    /// Owner's access events, newest first
    fn access_events(&self, owner: OwnerId) -> StoreResult<Vec<AccessEvent>>;

    /// Crossings for the given fences, newest first
    fn geofence_events(&self, fences: &[GeofenceId]) -> StoreResult<Vec<GeofenceEvent>>;
}

pub trait PreferenceStore: Send + Sync {
    fn notification_preferences(
        &self,
        owner: OwnerId,
    ) -> StoreResult<Option<NotificationPreferences>>;

    fn save_preferences(&self, prefs: NotificationPreferences) -> StoreResult<()>;
}

/// Owner-managed animals and their reference fingerprints
pub trait OwnerRecords: Send + Sync {
    /// Insert or replace. An id already held by another owner conflicts.
    fn upsert_individual(&self, individual: Individual) -> StoreResult<Individual>;

    /// Ordered by id
    fn individuals_for_owner(&self, owner: OwnerId) -> StoreResult<Vec<Individual>>;

    /// Store a reference hash; the store assigns the record id
    fn enroll_fingerprint(
        &self,
        owner: OwnerId,
        animal_id: AnimalId,
        hash: &str,
    ) -> StoreResult<FingerprintRecord>;
}

/// Collar firmware releases
pub trait FirmwareStore: Send + Sync {
    /// Insert with a store-assigned id. A version already released conflicts.
    fn insert_release(&self, release: FirmwareRelease) -> StoreResult<FirmwareRelease>;

    /// Newest active release by creation time
    fn latest_active_release(&self) -> StoreResult<Option<FirmwareRelease>>;

    /// Every release, newest first
    fn releases(&self) -> StoreResult<Vec<FirmwareRelease>>;
}
