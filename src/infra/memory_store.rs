//! In-process implementation of every storage trait
//!
//! Each table sits behind its own parking_lot lock. Read-modify-write
//! operations hold the write lock for the whole step, which is what keeps
//! geofence versions and device state from losing updates.

use crate::domain::device::{DeviceFix, DevicePatch, LocationSample, WearableDevice};
use crate::domain::door::{
    AccessEvent, DoorPolicy, DoorPolicyPatch, FingerprintRecord, DEFAULT_AUTO_CLOSE_SECS,
    DEFAULT_CONFIDENCE_THRESHOLD,
};
use crate::domain::firmware::FirmwareRelease;
use crate::domain::geofence::{GeofenceEvent, GeofencePatch, GeofencePolicy, NewGeofence};
use crate::domain::notification::NotificationPreferences;
use crate::domain::types::{AnimalId, DeviceId, GeofenceId, Individual, OwnerId};
use crate::infra::store::{
    DeviceDirectory, EventLog, FingerprintStore, FirmwareStore, GeofenceStore, IdFloor,
    OwnerRecords, PolicyStore, PreferenceStore, SampleStore, StoreError, StoreResult,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

#[derive(Default)]
struct EventTables {
    access: Vec<AccessEvent>,
    geofence: Vec<GeofenceEvent>,
    next_access_id: u64,
    next_geofence_id: u64,
}

pub struct MemoryStore {
    policy_defaults: (f64, u32),
    /// Last ids handed out; only ever move forward
    last_ids: Mutex<IdFloor>,
    individuals: RwLock<FxHashMap<AnimalId, Individual>>,
    fingerprints: RwLock<Vec<FingerprintRecord>>,
    policies: RwLock<BTreeMap<OwnerId, DoorPolicy>>,
    devices: RwLock<BTreeMap<DeviceId, WearableDevice>>,
    samples: RwLock<Vec<LocationSample>>,
    geofences: RwLock<BTreeMap<GeofenceId, GeofencePolicy>>,
    preferences: RwLock<FxHashMap<OwnerId, NotificationPreferences>>,
    releases: RwLock<Vec<FirmwareRelease>>,
    events: Mutex<EventTables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            policy_defaults: (DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_AUTO_CLOSE_SECS),
            last_ids: Mutex::default(),
            individuals: RwLock::default(),
            fingerprints: RwLock::default(),
            policies: RwLock::default(),
            devices: RwLock::default(),
            samples: RwLock::default(),
            geofences: RwLock::default(),
            preferences: RwLock::default(),
            releases: RwLock::default(),
            events: Mutex::default(),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threshold and auto-close delay used when a policy is auto-created
    pub fn with_policy_defaults(mut self, threshold: f64, auto_close_secs: u32) -> Self {
        self.policy_defaults = (threshold, auto_close_secs);
        self
    }

    /// Start id allocation above ids that durable records still reference
    pub fn with_id_floor(self, floor: IdFloor) -> Self {
        {
            let mut last = self.last_ids.lock();
            last.device = last.device.max(floor.device);
            last.geofence = last.geofence.max(floor.geofence);
        }
        self
    }

    fn default_policy(&self, owner: OwnerId, now: DateTime<Utc>) -> DoorPolicy {
        let mut policy = DoorPolicy::with_defaults(owner, now);
        policy.min_confidence = self.policy_defaults.0;
        policy.auto_close_delay_secs = self.policy_defaults.1;
        policy
    }

    /// Insert or replace an individual (owned by the CRUD layer)
    pub fn put_individual(&self, individual: Individual) {
        self.individuals.write().insert(individual.id, individual);
    }

    /// Store a reference fingerprint and return the record with its new id
    pub fn add_fingerprint(&self, owner: OwnerId, animal_id: AnimalId, hash: &str) -> FingerprintRecord {
        let mut fingerprints = self.fingerprints.write();
        let id = fingerprints.last().map(|r| r.id + 1).unwrap_or(1);
        let record = FingerprintRecord { id, animal_id, owner, hash: hash.to_string() };
        fingerprints.push(record.clone());
        record
    }

    /// Insert or replace a policy wholesale (provisioning)
    pub fn put_policy(&self, policy: DoorPolicy) {
        self.policies.write().insert(policy.owner, policy);
    }

    pub fn put_preferences(&self, prefs: NotificationPreferences) {
        self.preferences.write().insert(prefs.owner, prefs);
    }
}

impl FingerprintStore for MemoryStore {
    fn fingerprints_for_owner(&self, owner: OwnerId) -> StoreResult<Vec<FingerprintRecord>> {
        Ok(self.fingerprints.read().iter().filter(|r| r.owner == owner).cloned().collect())
    }

    fn individual(&self, owner: OwnerId, id: AnimalId) -> StoreResult<Option<Individual>> {
        Ok(self.individuals.read().get(&id).filter(|i| i.owner == owner).cloned())
    }
}

impl PolicyStore for MemoryStore {
    fn policy_by_api_key(&self, api_key: &str) -> StoreResult<Option<DoorPolicy>> {
        Ok(self
            .policies
            .read()
            .values()
            .find(|p| p.api_key.as_deref() == Some(api_key))
            .cloned())
    }

    fn policies_without_api_key(&self) -> StoreResult<Vec<DoorPolicy>> {
        Ok(self.policies.read().values().filter(|p| p.api_key.is_none()).cloned().collect())
    }

    fn policy_or_default(&self, owner: OwnerId, now: DateTime<Utc>) -> StoreResult<DoorPolicy> {
        let mut policies = self.policies.write();
        Ok(policies.entry(owner).or_insert_with(|| self.default_policy(owner, now)).clone())
    }

    fn update_policy(
        &self,
        owner: OwnerId,
        patch: &DoorPolicyPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<DoorPolicy> {
        let mut policies = self.policies.write();
        if let Some(key) = &patch.api_key {
            if policies.values().any(|p| p.owner != owner && p.api_key.as_deref() == Some(key)) {
                return Err(StoreError::Conflict("api key already assigned".to_string()));
            }
        }
        let policy = policies.entry(owner).or_insert_with(|| self.default_policy(owner, now));
        policy.apply(patch, now);
        Ok(policy.clone())
    }
}

impl DeviceDirectory for MemoryStore {
    fn insert_device(&self, mut device: WearableDevice) -> StoreResult<WearableDevice> {
        let mut devices = self.devices.write();
        if devices.values().any(|d| d.external_id == device.external_id) {
            return Err(StoreError::Conflict(format!(
                "device {} already registered",
                device.external_id
            )));
        }
        let mut last = self.last_ids.lock();
        last.device += 1;
        device.id = DeviceId(last.device);
        devices.insert(device.id, device.clone());
        Ok(device)
    }

    fn device_by_external_id(&self, external_id: &str) -> StoreResult<Option<WearableDevice>> {
        Ok(self.devices.read().values().find(|d| d.external_id == external_id).cloned())
    }

    fn device(&self, owner: OwnerId, id: DeviceId) -> StoreResult<Option<WearableDevice>> {
        Ok(self.devices.read().get(&id).filter(|d| d.owner == owner).cloned())
    }

    fn devices_for_owner(&self, owner: OwnerId) -> StoreResult<Vec<WearableDevice>> {
        Ok(self.devices.read().values().filter(|d| d.owner == owner).cloned().collect())
    }

    fn update_device(
        &self,
        owner: OwnerId,
        id: DeviceId,
        patch: &DevicePatch,
    ) -> StoreResult<Option<WearableDevice>> {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(&id).filter(|d| d.owner == owner) else {
            return Ok(None);
        };
        if let Some(name) = &patch.name {
            device.name = name.clone();
        }
        if let Some(animal_id) = patch.animal_id {
            device.animal_id = Some(animal_id);
        }
        if let Some(active) = patch.is_active {
            device.is_active = active;
        }
        Ok(Some(device.clone()))
    }

    fn remove_device(&self, owner: OwnerId, id: DeviceId) -> StoreResult<bool> {
        let mut devices = self.devices.write();
        if devices.get(&id).is_some_and(|d| d.owner == owner) {
            devices.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    fn touch_device(&self, id: DeviceId, seen_at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(device) = self.devices.write().get_mut(&id) {
            device.last_seen_at = Some(seen_at);
        }
        Ok(())
    }

    fn record_fix(&self, id: DeviceId, fix: &DeviceFix) -> StoreResult<()> {
        if let Some(device) = self.devices.write().get_mut(&id) {
            device.last_latitude = Some(fix.latitude);
            device.last_longitude = Some(fix.longitude);
            device.last_accuracy = fix.accuracy;
            device.battery_voltage = fix.battery_voltage;
            device.battery_percent = fix.battery_percent;
            device.last_seen_at = Some(fix.seen_at);
        }
        Ok(())
    }

    fn record_firmware(&self, id: DeviceId, version: &str, seen_at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(device) = self.devices.write().get_mut(&id) {
            device.firmware_version = Some(version.to_string());
            device.last_seen_at = Some(seen_at);
        }
        Ok(())
    }
}

impl SampleStore for MemoryStore {
    fn append_samples(&self, samples: Vec<LocationSample>) -> StoreResult<usize> {
        let count = samples.len();
        self.samples.write().extend(samples);
        Ok(count)
    }

    fn samples_between(
        &self,
        device: DeviceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LocationSample>> {
        let mut found: Vec<LocationSample> = self
            .samples
            .read()
            .iter()
            .filter(|s| s.device_id == device && s.timestamp >= from && s.timestamp <= to)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.timestamp);
        Ok(found)
    }
}

impl GeofenceStore for MemoryStore {
    fn insert_geofence(
        &self,
        owner: OwnerId,
        fence: &NewGeofence,
        now: DateTime<Utc>,
    ) -> StoreResult<GeofencePolicy> {
        let mut geofences = self.geofences.write();
        let id = {
            let mut last = self.last_ids.lock();
            last.geofence += 1;
            GeofenceId(last.geofence)
        };
        let policy = GeofencePolicy {
            id,
            owner,
            name: fence.name.clone(),
            shape: fence.shape,
            rule: fence.rule,
            boundary: fence.boundary.clone(),
            alert: fence.alert,
            is_active: true,
            version: 1,
            created_at: now,
            updated_at: None,
        };
        geofences.insert(id, policy.clone());
        Ok(policy)
    }

    fn geofence(&self, owner: OwnerId, id: GeofenceId) -> StoreResult<Option<GeofencePolicy>> {
        Ok(self.geofences.read().get(&id).filter(|f| f.owner == owner).cloned())
    }

    fn geofences_for_owner(&self, owner: OwnerId) -> StoreResult<Vec<GeofencePolicy>> {
        Ok(self.geofences.read().values().filter(|f| f.owner == owner).cloned().collect())
    }

    fn update_geofence(
        &self,
        owner: OwnerId,
        id: GeofenceId,
        patch: &GeofencePatch,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<GeofencePolicy>> {
        let mut geofences = self.geofences.write();
        let Some(fence) = geofences.get_mut(&id).filter(|f| f.owner == owner) else {
            return Ok(None);
        };
        fence.apply(patch, now);
        Ok(Some(fence.clone()))
    }

    fn remove_geofence(&self, owner: OwnerId, id: GeofenceId) -> StoreResult<bool> {
        let mut geofences = self.geofences.write();
        if geofences.get(&id).is_some_and(|f| f.owner == owner) {
            geofences.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    fn active_geofences_since(
        &self,
        owner: OwnerId,
        since: u64,
    ) -> StoreResult<Vec<GeofencePolicy>> {
        Ok(self
            .geofences
            .read()
            .values()
            .filter(|f| f.owner == owner && f.is_active && f.version > since)
            .cloned()
            .collect())
    }
}

impl PreferenceStore for MemoryStore {
    fn notification_preferences(
        &self,
        owner: OwnerId,
    ) -> StoreResult<Option<NotificationPreferences>> {
        Ok(self.preferences.read().get(&owner).cloned())
    }

    fn save_preferences(&self, prefs: NotificationPreferences) -> StoreResult<()> {
        self.put_preferences(prefs);
        Ok(())
    }
}

impl OwnerRecords for MemoryStore {
    fn upsert_individual(&self, individual: Individual) -> StoreResult<Individual> {
        let mut individuals = self.individuals.write();
        if individuals.get(&individual.id).is_some_and(|i| i.owner != individual.owner) {
            return Err(StoreError::Conflict(format!("animal {} belongs to another owner", individual.id)));
        }
        individuals.insert(individual.id, individual.clone());
        Ok(individual)
    }

    fn individuals_for_owner(&self, owner: OwnerId) -> StoreResult<Vec<Individual>> {
        let mut owned: Vec<Individual> =
            self.individuals.read().values().filter(|i| i.owner == owner).cloned().collect();
        owned.sort_by_key(|i| i.id);
        Ok(owned)
    }

    fn enroll_fingerprint(
        &self,
        owner: OwnerId,
        animal_id: AnimalId,
        hash: &str,
    ) -> StoreResult<FingerprintRecord> {
        Ok(self.add_fingerprint(owner, animal_id, hash))
    }
}

impl FirmwareStore for MemoryStore {
    fn insert_release(&self, mut release: FirmwareRelease) -> StoreResult<FirmwareRelease> {
        let mut releases = self.releases.write();
        if releases.iter().any(|r| r.version == release.version) {
            return Err(StoreError::Conflict(format!("firmware {} already released", release.version)));
        }
        release.id = releases.last().map(|r| r.id + 1).unwrap_or(1);
        releases.push(release.clone());
        Ok(release)
    }

    fn latest_active_release(&self) -> StoreResult<Option<FirmwareRelease>> {
        Ok(self
            .releases
            .read()
            .iter()
            .filter(|r| r.is_active)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    fn releases(&self) -> StoreResult<Vec<FirmwareRelease>> {
        let mut all = self.releases.read().clone();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all)
    }
}

impl EventLog for MemoryStore {
    fn append_access_event(&self, mut event: AccessEvent) -> StoreResult<AccessEvent> {
        let mut tables = self.events.lock();
        tables.next_access_id += 1;
        event.id = tables.next_access_id;
        tables.access.push(event.clone());
        Ok(event)
    }

    fn append_geofence_events(&self, events: Vec<GeofenceEvent>) -> StoreResult<usize> {
        let mut tables = self.events.lock();
        let count = events.len();
        for mut event in events {
            tables.next_geofence_id += 1;
            event.id = tables.next_geofence_id;
            tables.geofence.push(event);
        }
        Ok(count)
    }

    fn access_events(&self, owner: OwnerId) -> StoreResult<Vec<AccessEvent>> {
        let tables = self.events.lock();
        Ok(tables.access.iter().rev().filter(|e| e.owner == Some(owner)).cloned().collect())
    }

    fn geofence_events(&self, fences: &[GeofenceId]) -> StoreResult<Vec<GeofenceEvent>> {
        let tables = self.events.lock();
        Ok(tables
            .geofence
            .iter()
            .rev()
            .filter(|e| fences.contains(&e.policy_id))
            .cloned()
            .collect())
    }
}
