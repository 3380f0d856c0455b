//! Versioned geofence policies and incremental device sync
//!
//! Every mutation bumps a fence's version by one inside the store, so the
//! version doubles as the device's sync cursor. `sync(owner, since)` returns
//! active fences newer than the cursor plus the new cursor.

use crate::domain::geofence::{
    check_boundary, CrossingInput, CrossingKind, GeofenceEvent, GeofencePatch, GeofencePolicy, NewGeofence,
    SyncResult,
};
use crate::domain::notification::Notification;
use crate::domain::types::{from_epoch_secs, GeofenceId, OwnerId};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::infra::store::{
    DeviceDirectory, EventLog, FingerprintStore, GeofenceStore, StoreError, StoreResult,
};
use crate::services::notifier::Notifier;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum crossings returned by one events query
pub const EVENTS_LIMIT: usize = 100;

/// Filter for the crossing history query
#[derive(Debug, Clone, Copy, Default)]
pub struct EventQuery {
    pub fence: Option<GeofenceId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub struct GeofencePolicySync {
    fences: Arc<dyn GeofenceStore>,
    devices: Arc<dyn DeviceDirectory>,
    individuals: Arc<dyn FingerprintStore>,
    events: Arc<dyn EventLog>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl GeofencePolicySync {
    pub fn new(
        fences: Arc<dyn GeofenceStore>,
        devices: Arc<dyn DeviceDirectory>,
        individuals: Arc<dyn FingerprintStore>,
        events: Arc<dyn EventLog>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { fences, devices, individuals, events, notifier, clock, metrics }
    }

    /// Insert a fence; a boundary that is not JSON is rejected as `Invalid`
    pub fn create(&self, owner: OwnerId, fence: &NewGeofence) -> StoreResult<GeofencePolicy> {
        validate_boundary(&fence.boundary)?;
        let created = self.fences.insert_geofence(owner, fence, self.clock.now())?;
        info!(owner = %owner, fence = %created.id, name = %created.name, "geofence_created");
        Ok(created)
    }

    /// Apply the supplied fields; the version moves even for an empty patch
    pub fn update(
        &self,
        owner: OwnerId,
        id: GeofenceId,
        patch: &GeofencePatch,
    ) -> StoreResult<Option<GeofencePolicy>> {
        if let Some(boundary) = &patch.boundary {
            validate_boundary(boundary)?;
        }
        let updated = self.fences.update_geofence(owner, id, patch, self.clock.now())?;
        if let Some(fence) = &updated {
            info!(owner = %owner, fence = %id, version = fence.version, "geofence_updated");
        }
        Ok(updated)
    }

    pub fn delete(&self, owner: OwnerId, id: GeofenceId) -> StoreResult<bool> {
        let removed = self.fences.remove_geofence(owner, id)?;
        if removed {
            info!(owner = %owner, fence = %id, "geofence_deleted");
        }
        Ok(removed)
    }

    /// Owner's fences ordered by name
    pub fn list(&self, owner: OwnerId) -> StoreResult<Vec<GeofencePolicy>> {
        let mut fences = self.fences.geofences_for_owner(owner)?;
        fences.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(fences)
    }

    pub fn get(&self, owner: OwnerId, id: GeofenceId) -> StoreResult<Option<GeofencePolicy>> {
        self.fences.geofence(owner, id)
    }

    /// Active fences with `version > since`, ordered by id. The cursor is
    /// the highest returned version, or `since` when nothing is newer.
    pub fn sync(&self, owner: OwnerId, since: u64) -> StoreResult<SyncResult> {
        let mut fences = self.fences.active_geofences_since(owner, since)?;
        fences.sort_by_key(|f| f.id);
        let version = fences.iter().map(|f| f.version).max().unwrap_or(since);

        self.metrics.record_geofence_sync();
        debug!(owner = %owner, since, version, fences = fences.len(), "geofence_sync");
        Ok(SyncResult { version, fences })
    }

    /// Store crossings reported by the device `external_id`.
    ///
    /// Returns the number stored; 0 for an unknown device. Crossings that
    /// name a fence outside the device owner's scope are discarded. Each
    /// stored breach notifies the owner.
    pub fn record_events(&self, external_id: &str, crossings: &[CrossingInput]) -> StoreResult<usize> {
        let Some(device) = self.devices.device_by_external_id(external_id)? else {
            debug!(device = %external_id, len = crossings.len(), "geofence_events_unknown_device");
            return Ok(0);
        };

        let owned: FxHashMap<GeofenceId, String> = self
            .fences
            .geofences_for_owner(device.owner)?
            .into_iter()
            .map(|f| (f.id, f.name))
            .collect();

        let recorded_at = self.clock.now();
        let mut rows = Vec::with_capacity(crossings.len());
        for c in crossings {
            if !owned.contains_key(&c.fence_id) {
                warn!(device = %external_id, fence = %c.fence_id, "geofence_event_foreign_fence");
                continue;
            }
            rows.push(GeofenceEvent {
                id: 0,
                policy_id: c.fence_id,
                device_id: device.id,
                kind: c.kind,
                latitude: c.lat,
                longitude: c.lng,
                timestamp: from_epoch_secs(c.ts),
                recorded_at,
            });
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let breaches: Vec<GeofenceId> =
            rows.iter().filter(|e| e.kind == CrossingKind::Breach).map(|e| e.policy_id).collect();
        let stored = self.events.append_geofence_events(rows)?;
        self.metrics.record_geofence_events(stored as u64, breaches.len() as u64);

        if !breaches.is_empty() {
            let animal_name = match device.animal_id {
                Some(id) => self.individuals.individual(device.owner, id)?.map(|i| i.name),
                None => None,
            };
            for fence in breaches {
                warn!(owner = %device.owner, device = %external_id, fence = %fence, "geofence_breach");
                self.notifier.notify(
                    Notification::new(device.owner, CrossingKind::Breach.event_kind())
                        .with_subject(animal_name.clone())
                        .with_note(owned.get(&fence).cloned()),
                );
            }
        }

        info!(device = %external_id, owner = %device.owner, stored, "geofence_events_stored");
        Ok(stored)
    }

    /// Crossings on the owner's fences, newest first, at most [`EVENTS_LIMIT`]
    pub fn events(&self, owner: OwnerId, query: &EventQuery) -> StoreResult<Vec<GeofenceEvent>> {
        let fences: Vec<GeofenceId> = match query.fence {
            Some(id) => self.fences.geofence(owner, id)?.map(|f| f.id).into_iter().collect(),
            None => self.fences.geofences_for_owner(owner)?.into_iter().map(|f| f.id).collect(),
        };
        if fences.is_empty() {
            return Ok(Vec::new());
        }

        let mut events: Vec<GeofenceEvent> = self
            .events
            .geofence_events(&fences)?
            .into_iter()
            .filter(|e| query.from.map_or(true, |from| e.timestamp >= from))
            .filter(|e| query.to.map_or(true, |to| e.timestamp <= to))
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        events.truncate(EVENTS_LIMIT);
        Ok(events)
    }
}

fn validate_boundary(boundary: &str) -> StoreResult<()> {
    check_boundary(boundary).map_err(|e| StoreError::Invalid(format!("boundary is not JSON: {e}")))
}
