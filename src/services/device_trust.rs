//! Wearable device pairing and challenge-response authentication
//!
//! A device proves possession of its shared secret by answering
//! `hex(HMAC-SHA256(secret, challenge || timestamp_le8))`. Checks run in
//! order and the first failure is final:
//! 1. active device with that external id exists
//! 2. timestamp within the replay window of the server clock
//! 3. response matches, compared in constant time
//! 4. the (challenge, timestamp) pair has not authenticated before

use crate::domain::device::{DevicePatch, PairingResult, WearableDevice};
use crate::domain::types::{AnimalId, DeviceId, OwnerId};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::infra::store::{DeviceDirectory, FingerprintStore, StoreError, StoreResult};
use crate::services::replay_cache::ReplayCache;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const EXTERNAL_ID_BYTES: usize = 16;
const SECRET_BYTES: usize = 32;

pub const REASON_DEVICE_NOT_FOUND: &str = "Device not found";
pub const REASON_TIMESTAMP_EXPIRED: &str = "Timestamp expired";
pub const REASON_HMAC_FAILED: &str = "HMAC verification failed";
pub const REASON_REPLAYED: &str = "Challenge already used";

/// Authentication attempt presented by a device
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VerifyRequest {
    /// Hex-encoded challenge bytes
    pub challenge: String,
    /// Hex-encoded HMAC, any case
    pub response: String,
    /// Device clock, epoch seconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedAnimal {
    pub id: AnimalId,
    pub name: String,
    pub is_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub animal: Option<VerifiedAnimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerificationResult {
    fn failed(reason: &str) -> Self {
        Self { verified: false, animal: None, reason: Some(reason.to_string()) }
    }
}

/// Expected response for a challenge, as lowercase hex.
///
/// `secret` is the base64 shared secret handed out at pairing.
pub fn compute_response(secret: &str, challenge: &[u8], timestamp: i64) -> StoreResult<String> {
    let key = STANDARD
        .decode(secret)
        .map_err(|e| StoreError::Corrupt(format!("device secret is not base64: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| StoreError::Corrupt(format!("device secret rejected: {e}")))?;
    mac.update(challenge);
    mac.update(&timestamp.to_le_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub struct DeviceTrustVerifier {
    devices: Arc<dyn DeviceDirectory>,
    individuals: Arc<dyn FingerprintStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    replay_window_secs: i64,
    replay: ReplayCache,
}

impl DeviceTrustVerifier {
    pub fn new(
        devices: Arc<dyn DeviceDirectory>,
        individuals: Arc<dyn FingerprintStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        replay_window_secs: u64,
    ) -> Self {
        Self {
            devices,
            individuals,
            clock,
            metrics,
            replay_window_secs: replay_window_secs.min(i64::MAX as u64) as i64,
            replay: ReplayCache::new(replay_window_secs),
        }
    }

    /// Verify an authentication attempt from the device `external_id`
    pub fn verify(&self, external_id: &str, request: &VerifyRequest) -> StoreResult<VerificationResult> {
        let result = self.verify_inner(external_id, request)?;
        self.metrics.record_verification(result.verified);
        Ok(result)
    }

    fn verify_inner(&self, external_id: &str, request: &VerifyRequest) -> StoreResult<VerificationResult> {
        // inactive and unknown devices are indistinguishable to the caller
        let device = match self.devices.device_by_external_id(external_id)? {
            Some(device) if device.is_active => device,
            _ => {
                debug!(device = %external_id, "verify_device_not_found");
                return Ok(VerificationResult::failed(REASON_DEVICE_NOT_FOUND));
            }
        };

        let now = self.clock.now();
        let skew = now.timestamp().saturating_sub(request.timestamp).saturating_abs();
        if skew > self.replay_window_secs {
            info!(device = %external_id, skew_secs = skew, "verify_timestamp_expired");
            return Ok(VerificationResult::failed(REASON_TIMESTAMP_EXPIRED));
        }

        let Ok(challenge) = hex::decode(&request.challenge) else {
            info!(device = %external_id, "verify_malformed_challenge");
            return Ok(VerificationResult::failed(REASON_HMAC_FAILED));
        };
        let expected = compute_response(&device.shared_secret, &challenge, request.timestamp)?;
        let supplied = request.response.to_ascii_lowercase();
        if !bool::from(expected.as_bytes().ct_eq(supplied.as_bytes())) {
            info!(device = %external_id, "verify_hmac_mismatch");
            return Ok(VerificationResult::failed(REASON_HMAC_FAILED));
        }

        if !self.replay.first_use(device.id, &request.challenge, request.timestamp, now) {
            warn!(device = %external_id, ts = request.timestamp, "verify_replayed_challenge");
            return Ok(VerificationResult::failed(REASON_REPLAYED));
        }

        self.devices.touch_device(device.id, now)?;

        let animal = match device.animal_id {
            Some(id) => self.individuals.individual(device.owner, id)?.map(|i| VerifiedAnimal {
                id: i.id,
                name: i.name,
                is_allowed: i.is_allowed,
            }),
            None => None,
        };

        info!(
            device = %external_id,
            owner = %device.owner,
            animal = ?animal.as_ref().map(|a| a.id.0),
            "verify_ok"
        );
        Ok(VerificationResult { verified: true, animal, reason: None })
    }

    /// Pair a new device. The returned secret is never exposed again.
    pub fn register_device(
        &self,
        owner: OwnerId,
        name: &str,
        animal_id: Option<AnimalId>,
    ) -> StoreResult<PairingResult> {
        let animal_id = self.owned_animal(owner, animal_id)?;
        let external_id = hex::encode(random_bytes::<EXTERNAL_ID_BYTES>());
        let shared_secret = STANDARD.encode(random_bytes::<SECRET_BYTES>());

        let device = self.devices.insert_device(WearableDevice {
            id: DeviceId(0),
            owner,
            external_id,
            name: name.to_string(),
            shared_secret,
            animal_id,
            last_seen_at: None,
            last_latitude: None,
            last_longitude: None,
            last_accuracy: None,
            battery_voltage: None,
            battery_percent: None,
            firmware_version: None,
            is_active: true,
            created_at: self.clock.now(),
        })?;

        info!(owner = %owner, device = %device.external_id, id = %device.id, "device_registered");
        Ok(PairingResult {
            id: device.id,
            external_id: device.external_id,
            shared_secret: device.shared_secret,
            name: device.name,
        })
    }

    pub fn update_device(
        &self,
        owner: OwnerId,
        id: DeviceId,
        patch: &DevicePatch,
    ) -> StoreResult<Option<WearableDevice>> {
        let mut patch = patch.clone();
        patch.animal_id = self.owned_animal(owner, patch.animal_id)?;
        let updated = self.devices.update_device(owner, id, &patch)?;
        if updated.is_some() {
            info!(owner = %owner, id = %id, "device_updated");
        }
        Ok(updated)
    }

    pub fn remove_device(&self, owner: OwnerId, id: DeviceId) -> StoreResult<bool> {
        let removed = self.devices.remove_device(owner, id)?;
        if removed {
            info!(owner = %owner, id = %id, "device_removed");
        }
        Ok(removed)
    }

    pub fn list_devices(&self, owner: OwnerId) -> StoreResult<Vec<WearableDevice>> {
        self.devices.devices_for_owner(owner)
    }

    pub fn device(&self, owner: OwnerId, id: DeviceId) -> StoreResult<Option<WearableDevice>> {
        self.devices.device(owner, id)
    }

    /// Only links to animals of the same owner survive
    fn owned_animal(&self, owner: OwnerId, animal_id: Option<AnimalId>) -> StoreResult<Option<AnimalId>> {
        let Some(id) = animal_id else {
            return Ok(None);
        };
        if self.individuals.individual(owner, id)?.is_some() {
            Ok(Some(id))
        } else {
            warn!(owner = %owner, animal = %id, "device_link_foreign_animal_ignored");
            Ok(None)
        }
    }
}
