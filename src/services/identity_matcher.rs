//! Best-match lookup of a door frame against one owner's fingerprints

use crate::domain::types::{AnimalId, OwnerId};
use crate::infra::store::{FingerprintStore, StoreResult};
use crate::services::fingerprint;
use std::sync::Arc;
use tracing::debug;

/// Best candidate for a frame. Reported even when below any threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub animal_id: Option<AnimalId>,
    pub name: Option<String>,
    pub confidence: f64,
}

impl Recognition {
    pub fn none() -> Self {
        Self { animal_id: None, name: None, confidence: 0.0 }
    }
}

pub struct IdentityMatcher {
    store: Arc<dyn FingerprintStore>,
}

impl IdentityMatcher {
    pub fn new(store: Arc<dyn FingerprintStore>) -> Self {
        Self { store }
    }

    /// Identify the animal in `image` among fingerprints owned by `owner`
    pub fn identify(&self, image: &[u8], owner: OwnerId) -> StoreResult<Recognition> {
        let records = self.store.fingerprints_for_owner(owner)?;
        if records.is_empty() {
            return Ok(Recognition::none());
        }

        let query = fingerprint::compute(image);
        if fingerprint::is_sentinel(&query) {
            debug!(owner = %owner, "identify_no_signal");
            return Ok(Recognition::none());
        }

        // (record id, animal, score); ties go to the lowest record id
        let mut best: Option<(u64, AnimalId, f64)> = None;
        for record in records.iter().filter(|r| r.owner == owner) {
            if fingerprint::is_sentinel(&record.hash) {
                continue;
            }
            let score = fingerprint::similarity(&query, &record.hash);
            let better = match best {
                None => true,
                Some((id, _, top)) => score > top || (score == top && record.id < id),
            };
            if better {
                best = Some((record.id, record.animal_id, score));
            }
        }

        let Some((record_id, animal_id, confidence)) = best else {
            return Ok(Recognition::none());
        };

        let name = self.store.individual(owner, animal_id)?.map(|i| i.name);
        debug!(
            owner = %owner,
            animal = %animal_id,
            record = record_id,
            confidence = format!("{confidence:.3}"),
            "identify_best_candidate"
        );
        Ok(Recognition { animal_id: Some(animal_id), name, confidence })
    }
}
