//! Owner-managed animals and their reference fingerprints
//!
//! An enrolled photo is hashed exactly like a door frame, so a later frame of
//! the same animal scores against it in the identity matcher.

use crate::domain::door::FingerprintRecord;
use crate::domain::types::{AnimalId, Individual, OwnerId};
use crate::infra::store::{FingerprintStore, OwnerRecords, StoreError, StoreResult};
use crate::services::error::EngineResult;
use crate::services::fingerprint;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Body of `PUT /api/owners/{owner}/animals/{id}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnimalInput {
    pub name: String,
    #[serde(default = "default_allowed")]
    pub is_allowed: bool,
}

fn default_allowed() -> bool {
    true
}

pub struct AnimalRegistry {
    records: Arc<dyn OwnerRecords>,
    individuals: Arc<dyn FingerprintStore>,
}

impl AnimalRegistry {
    pub fn new(records: Arc<dyn OwnerRecords>, individuals: Arc<dyn FingerprintStore>) -> Self {
        Self { records, individuals }
    }

    /// Create or replace the owner's animal `id`
    pub fn put_animal(&self, owner: OwnerId, id: AnimalId, input: &AnimalInput) -> StoreResult<Individual> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("animal name is required".to_string()));
        }
        let stored = self.records.upsert_individual(Individual {
            id,
            owner,
            name: name.to_string(),
            is_allowed: input.is_allowed,
        })?;
        info!(owner = %owner, animal = %id, allowed = stored.is_allowed, "animal_saved");
        Ok(stored)
    }

    pub fn animals(&self, owner: OwnerId) -> StoreResult<Vec<Individual>> {
        self.records.individuals_for_owner(owner)
    }

    /// Hash `photo` and keep it as a reference for the animal. `None` when
    /// the animal is not the owner's. A photo with no usable signal is
    /// rejected as `Invalid`.
    pub async fn enroll(
        &self,
        owner: OwnerId,
        animal: AnimalId,
        photo: Vec<u8>,
    ) -> EngineResult<Option<FingerprintRecord>> {
        if self.individuals.individual(owner, animal)?.is_none() {
            debug!(owner = %owner, animal = %animal, "enroll_unknown_animal");
            return Ok(None);
        }

        let hash = tokio::task::spawn_blocking(move || fingerprint::compute(&photo)).await?;
        if fingerprint::is_sentinel(&hash) {
            return Err(StoreError::Invalid("photo has no usable fingerprint".to_string()).into());
        }

        let record = self.records.enroll_fingerprint(owner, animal, &hash)?;
        info!(owner = %owner, animal = %animal, record = record.id, "fingerprint_enrolled");
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory_store::MemoryStore;
    use crate::services::error::EngineError;
    use image::{ImageBuffer, ImageFormat, Luma};
    use std::io::Cursor;

    fn png(f: impl Fn(u32, u32) -> u8) -> Vec<u8> {
        let img = ImageBuffer::from_fn(32, 32, |x, y| Luma([f(x, y)]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn setup() -> (Arc<MemoryStore>, AnimalRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), AnimalRegistry::new(store.clone(), store))
    }

    fn input(name: &str) -> AnimalInput {
        AnimalInput { name: name.to_string(), is_allowed: true }
    }

    #[test]
    fn test_put_animal_scoped_by_owner() {
        let (_, registry) = setup();
        registry.put_animal(OwnerId(1), AnimalId(4), &input(" Rex ")).unwrap();
        let renamed = registry.put_animal(OwnerId(1), AnimalId(4), &input("Rex II")).unwrap();
        assert_eq!(renamed.name, "Rex II");
        assert_eq!(registry.animals(OwnerId(1)).unwrap().len(), 1);

        assert!(matches!(
            registry.put_animal(OwnerId(2), AnimalId(4), &input("Stolen")),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            registry.put_animal(OwnerId(1), AnimalId(5), &input("  ")),
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_enroll_stores_hash() {
        let (store, registry) = setup();
        registry.put_animal(OwnerId(1), AnimalId(4), &input("Rex")).unwrap();
        let photo = png(|x, _| 255 - (x * 8) as u8);

        let record = registry.enroll(OwnerId(1), AnimalId(4), photo.clone()).await.unwrap().unwrap();
        assert_eq!(record.hash, fingerprint::compute(&photo));
        assert_eq!(store.fingerprints_for_owner(OwnerId(1)).unwrap(), vec![record]);

        // another owner's animal is invisible
        assert!(registry.enroll(OwnerId(2), AnimalId(4), photo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enroll_rejects_flat_photo() {
        let (store, registry) = setup();
        registry.put_animal(OwnerId(1), AnimalId(4), &input("Rex")).unwrap();

        let err = registry.enroll(OwnerId(1), AnimalId(4), png(|_, _| 90)).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Invalid(_))));
        let err = registry.enroll(OwnerId(1), AnimalId(4), b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Invalid(_))));
        assert!(store.fingerprints_for_owner(OwnerId(1)).unwrap().is_empty());
    }
}
