//! Collar firmware catalog: update checks, downloads and uploads
//!
//! The newest active release (by upload time) is the one offered to every
//! collar. A check also records the version the collar reports.

use crate::domain::firmware::{check_version, FirmwareCheck, FirmwareRelease, MAX_NOTES_LEN};
use crate::infra::clock::Clock;
use crate::infra::store::{DeviceDirectory, FirmwareStore, StoreError, StoreResult};
use crate::io::firmware_files::FirmwareFiles;
use crate::services::error::EngineResult;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A release together with its image bytes
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub release: FirmwareRelease,
    pub bytes: Vec<u8>,
}

pub struct FirmwareCatalog {
    releases: Arc<dyn FirmwareStore>,
    devices: Arc<dyn DeviceDirectory>,
    files: Arc<FirmwareFiles>,
    clock: Arc<dyn Clock>,
}

impl FirmwareCatalog {
    pub fn new(
        releases: Arc<dyn FirmwareStore>,
        devices: Arc<dyn DeviceDirectory>,
        files: Arc<FirmwareFiles>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { releases, devices, files, clock }
    }

    /// Whether a release other than `current` is available.
    ///
    /// A known device gets `current` recorded and its last-seen time moved.
    /// Unknown devices still get an answer.
    pub fn check(&self, external_id: &str, current: &str) -> StoreResult<FirmwareCheck> {
        check_version(current).map_err(StoreError::Invalid)?;
        if let Some(device) = self.devices.device_by_external_id(external_id)? {
            self.devices.record_firmware(device.id, current, self.clock.now())?;
        }

        let Some(latest) = self.releases.latest_active_release()? else {
            return Ok(FirmwareCheck::up_to_date());
        };
        if latest.version == current {
            return Ok(FirmwareCheck::up_to_date());
        }
        debug!(device = %external_id, current, latest = %latest.version, "firmware_update_offered");
        Ok(FirmwareCheck::offer(&latest))
    }

    /// Image of the newest active release. `None` when there is no release
    /// or its file has gone missing.
    pub async fn download(&self, external_id: &str) -> EngineResult<Option<FirmwareImage>> {
        let Some(release) = self.releases.latest_active_release()? else {
            return Ok(None);
        };

        let files = self.files.clone();
        let path = release.file_path.clone();
        let Some(bytes) = tokio::task::spawn_blocking(move || files.load(&path)).await?? else {
            warn!(version = %release.version, path = %release.file_path, "firmware_file_missing");
            return Ok(None);
        };

        info!(device = %external_id, version = %release.version, bytes = bytes.len(), "firmware_download");
        Ok(Some(FirmwareImage { release, bytes }))
    }

    /// Store a new active release. Versions are unique.
    pub async fn upload(
        &self,
        version: &str,
        notes: Option<&str>,
        image: Vec<u8>,
    ) -> EngineResult<FirmwareRelease> {
        check_version(version).map_err(StoreError::Invalid)?;
        let notes = notes.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
        if notes.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTES_LEN) {
            return Err(StoreError::Invalid(format!("release notes exceed {MAX_NOTES_LEN} characters")).into());
        }
        if image.is_empty() {
            return Err(StoreError::Invalid("firmware image is empty".to_string()).into());
        }
        // checked before the write so a duplicate never replaces a released file
        if self.releases.releases()?.iter().any(|r| r.version == version) {
            return Err(StoreError::Conflict(format!("firmware {version} already released")).into());
        }

        let sha256 = hex::encode(Sha256::digest(&image));
        let file_size = image.len() as u64;
        let files = self.files.clone();
        let name = version.to_string();
        let file_path = tokio::task::spawn_blocking(move || files.save(&name, &image)).await??;

        let release = self.releases.insert_release(FirmwareRelease {
            id: 0,
            version: version.to_string(),
            file_path,
            file_size,
            sha256,
            release_notes: notes,
            is_active: true,
            created_at: self.clock.now(),
        })?;

        info!(version = %release.version, bytes = file_size, sha256 = %release.sha256, "firmware_uploaded");
        Ok(release)
    }

    /// Every release, newest first
    pub fn releases(&self) -> StoreResult<Vec<FirmwareRelease>> {
        self.releases.releases()
    }
}
