//! Collar firmware releases and the answer to a device's update check

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_VERSION_LEN: usize = 20;
pub const MAX_NOTES_LEN: usize = 500;

/// One uploaded firmware image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub id: u64,
    pub version: String,
    #[serde(skip_serializing)]
    pub file_path: String,
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the image
    pub sha256: String,
    pub release_notes: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Reply to `GET /api/devices/{id}/firmware`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FirmwareCheck {
    pub update_available: bool,
    pub version: Option<String>,
    pub file_size: Option<u64>,
    pub release_notes: Option<String>,
}

impl FirmwareCheck {
    pub fn up_to_date() -> Self {
        Self::default()
    }

    pub fn offer(release: &FirmwareRelease) -> Self {
        Self {
            update_available: true,
            version: Some(release.version.clone()),
            file_size: Some(release.file_size),
            release_notes: release.release_notes.clone(),
        }
    }
}

/// Versions double as file names, so only `[A-Za-z0-9._-]` is accepted
pub fn check_version(version: &str) -> Result<(), String> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(format!("version must be 1 to {MAX_VERSION_LEN} characters"));
    }
    if version.starts_with('.') {
        return Err("version must not start with '.'".to_string());
    }
    if !version.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(format!("version contains unsupported characters: {version}"));
    }
    Ok(())
}
