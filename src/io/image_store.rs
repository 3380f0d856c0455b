//! Captured door frames on disk
//!
//! Frames land in `<image_dir>/events/<uuid v7>.<ext>`. The extension comes
//! from the detected format; undecodable uploads are kept as `.bin`.

use crate::domain::types::new_uuid_v7;
use image::ImageFormat;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new<P: AsRef<Path>>(image_dir: P) -> Self {
        Self { dir: image_dir.as_ref().join("events") }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` under a fresh name and return the path
    pub fn save(&self, bytes: &[u8]) -> std::io::Result<String> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }

        let path = self.dir.join(format!("{}.{}", new_uuid_v7(), extension_for(bytes)));
        let mut file = fs::OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(bytes)?;
        file.flush()?;

        debug!(path = %path.display(), bytes = bytes.len(), "frame_saved");
        Ok(path.display().to_string())
    }
}

fn extension_for(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(format) => format.extensions_str().first().copied().unwrap_or("bin"),
        Err(_) => "bin",
    }
}
