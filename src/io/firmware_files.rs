//! Firmware images on disk
//!
//! Images land in `<upload_dir>/firmware/collar_<version>.bin`. Versions are
//! validated before they reach this module, so the name cannot escape the
//! directory.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct FirmwareFiles {
    dir: PathBuf,
}

impl FirmwareFiles {
    pub fn new<P: AsRef<Path>>(upload_dir: P) -> Self {
        Self { dir: upload_dir.as_ref().join("firmware") }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the image for `version`, replacing any leftover file, and
    /// return the path
    pub fn save(&self, version: &str, bytes: &[u8]) -> std::io::Result<String> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }

        let path = self.dir.join(format!("collar_{version}.bin"));
        let mut file = fs::File::create(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        debug!(path = %path.display(), bytes = bytes.len(), "firmware_saved");
        Ok(path.display().to_string())
    }

    /// `None` when the file has gone missing
    pub fn load(&self, path: &str) -> std::io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let files = FirmwareFiles::new(dir.path());

        let path = files.save("1.2.0", b"\x7fELF").unwrap();
        assert!(path.ends_with("collar_1.2.0.bin"));
        assert!(Path::new(&path).starts_with(dir.path().join("firmware")));
        assert_eq!(files.load(&path).unwrap().unwrap(), b"\x7fELF");

        fs::remove_file(&path).unwrap();
        assert!(files.load(&path).unwrap().is_none());
    }
}
