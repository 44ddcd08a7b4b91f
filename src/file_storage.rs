use anyhow::{Context, Result};
use log::{debug, warn};
use rtu_poller_lib::settings::{MemoryStorage, Storage};
use rtu_poller_lib::StorageError;
use std::path::{Path, PathBuf};

/// Settings image mirrored to a file on every write.
pub struct FileStorage {
    image: MemoryStorage,
    path: PathBuf,
}

impl FileStorage {
    /// Loads `path`; a missing file starts from an erased image.
    pub fn open(path: &Path) -> Result<Self> {
        let image = if path.exists() {
            let bytes = std::fs::read(path).with_context(|| format!("Cannot read settings file {path:?}"))?;
            debug!("Loaded {} bytes of settings from {path:?}", bytes.len());
            MemoryStorage::from_bytes(&bytes)
        } else {
            debug!("No settings file {path:?}, starting erased");
            MemoryStorage::new()
        };
        Ok(Self {
            image,
            path: path.to_path_buf(),
        })
    }
}

impl Storage for FileStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        self.image.read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        self.image.write(offset, data)?;
        std::fs::write(&self.path, self.image.as_bytes()).map_err(|err| {
            warn!("Cannot write settings file {:?}: {err}", self.path);
            StorageError::Write {
                offset,
                len: data.len(),
            }
        })
    }
}
