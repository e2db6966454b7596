use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StoreError;
use crate::keys;

/// Opaque attachment bytes, one file per blob id.
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("create dir {}: {e}", dir.display())))?;
        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    pub fn put(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(id)?;
        let temp_path = path.with_extension("bin.tmp");
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &path)?;
        debug!(blob_id = id, len = bytes.len(), "blob stored");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("blob {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn blob_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        keys::validate_key("blob id", id)?;
        Ok(self.dir.join(format!("{id}.bin")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_then_get() {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(&dir.path().join("blobs")).unwrap();
        blobs.put("abc123", b"payload").unwrap();
        assert_eq!(blobs.get("abc123").unwrap(), b"payload");

        blobs.put("abc123", b"replaced").unwrap();
        assert_eq!(blobs.get("abc123").unwrap(), b"replaced");
    }

    #[test]
    fn missing_blob_not_found() {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();
        assert!(matches!(blobs.get("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn bad_id_rejected() {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();
        assert!(matches!(blobs.put("../x", b""), Err(StoreError::InvalidKey(_))));
    }
}
