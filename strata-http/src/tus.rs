//! Minimal TUS 1.0 server store for resumable pack uploads.
//!
//! Supports creation, offset probing, sequential PATCH appends and deletion.
//! Uploads land under a spool directory and are referenced by the
//! `/api/files/{id}` resource uri handed back at creation time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TUS_VERSION: &str = "1.0.0";

/// Metadata sidecar for one upload.
#[derive(Debug, Serialize, Deserialize)]
struct UploadMeta {
    length: u64,
}

/// Errors from the upload store.
#[derive(Debug, PartialEq)]
pub enum TusError {
    NotFound,
    OffsetMismatch { expected: u64 },
    LengthExceeded,
    Io(String),
}

impl std::fmt::Display for TusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TusError::NotFound => write!(f, "upload not found"),
            TusError::OffsetMismatch { expected } => {
                write!(f, "offset mismatch, expected {}", expected)
            }
            TusError::LengthExceeded => write!(f, "upload exceeds declared length"),
            TusError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

fn io_err(e: std::io::Error) -> TusError {
    TusError::Io(e.to_string())
}

/// Filesystem-backed upload spool.
pub struct TusStore {
    dir: PathBuf,
}

impl TusStore {
    pub fn open(dir: &Path) -> Result<Self, TusError> {
        std::fs::create_dir_all(dir).map_err(io_err)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn data_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.upload", id))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn valid_id(id: &str) -> bool {
        !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }

    fn meta(&self, id: &str) -> Result<UploadMeta, TusError> {
        if !Self::valid_id(id) {
            return Err(TusError::NotFound);
        }
        let path = self.meta_path(id);
        if !path.exists() {
            return Err(TusError::NotFound);
        }
        let data = std::fs::read_to_string(&path).map_err(io_err)?;
        serde_json::from_str(&data).map_err(|e| TusError::Io(e.to_string()))
    }

    /// Create a new upload of `length` bytes; returns the upload id.
    pub fn create(&self, length: u64) -> Result<String, TusError> {
        let id = uuid::Uuid::new_v4().to_string();
        let meta = UploadMeta { length };
        std::fs::write(
            self.meta_path(&id),
            serde_json::to_string(&meta).map_err(|e| TusError::Io(e.to_string()))?,
        )
        .map_err(io_err)?;
        std::fs::write(self.data_path(&id), b"").map_err(io_err)?;
        Ok(id)
    }

    /// Current byte offset of an upload.
    pub fn offset(&self, id: &str) -> Result<u64, TusError> {
        self.meta(id)?;
        Ok(std::fs::metadata(self.data_path(id)).map_err(io_err)?.len())
    }

    /// Declared total length of an upload.
    pub fn length(&self, id: &str) -> Result<u64, TusError> {
        Ok(self.meta(id)?.length)
    }

    /// Append a chunk at `offset`; returns the new offset.
    pub fn patch(&self, id: &str, offset: u64, chunk: &[u8]) -> Result<u64, TusError> {
        let meta = self.meta(id)?;
        let current = self.offset(id)?;
        if current != offset {
            return Err(TusError::OffsetMismatch { expected: current });
        }
        if current + chunk.len() as u64 > meta.length {
            return Err(TusError::LengthExceeded);
        }
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.data_path(id))
            .map_err(io_err)?;
        file.write_all(chunk).map_err(io_err)?;
        Ok(current + chunk.len() as u64)
    }

    /// Whether the upload has received every declared byte.
    pub fn is_complete(&self, id: &str) -> Result<bool, TusError> {
        Ok(self.offset(id)? == self.meta(id)?.length)
    }

    /// Read a completed upload.
    pub fn read(&self, id: &str) -> Result<Vec<u8>, TusError> {
        self.meta(id)?;
        std::fs::read(self.data_path(id)).map_err(io_err)
    }

    /// Remove an upload and its metadata.
    pub fn delete(&self, id: &str) -> Result<(), TusError> {
        self.meta(id)?;
        let _ = std::fs::remove_file(self.data_path(id));
        let _ = std::fs::remove_file(self.meta_path(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upload_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let store = TusStore::open(tmp.path()).unwrap();

        let id = store.create(10).unwrap();
        assert_eq!(store.offset(&id).unwrap(), 0);
        assert!(!store.is_complete(&id).unwrap());

        assert_eq!(store.patch(&id, 0, b"hello").unwrap(), 5);
        assert_eq!(store.patch(&id, 5, b"world").unwrap(), 10);
        assert!(store.is_complete(&id).unwrap());
        assert_eq!(store.read(&id).unwrap(), b"helloworld");

        store.delete(&id).unwrap();
        assert_eq!(store.offset(&id).unwrap_err(), TusError::NotFound);
    }

    #[test]
    fn test_offset_mismatch_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = TusStore::open(tmp.path()).unwrap();
        let id = store.create(10).unwrap();

        store.patch(&id, 0, b"abc").unwrap();
        let err = store.patch(&id, 0, b"abc").unwrap_err();
        assert_eq!(err, TusError::OffsetMismatch { expected: 3 });
    }

    #[test]
    fn test_length_overflow_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = TusStore::open(tmp.path()).unwrap();
        let id = store.create(4).unwrap();
        let err = store.patch(&id, 0, b"too long").unwrap_err();
        assert_eq!(err, TusError::LengthExceeded);
    }

    #[test]
    fn test_unknown_upload() {
        let tmp = TempDir::new().unwrap();
        let store = TusStore::open(tmp.path()).unwrap();
        assert_eq!(store.offset("nope").unwrap_err(), TusError::NotFound);
        assert_eq!(
            store.offset("../escape").unwrap_err(),
            TusError::NotFound
        );
    }
}
