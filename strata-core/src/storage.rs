//! Layer store abstraction.
//!
//! A layer store is a content-addressed blob store keyed by layer id that
//! also exposes each layer's parent pointer. Puts are idempotent; a put whose
//! bytes do not hash to the claimed id is rejected.

use crate::error::StoreError;
use crate::layer::{LayerId, LayerRecord};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome of a `put_layer` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The layer was admitted.
    Stored,
    /// A layer with this id was already present.
    AlreadyPresent,
    /// The bytes do not hash to the claimed id; nothing was stored.
    Mismatch,
}

/// Content-addressed layer store.
#[async_trait]
pub trait LayerStore: Send + Sync {
    /// Admit a layer. Idempotent on content-address equality.
    async fn put_layer(
        &self,
        id: LayerId,
        parent: Option<LayerId>,
        bytes: Bytes,
    ) -> Result<PutOutcome, StoreError>;

    /// Fetch a layer's parent pointer and payload.
    async fn get_layer(&self, id: LayerId) -> Result<Option<(Option<LayerId>, Bytes)>, StoreError>;

    /// Fetch only the parent pointer.
    async fn parent_of(&self, id: LayerId) -> Result<Option<LayerId>, StoreError>;

    /// Check whether a layer is present.
    async fn exists(&self, id: LayerId) -> Result<bool, StoreError>;

    /// Enumerate all stored layer ids.
    async fn layer_ids(&self) -> Result<Vec<LayerId>, StoreError>;
}

/// Admit a sealed record, returning the outcome.
pub async fn put_record(
    store: &dyn LayerStore,
    record: &LayerRecord,
) -> Result<PutOutcome, StoreError> {
    store
        .put_layer(record.id, record.parent, Bytes::from(record.bytes.clone()))
        .await
}

// ─────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────

/// In-memory layer store for tests and bundle scratch work.
#[derive(Default)]
pub struct MemoryLayerStore {
    layers: Arc<RwLock<HashMap<LayerId, (Option<LayerId>, Bytes)>>>,
}

impl MemoryLayerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LayerStore for MemoryLayerStore {
    async fn put_layer(
        &self,
        id: LayerId,
        parent: Option<LayerId>,
        bytes: Bytes,
    ) -> Result<PutOutcome, StoreError> {
        if LayerId::from_content(parent.as_ref(), &bytes) != id {
            return Ok(PutOutcome::Mismatch);
        }
        let mut layers = self.layers.write().await;
        if layers.contains_key(&id) {
            return Ok(PutOutcome::AlreadyPresent);
        }
        layers.insert(id, (parent, bytes));
        Ok(PutOutcome::Stored)
    }

    async fn get_layer(&self, id: LayerId) -> Result<Option<(Option<LayerId>, Bytes)>, StoreError> {
        let layers = self.layers.read().await;
        Ok(layers.get(&id).map(|(p, b)| (*p, b.clone())))
    }

    async fn parent_of(&self, id: LayerId) -> Result<Option<LayerId>, StoreError> {
        let layers = self.layers.read().await;
        match layers.get(&id) {
            Some((p, _)) => Ok(*p),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn exists(&self, id: LayerId) -> Result<bool, StoreError> {
        Ok(self.layers.read().await.contains_key(&id))
    }

    async fn layer_ids(&self) -> Result<Vec<LayerId>, StoreError> {
        Ok(self.layers.read().await.keys().copied().collect())
    }
}

// ─────────────────────────────────────────────────────
// Disk store
// ─────────────────────────────────────────────────────

/// On-disk record: parent pointer plus zstd-compressed payload.
#[derive(Serialize, Deserialize)]
struct StoredLayer {
    parent: Option<LayerId>,
    compressed: Vec<u8>,
}

/// Disk-backed layer store.
///
/// Layers are stored one file per layer under `ab/cdef…` sharded directories,
/// compressed with zstd and written via tmp+rename.
pub struct DiskLayerStore {
    root: PathBuf,
}

impl DiskLayerStore {
    /// Open (creating if needed) a disk store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_path(&self, id: LayerId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn read_stored(&self, id: LayerId) -> Result<Option<StoredLayer>, StoreError> {
        let path = self.layer_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path)?;
        let stored: StoredLayer = bincode::deserialize(&data)
            .map_err(|e| StoreError::Corrupt(format!("layer {}: {}", id, e)))?;
        Ok(Some(stored))
    }
}

#[async_trait]
impl LayerStore for DiskLayerStore {
    async fn put_layer(
        &self,
        id: LayerId,
        parent: Option<LayerId>,
        bytes: Bytes,
    ) -> Result<PutOutcome, StoreError> {
        if LayerId::from_content(parent.as_ref(), &bytes) != id {
            return Ok(PutOutcome::Mismatch);
        }
        let path = self.layer_path(id);
        if path.exists() {
            return Ok(PutOutcome::AlreadyPresent);
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let compressed = zstd::encode_all(bytes.as_ref(), 3)
            .map_err(|e| StoreError::Backend(format!("compression failed: {}", e)))?;
        let stored = StoredLayer { parent, compressed };
        let data = bincode::serialize(&stored)
            .map_err(|e| StoreError::Backend(format!("encode failed: {}", e)))?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(PutOutcome::Stored)
    }

    async fn get_layer(&self, id: LayerId) -> Result<Option<(Option<LayerId>, Bytes)>, StoreError> {
        match self.read_stored(id)? {
            None => Ok(None),
            Some(stored) => {
                let payload = zstd::decode_all(stored.compressed.as_slice())
                    .map_err(|e| StoreError::Corrupt(format!("layer {}: {}", id, e)))?;
                Ok(Some((stored.parent, Bytes::from(payload))))
            }
        }
    }

    async fn parent_of(&self, id: LayerId) -> Result<Option<LayerId>, StoreError> {
        match self.read_stored(id)? {
            None => Err(StoreError::NotFound(id)),
            Some(stored) => Ok(stored.parent),
        }
    }

    async fn exists(&self, id: LayerId) -> Result<bool, StoreError> {
        Ok(self.layer_path(id).exists())
    }

    async fn layer_ids(&self) -> Result<Vec<LayerId>, StoreError> {
        let mut ids = Vec::new();
        if !self.root.exists() {
            return Ok(ids);
        }
        for shard in std::fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.path().is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().to_string();
            for entry in std::fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".tmp") {
                    continue;
                }
                if let Ok(id) = LayerId::from_hex(&format!("{}{}", prefix, name)) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn roundtrip(store: &dyn LayerStore) {
        let rec = LayerRecord::sealed(None, b"base layer".to_vec());
        let outcome = put_record(store, &rec).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);

        let child = LayerRecord::sealed(Some(rec.id), b"child layer".to_vec());
        put_record(store, &child).await.unwrap();

        let (parent, bytes) = store.get_layer(child.id).await.unwrap().unwrap();
        assert_eq!(parent, Some(rec.id));
        assert_eq!(bytes.as_ref(), b"child layer");

        assert_eq!(store.parent_of(child.id).await.unwrap(), Some(rec.id));
        assert_eq!(store.parent_of(rec.id).await.unwrap(), None);
        assert!(store.exists(rec.id).await.unwrap());

        let mut ids = store.layer_ids().await.unwrap();
        ids.sort();
        let mut expected = vec![rec.id, child.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryLayerStore::new();
        roundtrip(&store).await;
    }

    #[tokio::test]
    async fn test_disk_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = DiskLayerStore::open(tmp.path()).unwrap();
        roundtrip(&store).await;
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryLayerStore::new();
        let rec = LayerRecord::sealed(None, b"dup".to_vec());
        assert_eq!(put_record(&store, &rec).await.unwrap(), PutOutcome::Stored);
        assert_eq!(
            put_record(&store, &rec).await.unwrap(),
            PutOutcome::AlreadyPresent
        );
    }

    #[tokio::test]
    async fn test_put_mismatch_rejected() {
        let store = MemoryLayerStore::new();
        let bogus_id = LayerId::new([7u8; 20]);
        let outcome = store
            .put_layer(bogus_id, None, Bytes::from_static(b"whatever"))
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Mismatch);
        assert!(!store.exists(bogus_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let rec = LayerRecord::sealed(None, b"durable".to_vec());
        {
            let store = DiskLayerStore::open(tmp.path()).unwrap();
            put_record(&store, &rec).await.unwrap();
        }
        let store = DiskLayerStore::open(tmp.path()).unwrap();
        let (parent, bytes) = store.get_layer(rec.id).await.unwrap().unwrap();
        assert_eq!(parent, None);
        assert_eq!(bytes.as_ref(), b"durable");
    }

    #[tokio::test]
    async fn test_parent_of_missing_layer() {
        let store = MemoryLayerStore::new();
        let err = store.parent_of(LayerId::new([9u8; 20])).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
