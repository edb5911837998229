//! Transactional database metadata.
//!
//! Each database carries a small metadata document: the head of the local
//! repository layer chain, and one record per remote (url, kind, confirmed
//! remote head, remote-tracking chain head). Transactions serialize through a
//! per-database lock; a transaction mutates a working copy and the document is
//! persisted atomically on commit. Dropping a transaction aborts it.

use crate::error::SyncError;
use crate::layer::LayerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

/// Kind of a registered remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteKind {
    Local,
    Remote,
}

/// One registered remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub url: String,
    pub kind: RemoteKind,
    /// Last confirmed remote repository head; absent until the first fetch
    /// (or successful push) observes one.
    pub head: Option<LayerId>,
    /// Head of the remote-tracking repository chain. Advances ahead of
    /// `head` during a push and is confirmed once transmission succeeds.
    pub tracking_head: Option<LayerId>,
}

/// The metadata document for one database.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetaDocument {
    /// Head of the local repository layer chain.
    pub local_head: Option<LayerId>,
    pub remotes: BTreeMap<String, RemoteRecord>,
}

impl MetaDocument {
    pub fn remote(&self, name: &str) -> Result<&RemoteRecord, SyncError> {
        self.remotes
            .get(name)
            .ok_or_else(|| SyncError::NotFound(format!("remote {}", name)))
    }

    pub fn remote_type(&self, name: &str) -> Result<RemoteKind, SyncError> {
        Ok(self.remote(name)?.kind)
    }

    /// Last observed remote repository head.
    pub fn repository_head(&self, name: &str) -> Result<Option<LayerId>, SyncError> {
        Ok(self.remote(name)?.head)
    }

    pub fn add_remote(&mut self, name: &str, url: &str, kind: RemoteKind) -> Result<(), SyncError> {
        if self.remotes.contains_key(name) {
            return Err(SyncError::RemoteAlreadyExists(name.to_string()));
        }
        self.remotes.insert(
            name.to_string(),
            RemoteRecord {
                url: url.to_string(),
                kind,
                head: None,
                tracking_head: None,
            },
        );
        Ok(())
    }

    pub fn remove_remote(&mut self, name: &str) -> Result<(), SyncError> {
        self.remotes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(format!("remote {}", name)))
    }

    pub fn update_repository_head(
        &mut self,
        name: &str,
        head: LayerId,
    ) -> Result<(), SyncError> {
        let record = self
            .remotes
            .get_mut(name)
            .ok_or_else(|| SyncError::NotFound(format!("remote {}", name)))?;
        record.head = Some(head);
        Ok(())
    }

    pub fn update_tracking_head(
        &mut self,
        name: &str,
        head: Option<LayerId>,
    ) -> Result<(), SyncError> {
        let record = self
            .remotes
            .get_mut(name)
            .ok_or_else(|| SyncError::NotFound(format!("remote {}", name)))?;
        record.tracking_head = head;
        Ok(())
    }
}

/// Lock-guarded, optionally file-backed metadata store.
#[derive(Debug)]
pub struct MetaStore {
    path: Option<PathBuf>,
    state: Mutex<MetaDocument>,
}

impl MetaStore {
    /// A store with no backing file (tests, scratch databases).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(MetaDocument::default()),
        }
    }

    /// Open a file-backed store, loading the document if the file exists.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let doc = if path.exists() {
            let data = std::fs::read_to_string(path)
                .map_err(|e| SyncError::Internal(format!("failed to read metadata: {}", e)))?;
            serde_json::from_str(&data)
                .map_err(|e| SyncError::Internal(format!("failed to parse metadata: {}", e)))?
        } else {
            MetaDocument::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(doc),
        })
    }

    /// Begin a transaction. Transactions on the same database serialize.
    pub async fn begin(&self) -> MetaTxn<'_> {
        let guard = self.state.lock().await;
        let working = guard.clone();
        MetaTxn {
            guard,
            working,
            path: self.path.as_deref(),
        }
    }

    /// Read-only snapshot of the current document.
    pub async fn snapshot(&self) -> MetaDocument {
        self.state.lock().await.clone()
    }
}

/// An open metadata transaction. Commit persists the working copy; dropping
/// the transaction discards it.
pub struct MetaTxn<'a> {
    guard: MutexGuard<'a, MetaDocument>,
    working: MetaDocument,
    path: Option<&'a Path>,
}

impl MetaTxn<'_> {
    pub fn doc(&self) -> &MetaDocument {
        &self.working
    }

    pub fn doc_mut(&mut self) -> &mut MetaDocument {
        &mut self.working
    }

    /// Commit: persist atomically (tmp+rename), then publish the working copy.
    pub fn commit(mut self) -> Result<(), SyncError> {
        if let Some(path) = self.path {
            let data = serde_json::to_string_pretty(&self.working)
                .map_err(|e| SyncError::Internal(format!("failed to encode metadata: {}", e)))?;
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, &data)
                .map_err(|e| SyncError::Internal(format!("failed to write metadata: {}", e)))?;
            std::fs::rename(&tmp, path)
                .map_err(|e| SyncError::Internal(format!("failed to publish metadata: {}", e)))?;
        }
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}
