//! Database registry: org/db containers over a store root.
//!
//! Each database lives at `<root>/<org>/<db>/` with a `db.json` descriptor,
//! a `meta.json` metadata document and a `layers/` blob directory. Databases
//! are created unfinalized and become visible only once finalized, so a
//! failed clone never exposes a half-built database.

use crate::error::SyncError;
use crate::graph::{RepoDelta, RepositoryGraph};
use crate::meta::MetaStore;
use crate::storage::{DiskLayerStore, LayerStore, MemoryLayerStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default prefix document for a fresh database.
pub fn default_prefixes() -> BTreeMap<String, String> {
    let mut prefixes = BTreeMap::new();
    prefixes.insert("@base".to_string(), "strata:///data/".to_string());
    prefixes.insert("@schema".to_string(), "strata:///schema#".to_string());
    prefixes
}

/// Identifies a database by organization and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub org: String,
    pub db: String,
}

impl DatabaseSpec {
    pub fn new(org: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            db: db.into(),
        }
    }

    /// Parse `org/db`.
    pub fn parse(path: &str) -> Result<Self, SyncError> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(org), Some(db), None) => Ok(Self::new(org, db)),
            _ => Err(SyncError::NotFound(format!("invalid database path {}", path))),
        }
    }
}

impl std::fmt::Display for DatabaseSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.org, self.db)
    }
}

/// Persisted descriptor for one database (`db.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub label: String,
    pub comment: String,
    pub public: bool,
    pub finalized: bool,
    /// Unique id of this database instance.
    pub instance: String,
}

/// Everything an engine needs to operate on one database.
#[derive(Clone)]
pub struct DatabaseContext {
    pub spec: DatabaseSpec,
    pub store: Arc<dyn LayerStore>,
    pub meta: Arc<MetaStore>,
}

impl std::fmt::Debug for DatabaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("spec", &self.spec)
            .field("store", &"<dyn LayerStore>")
            .field("meta", &self.meta)
            .finish()
    }
}

impl DatabaseContext {
    /// A context backed entirely by memory; used in tests.
    pub fn in_memory(spec: DatabaseSpec) -> Self {
        Self {
            spec,
            store: Arc::new(MemoryLayerStore::new()),
            meta: Arc::new(MetaStore::in_memory()),
        }
    }

    /// Materialize the local repository graph.
    pub async fn local_graph(&self) -> Result<RepositoryGraph, SyncError> {
        let head = self.meta.snapshot().await.local_head;
        RepositoryGraph::load(self.store.as_ref(), head).await
    }

    /// Materialize the remote-tracking repository graph for `remote`.
    pub async fn tracking_graph(&self, remote: &str) -> Result<RepositoryGraph, SyncError> {
        let head = self.meta.snapshot().await.remote(remote)?.tracking_head;
        RepositoryGraph::load(self.store.as_ref(), head).await
    }

    /// Write the base layer of the local chain: the prefix document plus the
    /// empty `main` branch. Must only be called on a database whose local
    /// chain is still empty.
    pub async fn init_local_graph(
        &self,
        prefixes: BTreeMap<String, String>,
    ) -> Result<(), SyncError> {
        let mut txn = self.meta.begin().await;
        if txn.doc().local_head.is_some() {
            return Err(SyncError::Internal(
                "local repository already initialized".into(),
            ));
        }
        let mut graph = RepositoryGraph::empty();
        let head = graph
            .append(
                self.store.as_ref(),
                &RepoDelta {
                    branches: vec![("main".to_string(), None)],
                    prefixes: Some(prefixes),
                    ..Default::default()
                },
            )
            .await?;
        txn.doc_mut().local_head = Some(head);
        txn.commit()
    }
}

/// Filesystem-backed registry of databases.
///
/// Contexts are cached so every caller of the same database shares one
/// metadata lock; transactions on a database serialize process-wide.
pub struct DatabaseRegistry {
    root: PathBuf,
    contexts: std::sync::Mutex<std::collections::HashMap<DatabaseSpec, DatabaseContext>>,
}

impl DatabaseRegistry {
    pub fn open(root: &Path) -> Result<Self, SyncError> {
        std::fs::create_dir_all(root)
            .map_err(|e| SyncError::Internal(format!("failed to create store root: {}", e)))?;
        Ok(Self {
            root: root.to_path_buf(),
            contexts: std::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn db_dir(&self, spec: &DatabaseSpec) -> PathBuf {
        self.root.join(&spec.org).join(&spec.db)
    }

    fn descriptor_path(&self, spec: &DatabaseSpec) -> PathBuf {
        self.db_dir(spec).join("db.json")
    }

    fn read_descriptor(&self, spec: &DatabaseSpec) -> Result<Option<DatabaseDescriptor>, SyncError> {
        let path = self.descriptor_path(spec);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| SyncError::Internal(format!("failed to read descriptor: {}", e)))?;
        let descriptor = serde_json::from_str(&data)
            .map_err(|e| SyncError::Internal(format!("failed to parse descriptor: {}", e)))?;
        Ok(Some(descriptor))
    }

    fn write_descriptor(
        &self,
        spec: &DatabaseSpec,
        descriptor: &DatabaseDescriptor,
    ) -> Result<(), SyncError> {
        let path = self.descriptor_path(spec);
        let data = serde_json::to_string_pretty(descriptor)
            .map_err(|e| SyncError::Internal(format!("failed to encode descriptor: {}", e)))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data)
            .map_err(|e| SyncError::Internal(format!("failed to write descriptor: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| SyncError::Internal(format!("failed to publish descriptor: {}", e)))?;
        Ok(())
    }

    fn context(&self, spec: &DatabaseSpec) -> Result<DatabaseContext, SyncError> {
        let mut contexts = self
            .contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(ctx) = contexts.get(spec) {
            return Ok(ctx.clone());
        }
        let dir = self.db_dir(spec);
        let store = DiskLayerStore::open(&dir.join("layers"))
            .map_err(|e| SyncError::Internal(format!("failed to open layer store: {}", e)))?;
        let meta = MetaStore::open(&dir.join("meta.json"))?;
        let ctx = DatabaseContext {
            spec: spec.clone(),
            store: Arc::new(store),
            meta: Arc::new(meta),
        };
        contexts.insert(spec.clone(), ctx.clone());
        Ok(ctx)
    }

    fn evict(&self, spec: &DatabaseSpec) {
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(spec);
    }

    /// Whether a finalized database exists at `spec`.
    pub fn exists(&self, spec: &DatabaseSpec) -> Result<bool, SyncError> {
        Ok(self
            .read_descriptor(spec)?
            .map(|d| d.finalized)
            .unwrap_or(false))
    }

    /// Create an unfinalized database. Debris from an earlier failed creation
    /// is discarded; an existing finalized database is an error.
    pub fn create_unfinalized(
        &self,
        spec: &DatabaseSpec,
        label: &str,
        comment: &str,
        public: bool,
    ) -> Result<DatabaseContext, SyncError> {
        if let Some(descriptor) = self.read_descriptor(spec)? {
            if descriptor.finalized {
                return Err(SyncError::DatabaseAlreadyExists(spec.to_string()));
            }
            self.evict(spec);
            std::fs::remove_dir_all(self.db_dir(spec))
                .map_err(|e| SyncError::Internal(format!("failed to clear stale database: {}", e)))?;
        }

        let dir = self.db_dir(spec);
        std::fs::create_dir_all(&dir)
            .map_err(|e| SyncError::Internal(format!("failed to create database dir: {}", e)))?;
        let descriptor = DatabaseDescriptor {
            label: label.to_string(),
            comment: comment.to_string(),
            public,
            finalized: false,
            instance: uuid::Uuid::new_v4().to_string(),
        };
        self.write_descriptor(spec, &descriptor)?;
        self.context(spec)
    }

    /// Create a finalized database with the default prefix base layer.
    pub async fn create(
        &self,
        spec: &DatabaseSpec,
        label: &str,
        comment: &str,
        public: bool,
    ) -> Result<DatabaseContext, SyncError> {
        let ctx = self.create_unfinalized(spec, label, comment, public)?;
        ctx.init_local_graph(default_prefixes()).await?;
        self.finalize(spec)?;
        Ok(ctx)
    }

    /// Mark an unfinalized database as complete.
    pub fn finalize(&self, spec: &DatabaseSpec) -> Result<(), SyncError> {
        let mut descriptor = self
            .read_descriptor(spec)?
            .ok_or_else(|| SyncError::NotFound(format!("database {}", spec)))?;
        descriptor.finalized = true;
        self.write_descriptor(spec, &descriptor)
    }

    /// Remove a database and everything under it.
    pub fn force_delete(&self, spec: &DatabaseSpec) -> Result<(), SyncError> {
        self.evict(spec);
        let dir = self.db_dir(spec);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| SyncError::Internal(format!("failed to delete database: {}", e)))?;
        }
        Ok(())
    }

    /// Open a finalized database.
    pub fn open_db(&self, spec: &DatabaseSpec) -> Result<DatabaseContext, SyncError> {
        match self.read_descriptor(spec)? {
            Some(descriptor) if descriptor.finalized => self.context(spec),
            _ => Err(SyncError::NotFound(format!("database {}", spec))),
        }
    }

    /// List finalized databases under one organization.
    pub fn list(&self, org: &str) -> Result<Vec<DatabaseSpec>, SyncError> {
        let org_dir = self.root.join(org);
        let mut specs = Vec::new();
        if !org_dir.exists() {
            return Ok(specs);
        }
        let entries = std::fs::read_dir(&org_dir)
            .map_err(|e| SyncError::Internal(format!("failed to list databases: {}", e)))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| SyncError::Internal(format!("failed to list databases: {}", e)))?;
            let spec = DatabaseSpec::new(org, entry.file_name().to_string_lossy().to_string());
            if self.exists(&spec)? {
                specs.push(spec);
            }
        }
        specs.sort_by(|a, b| a.db.cmp(&b.db));
        Ok(specs)
    }
}
