//! Strata Core Library
//!
//! Distributed repository synchronization core for strata:
//! - Content-addressed layer and commit model
//! - Layer store abstraction (memory and disk backends)
//! - Pack codec and payloads
//! - DAG walking (ancestry, most-recent-common-ancestor)
//! - Transactional repository metadata
//! - Fetch / push / pull / clone engines
//! - Transports (HTTP with TUS-resumable upload, local store, in-memory)
//! - Orchestrator API with authorization

pub mod api;
pub mod auth;
pub mod clone;
pub mod commit;
pub mod db;
pub mod error;
pub mod exchange;
pub mod fetch;
pub mod graph;
pub mod history;
pub mod layer;
pub mod meta;
pub mod packfile;
pub mod pull;
pub mod push;
pub mod storage;
pub mod transport;
pub mod walk;

pub use api::{resolve_branch_target, Orchestrator};
pub use auth::{AuthContext, Capability, OpenAuthProvider, StaticTokenProvider, TokenAuthProvider};
pub use clone::{clone_db, CloneReport};
pub use commit::{CommitRecord, GraphHeads, GraphKind, Triple, TripleDelta};
pub use db::{default_prefixes, DatabaseContext, DatabaseRegistry, DatabaseSpec};
pub use error::{PackFailReason, StoreError, SyncError};
pub use exchange::{pack_from_head, receive_payload, unpack_into_store};
pub use fetch::{fetch, FetchOutcome};
pub use graph::{RepoDelta, RepositoryGraph};
pub use history::{branch_log, copy_commits, reset_branch_head, LogEntry};
pub use layer::{CommitId, LayerId, LayerRecord, ID_LEN};
pub use meta::{MetaDocument, MetaStore, RemoteKind, RemoteRecord};
pub use packfile::{
    build_pack, build_payload, pack_entries, pack_layerids_and_parents,
    payload_repository_head_and_pack, PackError, PackReader, PACK_MAGIC,
};
pub use pull::{fast_forward_branch, pull, PullOutcome, PullReport};
pub use push::{push, PushResult};
pub use storage::{DiskLayerStore, LayerStore, MemoryLayerStore, PutOutcome};
pub use transport::{
    transport_for_url, HttpTransport, InMemoryPayloadTransport, LocalStoreTransport, Transport,
    BUNDLE_URL, DEFAULT_TUS_THRESHOLD, PROTOCOL_VERSION,
};
pub use walk::{
    child_until_parents, most_recent_common_ancestor, repository_layer_to_layerids, MrcaResult,
};
