//! Fetch engine: pull new layers from a remote and advance the
//! remote-tracking head.

use crate::db::DatabaseContext;
use crate::error::{PackFailReason, SyncError};
use crate::exchange::{admit_embedded_graph_layers, unpack_into_store};
use crate::layer::LayerId;
use crate::packfile::payload_repository_head_and_pack;
use crate::transport::Transport;

/// Result of a fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchOutcome {
    /// The remote head after the fetch (unchanged if nothing was received).
    pub head: Option<LayerId>,
    /// Whether the head moved.
    pub head_advanced: bool,
}

/// Fetch from `remote_name`: ask the transport for everything newer than the
/// last observed remote head, admit the received layers, then record the new
/// head. No metadata transaction is held across the network round-trip.
pub async fn fetch(
    ctx: &DatabaseContext,
    remote_name: &str,
    transport: &dyn Transport,
) -> Result<FetchOutcome, SyncError> {
    let (url, current) = {
        let doc = ctx.meta.snapshot().await;
        let record = doc.remote(remote_name)?;
        (record.url.clone(), record.head)
    };

    tracing::debug!(remote = remote_name, url = %url, "requesting pack");
    let payload = match transport.request_pack(&url, current).await? {
        None => {
            tracing::debug!(remote = remote_name, "remote has nothing new");
            return Ok(FetchOutcome {
                head: current,
                head_advanced: false,
            });
        }
        Some(payload) => payload,
    };

    let (new_head, pack) = payload_repository_head_and_pack(&payload)
        .map_err(|e| SyncError::RemotePackFailed(PackFailReason::Malformed(e.to_string())))?;

    let admitted = unpack_into_store(ctx.store.as_ref(), pack).await?;
    admit_embedded_graph_layers(ctx.store.as_ref(), &admitted).await?;

    if !ctx.store.exists(new_head).await? {
        return Err(SyncError::RemotePackFailed(PackFailReason::Malformed(
            format!("payload head {} not contained in pack or store", new_head),
        )));
    }

    let mut txn = ctx.meta.begin().await;
    txn.doc_mut().update_repository_head(remote_name, new_head)?;
    txn.doc_mut()
        .update_tracking_head(remote_name, Some(new_head))?;
    txn.commit()?;

    let advanced = current != Some(new_head);
    if advanced {
        tracing::info!(remote = remote_name, head = %new_head, "remote head advanced");
    }
    Ok(FetchOutcome {
        head: Some(new_head),
        head_advanced: advanced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseContext, DatabaseSpec};
    use crate::exchange::pack_from_head;
    use crate::graph::{RepoDelta, RepositoryGraph};
    use crate::meta::RemoteKind;
    use crate::transport::{InMemoryPayloadTransport, BUNDLE_URL};

    async fn ctx_with_remote() -> DatabaseContext {
        let ctx = DatabaseContext::in_memory(DatabaseSpec::new("acme", "crm"));
        let mut txn = ctx.meta.begin().await;
        txn.doc_mut()
            .add_remote("origin", BUNDLE_URL, RemoteKind::Remote)
            .unwrap();
        txn.commit().unwrap();
        ctx
    }

    async fn payload_with_chain(n: usize) -> bytes::Bytes {
        let store = crate::storage::MemoryLayerStore::new();
        let mut graph = RepositoryGraph::empty();
        for i in 0..n {
            graph
                .append(
                    &store,
                    &RepoDelta {
                        branches: vec![(format!("marker-{}", i), None)],
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        pack_from_head(&store, graph.head, None)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_with_no_updates() {
        let ctx = ctx_with_remote().await;
        let transport = InMemoryPayloadTransport::capture();

        let outcome = fetch(&ctx, "origin", &transport).await.unwrap();
        assert_eq!(outcome.head, None);
        assert!(!outcome.head_advanced);
    }

    #[tokio::test]
    async fn test_fetch_admits_layers_and_updates_head() {
        let ctx = ctx_with_remote().await;
        let payload = payload_with_chain(2).await;
        let transport = InMemoryPayloadTransport::replay(payload);

        let outcome = fetch(&ctx, "origin", &transport).await.unwrap();
        assert!(outcome.head_advanced);
        let head = outcome.head.unwrap();
        assert!(ctx.store.exists(head).await.unwrap());

        let doc = ctx.meta.snapshot().await;
        assert_eq!(doc.repository_head("origin").unwrap(), Some(head));
        assert_eq!(doc.remote("origin").unwrap().tracking_head, Some(head));
    }

    #[tokio::test]
    async fn test_fetch_same_head_does_not_advance() {
        let ctx = ctx_with_remote().await;
        let payload = payload_with_chain(1).await;

        let transport = InMemoryPayloadTransport::replay(payload.clone());
        let first = fetch(&ctx, "origin", &transport).await.unwrap();
        assert!(first.head_advanced);

        let transport = InMemoryPayloadTransport::replay(payload);
        let second = fetch(&ctx, "origin", &transport).await.unwrap();
        assert!(!second.head_advanced);
        assert_eq!(second.head, first.head);
    }

    #[tokio::test]
    async fn test_fetch_unknown_remote() {
        let ctx = DatabaseContext::in_memory(DatabaseSpec::new("acme", "crm"));
        let transport = InMemoryPayloadTransport::capture();
        let err = fetch(&ctx, "origin", &transport).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fetch_truncated_payload_fails() {
        let ctx = ctx_with_remote().await;
        let transport = InMemoryPayloadTransport::replay(bytes::Bytes::from_static(b"short"));
        let err = fetch(&ctx, "origin", &transport).await.unwrap_err();
        assert!(matches!(err, SyncError::RemotePackFailed(_)));
    }
}
