//! Push engine: transfer local-only commits of a branch to a remote.
//!
//! The remote-tracking repository is advanced first, the chain segment between
//! the previous confirmed remote head and the new tracking head is packed and
//! transmitted, and only a successful transmission confirms the new remote
//! head. A failed transmission leaves the confirmed head untouched; the
//! speculative tracking layers are unreferenced and harmless.

use crate::db::DatabaseContext;
use crate::error::SyncError;
use crate::exchange::pack_from_head;
use crate::graph::RepositoryGraph;
use crate::history::copy_commits;
use crate::layer::LayerId;
use crate::meta::RemoteKind;
use crate::transport::{Transport, BUNDLE_URL};
use crate::walk::most_recent_common_ancestor;

/// Result of a push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushResult {
    /// The remote already had everything; nothing was transmitted.
    Same(Option<LayerId>),
    /// The remote accepted a pack and now sits at this head.
    New(LayerId),
}

pub async fn push(
    ctx: &DatabaseContext,
    branch: &str,
    remote_name: &str,
    transport: &dyn Transport,
) -> Result<PushResult, SyncError> {
    let (url, kind, previous) = {
        let doc = ctx.meta.snapshot().await;
        let record = doc.remote(remote_name)?;
        (record.url.clone(), record.kind, record.head)
    };

    if kind != RemoteKind::Remote {
        return Err(SyncError::PushAttemptedOnNonRemote(remote_name.to_string()));
    }
    // Bundle remotes are virtual and never fetched, so they are exempt from
    // the fetch-first requirement.
    if previous.is_none() && url != BUNDLE_URL {
        return Err(SyncError::PushHasNoRepositoryHead(remote_name.to_string()));
    }

    // Local mutation phase. The transaction spans only store and metadata
    // I/O; it is committed before anything touches the network.
    let (new_layer, payload) = {
        let mut txn = ctx.meta.begin().await;
        let local = RepositoryGraph::load(ctx.store.as_ref(), txn.doc().local_head).await?;
        let tracking_head = txn.doc().remote(remote_name)?.tracking_head;
        let mut tracking = RepositoryGraph::load(ctx.store.as_ref(), tracking_head).await?;

        if !local.has_branch(branch) {
            return Err(SyncError::NotFound(format!("branch {}", branch)));
        }
        let local_commit = local.branch_head(branch);
        let remote_commit = tracking.branch_head(branch);

        match (local_commit, remote_commit) {
            (None, None) => {
                // Empty to empty: the remote branch pointer at empty is
                // indistinguishable from an absent branch, so nothing needs
                // to be created and nothing is transmitted.
                return Ok(PushResult::Same(previous));
            }
            (None, Some(_)) => {
                return Err(SyncError::RemoteNotEmptyOnLocalEmpty);
            }
            (Some(local_commit), remote_commit) => {
                if let Some(remote_commit) = remote_commit {
                    let mrca = most_recent_common_ancestor(
                        &local,
                        &tracking,
                        local_commit,
                        remote_commit,
                    );
                    if mrca.common.is_none() {
                        return Err(SyncError::NoCommonHistory);
                    }
                    if !mrca.path_b.is_empty() {
                        return Err(SyncError::RemoteDiverged(mrca.path_b));
                    }
                }
                copy_commits(&local, &mut tracking, ctx.store.as_ref(), local_commit, branch)
                    .await?;
            }
        }

        txn.doc_mut()
            .update_tracking_head(remote_name, tracking.head)?;
        txn.commit()?;

        let new_layer = tracking.head.ok_or_else(|| {
            SyncError::Internal("tracking repository has no head after copy".into())
        })?;
        let payload = pack_from_head(ctx.store.as_ref(), Some(new_layer), previous).await?;
        (new_layer, payload)
    };

    let Some(payload) = payload else {
        // Nothing between the previous remote head and the new tracking head;
        // transmission skipped.
        return Ok(PushResult::Same(previous));
    };

    tracing::info!(
        remote = remote_name,
        branch,
        bytes = payload.len(),
        "transmitting pack"
    );
    transport.send_pack(&url, payload).await?;

    let mut txn = ctx.meta.begin().await;
    txn.doc_mut()
        .update_repository_head(remote_name, new_layer)?;
    txn.commit()?;

    Ok(PushResult::New(new_layer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{GraphKind, Triple, TripleDelta};
    use crate::db::DatabaseSpec;
    use crate::history::{append_commit, build_commit};
    use crate::transport::InMemoryPayloadTransport;

    async fn ctx_with_bundle_remote() -> DatabaseContext {
        let ctx = DatabaseContext::in_memory(DatabaseSpec::new("acme", "crm"));
        ctx.init_local_graph(crate::db::default_prefixes())
            .await
            .unwrap();
        let mut txn = ctx.meta.begin().await;
        txn.doc_mut()
            .add_remote("origin", BUNDLE_URL, RemoteKind::Remote)
            .unwrap();
        txn.commit().unwrap();
        ctx
    }

    async fn write_commit(ctx: &DatabaseContext, message: &str) {
        let mut txn = ctx.meta.begin().await;
        let mut local = RepositoryGraph::load(ctx.store.as_ref(), txn.doc().local_head)
            .await
            .unwrap();
        let (record, layers) = build_commit(
            &local,
            "main",
            "alice",
            message,
            1000,
            &[(
                GraphKind::Instance,
                TripleDelta::additions(vec![Triple::new("s", message, "o")]),
            )],
        )
        .unwrap();
        append_commit(&mut local, ctx.store.as_ref(), "main", record, layers)
            .await
            .unwrap();
        txn.doc_mut().local_head = local.head;
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn test_push_empty_to_empty_is_same() {
        let ctx = ctx_with_bundle_remote().await;
        let transport = InMemoryPayloadTransport::capture();
        let result = push(&ctx, "main", "origin", &transport).await.unwrap();
        assert_eq!(result, PushResult::Same(None));
        assert!(transport.captured().await.is_none());
    }

    #[tokio::test]
    async fn test_push_transmits_new_commits() {
        let ctx = ctx_with_bundle_remote().await;
        write_commit(&ctx, "first").await;

        let transport = InMemoryPayloadTransport::capture();
        let result = push(&ctx, "main", "origin", &transport).await.unwrap();

        let new_layer = match result {
            PushResult::New(id) => id,
            other => panic!("expected New, got {:?}", other),
        };
        assert!(transport.captured().await.is_some());

        let doc = ctx.meta.snapshot().await;
        assert_eq!(doc.repository_head("origin").unwrap(), Some(new_layer));
        assert_eq!(doc.remote("origin").unwrap().tracking_head, Some(new_layer));
    }

    #[tokio::test]
    async fn test_push_twice_is_same() {
        let ctx = ctx_with_bundle_remote().await;
        write_commit(&ctx, "first").await;

        let transport = InMemoryPayloadTransport::capture();
        let first = push(&ctx, "main", "origin", &transport).await.unwrap();
        let head = match first {
            PushResult::New(id) => id,
            other => panic!("expected New, got {:?}", other),
        };

        let transport = InMemoryPayloadTransport::capture();
        let second = push(&ctx, "main", "origin", &transport).await.unwrap();
        assert_eq!(second, PushResult::Same(Some(head)));
        assert!(transport.captured().await.is_none());
    }

    #[tokio::test]
    async fn test_push_to_local_remote_rejected() {
        let ctx = DatabaseContext::in_memory(DatabaseSpec::new("acme", "crm"));
        ctx.init_local_graph(crate::db::default_prefixes())
            .await
            .unwrap();
        let mut txn = ctx.meta.begin().await;
        txn.doc_mut()
            .add_remote("mirror", "local:///acme/mirror", RemoteKind::Local)
            .unwrap();
        txn.commit().unwrap();

        let transport = InMemoryPayloadTransport::capture();
        let err = push(&ctx, "main", "mirror", &transport).await.unwrap_err();
        assert!(matches!(err, SyncError::PushAttemptedOnNonRemote(_)));
    }

    #[tokio::test]
    async fn test_push_without_repository_head_rejected() {
        let ctx = DatabaseContext::in_memory(DatabaseSpec::new("acme", "crm"));
        ctx.init_local_graph(crate::db::default_prefixes())
            .await
            .unwrap();
        let mut txn = ctx.meta.begin().await;
        txn.doc_mut()
            .add_remote("origin", "http://server/acme/crm", RemoteKind::Remote)
            .unwrap();
        txn.commit().unwrap();

        let transport = InMemoryPayloadTransport::capture();
        let err = push(&ctx, "main", "origin", &transport).await.unwrap_err();
        assert!(matches!(err, SyncError::PushHasNoRepositoryHead(_)));
    }

    #[tokio::test]
    async fn test_push_missing_branch_rejected() {
        let ctx = ctx_with_bundle_remote().await;
        let transport = InMemoryPayloadTransport::capture();
        let err = push(&ctx, "nope", "origin", &transport).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_transmission_keeps_confirmed_head() {
        struct FailingTransport;
        #[async_trait::async_trait]
        impl Transport for FailingTransport {
            async fn request_pack(
                &self,
                _url: &str,
                _baseline: Option<LayerId>,
            ) -> Result<Option<bytes::Bytes>, SyncError> {
                Ok(None)
            }
            async fn send_pack(
                &self,
                _url: &str,
                _payload: bytes::Bytes,
            ) -> Result<(), SyncError> {
                Err(SyncError::RemoteUnpackFailed {
                    status: 500,
                    body: "boom".into(),
                })
            }
        }

        let ctx = ctx_with_bundle_remote().await;
        write_commit(&ctx, "first").await;

        let err = push(&ctx, "main", "origin", &FailingTransport)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnpackFailed { .. }));

        let doc = ctx.meta.snapshot().await;
        assert_eq!(doc.repository_head("origin").unwrap(), None);
    }
}
