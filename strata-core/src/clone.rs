//! Clone engine: create a database, register its origin, fetch, fast-forward
//! and finalize — deleting the half-built database when the transfer itself
//! fails.

use crate::db::{default_prefixes, DatabaseContext, DatabaseRegistry, DatabaseSpec};
use crate::error::SyncError;
use crate::fetch::fetch;
use crate::layer::CommitId;
use crate::meta::RemoteKind;
use crate::pull::{fast_forward_branch, PullOutcome};
use crate::transport::Transport;

/// Result of a clone.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneReport {
    pub applied_commits: Vec<CommitId>,
}

pub async fn clone_db(
    registry: &DatabaseRegistry,
    spec: &DatabaseSpec,
    label: &str,
    comment: &str,
    public: bool,
    remote_url: &str,
    transport: &dyn Transport,
) -> Result<CloneReport, SyncError> {
    let ctx = registry.create_unfinalized(spec, label, comment, public)?;

    match clone_into(&ctx, remote_url, transport).await {
        Ok(applied_commits) => {
            registry.finalize(spec)?;
            tracing::info!(db = %spec, commits = applied_commits.len(), "clone complete");
            Ok(CloneReport { applied_commits })
        }
        Err(err) => {
            // Only a failed transfer warrants tearing the database down;
            // everything else left nothing observable behind.
            if matches!(
                err,
                SyncError::RemotePackFailed(_) | SyncError::RemotePackUnexpectedFailure(_)
            ) {
                tracing::warn!(db = %spec, error = %err, "clone failed, removing database");
                registry.force_delete(spec)?;
            }
            Err(err)
        }
    }
}

async fn clone_into(
    ctx: &DatabaseContext,
    remote_url: &str,
    transport: &dyn Transport,
) -> Result<Vec<CommitId>, SyncError> {
    {
        let mut txn = ctx.meta.begin().await;
        txn.doc_mut()
            .add_remote("origin", remote_url, RemoteKind::Remote)?;
        txn.commit()?;
    }

    fetch(ctx, "origin", transport).await?;

    // Seed the local chain with the fetched prefix document (falling back to
    // the defaults when the remote carries none), then fast-forward main.
    let tracking = ctx.tracking_graph("origin").await?;
    let prefixes = if tracking.prefixes().is_empty() {
        default_prefixes()
    } else {
        tracking.prefixes().clone()
    };
    ctx.init_local_graph(prefixes).await?;

    match fast_forward_branch(ctx, "main", "origin", "main").await? {
        PullOutcome::FastForwarded(applied) => Ok(applied),
        PullOutcome::Unchanged => Ok(Vec::new()),
        other => Err(SyncError::Internal(format!(
            "fast-forward of a fresh clone cannot be {:?}",
            other
        ))),
    }
}
