//! Pull engine: fetch, then fast-forward the local branch over the
//! remote-tracking branch.

use crate::db::DatabaseContext;
use crate::error::SyncError;
use crate::fetch::{fetch, FetchOutcome};
use crate::graph::RepositoryGraph;
use crate::history::copy_commits;
use crate::layer::CommitId;
use crate::transport::Transport;
use crate::walk::most_recent_common_ancestor;

/// How a pull ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// Fetch brought nothing and fast-forward applied nothing.
    Unchanged,
    /// The local branch advanced; the applied commit ids in application order.
    FastForwarded(Vec<CommitId>),
    /// The local branch already contains every remote commit.
    Ahead,
    /// Both sides have unique commits; a rebase is required.
    DivergentHistory(Option<CommitId>),
    /// The branches share no history at all.
    NoCommonHistory,
}

/// Result of a pull: the classification plus the fetch outcome it built on.
#[derive(Debug, Clone, PartialEq)]
pub struct PullReport {
    pub outcome: PullOutcome,
    pub fetch: FetchOutcome,
}

impl PullReport {
    /// Commit ids applied by the fast-forward, empty unless fast-forwarded.
    pub fn applied_commits(&self) -> &[CommitId] {
        match &self.outcome {
            PullOutcome::FastForwarded(ids) => ids,
            _ => &[],
        }
    }
}

/// Fast-forward `local_branch` over the remote-tracking branch
/// `remote_branch` of `remote_name`, classifying the branch relationship.
pub async fn fast_forward_branch(
    ctx: &DatabaseContext,
    local_branch: &str,
    remote_name: &str,
    remote_branch: &str,
) -> Result<PullOutcome, SyncError> {
    let mut txn = ctx.meta.begin().await;
    let mut local = RepositoryGraph::load(ctx.store.as_ref(), txn.doc().local_head).await?;
    let tracking_head = txn.doc().remote(remote_name)?.tracking_head;
    let tracking = RepositoryGraph::load(ctx.store.as_ref(), tracking_head).await?;

    let local_commit = local.branch_head(local_branch);
    let remote_commit = tracking.branch_head(remote_branch);

    let outcome = match (local_commit, remote_commit) {
        (None, None) => PullOutcome::Unchanged,
        (Some(_), None) => PullOutcome::Ahead,
        (None, Some(remote_commit)) => {
            let applied = copy_commits(
                &tracking,
                &mut local,
                ctx.store.as_ref(),
                remote_commit,
                local_branch,
            )
            .await?;
            txn.doc_mut().local_head = local.head;
            txn.commit()?;
            return Ok(PullOutcome::FastForwarded(applied));
        }
        (Some(local_commit), Some(remote_commit)) => {
            let mrca =
                most_recent_common_ancestor(&local, &tracking, local_commit, remote_commit);
            match (mrca.common, mrca.path_a.is_empty(), mrca.path_b.is_empty()) {
                (None, _, _) => PullOutcome::NoCommonHistory,
                (Some(_), true, true) => PullOutcome::Unchanged,
                (Some(_), false, true) => PullOutcome::Ahead,
                (Some(common), false, false) => PullOutcome::DivergentHistory(Some(common)),
                (Some(_), true, false) => {
                    let applied = copy_commits(
                        &tracking,
                        &mut local,
                        ctx.store.as_ref(),
                        remote_commit,
                        local_branch,
                    )
                    .await?;
                    txn.doc_mut().local_head = local.head;
                    txn.commit()?;
                    return Ok(PullOutcome::FastForwarded(applied));
                }
            }
        }
    };
    Ok(outcome)
}

/// Pull: fetch from `remote_name`, then fast-forward.
pub async fn pull(
    ctx: &DatabaseContext,
    local_branch: &str,
    remote_name: &str,
    remote_branch: &str,
    transport: &dyn Transport,
) -> Result<PullReport, SyncError> {
    let fetch_outcome = fetch(ctx, remote_name, transport).await?;
    let outcome = fast_forward_branch(ctx, local_branch, remote_name, remote_branch).await?;
    Ok(PullReport {
        outcome,
        fetch: fetch_outcome,
    })
}
