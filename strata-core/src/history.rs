//! Commit-level history operations: writing commits, copying commits between
//! repository graphs, branch resets and ancestry logs.

use crate::commit::{CommitRecord, GraphHeads, GraphKind, TripleDelta};
use crate::error::SyncError;
use crate::graph::{RepoDelta, RepositoryGraph};
use crate::layer::{CommitId, LayerRecord};
use crate::storage::LayerStore;
use std::collections::HashSet;

/// Build the commit record and fresh graph layers for a write on `branch`.
///
/// Graphs with a non-empty delta get a new layer stacked on the parent
/// commit's layer for that graph; untouched graphs inherit the parent's head.
pub fn build_commit(
    graph: &RepositoryGraph,
    branch: &str,
    author: &str,
    message: &str,
    timestamp: i64,
    deltas: &[(GraphKind, TripleDelta)],
) -> Result<(CommitRecord, Vec<LayerRecord>), SyncError> {
    let parent = graph.branch_head(branch);
    let parent_heads = match parent {
        Some(id) => {
            graph
                .commit(&id)
                .ok_or_else(|| {
                    SyncError::Internal(format!("branch head commit {} missing", id))
                })?
                .graphs
        }
        None => GraphHeads::default(),
    };

    let mut heads = parent_heads;
    let mut new_layers = Vec::new();
    for kind in GraphKind::ALL {
        if let Some((_, delta)) = deltas.iter().find(|(k, _)| *k == kind) {
            if delta.is_empty() {
                continue;
            }
            let layer = delta.seal(parent_heads.get(kind))?;
            heads.set(kind, Some(layer.id));
            new_layers.push(layer);
        }
    }

    let record = CommitRecord {
        author: author.to_string(),
        message: message.to_string(),
        timestamp,
        parents: parent.into_iter().collect(),
        graphs: heads,
    };
    Ok((record, new_layers))
}

/// Append a freshly built commit to `graph`, moving `branch` to it.
pub async fn append_commit(
    graph: &mut RepositoryGraph,
    store: &dyn LayerStore,
    branch: &str,
    record: CommitRecord,
    graph_layers: Vec<LayerRecord>,
) -> Result<CommitId, SyncError> {
    let id = record.id();
    graph
        .append(
            store,
            &RepoDelta {
                commits: vec![record],
                graph_layers,
                branches: vec![(branch.to_string(), Some(id))],
                ..Default::default()
            },
        )
        .await?;
    Ok(id)
}

/// Ancestors of `target` absent from `dst`, ordered parents-first.
fn missing_ancestors(
    src: &RepositoryGraph,
    dst: &RepositoryGraph,
    target: CommitId,
) -> Result<Vec<CommitId>, SyncError> {
    let mut order = Vec::new();
    let mut done: HashSet<CommitId> = HashSet::new();
    // (commit, parents_expanded)
    let mut stack = vec![(target, false)];
    while let Some((id, expanded)) = stack.pop() {
        if done.contains(&id) || dst.has_commit(&id) {
            continue;
        }
        let record = src
            .commit(&id)
            .ok_or_else(|| SyncError::Internal(format!("commit {} missing from source", id)))?;
        if expanded {
            if done.insert(id) {
                order.push(id);
            }
        } else {
            stack.push((id, true));
            for parent in &record.parents {
                stack.push((*parent, false));
            }
        }
    }
    Ok(order)
}

/// The graph layers a commit introduces over its parents.
fn introduced_graph_layers(
    src: &RepositoryGraph,
    record: &CommitRecord,
) -> Vec<(GraphKind, crate::layer::LayerId)> {
    let parent_heads: Vec<GraphHeads> = record
        .parents
        .iter()
        .filter_map(|p| src.commit(p).map(|c| c.graphs))
        .collect();
    let mut introduced = Vec::new();
    for kind in GraphKind::ALL {
        if let Some(id) = record.graphs.get(kind) {
            let inherited = parent_heads.iter().any(|h| h.get(kind) == Some(id));
            if !inherited {
                introduced.push((kind, id));
            }
        }
    }
    introduced
}

/// Copy `target` and its missing ancestors from `src` into `dst`, moving
/// `branch` along each copied commit. Stops at the first commit already
/// present in the destination; copying an already-present history is a no-op.
/// Returns the copied commit ids in application (oldest-first) order.
pub async fn copy_commits(
    src: &RepositoryGraph,
    dst: &mut RepositoryGraph,
    store: &dyn LayerStore,
    target: CommitId,
    branch: &str,
) -> Result<Vec<CommitId>, SyncError> {
    let mut applied = Vec::new();
    for id in missing_ancestors(src, dst, target)? {
        let record = src
            .commit(&id)
            .ok_or_else(|| SyncError::Internal(format!("commit {} missing from source", id)))?
            .clone();

        let mut graph_layers = Vec::new();
        for (_, layer_id) in introduced_graph_layers(src, &record) {
            let (parent, bytes) = store.get_layer(layer_id).await?.ok_or_else(|| {
                SyncError::Internal(format!("graph layer {} missing from store", layer_id))
            })?;
            graph_layers.push(LayerRecord {
                id: layer_id,
                parent,
                bytes: bytes.to_vec(),
            });
        }

        dst.append(
            store,
            &RepoDelta {
                commits: vec![record],
                graph_layers,
                branches: vec![(branch.to_string(), Some(id))],
                ..Default::default()
            },
        )
        .await?;
        applied.push(id);
    }
    Ok(applied)
}

/// Point `branch` at `commit`, appending a branch-only layer. A no-op when
/// the branch already points there.
pub async fn reset_branch_head(
    graph: &mut RepositoryGraph,
    store: &dyn LayerStore,
    branch: &str,
    commit: CommitId,
) -> Result<(), SyncError> {
    if graph.branch_head(branch) == Some(commit) {
        return Ok(());
    }
    if !graph.has_commit(&commit) {
        return Err(SyncError::NotFound(format!("commit {}", commit)));
    }
    graph
        .append(
            store,
            &RepoDelta {
                branches: vec![(branch.to_string(), Some(commit))],
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

/// One entry of a branch log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: CommitId,
    pub author: String,
    pub message: String,
    pub timestamp: i64,
}

/// Walk a branch's first-parent ancestry, newest first.
pub fn branch_log(
    graph: &RepositoryGraph,
    branch: &str,
    limit: usize,
) -> Result<Vec<LogEntry>, SyncError> {
    let mut entries = Vec::new();
    let mut cursor = graph.branch_head(branch);
    while let Some(id) = cursor {
        if entries.len() >= limit {
            break;
        }
        let record = graph
            .commit(&id)
            .ok_or_else(|| SyncError::Internal(format!("commit {} missing", id)))?;
        entries.push(LogEntry {
            id,
            author: record.author.clone(),
            message: record.message.clone(),
            timestamp: record.timestamp,
        });
        cursor = record.parents.first().copied();
    }
    Ok(entries)
}
