//! Ancestry walks over layer chains and the commit DAG.

use crate::error::SyncError;
use crate::graph::RepositoryGraph;
use crate::layer::{CommitId, LayerId};
use crate::storage::LayerStore;
use std::collections::{HashSet, VecDeque};

/// Walk the layer chain from `head` towards the base, stopping exclusively at
/// `baseline`. Returns layers child-first (`[head, head.parent, …]`).
///
/// If `baseline` is `None` the full chain is returned. If `baseline` is not on
/// the chain the full chain is returned as well; a requester holding a stale
/// or foreign baseline simply receives a full pack.
pub async fn child_until_parents(
    store: &dyn LayerStore,
    head: LayerId,
    baseline: Option<LayerId>,
) -> Result<Vec<(LayerId, Option<LayerId>)>, SyncError> {
    if baseline == Some(head) {
        return Ok(Vec::new());
    }

    let mut chain = Vec::new();
    let mut cursor = Some(head);
    while let Some(id) = cursor {
        if Some(id) == baseline {
            return Ok(chain);
        }
        let parent = store
            .get_layer(id)
            .await?
            .ok_or_else(|| SyncError::Internal(format!("layer {} missing from store", id)))?
            .0;
        chain.push((id, parent));
        cursor = parent;
    }

    if baseline.is_some() {
        tracing::warn!(
            head = %head,
            "baseline not found on layer chain; returning full history"
        );
    }
    Ok(chain)
}

/// The layer ids of the chain returned by [`child_until_parents`].
pub async fn repository_layer_to_layerids(
    store: &dyn LayerStore,
    head: LayerId,
    baseline: Option<LayerId>,
) -> Result<Vec<LayerId>, SyncError> {
    Ok(child_until_parents(store, head, baseline)
        .await?
        .into_iter()
        .map(|(id, _)| id)
        .collect())
}

/// Result of a most-recent-common-ancestor search.
#[derive(Debug, Clone, PartialEq)]
pub struct MrcaResult {
    /// The common ancestor, if any.
    pub common: Option<CommitId>,
    /// Commits reachable from `head_a` outside the common ancestor subgraph,
    /// newest first.
    pub path_a: Vec<CommitId>,
    /// Symmetrically for `head_b`.
    pub path_b: Vec<CommitId>,
}

fn parents_of(graph: &RepositoryGraph, id: &CommitId) -> Vec<CommitId> {
    graph
        .commit(id)
        .map(|c| c.parents.clone())
        .unwrap_or_default()
}

/// Breadth-first ancestor closure of `start` (inclusive), in visit order.
fn reachable(graph: &RepositoryGraph, start: CommitId) -> Vec<CommitId> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(start);
    seen.insert(start);
    while let Some(id) = queue.pop_front() {
        order.push(id);
        for parent in parents_of(graph, &id) {
            if seen.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    order
}

/// Most-recent-common-ancestor of two commits via a two-sided BFS over commit
/// parents. The first commit seen on both sides is the MRCA; when two
/// candidates are equally recent the one on A's frontier wins.
pub fn most_recent_common_ancestor(
    graph_a: &RepositoryGraph,
    graph_b: &RepositoryGraph,
    head_a: CommitId,
    head_b: CommitId,
) -> MrcaResult {
    let mut visited_a: HashSet<CommitId> = HashSet::new();
    let mut visited_b: HashSet<CommitId> = HashSet::new();
    let mut frontier_a = VecDeque::from([head_a]);
    let mut frontier_b = VecDeque::from([head_b]);
    visited_a.insert(head_a);
    visited_b.insert(head_b);

    let mut common = None;

    'search: loop {
        if frontier_a.is_empty() && frontier_b.is_empty() {
            break;
        }

        // A's frontier expands first so ties resolve in A's favor.
        let mut next_a = VecDeque::new();
        while let Some(id) = frontier_a.pop_front() {
            if visited_b.contains(&id) {
                common = Some(id);
                break 'search;
            }
            for parent in parents_of(graph_a, &id) {
                if visited_a.insert(parent) {
                    next_a.push_back(parent);
                }
            }
        }
        frontier_a = next_a;

        let mut next_b = VecDeque::new();
        while let Some(id) = frontier_b.pop_front() {
            if visited_a.contains(&id) {
                common = Some(id);
                break 'search;
            }
            for parent in parents_of(graph_b, &id) {
                if visited_b.insert(parent) {
                    next_b.push_back(parent);
                }
            }
        }
        frontier_b = next_b;
    }

    match common {
        None => MrcaResult {
            common: None,
            path_a: reachable(graph_a, head_a),
            path_b: reachable(graph_b, head_b),
        },
        Some(common_id) => {
            let closure_a: HashSet<CommitId> =
                reachable(graph_a, common_id).into_iter().collect();
            let closure_b: HashSet<CommitId> =
                reachable(graph_b, common_id).into_iter().collect();
            let path_a = reachable(graph_a, head_a)
                .into_iter()
                .filter(|id| !closure_a.contains(id))
                .collect();
            let path_b = reachable(graph_b, head_b)
                .into_iter()
                .filter(|id| !closure_b.contains(id))
                .collect();
            MrcaResult {
                common: Some(common_id),
                path_a,
                path_b,
            }
        }
    }
}
