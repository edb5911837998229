//! Repository graph: commits, branches and prefixes materialized from the
//! repository layer chain.
//!
//! Every metadata mutation appends exactly one layer whose payload is a
//! bincode-encoded [`RepoDelta`]. Loading a graph walks the chain from head
//! to base and applies deltas oldest-first. Because delta serialization is
//! canonical, two repositories that perform the same sequence of mutations
//! produce byte-identical chains and therefore identical layer ids.

use crate::commit::CommitRecord;
use crate::error::SyncError;
use crate::layer::{CommitId, LayerId, LayerRecord};
use crate::storage::{put_record, LayerStore, PutOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The payload of one repository layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RepoDelta {
    /// Commit records introduced by this layer.
    pub commits: Vec<CommitRecord>,
    /// Graph layers referenced by those commits, carried so the receiver can
    /// admit them without a separate transfer.
    pub graph_layers: Vec<LayerRecord>,
    /// Branch head updates, applied in order. `None` clears the head;
    /// a `None` entry with a fresh name creates an empty branch.
    pub branches: Vec<(String, Option<CommitId>)>,
    /// Branch deletions.
    pub deleted_branches: Vec<String>,
    /// Prefix document replacement; set only by the base layer of a chain.
    pub prefixes: Option<BTreeMap<String, String>>,
}

impl RepoDelta {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Commits, branches and prefixes of one repository, plus the head of the
/// layer chain they were materialized from.
#[derive(Debug, Clone, Default)]
pub struct RepositoryGraph {
    pub head: Option<LayerId>,
    commits: HashMap<CommitId, CommitRecord>,
    branches: BTreeMap<String, Option<CommitId>>,
    prefixes: BTreeMap<String, String>,
}

impl RepositoryGraph {
    /// An empty graph with no backing chain.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Materialize a graph by walking the chain from `head` down to its base
    /// and applying deltas oldest-first.
    pub async fn load(
        store: &dyn LayerStore,
        head: Option<LayerId>,
    ) -> Result<Self, SyncError> {
        let mut graph = Self::empty();
        let Some(head) = head else {
            return Ok(graph);
        };

        let mut chain = Vec::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let (parent, bytes) = store
                .get_layer(id)
                .await?
                .ok_or_else(|| SyncError::Internal(format!("repository layer {} missing", id)))?;
            chain.push(bytes);
            cursor = parent;
        }

        for bytes in chain.iter().rev() {
            let delta = RepoDelta::from_bytes(bytes)
                .map_err(|e| SyncError::Internal(format!("undecodable repository layer: {}", e)))?;
            graph.apply(&delta);
        }
        graph.head = Some(head);
        Ok(graph)
    }

    fn apply(&mut self, delta: &RepoDelta) {
        for record in &delta.commits {
            self.commits.insert(record.id(), record.clone());
        }
        for (name, head) in &delta.branches {
            self.branches.insert(name.clone(), *head);
        }
        for name in &delta.deleted_branches {
            self.branches.remove(name);
        }
        if let Some(prefixes) = &delta.prefixes {
            self.prefixes = prefixes.clone();
        }
    }

    /// Seal `delta` into a layer on top of the current head, admit it (and the
    /// graph layers it carries) into the store, and apply it to this graph.
    /// Returns the new head layer id.
    pub async fn append(
        &mut self,
        store: &dyn LayerStore,
        delta: &RepoDelta,
    ) -> Result<LayerId, SyncError> {
        for graph_layer in &delta.graph_layers {
            if put_record(store, graph_layer).await? == PutOutcome::Mismatch {
                return Err(SyncError::Internal(format!(
                    "graph layer {} failed content verification",
                    graph_layer.id
                )));
            }
        }

        let bytes = delta.to_bytes()?;
        let record = LayerRecord::sealed(self.head, bytes);
        if put_record(store, &record).await? == PutOutcome::Mismatch {
            return Err(SyncError::Internal(format!(
                "repository layer {} failed content verification",
                record.id
            )));
        }

        self.apply(delta);
        self.head = Some(record.id);
        Ok(record.id)
    }

    pub fn commit(&self, id: &CommitId) -> Option<&CommitRecord> {
        self.commits.get(id)
    }

    pub fn has_commit(&self, id: &CommitId) -> bool {
        self.commits.contains_key(id)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    /// Head commit of a branch; `None` both for an absent branch and for a
    /// branch pointing at empty.
    pub fn branch_head(&self, name: &str) -> Option<CommitId> {
        self.branches.get(name).copied().flatten()
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.branches.contains_key(name)
    }

    pub fn branch_names(&self) -> impl Iterator<Item = &String> {
        self.branches.keys()
    }

    pub fn prefixes(&self) -> &BTreeMap<String, String> {
        &self.prefixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::GraphHeads;
    use crate::storage::MemoryLayerStore;

    fn commit(message: &str, parents: Vec<CommitId>) -> CommitRecord {
        CommitRecord {
            author: "alice".into(),
            message: message.into(),
            timestamp: 1000,
            parents,
            graphs: GraphHeads::default(),
        }
    }

    #[tokio::test]
    async fn test_append_and_reload() {
        let store = MemoryLayerStore::new();
        let mut graph = RepositoryGraph::empty();

        let c1 = commit("first", vec![]);
        let c1_id = c1.id();
        let delta = RepoDelta {
            commits: vec![c1],
            branches: vec![("main".into(), Some(c1_id))],
            ..Default::default()
        };
        let head = graph.append(&store, &delta).await.unwrap();

        let reloaded = RepositoryGraph::load(&store, Some(head)).await.unwrap();
        assert_eq!(reloaded.branch_head("main"), Some(c1_id));
        assert!(reloaded.has_commit(&c1_id));
        assert_eq!(reloaded.head, Some(head));
    }

    #[tokio::test]
    async fn test_chain_is_deterministic() {
        let store_a = MemoryLayerStore::new();
        let store_b = MemoryLayerStore::new();
        let mut graph_a = RepositoryGraph::empty();
        let mut graph_b = RepositoryGraph::empty();

        let c1 = commit("first", vec![]);
        let delta = RepoDelta {
            commits: vec![c1.clone()],
            branches: vec![("main".into(), Some(c1.id()))],
            ..Default::default()
        };

        let head_a = graph_a.append(&store_a, &delta).await.unwrap();
        let head_b = graph_b.append(&store_b, &delta).await.unwrap();
        assert_eq!(head_a, head_b);
    }

    #[tokio::test]
    async fn test_deltas_apply_oldest_first() {
        let store = MemoryLayerStore::new();
        let mut graph = RepositoryGraph::empty();

        let c1 = commit("first", vec![]);
        let c1_id = c1.id();
        graph
            .append(
                &store,
                &RepoDelta {
                    commits: vec![c1],
                    branches: vec![("main".into(), Some(c1_id))],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let c2 = commit("second", vec![c1_id]);
        let c2_id = c2.id();
        let head = graph
            .append(
                &store,
                &RepoDelta {
                    commits: vec![c2],
                    branches: vec![("main".into(), Some(c2_id))],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reloaded = RepositoryGraph::load(&store, Some(head)).await.unwrap();
        assert_eq!(reloaded.branch_head("main"), Some(c2_id));
        assert_eq!(reloaded.commit_count(), 2);
        assert_eq!(
            reloaded.commit(&c2_id).unwrap().parents,
            vec![c1_id]
        );
    }

    #[tokio::test]
    async fn test_prefixes_from_base_layer() {
        let store = MemoryLayerStore::new();
        let mut graph = RepositoryGraph::empty();

        let mut prefixes = BTreeMap::new();
        prefixes.insert("@base".to_string(), "strata:///data/".to_string());
        let head = graph
            .append(
                &store,
                &RepoDelta {
                    prefixes: Some(prefixes.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reloaded = RepositoryGraph::load(&store, Some(head)).await.unwrap();
        assert_eq!(reloaded.prefixes(), &prefixes);
    }

    #[tokio::test]
    async fn test_branch_deletion() {
        let store = MemoryLayerStore::new();
        let mut graph = RepositoryGraph::empty();

        graph
            .append(
                &store,
                &RepoDelta {
                    branches: vec![("scratch".into(), None)],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(graph.has_branch("scratch"));

        let head = graph
            .append(
                &store,
                &RepoDelta {
                    deleted_branches: vec!["scratch".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!graph.has_branch("scratch"));

        let reloaded = RepositoryGraph::load(&store, Some(head)).await.unwrap();
        assert!(!reloaded.has_branch("scratch"));
    }

    #[tokio::test]
    async fn test_graph_layers_admitted_on_append() {
        let store = MemoryLayerStore::new();
        let mut graph = RepositoryGraph::empty();

        let graph_layer = LayerRecord::sealed(None, b"triples".to_vec());
        let graph_layer_id = graph_layer.id;
        graph
            .append(
                &store,
                &RepoDelta {
                    graph_layers: vec![graph_layer],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(store.exists(graph_layer_id).await.unwrap());
    }
}
