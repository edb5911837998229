//! Commit model for the version DAG.
//!
//! A commit names its author, message, timestamp and parents, and references
//! the head layer of each named graph (instance / schema / inference). The
//! commit id is the content hash of the serialized record, so commits are
//! immutable and deduplicate across repositories.

use crate::layer::{CommitId, LayerId, LayerRecord};
use serde::{Deserialize, Serialize};

/// The named graphs a commit references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphKind {
    Instance,
    Schema,
    Inference,
}

impl GraphKind {
    pub const ALL: [GraphKind; 3] = [GraphKind::Instance, GraphKind::Schema, GraphKind::Inference];

    pub fn as_str(&self) -> &'static str {
        match self {
            GraphKind::Instance => "instance",
            GraphKind::Schema => "schema",
            GraphKind::Inference => "inference",
        }
    }
}

/// Head graph-layer ids per named graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphHeads {
    pub instance: Option<LayerId>,
    pub schema: Option<LayerId>,
    pub inference: Option<LayerId>,
}

impl GraphHeads {
    pub fn get(&self, kind: GraphKind) -> Option<LayerId> {
        match kind {
            GraphKind::Instance => self.instance,
            GraphKind::Schema => self.schema,
            GraphKind::Inference => self.inference,
        }
    }

    pub fn set(&mut self, kind: GraphKind, id: Option<LayerId>) {
        match kind {
            GraphKind::Instance => self.instance = id,
            GraphKind::Schema => self.schema = id,
            GraphKind::Inference => self.inference = id,
        }
    }
}

/// An immutable node in the version DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub author: String,
    pub message: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// Zero or more parents; more than one for merges.
    pub parents: Vec<CommitId>,
    pub graphs: GraphHeads,
}

impl CommitRecord {
    /// Serialize to the canonical binary form the id is computed over.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Compute the commit id.
    pub fn id(&self) -> CommitId {
        CommitId::from_record_bytes(&self.to_bytes().unwrap_or_default())
    }

    /// Check if this is an initial commit (no parents).
    pub fn is_initial(&self) -> bool {
        self.parents.is_empty()
    }
}

/// A single triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Triple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

/// Additions and retractions carried by one graph layer.
///
/// The wire form is the layer payload; triples are kept sorted so identical
/// deltas serialize identically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TripleDelta {
    pub additions: Vec<Triple>,
    pub retractions: Vec<Triple>,
}

impl TripleDelta {
    pub fn additions(mut triples: Vec<Triple>) -> Self {
        triples.sort();
        Self {
            additions: triples,
            retractions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.retractions.is_empty()
    }

    /// Normalize ordering, then serialize as a graph-layer payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        let mut normalized = self.clone();
        normalized.additions.sort();
        normalized.retractions.sort();
        bincode::serialize(&normalized)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Seal this delta into a graph layer stacked on `parent`.
    pub fn seal(&self, parent: Option<LayerId>) -> Result<LayerRecord, bincode::Error> {
        Ok(LayerRecord::sealed(parent, self.to_bytes()?))
    }
}
