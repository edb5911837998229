//! Content-addressed identifiers for layers and commits.
//!
//! A layer id is the truncated SHA-256 of the layer's parent pointer and
//! payload, so the id covers both the contents and the chain linkage. Ids are
//! 20 bytes, conventionally rendered as 40 hex characters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of raw bytes in a layer or commit id.
pub const ID_LEN: usize = 20;

/// Unique identifier for a stored layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId([u8; ID_LEN]);

impl LayerId {
    /// Create a LayerId from raw bytes.
    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Compute the id of a layer from its parent pointer and payload.
    pub fn from_content(parent: Option<&LayerId>, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        match parent {
            Some(p) => hasher.update(p.as_bytes()),
            None => hasher.update([0u8; ID_LEN]),
        }
        hasher.update(payload);
        let digest = hasher.finalize();
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&digest[..ID_LEN]);
        Self(arr)
    }

    /// Convert to hexadecimal string (40 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Unique identifier for a commit in the version DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId([u8; ID_LEN]);

impl CommitId {
    /// Create a CommitId from raw bytes.
    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Compute a CommitId from the serialized commit record.
    pub fn from_record_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&digest[..ID_LEN]);
        Self(arr)
    }

    /// Convert to hexadecimal string (40 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A fully materialized layer record: id, optional parent, payload bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: LayerId,
    pub parent: Option<LayerId>,
    pub bytes: Vec<u8>,
}

impl LayerRecord {
    /// Build a record, computing the id from parent and payload.
    pub fn sealed(parent: Option<LayerId>, bytes: Vec<u8>) -> Self {
        let id = LayerId::from_content(parent.as_ref(), &bytes);
        Self { id, parent, bytes }
    }

    /// Verify that the stored id matches the content hash.
    pub fn verify(&self) -> bool {
        LayerId::from_content(self.parent.as_ref(), &self.bytes) == self.id
    }
}
