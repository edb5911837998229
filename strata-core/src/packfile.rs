//! Pack codec.
//!
//! A pack is a self-describing byte stream carrying a set of layers and their
//! parent pointers:
//!
//! ```text
//! magic (8 bytes) | entry count (4 bytes BE) | entries…
//! entry: layer id (20) | flags (1, bit0 = has-parent) | parent id (20, if flagged)
//!        | payload length (8 bytes BE) | payload
//! ```
//!
//! A payload prepends a 20-byte repository head hint to the pack. Packs are
//! emitted parents-first but readers must not rely on entry ordering.

use crate::layer::{LayerId, LayerRecord, ID_LEN};
use bytes::Bytes;

/// Pack magic; the final byte doubles as the format version.
pub const PACK_MAGIC: [u8; 8] = *b"STRATAPK";

const FLAG_HAS_PARENT: u8 = 0b0000_0001;

/// Errors raised while decoding a pack or payload.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("bad pack magic")]
    BadMagic,

    #[error("truncated pack at offset {0}")]
    Truncated(usize),

    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),

    #[error("payload too short for repository head")]
    PayloadTooShort,
}

/// Serialize a set of layer records into a pack.
pub fn build_pack(entries: &[LayerRecord]) -> Bytes {
    let mut out = Vec::with_capacity(
        PACK_MAGIC.len() + 4 + entries.iter().map(|e| e.bytes.len() + 49).sum::<usize>(),
    );
    out.extend_from_slice(&PACK_MAGIC);
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        out.extend_from_slice(entry.id.as_bytes());
        match entry.parent {
            Some(parent) => {
                out.push(FLAG_HAS_PARENT);
                out.extend_from_slice(parent.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(entry.bytes.len() as u64).to_be_bytes());
        out.extend_from_slice(&entry.bytes);
    }
    Bytes::from(out)
}

/// Streaming pack reader.
pub struct PackReader<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: u32,
}

impl<'a> PackReader<'a> {
    /// Open a pack, validating the magic and entry count header.
    pub fn open(data: &'a [u8]) -> Result<Self, PackError> {
        if data.len() < PACK_MAGIC.len() + 4 {
            return Err(PackError::Truncated(data.len()));
        }
        if data[..PACK_MAGIC.len()] != PACK_MAGIC {
            return Err(PackError::BadMagic);
        }
        let count = u32::from_be_bytes(
            data[PACK_MAGIC.len()..PACK_MAGIC.len() + 4]
                .try_into()
                .expect("4-byte slice"),
        );
        Ok(Self {
            data,
            pos: PACK_MAGIC.len() + 4,
            remaining: count,
        })
    }

    /// Number of entries declared in the header.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PackError> {
        if self.pos + n > self.data.len() {
            return Err(PackError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_id(&mut self) -> Result<LayerId, PackError> {
        let slice = self.take(ID_LEN)?;
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(slice);
        Ok(LayerId::new(arr))
    }

    fn next_entry(&mut self, materialize: bool) -> Result<Option<LayerRecord>, PackError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let id = self.read_id()?;
        let flags = self.take(1)?[0];
        if flags & !FLAG_HAS_PARENT != 0 {
            return Err(PackError::UnknownFlags(flags));
        }
        let parent = if flags & FLAG_HAS_PARENT != 0 {
            Some(self.read_id()?)
        } else {
            None
        };
        let len = u64::from_be_bytes(self.take(8)?.try_into().expect("8-byte slice")) as usize;
        let payload = self.take(len)?;
        Ok(Some(LayerRecord {
            id,
            parent,
            bytes: if materialize {
                payload.to_vec()
            } else {
                Vec::new()
            },
        }))
    }
}

impl<'a> Iterator for PackReader<'a> {
    type Item = Result<LayerRecord, PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry(true).transpose()
    }
}

/// Enumerate pack membership without materializing payload bytes.
pub fn pack_layerids_and_parents(
    pack: &[u8],
) -> Result<Vec<(LayerId, Option<LayerId>)>, PackError> {
    let mut reader = PackReader::open(pack)?;
    let mut out = Vec::with_capacity(reader.remaining() as usize);
    while let Some(entry) = reader.next_entry(false)? {
        out.push((entry.id, entry.parent));
    }
    Ok(out)
}

/// Decode every entry of a pack.
pub fn pack_entries(pack: &[u8]) -> Result<Vec<LayerRecord>, PackError> {
    PackReader::open(pack)?.collect()
}

/// Prefix a pack with the sending repository's head layer id.
pub fn build_payload(repository_head: LayerId, pack: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(ID_LEN + pack.len());
    out.extend_from_slice(repository_head.as_bytes());
    out.extend_from_slice(pack);
    Bytes::from(out)
}

/// Split a payload into its repository head hint and the pack bytes.
pub fn payload_repository_head_and_pack(payload: &[u8]) -> Result<(LayerId, &[u8]), PackError> {
    if payload.len() < ID_LEN {
        return Err(PackError::PayloadTooShort);
    }
    let mut arr = [0u8; ID_LEN];
    arr.copy_from_slice(&payload[..ID_LEN]);
    Ok((LayerId::new(arr), &payload[ID_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> Vec<LayerRecord> {
        let mut entries = Vec::new();
        let mut parent = None;
        for i in 0..n {
            let rec = LayerRecord::sealed(parent, format!("layer {}", i).into_bytes());
            parent = Some(rec.id);
            entries.push(rec);
        }
        entries
    }

    #[test]
    fn test_pack_roundtrip() {
        let entries = chain(3);
        let pack = build_pack(&entries);
        let decoded = pack_entries(&pack).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_empty_pack() {
        let pack = build_pack(&[]);
        assert_eq!(pack.len(), PACK_MAGIC.len() + 4);
        assert!(pack_entries(&pack).unwrap().is_empty());
    }

    #[test]
    fn test_membership_without_payloads() {
        let entries = chain(2);
        let pack = build_pack(&entries);
        let members = pack_layerids_and_parents(&pack).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], (entries[0].id, None));
        assert_eq!(members[1], (entries[1].id, Some(entries[0].id)));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut pack = build_pack(&chain(1)).to_vec();
        pack[0] = b'X';
        assert!(matches!(
            PackReader::open(&pack),
            Err(PackError::BadMagic)
        ));
    }

    #[test]
    fn test_truncated_pack_rejected() {
        let pack = build_pack(&chain(2));
        let truncated = &pack[..pack.len() - 3];
        let err = pack_entries(truncated).unwrap_err();
        assert!(matches!(err, PackError::Truncated(_)));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let entries = chain(1);
        let mut pack = build_pack(&entries).to_vec();
        // Flag byte sits right after the magic, count and first id.
        pack[PACK_MAGIC.len() + 4 + ID_LEN] = 0b1000_0000;
        let err = pack_entries(&pack).unwrap_err();
        assert!(matches!(err, PackError::UnknownFlags(_)));
    }

    #[test]
    fn test_payload_roundtrip() {
        let entries = chain(2);
        let head = entries.last().unwrap().id;
        let pack = build_pack(&entries);
        let payload = build_payload(head, &pack);

        let (decoded_head, decoded_pack) = payload_repository_head_and_pack(&payload).unwrap();
        assert_eq!(decoded_head, head);
        assert_eq!(decoded_pack, pack.as_ref());
    }

    #[test]
    fn test_payload_too_short() {
        assert!(matches!(
            payload_repository_head_and_pack(&[1, 2, 3]),
            Err(PackError::PayloadTooShort)
        ));
    }

    #[test]
    fn test_incremental_pack_is_smaller() {
        let entries = chain(3);
        let full = build_pack(&entries);
        let incremental = build_pack(&entries[2..]);
        assert!(full.len() > incremental.len());
    }
}
