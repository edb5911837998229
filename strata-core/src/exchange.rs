//! Pack exchange: building payloads from a repository chain and admitting
//! received packs into a store.
//!
//! A pack is accepted on structural and cryptographic grounds only. No schema
//! validation happens on this path; content checks are the layer hash and the
//! parent-presence rule.

use crate::error::{PackFailReason, SyncError};
use crate::graph::RepoDelta;
use crate::layer::{LayerId, LayerRecord};
use crate::meta::MetaStore;
use crate::packfile::{
    build_pack, build_payload, pack_entries, payload_repository_head_and_pack,
};
use crate::storage::{LayerStore, PutOutcome};
use crate::walk::child_until_parents;
use bytes::Bytes;
use std::collections::HashSet;

/// Build a payload carrying the chain from `head` down to (but excluding)
/// `baseline`. Returns `None` when there is nothing to send: no head yet, or
/// the baseline already is the head.
pub async fn pack_from_head(
    store: &dyn LayerStore,
    head: Option<LayerId>,
    baseline: Option<LayerId>,
) -> Result<Option<Bytes>, SyncError> {
    let Some(head) = head else {
        return Ok(None);
    };
    let chain = child_until_parents(store, head, baseline).await?;
    if chain.is_empty() {
        return Ok(None);
    }

    // Emit parents-first.
    let mut entries = Vec::with_capacity(chain.len());
    for (id, parent) in chain.into_iter().rev() {
        let (_, bytes) = store
            .get_layer(id)
            .await?
            .ok_or_else(|| SyncError::Internal(format!("layer {} missing from store", id)))?;
        entries.push(LayerRecord {
            id,
            parent,
            bytes: bytes.to_vec(),
        });
    }
    let pack = build_pack(&entries);
    Ok(Some(build_payload(head, &pack)))
}

/// Admit every layer of a pack into the store.
///
/// Each layer's parent must either be in the pack or already present in the
/// store; each layer's bytes must hash to its id. Admission is idempotent, so
/// unpacking the same pack twice leaves the store unchanged.
pub async fn unpack_into_store(
    store: &dyn LayerStore,
    pack: &[u8],
) -> Result<Vec<LayerId>, SyncError> {
    let entries = pack_entries(pack)
        .map_err(|e| SyncError::RemotePackFailed(PackFailReason::Malformed(e.to_string())))?;

    let in_pack: HashSet<LayerId> = entries.iter().map(|e| e.id).collect();
    let mut admitted: HashSet<LayerId> = HashSet::new();
    let mut pending: Vec<&LayerRecord> = entries.iter().collect();

    // Admit parents before children; entries may arrive in any order.
    while !pending.is_empty() {
        let mut next = Vec::new();
        let mut progressed = false;
        for entry in pending {
            let parent_ready = match entry.parent {
                None => true,
                Some(p) => {
                    admitted.contains(&p) || (!in_pack.contains(&p) && store.exists(p).await?)
                }
            };
            if !parent_ready {
                if let Some(p) = entry.parent {
                    if !in_pack.contains(&p) && !store.exists(p).await? {
                        return Err(SyncError::RemotePackFailed(PackFailReason::MissingParent(
                            p,
                        )));
                    }
                }
                next.push(entry);
                continue;
            }
            match store
                .put_layer(entry.id, entry.parent, Bytes::from(entry.bytes.clone()))
                .await?
            {
                PutOutcome::Mismatch => {
                    return Err(SyncError::RemotePackFailed(
                        PackFailReason::ChecksumMismatch(entry.id),
                    ));
                }
                PutOutcome::Stored | PutOutcome::AlreadyPresent => {}
            }
            admitted.insert(entry.id);
            progressed = true;
        }
        if !progressed && !next.is_empty() {
            // Only possible if parents form a cycle, which content addressing
            // rules out; treat as a malformed pack.
            return Err(SyncError::RemotePackFailed(PackFailReason::Malformed(
                "unresolvable parent ordering".into(),
            )));
        }
        pending = next;
    }

    Ok(entries.into_iter().map(|e| e.id).collect())
}

/// Admit the graph layers embedded in the given repository layers.
///
/// Repository layers carry the graph-layer records their commits reference;
/// materializing them here keeps every layer a commit references resolvable
/// in the store.
pub async fn admit_embedded_graph_layers(
    store: &dyn LayerStore,
    repo_layer_ids: &[LayerId],
) -> Result<(), SyncError> {
    for id in repo_layer_ids {
        let (_, bytes) = store
            .get_layer(*id)
            .await?
            .ok_or_else(|| SyncError::Internal(format!("layer {} missing from store", id)))?;
        let delta = RepoDelta::from_bytes(&bytes).map_err(|e| {
            SyncError::RemotePackFailed(PackFailReason::Malformed(format!(
                "repository layer {}: {}",
                id, e
            )))
        })?;
        for graph_layer in &delta.graph_layers {
            if crate::storage::put_record(store, graph_layer).await? == PutOutcome::Mismatch {
                return Err(SyncError::RemotePackFailed(
                    PackFailReason::ChecksumMismatch(graph_layer.id),
                ));
            }
        }
    }
    Ok(())
}

/// Server-side unpack: admit a payload and advance the local repository head.
///
/// The current head must remain reachable from the new one; a payload built
/// against a stale baseline is rejected as diverged, which is how a losing
/// concurrent push gets turned away.
pub async fn receive_payload(
    store: &dyn LayerStore,
    meta: &MetaStore,
    payload: &[u8],
) -> Result<LayerId, SyncError> {
    let (new_head, pack) = payload_repository_head_and_pack(payload)
        .map_err(|e| SyncError::RemotePackFailed(PackFailReason::Malformed(e.to_string())))?;

    let mut txn = meta.begin().await;
    let current = txn.doc().local_head;

    let admitted = unpack_into_store(store, pack).await?;
    admit_embedded_graph_layers(store, &admitted).await?;

    if !store.exists(new_head).await? {
        return Err(SyncError::RemotePackFailed(PackFailReason::Malformed(
            format!("payload head {} not contained in pack or store", new_head),
        )));
    }

    if let Some(current) = current {
        if current != new_head {
            let mut cursor = Some(new_head);
            let mut found = false;
            while let Some(id) = cursor {
                if id == current {
                    found = true;
                    break;
                }
                cursor = store
                    .get_layer(id)
                    .await?
                    .ok_or_else(|| {
                        SyncError::Internal(format!("layer {} missing from store", id))
                    })?
                    .0;
            }
            if !found {
                return Err(SyncError::RemoteDiverged(Vec::new()));
            }
        }
    }

    if current != Some(new_head) {
        txn.doc_mut().local_head = Some(new_head);
        txn.commit()?;
    }
    Ok(new_head)
}
