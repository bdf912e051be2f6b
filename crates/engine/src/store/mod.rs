// Rewind - EVM State Time Machine
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Content-addressed snapshot store.
//!
//! Every state is addressed by the keccak256 of its canonical bytes, so identical states
//! always land on the same [`SnapshotId`] and are stored once. A snapshot is either a
//! full blob or a [`Delta`] against a parent snapshot; reading an incremental snapshot
//! walks the parent chain down to the nearest full blob and replays the deltas upwards.
//! Chains are bounded by `checkpoint_interval`: a put that would make a chain deeper
//! writes a full checkpoint instead.
//!
//! Metadata lives in a concurrent map. The insert path takes the map entry for the id
//! before writing the blob, which makes check-then-insert atomic per id.

mod backend;
mod delta;

pub use backend::*;
pub use delta::*;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use rewind_common::{
    EntityKind, Result, Snapshot, SnapshotId, State, StorageError, TimeMachineError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// zstd level of compressed blobs.
const COMPRESSION_LEVEL: i32 = 3;

/// Encoded form of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoredBlob {
    Full(State),
    Delta { parent: SnapshotId, delta: Delta },
}

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Content hash of the state
    pub id: SnapshotId,
    /// `false` when identical content was already stored
    pub inserted: bool,
}

/// Aggregate numbers of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Backend name
    pub backend: String,
    /// Stored snapshots
    pub snapshots: usize,
    /// Snapshots stored as full blobs
    pub full: usize,
    /// Snapshots stored as deltas
    pub incremental: usize,
    /// Snapshots whose blob is compressed
    pub compressed: usize,
    /// Sum of canonical encodings of all full states
    pub logical_bytes: u64,
    /// Sum of bytes held by the backend
    pub stored_bytes: u64,
    /// Puts answered by an existing snapshot
    pub dedup_hits: u64,
}

/// Content-addressed, deduplicated snapshot store.
#[derive(Debug)]
pub struct SnapshotStore {
    backend: Arc<dyn BlobBackend>,
    snapshots: DashMap<SnapshotId, Snapshot>,
    checkpoint_interval: u32,
    compression_threshold: usize,
    dedup_hits: AtomicU64,
}

impl SnapshotStore {
    /// Store over `backend`.
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self {
            backend,
            snapshots: DashMap::new(),
            checkpoint_interval: 16,
            compression_threshold: 64 * 1024,
            dedup_hits: AtomicU64::new(0),
        }
    }

    /// In-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobBackend::new()))
    }

    /// Sets the maximum delta chain depth.
    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the compression threshold in bytes.
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Backend blobs are written to.
    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    /// Stores a full state.
    pub fn put(&self, state: &State, block_number: u64) -> Result<PutOutcome> {
        self.insert(state, None, block_number)
    }

    /// Stores `state` as a delta against `parent`, or as a checkpoint when the chain is
    /// already `checkpoint_interval` deep.
    pub fn put_child(
        &self,
        parent: &SnapshotId,
        state: &State,
        block_number: u64,
    ) -> Result<PutOutcome> {
        let base = self.get(parent)?;
        let delta = Delta::between(&base, state);
        self.insert(state, Some((*parent, delta)), block_number)
    }

    /// Stores the state obtained by applying `delta` to `parent`.
    pub fn put_incremental(
        &self,
        parent: &SnapshotId,
        delta: Delta,
        block_number: u64,
    ) -> Result<PutOutcome> {
        let base = self.get(parent)?;
        let state = delta.apply(&base);
        self.insert(&state, Some((*parent, delta)), block_number)
    }

    /// Delta turning `parent` into `child`.
    pub fn diff_states(&self, parent: &SnapshotId, child: &SnapshotId) -> Result<Delta> {
        Ok(Delta::between(&self.get(parent)?, &self.get(child)?))
    }

    fn insert(
        &self,
        state: &State,
        parent: Option<(SnapshotId, Delta)>,
        block_number: u64,
    ) -> Result<PutOutcome> {
        let canonical = state.canonical_bytes();
        let id = SnapshotId::of_bytes(&canonical);

        let parent_depth = match &parent {
            Some((parent_id, _)) => Some(
                self.snapshots
                    .get(parent_id)
                    .map(|meta| meta.chain_depth)
                    .ok_or_else(|| TimeMachineError::not_found(EntityKind::Snapshot, parent_id))?,
            ),
            None => None,
        };

        let entry = match self.snapshots.entry(id) {
            Entry::Occupied(_) => {
                self.dedup_hits.fetch_add(1, Ordering::Relaxed);
                debug!(snapshot = %id.short(), "identical snapshot already stored");
                return Ok(PutOutcome { id, inserted: false });
            }
            Entry::Vacant(entry) => entry,
        };

        let (parent_snapshot_id, blob, chain_depth) = match (parent, parent_depth) {
            (Some((parent_id, delta)), Some(depth)) if depth < self.checkpoint_interval => {
                (Some(parent_id), StoredBlob::Delta { parent: parent_id, delta }, depth + 1)
            }
            (Some((parent_id, _)), _) => {
                debug!(snapshot = %id.short(), "chain too deep, writing full checkpoint");
                (Some(parent_id), StoredBlob::Full(state.clone()), 0)
            }
            (None, _) => (None, StoredBlob::Full(state.clone()), 0),
        };
        let incremental = matches!(blob, StoredBlob::Delta { .. });

        let encoded = serde_json::to_vec(&blob).map_err(StorageError::from)?;
        let compressed = encoded.len() > self.compression_threshold;
        let bytes = if compressed {
            zstd::encode_all(encoded.as_slice(), COMPRESSION_LEVEL).map_err(StorageError::Io)?
        } else {
            encoded
        };
        self.backend.write(&id, &bytes)?;

        let snapshot = Snapshot {
            id,
            parent_snapshot_id,
            block_number,
            compressed,
            incremental,
            size_bytes: bytes.len() as u64,
            logical_size: canonical.len() as u64,
            chain_depth,
            created_at: Utc::now(),
        };
        debug!(
            snapshot = %id.short(),
            block = block_number,
            incremental,
            compressed,
            size = snapshot.size_bytes,
            "stored snapshot"
        );
        entry.insert(snapshot);
        Ok(PutOutcome { id, inserted: true })
    }

    /// Reads and verifies a snapshot.
    pub fn get(&self, id: &SnapshotId) -> Result<State> {
        // Walk down to the nearest full blob, then replay deltas upwards.
        let mut deltas = Vec::new();
        let mut cursor = *id;
        let mut state = loop {
            match self.read_blob(&cursor)? {
                StoredBlob::Full(state) => break state,
                StoredBlob::Delta { parent, delta } => {
                    deltas.push(delta);
                    if deltas.len() > self.snapshots.len() {
                        return Err(StorageError::Corrupt {
                            id: id.to_string(),
                            computed: "cyclic delta chain".to_string(),
                        }
                        .into());
                    }
                    cursor = parent;
                }
            }
        };
        for delta in deltas.iter().rev() {
            state = delta.apply(&state);
        }

        let computed = state.content_hash();
        if computed != *id {
            warn!(snapshot = %id, %computed, "snapshot failed hash verification");
            return Err(StorageError::Corrupt { id: id.to_string(), computed: computed.to_string() }
                .into());
        }
        Ok(state)
    }

    fn read_blob(&self, id: &SnapshotId) -> Result<StoredBlob> {
        let compressed = self
            .snapshots
            .get(id)
            .map(|meta| meta.compressed)
            .ok_or_else(|| TimeMachineError::not_found(EntityKind::Snapshot, id))?;
        let bytes =
            self.backend.read(id)?.ok_or_else(|| StorageError::MissingBlob(id.to_string()))?;
        let decoded = if compressed {
            zstd::decode_all(bytes.as_slice()).map_err(StorageError::Io)?
        } else {
            bytes
        };
        serde_json::from_slice(&decoded)
            .map_err(|e| StorageError::Corrupt { id: id.to_string(), computed: e.to_string() }.into())
    }

    /// Whether `id` is stored.
    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.snapshots.contains_key(id)
    }

    /// Metadata of `id`.
    pub fn meta(&self, id: &SnapshotId) -> Result<Snapshot> {
        self.snapshots
            .get(id)
            .map(|meta| meta.clone())
            .ok_or_else(|| TimeMachineError::not_found(EntityKind::Snapshot, id))
    }

    /// Every snapshot, oldest first.
    pub fn list(&self) -> Vec<Snapshot> {
        let mut all: Vec<Snapshot> = self.snapshots.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Aggregate numbers.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            backend: self.backend.name().to_string(),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            ..Default::default()
        };
        for meta in self.snapshots.iter() {
            stats.snapshots += 1;
            if meta.incremental {
                stats.incremental += 1;
            } else {
                stats.full += 1;
            }
            if meta.compressed {
                stats.compressed += 1;
            }
            stats.logical_bytes += meta.logical_size;
            stats.stored_bytes += meta.size_bytes;
        }
        stats
    }

    /// Deletes a snapshot. Refuses while an incremental snapshot depends on it.
    ///
    /// Lineage-aware callers go through the reachability sweep of the
    /// [`TimeMachine`](crate::TimeMachine) instead of calling this directly.
    pub fn delete(&self, id: &SnapshotId) -> Result<bool> {
        let dependent = self
            .snapshots
            .iter()
            .find(|meta| meta.incremental && meta.parent_snapshot_id.as_ref() == Some(id))
            .map(|meta| meta.id);
        if let Some(child) = dependent {
            return Err(TimeMachineError::Conflict(format!(
                "snapshot {id} is the delta base of {child}"
            )));
        }
        if self.snapshots.remove(id).is_none() {
            return Ok(false);
        }
        self.backend.remove(id)?;
        debug!(snapshot = %id.short(), "deleted snapshot");
        Ok(true)
    }

    /// Re-registers metadata loaded from a persisted index. Entries whose blob is gone
    /// are skipped. Returns the number of restored snapshots.
    pub fn restore_index(&self, entries: impl IntoIterator<Item = Snapshot>) -> usize {
        let mut restored = 0;
        for meta in entries {
            if !self.backend.contains(&meta.id) {
                warn!(snapshot = %meta.id, "index entry without blob, skipping");
                continue;
            }
            self.snapshots.insert(meta.id, meta);
            restored += 1;
        }
        info!("Restored {restored} snapshots from index");
        restored
    }

    /// `snapshot → parent` links of every stored snapshot.
    pub fn parent_links(&self) -> BTreeMap<SnapshotId, Option<SnapshotId>> {
        self.snapshots.iter().map(|meta| (meta.id, meta.parent_snapshot_id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use rewind_common::{
        logging::ensure_test_logging,
        test_utils::{sample_state, ALICE, BOB},
    };
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        ensure_test_logging(None);
        let store = SnapshotStore::in_memory();
        let state = sample_state(100);
        let outcome = store.put(&state, 100).unwrap();
        assert!(outcome.inserted);
        assert_eq!(outcome.id, state.content_hash());
        assert_eq!(store.get(&outcome.id).unwrap(), state);
    }

    #[test]
    fn test_identical_put_is_deduplicated() {
        ensure_test_logging(None);
        let store = SnapshotStore::in_memory();
        let first = store.put(&sample_state(100), 100).unwrap();
        let stored = store.stats().stored_bytes;

        let second = store.put(&sample_state(100), 100).unwrap();
        assert_eq!(first.id, second.id);
        assert!(!second.inserted);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().stored_bytes, stored);
        assert_eq!(store.stats().dedup_hits, 1);
    }

    #[test]
    fn test_missing_snapshot_is_not_found() {
        let store = SnapshotStore::in_memory();
        let err = store.get(&SnapshotId::of_bytes(b"nothing")).unwrap_err();
        assert!(err.is_not_found(EntityKind::Snapshot));
    }

    #[test]
    fn test_tampered_blob_is_corrupt() {
        ensure_test_logging(None);
        let store = SnapshotStore::in_memory();
        let id = store.put(&sample_state(100), 100).unwrap().id;

        let forged = serde_json::to_vec(&StoredBlob::Full(sample_state(999))).unwrap();
        store.backend().write(&id, &forged).unwrap();
        assert!(matches!(
            store.get(&id),
            Err(TimeMachineError::Storage(StorageError::Corrupt { .. }))
        ));
    }

    #[test]
    fn test_incremental_chain_resolves() {
        ensure_test_logging(None);
        let store = SnapshotStore::in_memory();
        let root = sample_state(100);
        let mut parent = store.put(&root, 100).unwrap().id;

        let mut expected = root;
        for block in 101..105u64 {
            expected.set_block_number(block);
            expected.set_balance(&ALICE, U256::from(block));
            let outcome = store.put_child(&parent, &expected, block).unwrap();
            let meta = store.meta(&outcome.id).unwrap();
            assert!(meta.incremental);
            assert_eq!(meta.parent_snapshot_id, Some(parent));
            parent = outcome.id;
        }
        assert_eq!(store.meta(&parent).unwrap().chain_depth, 4);
        assert_eq!(store.get(&parent).unwrap(), expected);
        assert!(store.stats().stored_bytes < store.stats().logical_bytes);
    }

    #[test]
    fn test_checkpoint_bounds_chain_depth() {
        ensure_test_logging(None);
        let store = SnapshotStore::in_memory().with_checkpoint_interval(2);
        let mut state = sample_state(0);
        let mut parent = store.put(&state, 0).unwrap().id;
        let mut depths = Vec::new();
        for block in 1..=4u64 {
            state.set_block_number(block);
            parent = store.put_child(&parent, &state, block).unwrap().id;
            depths.push(store.meta(&parent).unwrap().chain_depth);
        }
        assert_eq!(depths, vec![1, 2, 0, 1]);
        assert_eq!(store.get(&parent).unwrap(), state);
    }

    #[test]
    fn test_put_incremental_applies_delta() {
        let store = SnapshotStore::in_memory();
        let base = sample_state(100);
        let parent = store.put(&base, 100).unwrap().id;

        let mut target = base.clone();
        target.set_balance(&BOB, U256::from(5u64));
        let delta = Delta::between(&base, &target);
        let outcome = store.put_incremental(&parent, delta, 100).unwrap();
        assert_eq!(outcome.id, target.content_hash());
        assert_eq!(store.diff_states(&parent, &outcome.id).unwrap().len(), 1);
    }

    #[test]
    fn test_large_blobs_are_compressed() {
        ensure_test_logging(None);
        let store = SnapshotStore::in_memory().with_compression_threshold(256);
        let mut state = sample_state(100);
        for slot in 0..64u64 {
            state.set_storage(&ALICE, U256::from(slot), U256::from(slot * 3));
        }
        let id = store.put(&state, 100).unwrap().id;
        let meta = store.meta(&id).unwrap();
        assert!(meta.compressed);
        assert!(meta.size_bytes < meta.logical_size);
        assert_eq!(store.get(&id).unwrap(), state);
    }

    #[test]
    fn test_delete_refuses_delta_base() {
        let store = SnapshotStore::in_memory();
        let base = sample_state(100);
        let parent = store.put(&base, 100).unwrap().id;
        let mut next = base;
        next.set_block_number(101);
        let child = store.put_child(&parent, &next, 101).unwrap().id;

        assert!(matches!(store.delete(&parent), Err(TimeMachineError::Conflict(_))));
        assert!(store.delete(&child).unwrap());
        assert!(store.delete(&parent).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_disk_store_restores_from_index() {
        ensure_test_logging(None);
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(DiskBlobBackend::new(dir.path()).unwrap());
        let store = SnapshotStore::new(backend.clone());
        let id = store.put(&sample_state(100), 100).unwrap().id;
        let index = store.list();

        let reopened = SnapshotStore::new(backend);
        assert_eq!(reopened.restore_index(index), 1);
        assert_eq!(reopened.get(&id).unwrap(), sample_state(100));
    }

    #[test]
    fn test_concurrent_identical_puts_store_once() {
        ensure_test_logging(None);
        let store = Arc::new(SnapshotStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.put(&sample_state(7), 7).unwrap())
            })
            .collect();
        let outcomes: Vec<PutOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1);
        assert_eq!(store.len(), 1);
    }
}
