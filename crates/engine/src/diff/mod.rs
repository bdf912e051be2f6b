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

//! Structural diffs between states.
//!
//! A diff is computed in two passes. The first walks both state trees and classifies
//! every leaf as ADDED, REMOVED, MODIFIED or UNCHANGED, comparing well-known numeric
//! fields by value. The second sorts the classified leaves into per-address storage,
//! balance, code and nonce buckets by looking at their paths, and compares logs and gas
//! at the top level directly.
//!
//! Diffs between branches are derived data: [`DiffEngine`] caches them per branch pair
//! and options, so asking twice returns the same [`Diff`].

mod bucket;
mod compare;
mod render;

pub use render::*;

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use dashmap::DashMap;
use rewind_common::{BranchId, Diff, DiffId, Result, State};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{BranchManager, SnapshotStore};

/// Default recursion bound.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Knobs of a diff computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffOptions {
    /// Objects nested deeper than this are compared as a whole
    pub max_depth: usize,
    /// Keep UNCHANGED leaves in the change list
    pub include_unchanged: bool,
    /// Network name used in exported artifact URIs
    pub network: String,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, include_unchanged: false, network: "mainnet".into() }
    }
}

impl DiffOptions {
    /// Sets the recursion bound.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Keeps UNCHANGED leaves.
    pub fn with_unchanged(mut self) -> Self {
        self.include_unchanged = true;
        self
    }

    /// Sets the network name.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }
}

/// Compares two states.
pub fn generate(from: &State, to: &State, options: &DiffOptions) -> Diff {
    let (old, new) = (from.as_value(), to.as_value());
    let leaves = compare::compare(old, new, options.max_depth, options.include_unchanged);
    let buckets = bucket::bucket(&leaves, old, new);
    let changes: Vec<_> = leaves.into_iter().map(|leaf| leaf.change).collect();
    let statistics = bucket::statistics(&changes, &buckets);

    let mut metadata = BTreeMap::new();
    metadata.insert("network".to_string(), json!(options.network));
    metadata.insert("max_depth".to_string(), json!(options.max_depth));
    metadata.insert("include_unchanged".to_string(), json!(options.include_unchanged));

    Diff {
        id: DiffId::generate(),
        from_branch_id: None,
        to_branch_id: None,
        storage_changes: buckets.storage,
        balance_changes: buckets.balance,
        code_changes: buckets.code,
        nonce_changes: buckets.nonce,
        log_changes: buckets.logs,
        gas_changes: buckets.gas,
        changes,
        statistics,
        created_at: Utc::now(),
        metadata,
    }
}

type CacheKey = (BranchId, BranchId, DiffOptions);

/// Branch-pair diffs with memoization.
#[derive(Debug)]
pub struct DiffEngine {
    store: Arc<SnapshotStore>,
    branches: Arc<BranchManager>,
    cache: DashMap<CacheKey, Arc<Diff>>,
}

impl DiffEngine {
    /// Engine reading states through `branches` and `store`.
    pub fn new(store: Arc<SnapshotStore>, branches: Arc<BranchManager>) -> Self {
        Self { store, branches, cache: DashMap::new() }
    }

    /// Diff from branch `from` to branch `to`; cached per pair and options.
    pub fn generate(
        &self,
        from: &BranchId,
        to: &BranchId,
        options: &DiffOptions,
    ) -> Result<Arc<Diff>> {
        let key = (from.clone(), to.clone(), options.clone());
        if let Some(cached) = self.cache.get(&key) {
            debug!(%from, %to, "diff cache hit");
            return Ok(cached.clone());
        }

        let from_branch = self.branches.get(from)?;
        let to_branch = self.branches.get(to)?;
        let old = self.store.get(&from_branch.snapshot_id)?;
        let new = self.store.get(&to_branch.snapshot_id)?;

        let mut diff = generate(&old, &new, options);
        diff.from_branch_id = Some(from.clone());
        diff.to_branch_id = Some(to.clone());
        diff.metadata.insert("from_snapshot".into(), json!(from_branch.snapshot_id));
        diff.metadata.insert("to_snapshot".into(), json!(to_branch.snapshot_id));
        debug!(
            %from,
            %to,
            changes = diff.statistics.total_changes,
            addresses = diff.statistics.addresses_affected,
            "computed diff"
        );

        // Concurrent computations of the same pair keep the first result.
        let entry = self.cache.entry(key).or_insert_with(|| Arc::new(diff));
        Ok(entry.value().clone())
    }

    /// Number of cached diffs.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Drops cached diffs touching `branch`.
    pub fn invalidate(&self, branch: &BranchId) {
        self.cache.retain(|(from, to, _), _| from != branch && to != branch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use rewind_common::{
        test_utils::{sample_state, ALICE, BOB, VAULT},
        ChangeType, CreateBranch,
    };

    #[test]
    fn test_identity_has_no_changes() {
        let state = sample_state(100);
        let diff = generate(&state, &state, &DiffOptions::default());
        assert!(diff.is_empty());
        assert_eq!(diff.effective_changes().count(), 0);

        let full = generate(&state, &state, &DiffOptions::default().with_unchanged());
        assert!(full.is_empty());
        assert!(full.statistics.unchanged > 0);
    }

    #[test]
    fn test_symmetry() {
        let from = sample_state(100);
        let mut to = sample_state(101);
        to.set_balance(&ALICE, U256::from(900u64));
        to.set_storage(&VAULT, U256::from(1u64), U256::from(5u64));

        let forward = generate(&from, &to, &DiffOptions::default());
        let backward = generate(&to, &from, &DiffOptions::default());
        assert_eq!(forward.changes.len(), backward.changes.len());
        for (f, b) in forward.changes.iter().zip(&backward.changes) {
            assert_eq!(f.path, b.path);
            assert_eq!(f.change_type, b.change_type.inverse());
            assert_eq!(f.old_value, b.new_value);
            assert_eq!(f.new_value, b.old_value);
        }
    }

    #[test]
    fn test_account_buckets() {
        let from = sample_state(100);
        let mut to = from.clone();
        to.set_balance(&BOB, U256::from(1u64));
        to.set_nonce(&ALICE, 2);
        to.set_storage(&VAULT, U256::ZERO, U256::from(2u64));

        let diff = generate(&from, &to, &DiffOptions::default());
        let bob = rewind_common::format_address(&BOB);
        let change = &diff.balance_changes[&bob];
        assert_eq!((change.old_balance.as_str(), change.new_balance.as_str()), ("0x0", "0x1"));
        assert_eq!(change.delta.as_deref(), Some("+1"));

        let vault = rewind_common::format_address(&VAULT);
        let slot = rewind_common::format_word(U256::ZERO);
        assert_eq!(diff.storage_changes[&vault][&slot].change_type, ChangeType::Modified);
        assert_eq!(diff.nonce_changes.len(), 1);
        assert_eq!(diff.statistics.addresses_affected, 3);
        assert_eq!(diff.metadata["network"], json!("mainnet"));
    }

    #[test]
    fn test_engine_caches_per_pair() {
        let store = Arc::new(SnapshotStore::in_memory());
        let branches = Arc::new(BranchManager::new(store.clone()));
        let a = store.put(&sample_state(100), 100).unwrap().id;
        let b = store.put(&sample_state(101), 101).unwrap().id;
        let a = branches.create(CreateBranch::new("a", a, 100)).unwrap();
        let b = branches.create(CreateBranch::new("b", b, 101)).unwrap();

        let engine = DiffEngine::new(store, branches);
        let options = DiffOptions::default();
        let first = engine.generate(&a.id, &b.id, &options).unwrap();
        let second = engine.generate(&a.id, &b.id, &options).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.from_branch_id.as_ref(), Some(&a.id));

        engine.generate(&a.id, &b.id, &options.clone().with_max_depth(1)).unwrap();
        assert_eq!(engine.cached(), 2);
        engine.invalidate(&b.id);
        assert_eq!(engine.cached(), 0);

        assert!(engine.generate(&a.id, &BranchId::new("br-missing"), &options).is_err());
    }
}
