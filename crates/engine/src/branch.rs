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

//! Branch lineage.
//!
//! Branches live in a flat id-keyed map; parent links are ids. A branch can only be
//! created on top of a stored snapshot and an existing parent, so the parent graph is a
//! forest by construction. Records are never mutated after creation.

use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rewind_common::{
    Branch, BranchFilter, BranchId, CreateBranch, EntityKind, Result, SnapshotId,
    TimeMachineError,
};
use tracing::{info, warn};

use crate::SnapshotStore;

/// Owner of every [`Branch`].
#[derive(Debug)]
pub struct BranchManager {
    store: Arc<SnapshotStore>,
    branches: DashMap<BranchId, Branch>,
    order: RwLock<Vec<BranchId>>,
}

impl BranchManager {
    /// Manager validating snapshot references against `store`.
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store, branches: DashMap::new(), order: RwLock::new(Vec::new()) }
    }

    /// Creates a branch. Fails with a validation error, creating nothing, when the
    /// snapshot is not stored or the parent does not exist.
    pub fn create(&self, request: CreateBranch) -> Result<Branch> {
        if request.name.trim().is_empty() {
            return Err(TimeMachineError::validation("branch name must not be empty"));
        }
        if !self.store.contains(&request.snapshot_id) {
            return Err(TimeMachineError::validation(format!(
                "snapshot {} does not exist",
                request.snapshot_id
            )));
        }
        if let Some(parent) = &request.parent_branch_id {
            if !self.branches.contains_key(parent) {
                return Err(TimeMachineError::validation(format!(
                    "parent branch {parent} does not exist"
                )));
            }
        }

        let branch = Branch {
            id: BranchId::generate(),
            name: request.name,
            parent_branch_id: request.parent_branch_id,
            snapshot_id: request.snapshot_id,
            block_number: request.block_number,
            tx_index: request.tx_index,
            patches_applied: request.patches_applied,
            tags: request.tags,
            metadata: request.metadata,
            created_at: Utc::now(),
        };
        self.insert(branch.clone());
        info!(
            branch = %branch.id,
            name = %branch.name,
            snapshot = %branch.snapshot_id.short(),
            parent = ?branch.parent_branch_id.as_ref().map(BranchId::as_str),
            "created branch"
        );
        Ok(branch)
    }

    fn insert(&self, branch: Branch) {
        let mut order = self.order.write();
        order.push(branch.id.clone());
        self.branches.insert(branch.id.clone(), branch);
    }

    /// Looks a branch up.
    pub fn get(&self, id: &BranchId) -> Result<Branch> {
        self.branches
            .get(id)
            .map(|b| b.clone())
            .ok_or_else(|| TimeMachineError::not_found(EntityKind::Branch, id))
    }

    /// Whether `id` exists.
    pub fn contains(&self, id: &BranchId) -> bool {
        self.branches.contains_key(id)
    }

    /// Branches matching `filter`, in creation order.
    pub fn list(&self, filter: &BranchFilter) -> Vec<Branch> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.branches.get(id).map(|b| b.clone()))
            .filter(|b| filter.matches(b))
            .collect()
    }

    /// `id` followed by its parent, grandparent, ... up to the root.
    pub fn ancestry(&self, id: &BranchId) -> Result<Vec<Branch>> {
        let mut chain = vec![self.get(id)?];
        while let Some(parent) = chain.last().and_then(|b| b.parent_branch_id.clone()) {
            if chain.len() > self.branches.len() {
                return Err(TimeMachineError::Conflict(format!("branch {id} has a cyclic ancestry")));
            }
            chain.push(self.get(&parent)?);
        }
        Ok(chain)
    }

    /// Direct children of `id`, in creation order.
    pub fn children(&self, id: &BranchId) -> Vec<Branch> {
        self.list(&BranchFilter { parent: Some(id.clone()), ..Default::default() })
    }

    /// Branches without children.
    pub fn tips(&self) -> Vec<Branch> {
        let parents: BTreeSet<BranchId> =
            self.branches.iter().filter_map(|b| b.parent_branch_id.clone()).collect();
        self.list(&BranchFilter::default())
            .into_iter()
            .filter(|b| !parents.contains(&b.id))
            .collect()
    }

    /// Removes a leaf branch. Its snapshot is left to the reachability sweep.
    pub fn remove(&self, id: &BranchId) -> Result<Branch> {
        let mut order = self.order.write();
        if let Some(child) =
            self.branches.iter().find(|b| b.parent_branch_id.as_ref() == Some(id))
        {
            return Err(TimeMachineError::Conflict(format!(
                "branch {id} still has child {}",
                child.id
            )));
        }
        let (_, branch) = self
            .branches
            .remove(id)
            .ok_or_else(|| TimeMachineError::not_found(EntityKind::Branch, id))?;
        order.retain(|b| b != id);
        info!(branch = %id, "removed branch");
        Ok(branch)
    }

    /// Snapshots referenced by any branch.
    pub fn referenced_snapshots(&self) -> BTreeSet<SnapshotId> {
        self.branches.iter().map(|b| b.snapshot_id).collect()
    }

    /// Number of branches.
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Whether there are no branches.
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Re-registers branches loaded from a persisted index, parents first. Branches whose
    /// snapshot or parent is gone are skipped.
    pub fn restore(&self, mut pending: Vec<Branch>) -> usize {
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.retain(|b| {
            let stored = self.store.contains(&b.snapshot_id);
            if !stored {
                warn!(branch = %b.id, snapshot = %b.snapshot_id, "branch snapshot is gone, skipping");
            }
            stored
        });
        let mut restored = 0;
        loop {
            let before = pending.len();
            pending.retain(|branch| {
                let ready =
                    branch.parent_branch_id.as_ref().is_none_or(|p| self.branches.contains_key(p));
                if ready {
                    self.insert(branch.clone());
                }
                !ready
            });
            restored += before - pending.len();
            if pending.len() == before {
                break;
            }
        }
        for branch in pending {
            warn!(branch = %branch.id, "dangling branch in index, skipping");
        }
        restored
    }
}
