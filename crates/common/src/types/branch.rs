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

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BranchId, PatchId, SnapshotId};

/// An immutable, named point in the state lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch id
    pub id: BranchId,
    /// Human readable name
    pub name: String,
    /// Branch this one was derived from
    pub parent_branch_id: Option<BranchId>,
    /// Snapshot holding the branch state
    pub snapshot_id: SnapshotId,
    /// Block the branch state corresponds to
    pub block_number: u64,
    /// Position inside the block when the branch was cut at a transaction
    pub tx_index: Option<u64>,
    /// Ids of every patch applied along the lineage, oldest first
    pub patches_applied: Vec<PatchId>,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Free-form metadata
    pub metadata: BTreeMap<String, Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Request to create a [`Branch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBranch {
    /// Human readable name
    pub name: String,
    /// Parent branch, which must exist
    pub parent_branch_id: Option<BranchId>,
    /// Snapshot, which must exist
    pub snapshot_id: SnapshotId,
    /// Block number of the state
    pub block_number: u64,
    /// Optional transaction index
    #[serde(default)]
    pub tx_index: Option<u64>,
    /// Patches applied along the lineage
    #[serde(default)]
    pub patches_applied: Vec<PatchId>,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl CreateBranch {
    /// Root branch request.
    pub fn new(name: impl Into<String>, snapshot_id: SnapshotId, block_number: u64) -> Self {
        Self {
            name: name.into(),
            parent_branch_id: None,
            snapshot_id,
            block_number,
            tx_index: None,
            patches_applied: Vec::new(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the parent branch.
    pub fn with_parent(mut self, parent: BranchId) -> Self {
        self.parent_branch_id = Some(parent);
        self
    }

    /// Sets the transaction index.
    pub fn with_tx_index(mut self, tx_index: u64) -> Self {
        self.tx_index = Some(tx_index);
        self
    }

    /// Sets the applied patch list.
    pub fn with_patches(mut self, patches: Vec<PatchId>) -> Self {
        self.patches_applied = patches;
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Filter for listing branches. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFilter {
    /// Substring the name must contain
    pub name_contains: Option<String>,
    /// Tag the branch must carry
    pub tag: Option<String>,
    /// Required parent
    pub parent: Option<BranchId>,
    /// Lowest block number, inclusive
    pub min_block: Option<u64>,
    /// Highest block number, inclusive
    pub max_block: Option<u64>,
}

impl BranchFilter {
    /// Whether `branch` passes every set criterion.
    pub fn matches(&self, branch: &Branch) -> bool {
        self.name_contains.as_ref().is_none_or(|needle| branch.name.contains(needle.as_str()))
            && self.tag.as_ref().is_none_or(|tag| branch.tags.contains(tag))
            && self.parent.as_ref().is_none_or(|p| branch.parent_branch_id.as_ref() == Some(p))
            && self.min_block.is_none_or(|min| branch.block_number >= min)
            && self.max_block.is_none_or(|max| branch.block_number <= max)
    }
}
