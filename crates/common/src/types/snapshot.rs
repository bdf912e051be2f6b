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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SnapshotId;

/// Metadata of a stored snapshot. The blob itself lives in the store's backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// keccak256 of the canonical state bytes
    pub id: SnapshotId,
    /// Snapshot this one is stored as a delta against, if incremental
    pub parent_snapshot_id: Option<SnapshotId>,
    /// Block the state was captured at
    pub block_number: u64,
    /// Whether the stored blob is zstd-compressed
    pub compressed: bool,
    /// Whether the stored blob is a delta
    pub incremental: bool,
    /// Bytes actually held by the backend
    pub size_bytes: u64,
    /// Length of the canonical encoding of the full state
    pub logical_size: u64,
    /// Number of deltas between this snapshot and its nearest full ancestor
    pub chain_depth: u32,
    /// When the snapshot was first stored
    pub created_at: DateTime<Utc>,
}

/// Opaque handle returned by a backend's own snapshot primitive (`evm_snapshot`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotHandle(pub String);

impl std::fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
