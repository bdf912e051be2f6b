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

use std::fmt;

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BranchId, JobId, Patch, SnapshotId, StateQuery};

/// Lifecycle of a replay job.
///
/// `Pending -> Running -> {Completed, Failed}`, or `{Pending, Running} -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, not yet dispatched
    Pending,
    /// Dispatched to an adapter
    Running,
    /// Finished and produced a branch
    Completed,
    /// Stopped by an error
    Failed,
    /// Stopped by an external request
    Cancelled,
}

impl JobStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Unit of work a replay job drives through its adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayTarget {
    /// A single transaction, captured before and after inclusion
    Transaction {
        /// Transaction hash
        hash: B256,
    },
    /// A single block
    Block {
        /// Block number
        number: u64,
    },
    /// An inclusive block range, one snapshot per block
    BlockRange {
        /// First block
        start: u64,
        /// Last block, inclusive
        end: u64,
    },
}

impl fmt::Display for ReplayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction { hash } => write!(f, "tx {hash}"),
            Self::Block { number } => write!(f, "block {number}"),
            Self::BlockRange { start, end } => write!(f, "blocks {start}..={end}"),
        }
    }
}

/// Request to create a [`ReplayJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJob {
    /// Tag of the adapter factory to run on
    pub vm_backend: String,
    /// What to replay
    pub target: ReplayTarget,
    /// Patches applied on top of the replayed state, in order
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// Optional job name, also used for the produced branch
    #[serde(default)]
    pub name: Option<String>,
    /// Branch the produced branch is attached to
    #[serde(default)]
    pub parent_branch_id: Option<BranchId>,
    /// Accounts captured in every snapshot, in addition to those the blocks touch
    #[serde(default)]
    pub watch: StateQuery,
}

impl CreateJob {
    /// Job over `target` on the adapter registered as `vm_backend`.
    pub fn new(vm_backend: impl Into<String>, target: ReplayTarget) -> Self {
        Self {
            vm_backend: vm_backend.into(),
            target,
            patches: Vec::new(),
            name: None,
            parent_branch_id: None,
            watch: StateQuery::default(),
        }
    }

    /// Sets the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Appends a patch.
    pub fn with_patch(mut self, patch: Patch) -> Self {
        self.patches.push(patch);
        self
    }

    /// Sets the parent branch.
    pub fn with_parent(mut self, parent: BranchId) -> Self {
        self.parent_branch_id = Some(parent);
        self
    }

    /// Sets the watched accounts.
    pub fn with_watch(mut self, watch: StateQuery) -> Self {
        self.watch = watch;
        self
    }
}

/// A replay job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayJob {
    /// Job id
    pub id: JobId,
    /// Optional name
    pub name: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// Adapter tag
    pub vm_backend: String,
    /// What is replayed
    pub target: ReplayTarget,
    /// Patches applied after the replay
    pub patches: Vec<Patch>,
    /// Parent of the produced branch
    pub parent_branch_id: Option<BranchId>,
    /// Extra accounts captured
    pub watch: StateQuery,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Dispatch time
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure description
    pub error_message: Option<String>,
    /// Snapshots produced, in replay order
    pub snapshot_ids: Vec<SnapshotId>,
    /// Branch produced on success
    pub branch_id: Option<BranchId>,
}

impl ReplayJob {
    /// Fresh pending job.
    pub fn pending(request: CreateJob) -> Self {
        Self {
            id: JobId::generate(),
            name: request.name,
            status: JobStatus::Pending,
            vm_backend: request.vm_backend,
            target: request.target,
            patches: request.patches,
            parent_branch_id: request.parent_branch_id,
            watch: request.watch,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            snapshot_ids: Vec::new(),
            branch_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(JobStatus::Completed).unwrap(), json!("COMPLETED"));
        assert_eq!(JobStatus::Cancelled.to_string(), "CANCELLED");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_target_roundtrip() {
        let target = ReplayTarget::BlockRange { start: 100, end: 102 };
        let value = serde_json::to_value(&target).unwrap();
        assert_eq!(value, json!({"block_range": {"start": 100, "end": 102}}));
        assert_eq!(serde_json::from_value::<ReplayTarget>(value).unwrap(), target);
    }

    #[test]
    fn test_pending_job() {
        let job = ReplayJob::pending(CreateJob::new("mock", ReplayTarget::Block { number: 1 }));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.id.as_str().starts_with("job-"));
    }
}
