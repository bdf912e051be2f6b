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

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BranchId, DiffId, TimeMachineError};

/// Classification of one compared leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Only present in the newer state
    Added,
    /// Only present in the older state
    Removed,
    /// Present in both, unequal
    Modified,
    /// Present in both, equal
    Unchanged,
}

impl ChangeType {
    /// The classification seen from the other side.
    pub fn inverse(self) -> Self {
        match self {
            Self::Added => Self::Removed,
            Self::Removed => Self::Added,
            other => other,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added => "ADDED",
            Self::Removed => "REMOVED",
            Self::Modified => "MODIFIED",
            Self::Unchanged => "UNCHANGED",
        };
        f.write_str(name)
    }
}

/// One entry of the raw change list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Dotted path of the leaf
    pub path: String,
    /// Classification
    pub change_type: ChangeType,
    /// Value in the older state
    pub old_value: Option<Value>,
    /// Value in the newer state
    pub new_value: Option<Value>,
    /// Signed numeric delta for numeric fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

/// Storage slot change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChange {
    /// Classification
    pub change_type: ChangeType,
    /// Old word
    pub old_value: Option<Value>,
    /// New word
    pub new_value: Option<Value>,
}

/// Balance change; absent balances count as `0x0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    /// Old balance as stored
    pub old_balance: String,
    /// New balance as stored
    pub new_balance: String,
    /// `+n`, `-n` or `0`; `None` when either side is not numeric
    pub delta: Option<String>,
}

/// Code change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChange {
    /// Classification
    pub change_type: ChangeType,
    /// Old code
    pub old_code: Option<String>,
    /// New code
    pub new_code: Option<String>,
}

/// Nonce change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonceChange {
    /// Old nonce
    pub old_nonce: Option<Value>,
    /// New nonce
    pub new_nonce: Option<Value>,
    /// Signed numeric delta
    pub delta: Option<String>,
}

/// Difference between the top-level log lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogChanges {
    /// Logs only present in the newer state
    pub added: Vec<Value>,
    /// Logs only present in the older state
    pub removed: Vec<Value>,
}

impl LogChanges {
    /// Whether both lists are empty.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Change of a top-level gas figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasChange {
    /// Old value
    pub old_value: Option<Value>,
    /// New value
    pub new_value: Option<Value>,
    /// Signed numeric delta
    pub delta: Option<String>,
}

/// Aggregate counts of a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStatistics {
    /// Changes other than UNCHANGED
    pub total_changes: usize,
    /// ADDED leaves
    pub added: usize,
    /// REMOVED leaves
    pub removed: usize,
    /// MODIFIED leaves
    pub modified: usize,
    /// UNCHANGED leaves retained
    pub unchanged: usize,
    /// Distinct addresses with at least one change
    pub addresses_affected: usize,
    /// Storage slots changed
    pub storage_changes: usize,
    /// Balances changed
    pub balance_changes: usize,
    /// Code changes
    pub code_changes: usize,
    /// Nonce changes
    pub nonce_changes: usize,
    /// Logs added or removed
    pub log_changes: usize,
    /// Gas figures changed
    pub gas_changes: usize,
}

/// Structural comparison between two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    /// Diff id
    pub id: DiffId,
    /// Older branch, when the diff was computed between branches
    pub from_branch_id: Option<BranchId>,
    /// Newer branch
    pub to_branch_id: Option<BranchId>,
    /// `address -> slot -> change`
    pub storage_changes: BTreeMap<String, BTreeMap<String, StorageChange>>,
    /// `address -> change`
    pub balance_changes: BTreeMap<String, BalanceChange>,
    /// `address -> change`
    pub code_changes: BTreeMap<String, CodeChange>,
    /// `address -> change`
    pub nonce_changes: BTreeMap<String, NonceChange>,
    /// Log list difference
    pub log_changes: LogChanges,
    /// `field -> change` for `gas` and `gas_used`
    pub gas_changes: BTreeMap<String, GasChange>,
    /// Every classified leaf, in path order
    pub changes: Vec<Change>,
    /// Counts
    pub statistics: DiffStatistics,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Free-form metadata; `network` and `max_depth` are always present
    pub metadata: BTreeMap<String, Value>,
}

impl Diff {
    /// Changes that are not UNCHANGED.
    pub fn effective_changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(|c| c.change_type != ChangeType::Unchanged)
    }

    /// Whether the two states are equal.
    pub fn is_empty(&self) -> bool {
        self.statistics.total_changes == 0
    }
}

/// Export format of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffFormat {
    /// Full structure
    Json,
    /// SARIF 2.1.0 log
    Sarif,
    /// Styled HTML fragment
    Html,
    /// Plain text report
    Text,
    /// One-line summary
    Compact,
}

impl FromStr for DiffFormat {
    type Err = TimeMachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sarif" => Ok(Self::Sarif),
            "html" => Ok(Self::Html),
            "text" | "txt" => Ok(Self::Text),
            "compact" => Ok(Self::Compact),
            other => Err(TimeMachineError::validation(format!("unsupported diff format '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("SARIF".parse::<DiffFormat>().unwrap(), DiffFormat::Sarif);
        assert!(matches!("pdf".parse::<DiffFormat>(), Err(TimeMachineError::Validation(_))));
    }

    #[test]
    fn test_change_type_inverse() {
        assert_eq!(ChangeType::Added.inverse(), ChangeType::Removed);
        assert_eq!(ChangeType::Modified.inverse(), ChangeType::Modified);
    }
}
