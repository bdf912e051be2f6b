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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BranchId, SessionId};

/// Severity of an investigator finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Low impact
    Low,
    /// Medium impact
    Medium,
    /// High impact
    High,
    /// Critical impact
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A labelled pointer to a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Bookmarked branch
    pub branch_id: BranchId,
    /// Short label
    pub label: String,
    /// Optional free text
    pub note: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// An investigator finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Severity
    pub severity: Severity,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Branch the finding was observed on
    pub branch_id: Option<BranchId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Investigator-facing grouping of branches, bookmarks and findings.
///
/// Holds ids only; a session never keeps a branch or snapshot alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForensicSession {
    /// Session id
    pub id: SessionId,
    /// Name
    pub name: String,
    /// Contracts under investigation
    pub target_contracts: Vec<String>,
    /// Transactions under investigation
    pub target_transactions: Vec<String>,
    /// Attached branches
    pub branch_ids: Vec<BranchId>,
    /// Bookmarks, oldest first
    pub bookmarks: Vec<Bookmark>,
    /// Findings, oldest first
    pub findings: Vec<Finding>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}
