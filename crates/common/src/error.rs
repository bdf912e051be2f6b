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

//! Error taxonomy for the time machine.
//!
//! Every fallible library operation returns [`TimeMachineError`]. Backend failures are
//! carried as [`AdapterError`] and persistence failures as [`StorageError`], so the job
//! controller can turn either into a job error message without losing the category.

use std::{fmt, io, time::Duration};

use thiserror::Error;

/// Result alias used across the Rewind crates.
pub type Result<T, E = TimeMachineError> = std::result::Result<T, E>;

/// Kind of entity referenced by a [`TimeMachineError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A stored state snapshot
    Snapshot,
    /// A lineage branch
    Branch,
    /// A replay job
    Job,
    /// A registered patch macro
    Macro,
    /// A forensic session
    Session,
    /// A cached diff
    Diff,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snapshot => "snapshot",
            Self::Branch => "branch",
            Self::Job => "job",
            Self::Macro => "macro",
            Self::Session => "session",
            Self::Diff => "diff",
        };
        f.write_str(name)
    }
}

/// Top-level error returned by time machine operations.
#[derive(Debug, Error)]
pub enum TimeMachineError {
    /// Malformed input: a patch, an operation, a job request or a render format.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referenced id does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of the missing entity
        kind: EntityKind,
        /// The id that failed to resolve
        id: String,
    },

    /// The execution backend failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// A patch operation failed mid-application; nothing was persisted.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Snapshot persistence failed or a blob did not verify.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TimeMachineError {
    /// Shorthand for a [`TimeMachineError::NotFound`].
    pub fn not_found(kind: EntityKind, id: impl fmt::Display) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }

    /// Shorthand for a [`TimeMachineError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true for a [`TimeMachineError::NotFound`] of the given kind.
    pub fn is_not_found(&self, expected: EntityKind) -> bool {
        matches!(self, Self::NotFound { kind, .. } if *kind == expected)
    }
}

/// Failures raised by a VM adapter or its RPC transport.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The backend answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message reported by the backend
        message: String,
    },

    /// The request never produced a JSON-RPC response.
    #[error("transport error: {0}")]
    Transport(String),

    /// A bounded wait elapsed.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// How long we waited
        elapsed: Duration,
    },

    /// The backend process could not be spawned or exited unexpectedly.
    #[error("backend process error: {0}")]
    Process(String),

    /// The backend does not offer the requested capability.
    #[error("unsupported by backend: {0}")]
    Unsupported(String),

    /// A response could not be decoded into the expected shape.
    #[error("malformed backend response: {0}")]
    Decode(String),

    /// The backend returned no data for something that must exist.
    #[error("missing data: {0}")]
    MissingData(String),

    /// An operation was invoked before `initialize`.
    #[error("adapter is not initialized")]
    NotInitialized,

    /// The owning job was cancelled while the call was in flight.
    #[error("cancelled")]
    Cancelled,
}

/// Failures raised by the snapshot store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The bytes read back do not hash to the requested id.
    #[error("snapshot {id} is corrupt: content hashes to {computed}")]
    Corrupt {
        /// Requested snapshot id
        id: String,
        /// Hash of the bytes actually read
        computed: String,
    },

    /// The lineage index was written by an incompatible layout.
    #[error("unsupported lineage index version {found} (expected {expected})")]
    UnsupportedIndexVersion {
        /// Version found on disk
        found: u32,
        /// Version this build reads
        expected: u32,
    },

    /// Snapshot metadata exists but the blob is gone.
    #[error("blob missing for snapshot {0}")]
    MissingBlob(String),

    /// Filesystem failure in a persistent backend.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or compression failure.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = TimeMachineError::not_found(EntityKind::Branch, "br-1");
        assert_eq!(err.to_string(), "branch not found: br-1");
        assert!(err.is_not_found(EntityKind::Branch));
        assert!(!err.is_not_found(EntityKind::Snapshot));
    }

    #[test]
    fn test_adapter_error_is_transparent() {
        let err: TimeMachineError = AdapterError::Rpc { code: -32601, message: "nope".into() }.into();
        assert_eq!(err.to_string(), "rpc error -32601: nope");
    }

    #[test]
    fn test_timeout_display_mentions_operation() {
        let err = AdapterError::Timeout {
            operation: "anvil readiness".into(),
            elapsed: Duration::from_secs(3),
        };
        assert!(err.to_string().starts_with("anvil readiness timed out"));
    }
}
