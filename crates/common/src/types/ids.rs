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

//! Identifiers.
//!
//! Snapshots are addressed by the keccak256 of their canonical bytes. Every other
//! entity gets a random, prefixed string id so ids remain readable in logs and in the
//! persisted index.

use std::{fmt, str::FromStr};

use alloy_primitives::{hex, B256};
use serde::{Deserialize, Serialize};

/// Content hash of a canonical state blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub B256);

impl SnapshotId {
    /// Computes the id of a canonical blob.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(alloy_primitives::keccak256(bytes))
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        let full = self.to_string();
        full[..10.min(full.len())].to_string()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for SnapshotId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s).map(Self)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Wraps an existing `", stringify!($name), "`.")]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[doc = concat!("Generates a fresh random id prefixed with `", $prefix, "-`.")]
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{:016x}"), rand::random::<u64>()))
            }

            /// Borrows the raw id.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a lineage branch.
    BranchId,
    "br"
);
string_id!(
    /// Identifier of a replay job.
    JobId,
    "job"
);
string_id!(
    /// Identifier of a patch document.
    PatchId,
    "patch"
);
string_id!(
    /// Identifier of a computed diff.
    DiffId,
    "diff"
);
string_id!(
    /// Identifier of a forensic session.
    SessionId,
    "session"
);
