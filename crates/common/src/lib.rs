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

//! Rewind Common - Shared functionality for Rewind components
//!
//! This crate provides the entity types, the error taxonomy and the logging setup
//! shared by the VM adapters and the time machine engine.

/// Entity types of the time machine: states, snapshots, branches, jobs, patches, diffs and sessions
pub mod types;

/// Environment variable names understood by Rewind components
pub mod env;
/// Error taxonomy shared by every Rewind crate
pub mod error;
/// Logging setup and utilities for consistent logging across Rewind components
pub mod logging;
/// Data directory layout for persisted snapshots and the lineage index
pub mod paths;
/// Test helpers for building states and isolated data directories
pub mod test_utils;

pub use error::*;
pub use paths::*;
pub use types::*;
