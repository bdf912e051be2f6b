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

//! Environment variable name constants for Rewind configuration.
//!
//! Values read from these variables take precedence over the engine configuration
//! file, so an operator can redirect a single run without editing `~/.rewind.toml`.
//!
//! # Environment Variables
//!
//! - [`REWIND_DATA_DIR`] - Root directory for persisted snapshots and the lineage index
//! - [`REWIND_LOG_FILE`] - Enables or disables file logging
//! - [`REWIND_ANVIL_BIN`] - Path of the local fork node binary

/// Environment variable for specifying the data directory.
///
/// When set, snapshots are written under `<dir>/snapshots` and the lineage index
/// under `<dir>/index.json`. When unset and the configuration does not name a
/// directory, the engine keeps everything in memory.
///
/// # Examples
///
/// ```bash
/// REWIND_DATA_DIR=/tmp/rewind cargo test
/// ```
pub const REWIND_DATA_DIR: &str = "REWIND_DATA_DIR";

/// Environment variable controlling file logging.
///
/// `0`, `false` and `off` disable the rolling log file; anything else enables it.
pub const REWIND_LOG_FILE: &str = "REWIND_LOG_FILE";

/// Environment variable overriding the `anvil` binary used by the local fork adapter.
///
/// # Default
///
/// `anvil`, resolved through `PATH`.
pub const REWIND_ANVIL_BIN: &str = "REWIND_ANVIL_BIN";

/// Returns `false` when the variable is set to a recognised "off" value.
pub fn flag_enabled(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off"),
        Err(_) => default,
    }
}
