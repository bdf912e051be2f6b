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

//! Data directory layout.

use std::path::PathBuf;

use crate::env::REWIND_DATA_DIR;

/// File name of the lineage index inside the data directory.
pub const INDEX_FILE_NAME: &str = "index.json";

/// Trait for data paths.
pub trait DataPath {
    /// Returns the path to the data root: `~/.rewind` by default.
    fn data_dir(&self) -> Option<PathBuf>;

    /// Whether any persistent location is configured.
    fn is_persistent(&self) -> bool {
        self.data_dir().is_some()
    }

    /// Returns the snapshot blob directory: `<data_root>/snapshots`.
    fn snapshots_dir(&self) -> Option<PathBuf> {
        Some(self.data_dir()?.join("snapshots"))
    }

    /// Returns the lineage index file: `<data_root>/index.json`.
    fn index_file(&self) -> Option<PathBuf> {
        Some(self.data_dir()?.join(INDEX_FILE_NAME))
    }
}

/// Data path for rewind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewindDataPath {
    root: Option<PathBuf>,
}

impl Default for RewindDataPath {
    fn default() -> Self {
        Self { root: dirs_next::home_dir().map(|p| p.join(".rewind")) }
    }
}

impl RewindDataPath {
    /// New data path; falls back to `~/.rewind` when `root` is `None`.
    pub fn new(root: Option<impl Into<PathBuf>>) -> Self {
        match root {
            Some(root) => Self { root: Some(root.into()) },
            None => Self::default(),
        }
    }

    /// A path that never persists anything.
    pub fn in_memory() -> Self {
        Self { root: None }
    }

    /// Resolves `REWIND_DATA_DIR`, then the configured root, else in-memory.
    pub fn resolve(configured: Option<PathBuf>) -> Self {
        match std::env::var(REWIND_DATA_DIR) {
            Ok(dir) if !dir.trim().is_empty() => Self { root: Some(PathBuf::from(dir)) },
            _ => Self { root: configured },
        }
    }
}

impl DataPath for RewindDataPath {
    fn data_dir(&self) -> Option<PathBuf> {
        self.root.clone()
    }
}
