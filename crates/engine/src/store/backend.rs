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

//! Blob backends of the snapshot store.
//!
//! A backend is a dumb keyed byte store. Deduplication, compression and hash
//! verification all happen in [`SnapshotStore`](super::SnapshotStore); the backend
//! only has to make a single `write` atomic.

use std::{fmt, fs, io, path::PathBuf};

use dashmap::DashMap;
use rewind_common::{SnapshotId, StorageError};
use tracing::{debug, trace};

/// Keyed storage of encoded snapshot blobs.
pub trait BlobBackend: Send + Sync + fmt::Debug {
    /// Short name for logs and stats.
    fn name(&self) -> &'static str;

    /// Stores `bytes` under `id`, replacing any previous blob.
    fn write(&self, id: &SnapshotId, bytes: &[u8]) -> Result<(), StorageError>;

    /// Reads the blob of `id`, `None` if absent.
    fn read(&self, id: &SnapshotId) -> Result<Option<Vec<u8>>, StorageError>;

    /// Deletes the blob of `id`; `false` if there was none.
    fn remove(&self, id: &SnapshotId) -> Result<bool, StorageError>;

    /// Whether a blob exists for `id`.
    fn contains(&self, id: &SnapshotId) -> bool;
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryBlobBackend {
    blobs: DashMap<SnapshotId, Vec<u8>>,
}

impl MemoryBlobBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobBackend for MemoryBlobBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&self, id: &SnapshotId, bytes: &[u8]) -> Result<(), StorageError> {
        self.blobs.insert(*id, bytes.to_vec());
        Ok(())
    }

    fn read(&self, id: &SnapshotId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.get(id).map(|blob| blob.clone()))
    }

    fn remove(&self, id: &SnapshotId) -> Result<bool, StorageError> {
        Ok(self.blobs.remove(id).is_some())
    }

    fn contains(&self, id: &SnapshotId) -> bool {
        self.blobs.contains_key(id)
    }
}

/// One file per blob: `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct DiskBlobBackend {
    dir: PathBuf,
}

impl DiskBlobBackend {
    /// Opens `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Using snapshot directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Directory holding the blobs.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// File of `id`.
    pub fn blob_path(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl BlobBackend for DiskBlobBackend {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn write(&self, id: &SnapshotId, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(id);
        // Atomic write via temp file
        let temp_file = path.with_extension("tmp");
        fs::write(&temp_file, bytes)?;
        fs::rename(&temp_file, &path)?;
        trace!(snapshot = %id.short(), bytes = bytes.len(), "wrote blob");
        Ok(())
    }

    fn read(&self, id: &SnapshotId) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.blob_path(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, id: &SnapshotId) -> Result<bool, StorageError> {
        match fs::remove_file(self.blob_path(id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn contains(&self, id: &SnapshotId) -> bool {
        self.blob_path(id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(backend: &dyn BlobBackend) {
        let id = SnapshotId::of_bytes(b"blob");
        assert!(!backend.contains(&id));
        assert!(backend.read(&id).unwrap().is_none());

        backend.write(&id, b"blob").unwrap();
        assert!(backend.contains(&id));
        assert_eq!(backend.read(&id).unwrap().as_deref(), Some(&b"blob"[..]));

        assert!(backend.remove(&id).unwrap());
        assert!(!backend.remove(&id).unwrap());
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBlobBackend::new());
    }

    #[test]
    fn test_disk_backend_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let backend = DiskBlobBackend::new(dir.path().join("snapshots")).unwrap();
        exercise(&backend);

        let id = SnapshotId::of_bytes(b"kept");
        backend.write(&id, b"kept").unwrap();
        let names: Vec<_> = fs::read_dir(backend.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{id}.json")]);
    }
}
