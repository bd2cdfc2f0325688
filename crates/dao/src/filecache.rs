//! Per-directory file cache with optimistic generation counters
//!
//! Rows are keyed by `(tgroup, path_key)` and hold a sorted `FileAndHash`
//! list plus a generation number. Modification is compare-and-swap on the
//! generation so two concurrent walks of the same directory cannot silently
//! overwrite each other.

use crate::ClientDao;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use snapdex_core::FileAndHash;

#[derive(Debug, Serialize, Deserialize)]
struct FileRow {
    generation: i64,
    files: Vec<FileAndHash>,
}

/// Build the storage key for a file-cache row.
pub fn file_key(path_key: &str, tgroup: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + path_key.len());
    key.extend_from_slice(&(tgroup as u32).to_be_bytes());
    key.extend_from_slice(path_key.as_bytes());
    key
}

impl ClientDao {
    /// Load the cached listing of a directory. Returns `(generation, files)`.
    pub fn get_files(&self, path_key: &str, tgroup: i32) -> Result<Option<(i64, Vec<FileAndHash>)>> {
        match self.files.get(file_key(path_key, tgroup))? {
            Some(raw) => {
                let row: FileRow = bincode::deserialize(&raw)?;
                Ok(Some((row.generation, row.files)))
            }
            None => Ok(None),
        }
    }

    /// Insert a new row with generation 0. Overwrites any existing row.
    pub fn add_files(&self, path_key: &str, tgroup: i32, files: &[FileAndHash]) -> Result<()> {
        let row = FileRow {
            generation: 0,
            files: files.to_vec(),
        };
        self.files
            .insert(file_key(path_key, tgroup), bincode::serialize(&row)?)?;
        Ok(())
    }

    /// Replace a row iff its stored generation equals `expected_generation`.
    ///
    /// Returns `false` when the row changed underneath the caller (or was
    /// deleted); the caller re-reads and retries.
    pub fn modify_files(
        &self,
        path_key: &str,
        tgroup: i32,
        files: &[FileAndHash],
        expected_generation: i64,
    ) -> Result<bool> {
        let key = file_key(path_key, tgroup);

        let current = match self.files.get(&key)? {
            Some(raw) => raw,
            None => return Ok(false),
        };

        let row: FileRow = bincode::deserialize(&current)?;
        if row.generation != expected_generation {
            return Ok(false);
        }

        let new_row = FileRow {
            generation: expected_generation + 1,
            files: files.to_vec(),
        };
        let swapped = self
            .files
            .compare_and_swap(
                &key,
                Some(current),
                Some(bincode::serialize(&new_row)?),
            )?
            .is_ok();

        Ok(swapped)
    }

    /// Delete every cached row under `path` for the given tgroup.
    pub fn remove_deleted_dir(&self, path_key: &str, tgroup: i32) -> Result<()> {
        let prefix = file_key(path_key, tgroup);
        let keys: Vec<_> = self
            .files
            .scan_prefix(&prefix)
            .keys()
            .collect::<std::result::Result<_, _>>()?;

        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key);
        }
        self.files.apply_batch(batch)?;
        Ok(())
    }

    /// Drop all rows of a tgroup (full backup reset). tgroup 0 (shared
    /// hashes) is cleared together with the requested group.
    pub fn clear_files(&self, tgroup: i32) -> Result<()> {
        for target in [0, tgroup] {
            let prefix = (target as u32).to_be_bytes();
            let keys: Vec<_> = self
                .files
                .scan_prefix(prefix)
                .keys()
                .collect::<std::result::Result<_, _>>()?;

            let mut batch = sled::Batch::default();
            for key in keys {
                batch.remove(key);
            }
            self.files.apply_batch(batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file(name: &str, size: i64) -> FileAndHash {
        FileAndHash {
            name: name.to_string(),
            size,
            change_indicator: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_add_get_modify() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        assert!(dao.get_files("/a/", 1)?.is_none());

        dao.add_files("/a/", 1, &[file("x", 10)])?;
        let (gen, files) = dao.get_files("/a/", 1)?.unwrap();
        assert_eq!(gen, 0);
        assert_eq!(files.len(), 1);

        assert!(dao.modify_files("/a/", 1, &[file("x", 20)], 0)?);
        let (gen, files) = dao.get_files("/a/", 1)?.unwrap();
        assert_eq!(gen, 1);
        assert_eq!(files[0].size, 20);
        Ok(())
    }

    #[test]
    fn test_modify_cas_conflict() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        dao.add_files("/a/", 1, &[file("x", 10)])?;

        // First writer wins, second (stale generation) loses.
        assert!(dao.modify_files("/a/", 1, &[file("x", 11)], 0)?);
        assert!(!dao.modify_files("/a/", 1, &[file("x", 12)], 0)?);

        // Retry against the updated generation succeeds.
        let (gen, _) = dao.get_files("/a/", 1)?.unwrap();
        assert!(dao.modify_files("/a/", 1, &[file("x", 12)], gen)?);
        Ok(())
    }

    #[test]
    fn test_tgroup_isolation() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        dao.add_files("/a/", 1, &[file("x", 1)])?;
        dao.add_files("/a/", 2, &[file("y", 2)])?;

        assert_eq!(dao.get_files("/a/", 1)?.unwrap().1[0].name, "x");
        assert_eq!(dao.get_files("/a/", 2)?.unwrap().1[0].name, "y");
        Ok(())
    }

    #[test]
    fn test_remove_deleted_dir_is_recursive() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        dao.add_files("/a/", 1, &[file("x", 1)])?;
        dao.add_files("/a/sub/", 1, &[file("y", 2)])?;
        dao.add_files("/ab/", 1, &[file("z", 3)])?;

        dao.remove_deleted_dir("/a/", 1)?;

        assert!(dao.get_files("/a/", 1)?.is_none());
        assert!(dao.get_files("/a/sub/", 1)?.is_none());
        assert!(dao.get_files("/ab/", 1)?.is_some());
        Ok(())
    }

    #[test]
    fn test_clear_files_also_clears_shared_group() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        dao.add_files("/a/", 0, &[file("s", 1)])?;
        dao.add_files("/a/", 1, &[file("x", 1)])?;
        dao.add_files("/a/", 2, &[file("c", 1)])?;

        dao.clear_files(1)?;

        assert!(dao.get_files("/a/", 0)?.is_none());
        assert!(dao.get_files("/a/", 1)?.is_none());
        assert!(dao.get_files("/a/", 2)?.is_some());
        Ok(())
    }
}
