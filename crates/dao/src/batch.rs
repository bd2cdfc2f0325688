//! Write batching for the file cache and hard-link graph
//!
//! The walker produces cache updates far faster than they should hit the
//! database one by one. Updates are buffered and applied when the buffer
//! exceeds its byte budget or age; each flush is one batched write.

use crate::ClientDao;
use anyhow::Result;
use snapdex_core::FileAndHash;
use std::time::{Duration, Instant};

/// Flush the file buffer when its estimated size exceeds this.
pub const FILE_BATCH_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Flush the file buffer at least this often.
pub const FILE_BATCH_MAX_AGE: Duration = Duration::from_secs(120);

/// Flush the hard-link buffer when its estimated size exceeds this.
pub const HARDLINK_BATCH_MAX_BYTES: usize = 1024 * 1024;

/// How often a conflicting cache modify is retried before giving up.
const MODIFY_RETRIES: usize = 10;

fn files_size_estimate(files: &[FileAndHash]) -> usize {
    files
        .iter()
        .map(|f| f.name.len() + f.hash.len() + 64)
        .sum()
}

/// Buffered `add_files` / `modify_files` operations.
pub struct FileBatch {
    adds: Vec<(String, i32, Vec<FileAndHash>)>,
    modifies: Vec<(String, i32, Vec<FileAndHash>, i64)>,
    buffered_bytes: usize,
    last_flush: Instant,
}

impl FileBatch {
    pub fn new() -> Self {
        Self {
            adds: Vec::new(),
            modifies: Vec::new(),
            buffered_bytes: 0,
            last_flush: Instant::now(),
        }
    }

    /// Queue a new row, flushing the buffer first if it is due.
    pub fn add(
        &mut self,
        dao: &ClientDao,
        path_key: &str,
        tgroup: i32,
        files: Vec<FileAndHash>,
    ) -> Result<()> {
        self.buffered_bytes += path_key.len() + files_size_estimate(&files);
        self.adds.push((path_key.to_string(), tgroup, files));
        self.maybe_flush(dao)
    }

    /// Queue a row replacement carrying the generation the caller read.
    pub fn modify(
        &mut self,
        dao: &ClientDao,
        path_key: &str,
        tgroup: i32,
        files: Vec<FileAndHash>,
        expected_generation: i64,
    ) -> Result<()> {
        self.buffered_bytes += path_key.len() + files_size_estimate(&files);
        self.modifies
            .push((path_key.to_string(), tgroup, files, expected_generation));
        self.maybe_flush(dao)
    }

    fn maybe_flush(&mut self, dao: &ClientDao) -> Result<()> {
        if self.buffered_bytes > FILE_BATCH_MAX_BYTES
            || self.last_flush.elapsed() > FILE_BATCH_MAX_AGE
        {
            self.flush(dao)?;
        }
        Ok(())
    }

    /// Apply everything buffered.
    ///
    /// A modify whose generation lost a race is retried against the updated
    /// generation; the freshly scanned contents win.
    pub fn flush(&mut self, dao: &ClientDao) -> Result<()> {
        for (path_key, tgroup, files) in self.adds.drain(..) {
            dao.add_files(&path_key, tgroup, &files)?;
        }

        for (path_key, tgroup, files, mut generation) in self.modifies.drain(..) {
            let mut applied = false;
            for _ in 0..MODIFY_RETRIES {
                if dao.modify_files(&path_key, tgroup, &files, generation)? {
                    applied = true;
                    break;
                }
                match dao.get_files(&path_key, tgroup)? {
                    Some((current, _)) => generation = current,
                    None => {
                        // Row vanished underneath us; re-create it.
                        dao.add_files(&path_key, tgroup, &files)?;
                        applied = true;
                        break;
                    }
                }
            }
            if !applied {
                tracing::warn!(
                    "Giving up updating file cache row {} (tgroup {})",
                    path_key,
                    tgroup
                );
            }
        }

        dao.flush()?;
        self.buffered_bytes = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.modifies.is_empty()
    }
}

impl Default for FileBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffered hard-link mutations; resets are applied before inserts so a
/// repopulated key never loses its new edges.
pub struct HardlinkBatch {
    resets: Vec<(String, i64, i64)>,
    adds: Vec<(String, i64, i64, i64, i64)>,
    buffered_bytes: usize,
}

impl HardlinkBatch {
    pub fn new() -> Self {
        Self {
            resets: Vec::new(),
            adds: Vec::new(),
            buffered_bytes: 0,
        }
    }

    pub fn reset(
        &mut self,
        dao: &ClientDao,
        volume: &str,
        frn_high: i64,
        frn_low: i64,
    ) -> Result<()> {
        self.buffered_bytes += volume.len() + 16;
        self.resets.push((volume.to_string(), frn_high, frn_low));
        self.maybe_flush(dao)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        dao: &ClientDao,
        volume: &str,
        frn_high: i64,
        frn_low: i64,
        parent_high: i64,
        parent_low: i64,
    ) -> Result<()> {
        self.buffered_bytes += volume.len() + 32;
        self.adds
            .push((volume.to_string(), frn_high, frn_low, parent_high, parent_low));
        self.maybe_flush(dao)
    }

    fn maybe_flush(&mut self, dao: &ClientDao) -> Result<()> {
        if self.buffered_bytes > HARDLINK_BATCH_MAX_BYTES {
            self.flush(dao)?;
        }
        Ok(())
    }

    pub fn flush(&mut self, dao: &ClientDao) -> Result<()> {
        for (volume, high, low) in self.resets.drain(..) {
            dao.reset_hardlink(&volume, high, low)?;
        }
        for (volume, high, low, parent_high, parent_low) in self.adds.drain(..) {
            dao.add_hardlink(&volume, high, low, parent_high, parent_low)?;
        }
        dao.flush()?;
        self.buffered_bytes = 0;
        Ok(())
    }
}

impl Default for HardlinkBatch {
    fn default() -> Self {
        Self::new()
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
            ..Default::default()
        }
    }

    #[test]
    fn test_file_batch_defers_until_flush() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;
        let mut batch = FileBatch::new();

        batch.add(&dao, "/a/", 1, vec![file("x", 1)])?;
        assert!(dao.get_files("/a/", 1)?.is_none());

        batch.flush(&dao)?;
        assert!(dao.get_files("/a/", 1)?.is_some());
        assert!(batch.is_empty());
        Ok(())
    }

    #[test]
    fn test_file_batch_modify_retries_lost_race() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        dao.add_files("/a/", 1, &[file("x", 1)])?;

        let mut batch = FileBatch::new();
        batch.modify(&dao, "/a/", 1, vec![file("x", 3)], 0)?;

        // Another writer bumps the generation before the batch lands.
        assert!(dao.modify_files("/a/", 1, &[file("x", 2)], 0)?);

        batch.flush(&dao)?;
        let (generation, files) = dao.get_files("/a/", 1)?.unwrap();
        assert_eq!(files[0].size, 3);
        assert_eq!(generation, 2);
        Ok(())
    }

    #[test]
    fn test_hardlink_batch_resets_before_inserts() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        dao.add_hardlink("/", 7, 0, 1, 0)?;

        let mut batch = HardlinkBatch::new();
        batch.add(&dao, "/", 7, 0, 2, 0)?;
        batch.reset(&dao, "/", 7, 0)?;
        batch.flush(&dao)?;

        // The reset ran first, then the insert repopulated the key.
        assert_eq!(dao.get_hardlink_parents("/", 7, 0)?, vec![(2, 0)]);
        Ok(())
    }
}
