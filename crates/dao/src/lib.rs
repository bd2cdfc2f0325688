//! Persistent client-side stores for the backup indexer
//!
//! One sled database holds every auxiliary index the indexer maintains:
//! - Per-directory file cache with optimistic generation counters
//! - Hard-link graph keyed by `(volume, file reference number)`
//! - Shadowcopy rows so snapshots survive a crash
//! - Backup root configuration
//! - Changed/deleted directory queues fed by the watcher
//! - Misc key/value settings
//!
//! Writes to the file cache and hard-link graph are buffered and applied in
//! batches (see [`FileBatch`] and [`HardlinkBatch`]).

pub mod batch;
pub mod dirs;
pub mod filecache;
pub mod hardlinks;
pub mod models;
pub mod shadow;

pub use batch::{FileBatch, HardlinkBatch};
pub use models::{flags, groups, BackupRoot, ShadowRow};

use anyhow::{Context, Result};
use std::path::Path;

/// Typed data-access object over the client database.
pub struct ClientDao {
    db: sled::Db,
    pub(crate) files: sled::Tree,
    pub(crate) hardlinks: sled::Tree,
    pub(crate) shadowcopies: sled::Tree,
    pub(crate) backupdirs: sled::Tree,
    pub(crate) changed_dirs: sled::Tree,
    pub(crate) saved_changed_dirs: sled::Tree,
    pub(crate) del_dirs: sled::Tree,
    pub(crate) saved_del_dirs: sled::Tree,
    pub(crate) misc: sled::Tree,
}

impl ClientDao {
    /// Open or create the client database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("Failed to open client database at {}", path.display()))?;

        Ok(Self {
            files: db.open_tree(b"files")?,
            hardlinks: db.open_tree(b"hardlinks")?,
            shadowcopies: db.open_tree(b"shadowcopies")?,
            backupdirs: db.open_tree(b"backupdirs")?,
            changed_dirs: db.open_tree(b"changed_dirs")?,
            saved_changed_dirs: db.open_tree(b"saved_changed_dirs")?,
            del_dirs: db.open_tree(b"del_dirs")?,
            saved_del_dirs: db.open_tree(b"saved_del_dirs")?,
            misc: db.open_tree(b"misc")?,
            db,
        })
    }

    /// Allocate a monotonic row id.
    pub(crate) fn next_id(&self) -> Result<i64> {
        Ok(self.db.generate_id()? as i64 + 1)
    }

    /// Flush all trees to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get a misc value.
    pub fn misc_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .misc
            .get(key.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Set a misc value.
    pub fn misc_set(&self, key: &str, value: &str) -> Result<()> {
        self.misc.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_and_misc_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        assert_eq!(dao.misc_get("last_index")?, None);
        dao.misc_set("last_index", "full")?;
        assert_eq!(dao.misc_get("last_index")?.as_deref(), Some("full"));
        Ok(())
    }

    #[test]
    fn test_ids_are_monotonic() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        let a = dao.next_id()?;
        let b = dao.next_id()?;
        assert!(b > a);
        assert!(a > 0);
        Ok(())
    }
}
