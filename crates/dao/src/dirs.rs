//! Backup roots and the changed/deleted directory queues

use crate::models::BackupRoot;
use crate::ClientDao;
use anyhow::Result;

impl ClientDao {
    /// All configured backup roots, ordered by id.
    pub fn backup_dirs(&self) -> Result<Vec<BackupRoot>> {
        let mut roots = Vec::new();
        for item in self.backupdirs.iter() {
            let (_, raw) = item?;
            roots.push(bincode::deserialize::<BackupRoot>(&raw)?);
        }
        roots.sort_by_key(|r| r.id);
        Ok(roots)
    }

    /// Insert a backup root, assigning an id when none is set.
    pub fn add_backup_dir(&self, mut root: BackupRoot) -> Result<i64> {
        if root.id <= 0 {
            root.id = self.next_id()?;
        }
        self.backupdirs
            .insert(root.id.to_be_bytes(), bincode::serialize(&root)?)?;
        Ok(root.id)
    }

    pub fn del_backup_dir(&self, id: i64) -> Result<()> {
        self.backupdirs.remove(id.to_be_bytes())?;
        Ok(())
    }

    /// Persist the reset-keep flag of a root.
    pub fn set_reset_keep(&self, id: i64, value: bool) -> Result<()> {
        if let Some(raw) = self.backupdirs.get(id.to_be_bytes())? {
            let mut root: BackupRoot = bincode::deserialize(&raw)?;
            root.reset_keep = value;
            self.backupdirs
                .insert(id.to_be_bytes(), bincode::serialize(&root)?)?;
        }
        Ok(())
    }

    /// Record a directory as changed since the last backup.
    pub fn add_changed_dir(&self, dir_key: &str) -> Result<()> {
        self.changed_dirs.insert(dir_key.as_bytes(), &b""[..])?;
        Ok(())
    }

    /// Record a directory as deleted since the last backup.
    pub fn add_del_dir(&self, dir_key: &str) -> Result<()> {
        self.del_dirs.insert(dir_key.as_bytes(), &b""[..])?;
        Ok(())
    }

    /// Changed directories under `volume`, merged with the saved queue from
    /// an earlier unfinished run.
    ///
    /// With `consume` the live entries move into the saved queue: if the run
    /// finishes cleanly the caller clears it via
    /// [`ClientDao::delete_saved_changed_dirs`]; if not, the next run sees
    /// the same set again.
    pub fn changed_dirs(&self, volume: &str, consume: bool) -> Result<Vec<String>> {
        consume_queue(
            &self.changed_dirs,
            &self.saved_changed_dirs,
            volume,
            consume,
        )
    }

    /// Deleted directories under `volume`; same consume semantics as
    /// [`ClientDao::changed_dirs`].
    pub fn del_dirs(&self, volume: &str, consume: bool) -> Result<Vec<String>> {
        consume_queue(&self.del_dirs, &self.saved_del_dirs, volume, consume)
    }

    /// Clear the saved changed/deleted queues after a clean run.
    pub fn delete_saved_changed_dirs(&self) -> Result<()> {
        self.saved_changed_dirs.clear()?;
        self.saved_del_dirs.clear()?;
        Ok(())
    }
}

fn consume_queue(
    live: &sled::Tree,
    saved: &sled::Tree,
    volume: &str,
    consume: bool,
) -> Result<Vec<String>> {
    let mut dirs = Vec::new();

    let live_keys: Vec<sled::IVec> = live
        .scan_prefix(volume.as_bytes())
        .keys()
        .collect::<std::result::Result<_, _>>()?;

    for key in &live_keys {
        dirs.push(String::from_utf8_lossy(key).into_owned());
    }

    for item in saved.scan_prefix(volume.as_bytes()).keys() {
        let key = item?;
        let dir = String::from_utf8_lossy(&key).into_owned();
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }

    if consume {
        let mut move_live = sled::Batch::default();
        let mut add_saved = sled::Batch::default();
        for key in live_keys {
            move_live.remove(key.clone());
            add_saved.insert(key, &b""[..]);
        }
        live.apply_batch(move_live)?;
        saved.apply_batch(add_saved)?;
    }

    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{flags, groups};
    use tempfile::TempDir;

    fn root(id: i64, tname: &str) -> BackupRoot {
        BackupRoot {
            id,
            tname: tname.to_string(),
            path: format!("/{}", tname),
            group: groups::DEFAULT,
            flags: flags::KEEP_FILES,
            symlinked: false,
            symlinked_confirmed: false,
            server_default: true,
            reset_keep: false,
        }
    }

    #[test]
    fn test_backup_dir_crud() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        let id_a = dao.add_backup_dir(root(0, "a"))?;
        let id_b = dao.add_backup_dir(root(0, "b"))?;
        assert_ne!(id_a, id_b);

        let dirs = dao.backup_dirs()?;
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].tname, "a");

        dao.set_reset_keep(id_a, true)?;
        assert!(dao.backup_dirs()?[0].reset_keep);

        dao.del_backup_dir(id_a)?;
        assert_eq!(dao.backup_dirs()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_changed_dirs_consume_and_restore() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        dao.add_changed_dir("/a/x/")?;
        dao.add_changed_dir("/a/y/")?;
        dao.add_changed_dir("/other/z/")?;

        let dirs = dao.changed_dirs("/a/", true)?;
        assert_eq!(dirs, vec!["/a/x/".to_string(), "/a/y/".to_string()]);

        // Consumed entries reappear until the saved queue is cleared.
        let dirs = dao.changed_dirs("/a/", true)?;
        assert_eq!(dirs.len(), 2);

        dao.delete_saved_changed_dirs()?;
        assert!(dao.changed_dirs("/a/", true)?.is_empty());

        // The other volume's entry is untouched.
        assert_eq!(dao.changed_dirs("/other/", false)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_del_dirs_queue() -> Result<()> {
        let dir = TempDir::new()?;
        let dao = ClientDao::open(dir.path())?;

        dao.add_del_dir("/a/gone/")?;
        assert_eq!(dao.del_dirs("/a/", true)?, vec!["/a/gone/".to_string()]);
        dao.delete_saved_changed_dirs()?;
        assert!(dao.del_dirs("/a/", true)?.is_empty());
        Ok(())
    }
}
