//! Persisted shadowcopy rows
//!
//! Every created snapshot is written here so that a crash during a backup
//! leaves enough state for the next start to delete orphaned snapshots.

use crate::models::ShadowRow;
use crate::ClientDao;
use anyhow::Result;

impl ClientDao {
    /// Persist a snapshot, assigning its `save_id`.
    pub fn add_shadowcopy(&self, mut row: ShadowRow) -> Result<i64> {
        if row.id <= 0 {
            row.id = self.next_id()?;
        }
        self.shadowcopies
            .insert(row.id.to_be_bytes(), bincode::serialize(&row)?)?;
        self.flush()?;
        Ok(row.id)
    }

    /// Adjust the image-backup reference count of a row.
    pub fn mod_shadowcopy_refcount(&self, id: i64, delta: i32) -> Result<()> {
        if let Some(raw) = self.shadowcopies.get(id.to_be_bytes())? {
            let mut row: ShadowRow = bincode::deserialize(&raw)?;
            row.refs += delta;
            self.shadowcopies
                .insert(id.to_be_bytes(), bincode::serialize(&row)?)?;
        }
        Ok(())
    }

    pub fn del_shadowcopy(&self, id: i64) -> Result<()> {
        self.shadowcopies.remove(id.to_be_bytes())?;
        Ok(())
    }

    pub fn get_shadowcopies(&self) -> Result<Vec<ShadowRow>> {
        let mut rows = Vec::new();
        for item in self.shadowcopies.iter() {
            let (_, raw) = item?;
            rows.push(bincode::deserialize::<ShadowRow>(&raw)?);
        }
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    pub fn get_shadowcopy(&self, id: i64) -> Result<Option<ShadowRow>> {
        match self.shadowcopies.get(id.to_be_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Refresh the start time so timeout reclamation does not fire (ping).
    pub fn update_shadowcopy_starttime(&self, id: i64, starttime_ms: i64) -> Result<()> {
        if let Some(raw) = self.shadowcopies.get(id.to_be_bytes())? {
            let mut row: ShadowRow = bincode::deserialize(&raw)?;
            row.starttime_ms = starttime_ms;
            self.shadowcopies
                .insert(id.to_be_bytes(), bincode::serialize(&row)?)?;
        }
        Ok(())
    }
}
