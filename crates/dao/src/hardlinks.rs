//! Hard-link graph: `(volume, file reference number)` -> parent directories
//!
//! Used to detect moved hard-link copies: when a file with more than one
//! link is indexed, every link's parent directory reference is recorded so
//! a later run can tell whether a "new" file is really an existing inode.

use crate::ClientDao;
use anyhow::Result;

/// Storage key for a hard-link row.
pub fn link_key(volume: &str, frn_high: i64, frn_low: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(volume.len() + 17);
    key.extend_from_slice(volume.as_bytes());
    key.push(0);
    key.extend_from_slice(&frn_high.to_be_bytes());
    key.extend_from_slice(&frn_low.to_be_bytes());
    key
}

impl ClientDao {
    /// Whether any edge is recorded for this file reference.
    pub fn hardlink_exists(&self, volume: &str, frn_high: i64, frn_low: i64) -> Result<bool> {
        Ok(self
            .hardlinks
            .contains_key(link_key(volume, frn_high, frn_low))?)
    }

    /// Parent directory references recorded for this file reference.
    pub fn get_hardlink_parents(
        &self,
        volume: &str,
        frn_high: i64,
        frn_low: i64,
    ) -> Result<Vec<(i64, i64)>> {
        match self.hardlinks.get(link_key(volume, frn_high, frn_low))? {
            Some(raw) => Ok(bincode::deserialize(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Add one `file -> parent` edge. Duplicate parents are ignored.
    pub fn add_hardlink(
        &self,
        volume: &str,
        frn_high: i64,
        frn_low: i64,
        parent_high: i64,
        parent_low: i64,
    ) -> Result<()> {
        let key = link_key(volume, frn_high, frn_low);
        let mut parents: Vec<(i64, i64)> = match self.hardlinks.get(&key)? {
            Some(raw) => bincode::deserialize(&raw)?,
            None => Vec::new(),
        };

        if !parents.contains(&(parent_high, parent_low)) {
            parents.push((parent_high, parent_low));
            self.hardlinks.insert(key, bincode::serialize(&parents)?)?;
        }
        Ok(())
    }

    /// Clear all edges of a file reference before repopulating it.
    pub fn reset_hardlink(&self, volume: &str, frn_high: i64, frn_low: i64) -> Result<()> {
        self.hardlinks
            .remove(link_key(volume, frn_high, frn_low))?;
        Ok(())
    }

    /// Drop the whole graph (full backup reset).
    pub fn reset_all_hardlinks(&self) -> Result<()> {
        self.hardlinks.clear()?;
        Ok(())
    }
}
