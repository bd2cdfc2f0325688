//! Row types stored in the client database

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backup root flags. Carried as a bitset in control records and rows.
pub mod flags {
    pub const FOLLOW_SYMLINKS: u32 = 1;
    pub const SYMLINKS_OPTIONAL: u32 = 1 << 1;
    pub const OPTIONAL: u32 = 1 << 2;
    pub const REQUIRE_SNAPSHOT: u32 = 1 << 3;
    pub const SHARE_HASHES: u32 = 1 << 4;
    pub const ONE_FILESYSTEM: u32 = 1 << 5;
    pub const KEEP_FILES: u32 = 1 << 6;
}

/// Backup group partitions.
pub mod groups {
    pub const DEFAULT: i32 = 0;
    pub const CONTINUOUS: i32 = 1;
    pub const COMPONENTS: i32 = 2;
}

/// A configured backup root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRoot {
    pub id: i64,
    /// Logical name exposed to the server.
    pub tname: String,
    /// Filesystem path.
    pub path: String,
    pub group: i32,
    pub flags: u32,
    /// Root discovered by following a symlink out of another root.
    pub symlinked: bool,
    /// Confirmed by traversal during the current walk; never persisted.
    #[serde(skip)]
    pub symlinked_confirmed: bool,
    pub server_default: bool,
    /// When set, the next incremental run must not carry keep entries.
    pub reset_keep: bool,
}

impl BackupRoot {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// The file-cache partition this root writes to. Roots sharing hashes
    /// collapse into tgroup 0.
    pub fn db_tgroup(&self) -> i32 {
        if self.has_flag(flags::SHARE_HASHES) {
            0
        } else {
            self.group + 1
        }
    }
}

/// Persisted shadowcopy state, mirroring the in-memory snapshot reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowRow {
    /// Row id, reported to the server as `save_id`.
    pub id: i64,
    /// Snapshot-set id shared by sibling volumes.
    pub ssetid: Uuid,
    /// Path where the snapshot is mounted.
    pub volpath: String,
    /// Original volume the snapshot was taken of.
    pub target: String,
    /// Logical name of the root that triggered the snapshot.
    pub tname: String,
    pub orig_target: String,
    pub filesrv: bool,
    pub starttoken: String,
    pub clientsubname: String,
    pub for_imagebackup: bool,
    pub starttime_ms: i64,
    /// Image-backup reference count.
    pub refs: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(flags: u32, group: i32) -> BackupRoot {
        BackupRoot {
            id: 1,
            tname: "data".to_string(),
            path: "/data".to_string(),
            group,
            flags,
            symlinked: false,
            symlinked_confirmed: false,
            server_default: true,
            reset_keep: false,
        }
    }

    #[test]
    fn test_db_tgroup_partitioning() {
        assert_eq!(root(0, groups::DEFAULT).db_tgroup(), 1);
        assert_eq!(root(0, groups::CONTINUOUS).db_tgroup(), 2);
        assert_eq!(root(flags::SHARE_HASHES, groups::DEFAULT).db_tgroup(), 0);
        assert_eq!(root(flags::SHARE_HASHES, groups::CONTINUOUS).db_tgroup(), 0);
    }

    #[test]
    fn test_flag_queries() {
        let r = root(flags::OPTIONAL | flags::KEEP_FILES, 0);
        assert!(r.has_flag(flags::OPTIONAL));
        assert!(r.has_flag(flags::KEEP_FILES));
        assert!(!r.has_flag(flags::REQUIRE_SNAPSHOT));
    }
}
