//! File records produced by the directory walker

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Tag bit marking a symlink in a change indicator.
pub const CHANGE_IND_SYMLINK: i64 = 1 << 62;

/// Tag bit marking a special file (device, fifo, socket) in a change indicator.
pub const CHANGE_IND_SPECIAL: i64 = 1 << 61;

/// Mask selecting the timestamp/sequence part of a change indicator.
pub const CHANGE_IND_MASK: i64 = (1 << 61) - 1;

/// Combine a modification time (or journal sequence) with type tag bits.
pub fn encode_change_indicator(base: i64, issym: bool, isspecial: bool) -> i64 {
    let mut v = base & CHANGE_IND_MASK;
    if issym {
        v |= CHANGE_IND_SYMLINK;
    }
    if isspecial {
        v |= CHANGE_IND_SPECIAL;
    }
    v
}

/// The timestamp/sequence part of a change indicator, tag bits stripped.
pub fn change_indicator_base(v: i64) -> i64 {
    v & CHANGE_IND_MASK
}

/// One entry of a directory listing, as cached and as emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAndHash {
    pub name: String,
    pub size: i64,
    /// Modification timestamp or journal sequence, with type tag bits.
    pub change_indicator: i64,
    /// Content hash; empty until computed or carried over from the cache.
    pub hash: Vec<u8>,
    pub isdir: bool,
    pub issym: bool,
    pub isspecial: bool,
    /// Hard link count; > 1 triggers link enumeration.
    pub nlinks: u64,
    /// Raw symlink target as read from the filesystem.
    pub symlink_target: Option<String>,
    /// Symlink target as written to the file list (may be rewritten to a
    /// logical backup path).
    pub output_symlink_target: Option<String>,
}

impl FileAndHash {
    /// Entries are ordered by name; listings are kept sorted so cache rows
    /// can be binary-searched.
    pub fn cmp_by_name(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl PartialOrd for FileAndHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileAndHash {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_by_name(other)
    }
}
