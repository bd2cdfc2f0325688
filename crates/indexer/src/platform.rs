//! Platform capability surface
//!
//! Everything the walker needs from the operating system beyond plain
//! directory enumeration sits behind this trait: volume resolution, journal
//! sequence numbers, file reference numbers and hard-link enumeration. The
//! default Unix implementation supports volume lookup and file references;
//! the rest degrades gracefully.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

pub trait Platform: Send + Sync {
    /// Mount point containing `path`.
    fn folder_mount(&self, path: &str) -> Option<String>;

    /// `(sequence_next, sequence_id)` of the volume journal backing `dir`.
    fn query_usn(&self, dir: &Path) -> Option<(i64, i64)>;

    /// File reference number `(high, low)` of `path` on its volume.
    fn file_ref(&self, path: &Path) -> Option<(i64, i64)>;

    /// Whether [`Platform::enumerate_hardlinks`] yields anything.
    fn can_enumerate_hardlinks(&self) -> bool;

    /// All paths linking to the inode behind `path`, on the same volume.
    fn enumerate_hardlinks(&self, volume: &str, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Default implementation for Unix-likes.
pub struct UnixPlatform;

impl Platform for UnixPlatform {
    fn folder_mount(&self, path: &str) -> Option<String> {
        let mounts = fs::read_to_string("/proc/mounts").ok()?;
        let mut best: Option<String> = None;
        for line in mounts.lines() {
            let mount_point = line.split_whitespace().nth(1)?;
            if path.starts_with(mount_point)
                && best.as_deref().map_or(true, |b| mount_point.len() > b.len())
            {
                best = Some(mount_point.to_string());
            }
        }
        best.or_else(|| Some("/".to_string()))
    }

    fn query_usn(&self, _dir: &Path) -> Option<(i64, i64)> {
        None
    }

    fn file_ref(&self, path: &Path) -> Option<(i64, i64)> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = fs::symlink_metadata(path).ok()?;
            Some((0, meta.ino() as i64))
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            None
        }
    }

    fn can_enumerate_hardlinks(&self) -> bool {
        false
    }

    fn enumerate_hardlinks(&self, _volume: &str, _path: &Path) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_mount_falls_back_to_root() {
        let platform = UnixPlatform;
        let mount = platform.folder_mount("/definitely/not/mounted");
        assert!(mount.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_ref_is_stable() -> Result<()> {
        use tempfile::TempDir;

        let dir = TempDir::new()?;
        let path = dir.path().join("f");
        fs::write(&path, b"x")?;

        let platform = UnixPlatform;
        let a = platform.file_ref(&path).unwrap();
        let b = platform.file_ref(&path).unwrap();
        assert_eq!(a, b);
        Ok(())
    }
}
