//! Filesystem helpers shared by the indexer crates

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Write `bytes` to `target` atomically: stage to `<target>.new`, sync, then
/// rename over the target.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> Result<()> {
    let stage = stage_path(target);

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    {
        use std::io::Write;
        let mut f = fs::File::create(&stage)
            .with_context(|| format!("Failed to create {}", stage.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    fs::rename(&stage, target).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            stage.display(),
            target.display()
        )
    })?;

    Ok(())
}

fn stage_path(target: &Path) -> std::path::PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".new");
    target.with_file_name(name)
}

/// Canonical directory-cache key for a path: `/`-separated with a trailing
/// separator, so prefix scans over the key space select whole subtrees.
pub fn path_key(path: &Path) -> String {
    let mut key = path.to_string_lossy().replace('\\', "/");
    if !key.ends_with('/') {
        key.push('/');
    }
    key
}

/// Remove a trailing separator (keeps a bare root separator).
pub fn remove_trailing_sep(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// Append a separator if missing.
pub fn add_trailing_sep(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_and_replaces() -> Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("out.bin");

        atomic_write(&target, b"first")?;
        assert_eq!(fs::read(&target)?, b"first");

        atomic_write(&target, b"second")?;
        assert_eq!(fs::read(&target)?, b"second");

        // No stage file left behind
        assert!(!target.with_file_name("out.bin.new").exists());
        Ok(())
    }

    #[test]
    fn test_path_key_trailing_sep() {
        assert_eq!(path_key(Path::new("/a/b")), "/a/b/");
        assert_eq!(path_key(Path::new("/a/b/")), "/a/b/");
    }

    #[test]
    fn test_sep_helpers() {
        assert_eq!(remove_trailing_sep("/a/b/"), "/a/b");
        assert_eq!(remove_trailing_sep("/"), "/");
        assert_eq!(add_trailing_sep("/a"), "/a/");
        assert_eq!(add_trailing_sep("/a/"), "/a/");
    }
}
