//! Indexer settings
//!
//! Loaded from `<data_dir>/settings.toml`; a per-clientsubname override file
//! `settings_<sub>.toml` takes precedence when present. Missing files fall
//! back to defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerSettings {
    /// Compute file hashes during indexing so unchanged content can be
    /// skipped by the server.
    pub calculate_filehashes_on_client: bool,

    /// Hash every emitted file a second time for end-to-end verification
    /// (`sha256_verify` extra).
    pub end_to_end_file_backup_verification: bool,

    /// Emit symlinks as entries with `sym_target` extras and close
    /// directories with `u` instead of `d".."`.
    pub with_proper_symlinks: bool,

    /// Emit `orig_path`/`orig_sep` extras on root entries.
    pub with_orig_path: bool,

    /// Emit `sequence_next`/`sequence_id` extras when the platform exposes
    /// a journal sequence.
    pub with_sequence: bool,

    /// Exclude patterns, `;`-separated.
    pub exclude_files: String,

    /// Include patterns, `;`-separated. Empty means include everything.
    pub include_files: String,

    /// Volumes with change block tracking enabled.
    pub cbt_volumes: Vec<String>,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            calculate_filehashes_on_client: true,
            end_to_end_file_backup_verification: false,
            with_proper_symlinks: true,
            with_orig_path: false,
            with_sequence: true,
            exclude_files: String::new(),
            include_files: String::new(),
            cbt_volumes: Vec::new(),
        }
    }
}

impl IndexerSettings {
    /// Load settings for a clientsubname, falling back to the shared file
    /// and then to defaults.
    pub fn load(data_dir: &Path, clientsubname: &str) -> Result<Self> {
        let mut candidates = Vec::new();
        if !clientsubname.is_empty() {
            candidates.push(data_dir.join(format!("settings_{}.toml", clientsubname)));
        }
        candidates.push(data_dir.join("settings.toml"));

        for path in candidates {
            if path.exists() {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                return toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse {}", path.display()));
            }
        }

        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() -> Result<()> {
        let dir = TempDir::new()?;
        let settings = IndexerSettings::load(dir.path(), "")?;
        assert!(settings.calculate_filehashes_on_client);
        assert!(settings.with_proper_symlinks);
        assert!(settings.include_files.is_empty());
        Ok(())
    }

    #[test]
    fn test_subname_override_wins() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(
            dir.path().join("settings.toml"),
            "exclude_files = \"*.tmp\"\n",
        )?;
        std::fs::write(
            dir.path().join("settings_web.toml"),
            "exclude_files = \"*.log\"\n",
        )?;

        assert_eq!(
            IndexerSettings::load(dir.path(), "")?.exclude_files,
            "*.tmp"
        );
        assert_eq!(
            IndexerSettings::load(dir.path(), "web")?.exclude_files,
            "*.log"
        );
        Ok(())
    }
}
