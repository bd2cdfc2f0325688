//! Hook script execution
//!
//! Scripts live under `<data_dir>/hooks/`; a missing script is a no-op, a
//! non-zero exit aborts the surrounding operation and is surfaced as an
//! error reply on the control pipe.

use anyhow::Result;
use std::path::Path;
use std::process::Command;

pub const PRE_FILE_BACKUP: &str = "prefilebackup";
pub const POST_FILE_INDEX: &str = "postfileindex";
pub const PRE_IMAGE_BACKUP: &str = "preimagebackup";

/// Run a hook synchronously. Returns the exit code (0 when the script does
/// not exist).
pub fn execute_hook(
    data_dir: &Path,
    name: &str,
    incremental: bool,
    server_token: &str,
    group: i32,
) -> Result<i32> {
    let script = data_dir.join("hooks").join(name);
    if !script.exists() {
        return Ok(0);
    }

    tracing::debug!("Running {} hook", name);

    let output = Command::new(&script)
        .arg(if incremental { "1" } else { "0" })
        .arg(server_token)
        .arg(group.to_string())
        .output()?;

    if !output.stdout.is_empty() {
        tracing::info!(
            "{} output: {}",
            name,
            String::from_utf8_lossy(&output.stdout).trim_end()
        );
    }
    if !output.stderr.is_empty() {
        tracing::warn!(
            "{} stderr: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }

    Ok(output.status.code().unwrap_or(-1))
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_hook(dir: &Path, name: &str, body: &str) {
        let hooks = dir.join("hooks");
        fs::create_dir_all(&hooks).unwrap();
        let path = hooks.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_missing_hook_is_ok() -> Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(execute_hook(dir.path(), PRE_FILE_BACKUP, true, "tok", 0)?, 0);
        Ok(())
    }

    #[test]
    fn test_hook_exit_codes() -> Result<()> {
        let dir = TempDir::new()?;
        write_hook(dir.path(), PRE_FILE_BACKUP, "exit 0");
        assert_eq!(execute_hook(dir.path(), PRE_FILE_BACKUP, true, "tok", 0)?, 0);

        write_hook(dir.path(), POST_FILE_INDEX, "exit 3");
        assert_eq!(execute_hook(dir.path(), POST_FILE_INDEX, false, "tok", 0)?, 3);
        Ok(())
    }
}
