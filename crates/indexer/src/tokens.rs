//! Access token files
//!
//! Before every indexing run a properties file
//! `<data_dir>/tokens/tokens_<start_token>.properties` is written for the
//! requesting server, enumerating user ids and group memberships plus an
//! `access_key` that rotates every 7 days (the previous key is retained for
//! one rotation as `last.access_key`).

use crate::ACCESS_KEY_ROTATE_SECS;
use anyhow::Result;
use dao::ClientDao;
use snapdex_core::fsutil::{atomic_write, now_secs};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Source of local identity information written into token files.
pub trait AccessTokenSource: Send + Sync {
    fn users(&self) -> Vec<String>;
    fn groups(&self) -> Vec<String>;
    fn groups_of(&self, user: &str) -> Vec<String>;
}

/// Token source for deployments without OS account integration.
pub struct NullTokenSource;

impl AccessTokenSource for NullTokenSource {
    fn users(&self) -> Vec<String> {
        Vec::new()
    }

    fn groups(&self) -> Vec<String> {
        Vec::new()
    }

    fn groups_of(&self, _user: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Current access key, rotating it when due. The previous key stays
/// readable under `last.key.<token>`.
fn current_access_key(dao: &ClientDao, start_token: &str) -> Result<(String, Option<String>)> {
    let key_name = format!("key.{}", start_token);
    let age_name = format!("key_age.{}", start_token);
    let last_name = format!("last.key.{}", start_token);

    let now = now_secs();
    let existing = dao.misc_get(&key_name)?;
    let age: i64 = dao
        .misc_get(&age_name)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    match existing {
        Some(key) if now - age < ACCESS_KEY_ROTATE_SECS => {
            Ok((key, dao.misc_get(&last_name)?))
        }
        existing => {
            let new_key = Uuid::new_v4().simple().to_string();
            if let Some(old) = &existing {
                dao.misc_set(&last_name, old)?;
            }
            dao.misc_set(&key_name, &new_key)?;
            dao.misc_set(&age_name, &now.to_string())?;
            Ok((new_key, existing))
        }
    }
}

/// Write the token file for a server; returns its path.
pub fn write_token_file(
    dao: &ClientDao,
    source: &dyn AccessTokenSource,
    data_dir: &Path,
    start_token: &str,
) -> Result<PathBuf> {
    let (access_key, last_key) = current_access_key(dao, start_token)?;

    let mut content = String::new();
    let users = source.users();
    content.push_str(&format!("users={}\n", users.join(";")));
    for user in &users {
        content.push_str(&format!(
            "user.{}.groups={}\n",
            user,
            source.groups_of(user).join(";")
        ));
    }
    content.push_str(&format!("groups={}\n", source.groups().join(";")));
    content.push_str(&format!("access_key={}\n", access_key));
    if let Some(last) = last_key {
        content.push_str(&format!("last.access_key={}\n", last));
    }

    let path = data_dir
        .join("tokens")
        .join(format!("tokens_{}.properties", start_token));
    atomic_write(&path, content.as_bytes())?;
    Ok(path)
}
