//! File-server plugin interface
//!
//! The real file server streams shared directories to the backup server on
//! its own threads; the indexer only needs to publish share mappings and
//! ask about in-flight transfers before releasing a snapshot.

use parking_lot::RwLock;
use std::collections::HashMap;

pub trait FileServ: Send + Sync {
    /// Whether transfers are still running for `(share_name, start_token)`.
    fn has_active_transfers(&self, share_name: &str, start_token: &str) -> bool;

    /// Publish or update a share mapping.
    fn share_dir(&self, token: &str, name: &str, path: &str);

    fn remove_dir(&self, token: &str, name: &str);

    /// Current path of a share, empty when unshared.
    fn share_path(&self, name: &str) -> String;
}

/// Standalone implementation holding only the share map; reports no active
/// transfers. Used when no file-server plugin is attached and by tests.
#[derive(Default)]
pub struct NullFileServ {
    shares: RwLock<HashMap<String, String>>,
}

impl NullFileServ {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileServ for NullFileServ {
    fn has_active_transfers(&self, _share_name: &str, _start_token: &str) -> bool {
        false
    }

    fn share_dir(&self, _token: &str, name: &str, path: &str) {
        self.shares
            .write()
            .insert(name.to_string(), path.to_string());
    }

    fn remove_dir(&self, _token: &str, name: &str) {
        self.shares.write().remove(name);
    }

    fn share_path(&self, name: &str) -> String {
        self.shares.read().get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_map() {
        let fs = NullFileServ::new();
        assert_eq!(fs.share_path("data"), "");

        fs.share_dir("tok", "data", "/mnt/snap/data");
        assert_eq!(fs.share_path("data"), "/mnt/snap/data");

        fs.remove_dir("tok", "data");
        assert_eq!(fs.share_path("data"), "");
        assert!(!fs.has_active_transfers("data", "tok"));
    }
}
