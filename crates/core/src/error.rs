//! Fault taxonomy for indexing runs
//!
//! Faults classify what went wrong during a run; they are recorded in the
//! job log and folded into the single reply word sent back on the control
//! pipe. Plumbing-level errors stay `anyhow` at function boundaries.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexFault {
    /// Directory open/read failure; path is emitted with best-effort
    /// metadata and the root may still succeed.
    #[error("transient I/O error at {path}: {message}")]
    TransientIo { path: String, message: String },

    /// A non-optional backup root could not be accessed.
    #[error("cannot access path to backup: \"{path}\"")]
    RootMissing { path: String },

    /// Snapshot creation failed for a root that requires one.
    #[error("creating snapshot of \"{name}\" failed")]
    SnapshotFailure { name: String },

    /// CBT bitmap magic or checksum mismatch; CBT is disabled for the volume.
    #[error("change block tracking data for volume {volume} is corrupt")]
    CbtChecksum { volume: String },

    /// A hook script exited non-zero.
    #[error("{phase} script failed with error code {code}")]
    HookFailed { phase: String, code: i32 },

    /// A filesystem transaction was active while the snapshot was taken;
    /// the changed-dir backup table must be preserved.
    #[error("active filesystem transaction on volume {volume}")]
    ActiveTransaction { volume: String },

    /// Indexing was cancelled.
    #[error("stopped indexing")]
    Stopped,
}

impl IndexFault {
    /// Whether this fault fails the whole indexing run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            IndexFault::TransientIo { .. } | IndexFault::ActiveTransaction { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!IndexFault::TransientIo {
            path: "/a".to_string(),
            message: "eio".to_string()
        }
        .is_fatal());
        assert!(IndexFault::Stopped.is_fatal());
        assert!(IndexFault::RootMissing {
            path: "/gone".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_hook_message() {
        let f = IndexFault::HookFailed {
            phase: "prefilebackup".to_string(),
            code: 3,
        };
        assert_eq!(f.to_string(), "prefilebackup script failed with error code 3");
    }
}
