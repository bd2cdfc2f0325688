//! Client-side backup indexer
//!
//! A single long-lived controller walks configured backup roots, produces a
//! deterministic file list for the server, manages reference-counted
//! filesystem snapshots, and keeps the auxiliary indexes (file cache,
//! hard-link graph, CBT bitmaps) coherent so incremental backups only look
//! at what changed.
//!
//! The embedding service feeds binary control records into the
//! [`Controller`] queue; replies are UTF-8 words on the per-message channel.

pub mod context;
pub mod controller;
pub mod emitter;
pub mod fileserv;
pub mod filter;
pub mod hooks;
pub mod lastlist;
pub mod message;
pub mod platform;
pub mod settings;
pub mod snapshot;
pub mod tokens;
pub mod walker;

pub use context::{IndexerContext, JobLog, LogLevel, ReadError};
pub use controller::{Controller, ControllerHandle};
pub use message::ControlRecord;
pub use settings::IndexerSettings;
pub use snapshot::{NullSnapshots, SnapshotBackend, SnapshotManager};

use std::time::Duration;

/// Hard snapshot lifetime; anything older is reclaimed.
pub const SNAPSHOT_TIMEOUT_SECS: i64 = 7 * 24 * 3600;

/// Age after which a snapshot used only by the requesting server is
/// restarted instead of reused.
pub const SNAPSHOT_RESTART_TIMEOUT_SECS: i64 = 55 * 60;

/// A start token with no activity for this long no longer pins a snapshot.
pub const TOKEN_IDLE_TIMEOUT_SECS: i64 = 10 * 60;

/// How long a release waits for in-flight file-server transfers to drain.
pub const RELEASE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval of bounded waits.
pub const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Access keys in token files rotate after this many seconds.
pub const ACCESS_KEY_ROTATE_SECS: i64 = 7 * 24 * 3600;

/// Grace period after which an async-index reply is dropped if the server
/// never collected it.
pub const ASYNC_INDEX_GRACE: Duration = Duration::from_secs(2 * 3600);
