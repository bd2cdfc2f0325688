//! Shared indexer state
//!
//! Everything the original kept in global singletons lives in one
//! [`IndexerContext`] handed to every operation, so tests construct one per
//! case. Only the controller mutates snapshot and backup-dir state; other
//! threads enter exclusively through [`IndexerContext::on_read_error`].

use crate::fileserv::FileServ;
use crate::platform::Platform;
use crate::settings::IndexerSettings;
use crate::snapshot::SnapshotBackend;
use crate::tokens::AccessTokenSource;
use cbt::CbtEngine;
use dao::ClientDao;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use watcher::ChangeSource;

const MAX_READ_ERRORS: usize = 1000;
const MAX_LOG_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_digit(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

/// In-memory job log, consumable via the `GetLog` action.
#[derive(Default)]
pub struct JobLog {
    lines: Mutex<Vec<(i64, LogLevel, String)>>,
}

impl JobLog {
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }

        let mut lines = self.lines.lock();
        if lines.len() < MAX_LOG_LINES {
            lines.push((snapdex_core::fsutil::now_secs(), level, message));
        }
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    /// Render as `timestamp-level-message` lines.
    pub fn render(&self) -> String {
        let lines = self.lines.lock();
        let mut out = String::new();
        for (ts, level, message) in lines.iter() {
            out.push_str(&format!("{}-{}-{}\n", ts, level.as_digit(), message));
        }
        out
    }

    pub fn has_errors(&self) -> bool {
        self.lines
            .lock()
            .iter()
            .any(|(_, level, _)| *level == LogLevel::Error)
    }
}

/// A read failure posted by a file-server thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    pub share_name: String,
    pub file_path: String,
    pub file_pos: i64,
    pub message: String,
}

pub struct IndexerContext {
    pub dao: ClientDao,
    pub change_source: Mutex<Box<dyn ChangeSource>>,
    pub snapshots: Arc<dyn SnapshotBackend>,
    pub cbt: CbtEngine,
    pub platform: Arc<dyn Platform>,
    pub fileserv: Arc<dyn FileServ>,
    pub tokens: Arc<dyn AccessTokenSource>,
    pub settings: RwLock<IndexerSettings>,
    pub log: JobLog,
    pub data_dir: PathBuf,

    /// Serializes publication of the output file list.
    pub filelist_mutex: Mutex<()>,

    read_errors: Mutex<Vec<ReadError>>,
    stop_index: AtomicBool,
}

impl IndexerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dao: ClientDao,
        change_source: Box<dyn ChangeSource>,
        snapshots: Arc<dyn SnapshotBackend>,
        cbt: CbtEngine,
        platform: Arc<dyn Platform>,
        fileserv: Arc<dyn FileServ>,
        tokens: Arc<dyn AccessTokenSource>,
        data_dir: &Path,
    ) -> Self {
        let settings = IndexerSettings::load(data_dir, "").unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            IndexerSettings::default()
        });

        Self {
            dao,
            change_source: Mutex::new(change_source),
            snapshots,
            cbt,
            platform,
            fileserv,
            tokens,
            settings: RwLock::new(settings),
            log: JobLog::default(),
            data_dir: data_dir.to_path_buf(),
            filelist_mutex: Mutex::new(()),
            read_errors: Mutex::new(Vec::new()),
            stop_index: AtomicBool::new(false),
        }
    }

    /// Entry point for file-server threads reporting read failures.
    pub fn on_read_error(&self, share_name: &str, file_path: &str, file_pos: i64, message: &str) {
        let error = ReadError {
            share_name: share_name.to_string(),
            file_path: file_path.to_string(),
            file_pos,
            message: message.to_string(),
        };

        let mut errors = self.read_errors.lock();
        if errors.len() < MAX_READ_ERRORS && !errors.contains(&error) {
            errors.push(error);
        }
    }

    /// Take the read errors recorded for a share.
    pub fn take_read_errors(&self, share_name: &str) -> Vec<ReadError> {
        let mut errors = self.read_errors.lock();
        let (matching, rest): (Vec<_>, Vec<_>) = errors
            .drain(..)
            .partition(|e| e.share_name == share_name);
        *errors = rest;
        matching
    }

    pub fn request_stop(&self) {
        self.stop_index.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.stop_index.store(false, Ordering::SeqCst);
    }

    /// Polled at directory boundaries by the walker.
    pub fn stop_requested(&self) -> bool {
        self.stop_index.load(Ordering::SeqCst)
    }
}
