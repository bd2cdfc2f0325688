//! Notify-backed directory watcher
//!
//! Events stream from the platform watcher through a crossbeam channel.
//! Nothing touches the database until `update_and_wait` pulls the queue;
//! `freeze` additionally parks the optional background application done by
//! `poll_apply` so the set stays stable while a backup indexes.

use crate::ChangeSource;
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use dao::ClientDao;
use notify::event::{EventKind, RemoveKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use snapdex_core::fsutil::path_key;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    event_rx: Receiver<notify::Result<notify::Event>>,
    roots: Vec<PathBuf>,
    frozen: bool,
    /// Files seen in write-ish events since the last drain.
    open_candidates: BTreeSet<String>,
}

impl DirWatcher {
    /// Watch the given roots recursively.
    pub fn new(roots: &[PathBuf]) -> Result<Self> {
        let (tx, rx): (Sender<_>, Receiver<_>) = crossbeam_channel::unbounded();

        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })
        .context("Failed to create filesystem watcher")?;

        for root in roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", root.display()))?;
        }

        Ok(Self {
            _watcher: watcher,
            event_rx: rx,
            roots: roots.to_vec(),
            frozen: false,
            open_candidates: BTreeSet::new(),
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Apply queued events in the background between backups. No-op while
    /// frozen.
    pub fn poll_apply(&mut self, dao: &ClientDao) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        self.drain(dao)
    }

    fn drain(&mut self, dao: &ClientDao) -> Result<()> {
        while let Ok(event) = self.event_rx.try_recv() {
            let event = match event {
                Ok(ev) => ev,
                Err(e) => {
                    tracing::warn!("Watcher error: {}", e);
                    continue;
                }
            };

            self.apply_event(dao, &event)?;
        }
        Ok(())
    }

    fn apply_event(&mut self, dao: &ClientDao, event: &notify::Event) -> Result<()> {
        for path in &event.paths {
            let parent = match path.parent() {
                Some(p) => p,
                None => continue,
            };

            // The containing directory's listing changed.
            dao.add_changed_dir(&path_key(parent))?;

            match event.kind {
                EventKind::Remove(RemoveKind::Folder) => {
                    dao.add_del_dir(&path_key(path))?;
                }
                EventKind::Remove(_) => {
                    self.open_candidates.remove(&file_event_key(path));
                }
                EventKind::Create(_) | EventKind::Modify(_) => {
                    if !path.is_dir() {
                        self.open_candidates.insert(file_event_key(path));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Open-file key: parent cache key with the file name appended, matching
/// what the walker constructs when checking a listing entry.
fn file_event_key(path: &Path) -> String {
    let parent = path.parent().unwrap_or(Path::new("/"));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}{}", path_key(parent), name)
}

impl ChangeSource for DirWatcher {
    fn can_watch(&self) -> bool {
        true
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn unfreeze(&mut self) {
        self.frozen = false;
    }

    fn update_and_wait(&mut self, dao: &ClientDao, open_files: &mut Vec<String>) -> Result<()> {
        self.drain(dao)?;
        open_files.extend(std::mem::take(&mut self.open_candidates));
        open_files.sort();
        open_files.dedup();
        Ok(())
    }
}
