//! Controller message loop
//!
//! A single-consumer queue: one control record is processed to completion
//! before the next is dequeued. Replies are UTF-8 words (`done`,
//! `done-<id>-<path>[|<siblings>]`, `no backup dirs`, `failed`, `in use`,
//! `error - <text>`) sent on the per-message channel.

use crate::context::{IndexerContext, LogLevel};
use crate::emitter::{FileListWriter, KeepCursor};
use crate::filter::{parse_exclude_patterns, parse_include_patterns};
use crate::hooks;
use crate::message::ControlRecord;
use crate::settings::IndexerSettings;
use crate::snapshot::{ScKey, SnapshotManager};
use crate::tokens;
use crate::walker::{WalkRoot, Walker};
use crate::{DRAIN_POLL, RELEASE_DRAIN_TIMEOUT, SNAPSHOT_TIMEOUT_SECS};
use anyhow::Result;
use dao::flags;
use snapdex_core::fsutil::{now_secs, remove_trailing_sep};
use snapdex_core::hash::HashAlgo;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// A control record plus its reply channel. The channel is unbounded so a
/// reply can never block the controller.
pub struct ControllerMessage {
    pub record: ControlRecord,
    pub reply: mpsc::UnboundedSender<String>,
}

#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerMessage>,
}

impl ControllerHandle {
    /// Queue a record; the returned receiver yields the reply word(s).
    pub async fn send(&self, record: ControlRecord) -> mpsc::UnboundedReceiver<String> {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let _ = self
            .tx
            .send(ControllerMessage {
                record,
                reply: reply_tx,
            })
            .await;
        reply_rx
    }

    /// Queue a raw wire record.
    pub async fn send_raw(&self, data: &[u8]) -> Result<mpsc::UnboundedReceiver<String>> {
        let record = ControlRecord::parse(data)?;
        Ok(self.send(record).await)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum IndexOutcome {
    Done,
    IndexError,
    Stopped,
}

pub struct Controller {
    ctx: Arc<IndexerContext>,
    rx: mpsc::Receiver<ControllerMessage>,
    snapmgr: SnapshotManager,
    /// Last activity per server token, for snapshot reuse decisions.
    token_times: HashMap<String, i64>,
    /// Kind of the previous indexing run (`full`, `vfull`, `incr`).
    last_index: String,
    last_index_finished: bool,
}

impl Controller {
    pub fn new(ctx: Arc<IndexerContext>) -> (ControllerHandle, Self) {
        let (tx, rx) = mpsc::channel(64);

        let last_index = ctx
            .dao
            .misc_get("last_index")
            .ok()
            .flatten()
            .unwrap_or_default();
        let last_index_finished = ctx
            .dao
            .misc_get("last_index_finished")
            .ok()
            .flatten()
            .as_deref()
            == Some("1");

        (
            ControllerHandle { tx },
            Self {
                ctx,
                rx,
                snapmgr: SnapshotManager::new(),
                token_times: HashMap::new(),
                last_index,
                last_index_finished,
            },
        )
    }

    /// Run until a `Stop` record arrives.
    pub async fn run(mut self) -> Result<()> {
        let ctx = self.ctx.clone();

        if let Err(e) = self.snapmgr.startup_cleanup(&ctx) {
            ctx.log
                .log(LogLevel::Error, format!("Snapshot cleanup at startup failed: {}", e));
        }

        let cbt_volumes = ctx.settings.read().cbt_volumes.clone();
        if let Err(e) = ctx.cbt.update_enabled(&cbt_volumes) {
            ctx.log
                .log(LogLevel::Error, format!("Updating CBT volumes failed: {}", e));
        }

        tracing::info!("Indexer controller started");

        while let Some(message) = self.rx.recv().await {
            let stop = matches!(message.record, ControlRecord::Stop);
            self.handle(message).await;
            if stop {
                break;
            }
        }

        tracing::info!("Indexer controller stopped");
        Ok(())
    }

    async fn handle(&mut self, message: ControllerMessage) {
        let reply = message.reply.clone();
        let result = self.dispatch(message).await;

        if let Err(e) = result {
            self.ctx
                .log
                .log(LogLevel::Error, format!("Action failed: {:#}", e));
            let _ = reply.send(format!("error - {}", e));
        }
    }

    async fn dispatch(&mut self, message: ControllerMessage) -> Result<()> {
        let reply = message.reply;

        match message.record {
            ControlRecord::StartFileBackup {
                full,
                start_token,
                group,
                flags: _,
                clientsubname,
                sha_version,
                running_jobs,
                async_index: _,
                async_ticket: _,
            } => {
                self.token_times.insert(start_token.clone(), now_secs());
                self.ctx.log.clear();
                self.ctx.clear_stop();

                match IndexerSettings::load(&self.ctx.data_dir, &clientsubname) {
                    Ok(settings) => *self.ctx.settings.write() = settings,
                    Err(e) => self
                        .ctx
                        .log
                        .log(LogLevel::Warn, format!("Failed to load settings: {}", e)),
                }

                // A full after an unfinished full runs as a virtual-full
                // incremental: walk incrementally, emit everything.
                let unfinished_full = matches!(self.last_index.as_str(), "full" | "vfull")
                    && !self.last_index_finished;
                let incremental = !full || unfinished_full;
                if full && unfinished_full {
                    self.ctx.log.log(
                        LogLevel::Info,
                        "Last full index unfinished. Performing incremental (virtual full) indexing...",
                    );
                }

                let has_dirs = self
                    .ctx
                    .dao
                    .backup_dirs()?
                    .iter()
                    .any(|r| r.group == group);
                if !has_dirs {
                    let _ = reply.send("no backup dirs".to_string());
                    return Ok(());
                }

                if !incremental {
                    self.ctx.log.log(
                        LogLevel::Info,
                        "Deleting files... doing full index...".to_string(),
                    );
                    self.ctx.dao.clear_files(group + 1)?;
                    self.ctx.dao.delete_saved_changed_dirs()?;
                    self.ctx.dao.reset_all_hardlinks()?;
                }

                let rc = hooks::execute_hook(
                    &self.ctx.data_dir,
                    hooks::PRE_FILE_BACKUP,
                    incremental,
                    &start_token,
                    group,
                )?;
                if rc != 0 {
                    let _ = reply.send(format!(
                        "error - prefilebackup script failed with error code {}",
                        rc
                    ));
                    return Ok(());
                }

                self.set_last_index(if !full {
                    "incr"
                } else if incremental {
                    "vfull"
                } else {
                    "full"
                })?;

                let hash_algo =
                    HashAlgo::from_wire(sha_version).unwrap_or(HashAlgo::TreeHash);

                let outcome = self.index_dirs(
                    !incremental,
                    group,
                    &start_token,
                    &clientsubname,
                    hash_algo,
                    running_jobs > 1,
                )?;

                let rc = hooks::execute_hook(
                    &self.ctx.data_dir,
                    hooks::POST_FILE_INDEX,
                    incremental,
                    &start_token,
                    group,
                )?;
                if rc != 0 {
                    let _ = reply.send(format!(
                        "error - postfileindex script failed with error code {}",
                        rc
                    ));
                    return Ok(());
                }

                match outcome {
                    IndexOutcome::Stopped => {
                        let _ = reply.send("error - stopped indexing".to_string());
                    }
                    IndexOutcome::IndexError => {
                        let _ = reply.send("error - index error".to_string());
                    }
                    IndexOutcome::Done => {
                        self.mark_last_index_finished()?;
                        let _ = reply.send("done".to_string());
                    }
                }
                Ok(())
            }

            ControlRecord::Shadowcopy {
                reference,
                logical_dir,
                start_token,
                image_backup,
                fileserv,
                clientsubname,
                running_jobs,
            } => {
                self.token_times.insert(start_token.clone(), now_secs());
                self.ctx.log.clear();

                let for_image = image_backup != 0;
                if for_image {
                    let rc = hooks::execute_hook(
                        &self.ctx.data_dir,
                        hooks::PRE_IMAGE_BACKUP,
                        image_backup == 2,
                        &start_token,
                        0,
                    )?;
                    if rc != 0 {
                        self.ctx.log.log(
                            LogLevel::Error,
                            format!("Pre image backup hook failed with error code {}", rc),
                        );
                        let _ = reply.send("failed".to_string());
                        return Ok(());
                    }
                }

                let key = ScKey {
                    start_token: start_token.clone(),
                    clientsubname: clientsubname.clone(),
                    for_imagebackup: for_image,
                };

                let ctx = self.ctx.clone();
                let running_recent = {
                    let scd = self.snapmgr.get_scdir(&key, &logical_dir);
                    scd.running && now_secs() - scd.start_time < SNAPSHOT_TIMEOUT_SECS
                };

                if running_recent {
                    if !for_image {
                        let handle = self
                            .snapmgr
                            .scdir(&key, &logical_dir)
                            .and_then(|s| s.ref_handle);
                        if let Some(h) = handle {
                            if let Some(r) = self.snapmgr.snapshot_ref_mut(h) {
                                r.dontincrement = true;
                            }
                        }
                    }
                } else {
                    let was_running = self.snapmgr.scdir(&key, &logical_dir).map(|s| s.running)
                        == Some(true);
                    if was_running {
                        ctx.log.log(
                            LogLevel::Warn,
                            format!(
                                "Removing snapshot \"{}\" because of timeout...",
                                logical_dir
                            ),
                        );
                        self.snapmgr.release(
                            &ctx,
                            &key,
                            &logical_dir,
                            false,
                            -1,
                            Some((key.clone(), logical_dir.clone())),
                        )?;
                    }

                    let target = if fileserv {
                        let shared = ctx.fileserv.share_path(&logical_dir);
                        if shared.is_empty() {
                            self.root_path_for(&logical_dir)?
                        } else {
                            shared
                        }
                    } else {
                        self.root_path_for(&logical_dir)?
                    };

                    let scd = self.snapmgr.get_scdir(&key, &logical_dir);
                    scd.dir = logical_dir.clone();
                    scd.start_time = now_secs();
                    scd.fileserv = fileserv;
                    scd.target = remove_trailing_sep(&target).to_string();
                    scd.orig_target = scd.target.clone();
                }

                let outcome = self.snapmgr.start(
                    &ctx,
                    &key,
                    &logical_dir,
                    false,
                    for_image,
                    running_jobs > 1,
                    for_image,
                    &[],
                    &self.token_times,
                )?;
                // `reference` requests only differ in reuse preference; both
                // create when nothing is reusable.
                let _ = reference;

                if !outcome.ok {
                    let orig = self
                        .snapmgr
                        .scdir(&key, &logical_dir)
                        .map(|s| s.orig_target.clone())
                        .unwrap_or_default();
                    self.disable_cbt_for(&orig);
                    ctx.log.log(
                        LogLevel::Error,
                        format!("Getting snapshot of \"{}\" failed.", logical_dir),
                    );
                    let _ = reply.send("failed".to_string());
                    return Ok(());
                }

                let handle = outcome.handle.unwrap();

                if !outcome.onlyref {
                    self.finish_cbt_for_set(handle, for_image);
                }

                let (save_id, target, cbt_ok, orig_target) = {
                    let scd = self.snapmgr.scdir(&key, &logical_dir).unwrap();
                    let r = self.snapmgr.snapshot_ref(handle).unwrap();
                    (r.save_id, scd.target.clone(), r.cbt, scd.orig_target.clone())
                };

                if !cbt_ok {
                    self.disable_cbt_for(&orig_target);
                }

                if fileserv {
                    ctx.fileserv.share_dir(&start_token, &logical_dir, &target);
                }

                let siblings = self.snapmgr.sibling_info(handle);
                self.snapmgr.get_scdir(&key, &logical_dir).running = true;

                let _ = reply.send(format!("done-{}-{}{}", save_id, target, siblings));
                Ok(())
            }

            ControlRecord::ReleaseShadowcopy {
                logical_dir,
                start_token,
                image_backup,
                save_id,
                clientsubname,
                issues,
            } => {
                self.token_times.insert(start_token.clone(), now_secs());
                self.ctx.log.clear();

                if issues > 0 {
                    self.ctx.log.log(
                        LogLevel::Warn,
                        format!("Backup of \"{}\" reported {} issues", logical_dir, issues),
                    );
                }

                // Wait for in-flight file-server transfers to drain.
                let start = Instant::now();
                while self
                    .ctx
                    .fileserv
                    .has_active_transfers(&logical_dir, &start_token)
                    && start.elapsed() < RELEASE_DRAIN_TIMEOUT
                {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
                if self
                    .ctx
                    .fileserv
                    .has_active_transfers(&logical_dir, &start_token)
                {
                    let _ = reply.send("in use".to_string());
                    return Ok(());
                }

                let key = ScKey {
                    start_token: start_token.clone(),
                    clientsubname,
                    for_imagebackup: image_backup != 0,
                };

                let ctx = self.ctx.clone();
                let known = self.snapmgr.scdir(&key, &logical_dir).is_some();
                let ok = if known {
                    self.snapmgr
                        .release(&ctx, &key, &logical_dir, image_backup != 0, save_id, None)?
                } else {
                    // Snapshot from a previous process lifetime: adjust the
                    // persisted refcount and let saved-state cleanup reclaim.
                    if image_backup != 0 && save_id != -1 {
                        ctx.dao.mod_shadowcopy_refcount(save_id, -1)?;
                    }
                    self.snapmgr.cleanup_saved(&ctx, false, &start_token)?
                };

                let _ = reply.send(if ok { "done" } else { "failed" }.to_string());
                Ok(())
            }

            ControlRecord::LookupShadowcopy { save_id } => {
                match self.snapmgr.lookup(&self.ctx, save_id)? {
                    Some(path) => {
                        let _ = reply.send(format!("done-{}-{}", save_id, path));
                    }
                    None => {
                        let _ = reply.send("failed".to_string());
                    }
                }
                Ok(())
            }

            ControlRecord::PingShadowcopy {
                logical_dir,
                start_token,
                image_backup,
                clientsubname,
            } => {
                self.token_times.insert(start_token.clone(), now_secs());
                let key = ScKey {
                    start_token,
                    clientsubname,
                    for_imagebackup: image_backup != 0,
                };
                let ctx = self.ctx.clone();
                let ok = self.snapmgr.ping(&ctx, &key, &logical_dir)?;
                let _ = reply.send(if ok { "done" } else { "failed" }.to_string());
                Ok(())
            }

            ControlRecord::UpdateCbt => {
                let volumes = self.ctx.settings.read().cbt_volumes.clone();
                self.ctx.cbt.update_enabled(&volumes)?;
                let _ = reply.send("done".to_string());
                Ok(())
            }

            ControlRecord::SnapshotCbt { volume } => {
                match self.ctx.cbt.snapshot_cbt(&volume) {
                    Ok(()) => {
                        let _ = reply.send("done".to_string());
                    }
                    Err(e) => {
                        self.ctx
                            .log
                            .log(LogLevel::Error, format!("Snapshotting CBT failed: {}", e));
                        let _ = reply.send("failed".to_string());
                    }
                }
                Ok(())
            }

            ControlRecord::GetLog => {
                let _ = reply.send(self.ctx.log.render());
                Ok(())
            }

            ControlRecord::Stop => {
                self.ctx.request_stop();
                let _ = reply.send("done".to_string());
                Ok(())
            }
        }
    }

    fn set_last_index(&mut self, kind: &str) -> Result<()> {
        self.last_index = kind.to_string();
        self.last_index_finished = false;
        self.ctx.dao.misc_set("last_index", kind)?;
        self.ctx.dao.misc_set("last_index_finished", "0")?;
        Ok(())
    }

    fn mark_last_index_finished(&mut self) -> Result<()> {
        self.last_index_finished = true;
        self.ctx.dao.misc_set("last_index_finished", "1")?;
        Ok(())
    }

    fn root_path_for(&self, logical_dir: &str) -> Result<String> {
        let roots = self.ctx.dao.backup_dirs()?;
        Ok(roots
            .into_iter()
            .find(|r| r.tname == logical_dir)
            .map(|r| r.path)
            .unwrap_or_else(|| logical_dir.to_string()))
    }

    fn disable_cbt_for(&self, path: &str) {
        if path.is_empty() {
            return;
        }
        let volume = self
            .ctx
            .platform
            .folder_mount(path)
            .unwrap_or_else(|| "/".to_string());
        if let Err(e) = self.ctx.cbt.disable(&volume) {
            self.ctx.log.log(
                LogLevel::Error,
                format!("Error disabling change block tracking for {}: {}", path, e),
            );
        }
    }

    /// Finalize CBT for every volume of a freshly created snapshot set.
    fn finish_cbt_for_set(&mut self, handle: usize, for_image: bool) {
        let ssetid = match self.snapmgr.snapshot_ref(handle) {
            Some(r) => r.ssetid,
            None => return,
        };

        for h in self.snapmgr.refs_in_set(ssetid) {
            let (cbt, target, volpath, save_id) = match self.snapmgr.snapshot_ref(h) {
                Some(r) => (r.cbt, r.target.clone(), r.volpath.clone(), r.save_id),
                None => continue,
            };
            if !cbt {
                continue;
            }

            let shadow_id = if for_image { save_id as i32 } else { -1 };
            let ok = self
                .ctx
                .cbt
                .finish(&target, shadow_id, Some(&volpath), for_image)
                .is_ok();
            if let Some(r) = self.snapmgr.snapshot_ref_mut(h) {
                r.cbt = ok;
            }
        }
    }

    /// Walk every root of `group`, emitting the new file list.
    fn index_dirs(
        &mut self,
        full: bool,
        group: i32,
        start_token: &str,
        clientsubname: &str,
        hash_algo: HashAlgo,
        simultaneous_other: bool,
    ) -> Result<IndexOutcome> {
        let ctx = self.ctx.clone();

        let (exclude, include, proper_symlinks) = {
            let settings = ctx.settings.read();
            (
                parse_exclude_patterns(&settings.exclude_files),
                parse_include_patterns(&settings.include_files),
                settings.with_proper_symlinks,
            )
        };

        if let Err(e) = tokens::write_token_file(&ctx.dao, ctx.tokens.as_ref(), &ctx.data_dir, start_token)
        {
            ctx.log
                .log(LogLevel::Warn, format!("Writing token file failed: {}", e));
        }

        let mut roots = ctx.dao.backup_dirs()?;
        for root in roots.iter_mut() {
            root.symlinked_confirmed = false;
        }

        let follow_last = !full
            && roots.iter().any(|r| {
                r.group == group && r.has_flag(flags::KEEP_FILES) && !r.reset_keep
            });

        // Freeze the watcher and pull the changed/open sets.
        let mut open_files = Vec::new();
        {
            let mut source = ctx.change_source.lock();
            source.freeze();
            if let Err(e) = source.update_and_wait(&ctx.dao, &mut open_files) {
                ctx.log
                    .log(LogLevel::Warn, format!("Updating change set failed: {}", e));
            }
        }

        let mut changed_dirs = Vec::new();
        for root in roots.iter().filter(|r| r.group == group) {
            let prefix = snapdex_core::fsutil::add_trailing_sep(remove_trailing_sep(&root.path));
            changed_dirs.extend(ctx.dao.changed_dirs(&prefix, true)?);

            for deleted in ctx.dao.del_dirs(&prefix, true)? {
                ctx.log.log(
                    LogLevel::Debug,
                    format!("Removing deleted directory {} from index", deleted),
                );
                ctx.dao.remove_deleted_dir(&deleted, root.db_tgroup())?;
            }
        }
        changed_dirs.sort();
        changed_dirs.dedup();
        open_files.sort();

        for dir in &changed_dirs {
            ctx.log
                .log(LogLevel::Debug, format!("Changed dir: {}", dir));
        }

        let dest_name = if group == dao::groups::DEFAULT {
            "filelist.ub".to_string()
        } else {
            format!("filelist_{}.ub", group)
        };
        let dest_path = ctx.data_dir.join(&dest_name);
        let stage_path = ctx.data_dir.join(format!("filelist_new_{}.ub", group));

        let cursor = if follow_last {
            KeepCursor::open(&dest_path, proper_symlinks)?
        } else {
            KeepCursor::disabled()
        };

        let mut out = FileListWriter::create(&stage_path)?;

        let mut walker = Walker::new(&ctx, roots, cursor, hash_algo);
        walker.changed_dirs = changed_dirs;
        walker.open_files = open_files;
        walker.exclude = exclude;
        walker.include = include;

        let key = ScKey {
            start_token: start_token.to_string(),
            clientsubname: clientsubname.to_string(),
            for_imagebackup: false,
        };

        let mut has_stale = false;
        let mut past_refs: Vec<usize> = Vec::new();

        let mut i = 0;
        while i < walker.roots.len() {
            let root = walker.roots[i].clone();
            if root.group != group || (root.symlinked && !root.symlinked_confirmed) {
                i += 1;
                continue;
            }

            let root_path = remove_trailing_sep(&root.path).to_string();
            {
                let scd = self.snapmgr.get_scdir(&key, &root.tname);
                if !scd.running {
                    scd.dir = root.tname.clone();
                    scd.start_time = now_secs();
                    scd.target = root_path.clone();
                    scd.orig_target = root_path.clone();
                }
                scd.fileserv = true;
            }

            let snapshot_optional = root.has_flag(flags::OPTIONAL)
                || (root.symlinked && root.has_flag(flags::SYMLINKS_OPTIONAL));
            let root_accessible = Path::new(&root_path).exists();

            let mut mod_path = root_path.clone();
            let mut snapshot_ok = false;

            if root_accessible || !snapshot_optional {
                ctx.log.log(
                    LogLevel::Debug,
                    format!("Creating snapshot of \"{}\"...", root.tname),
                );
                let outcome = self.snapmgr.start(
                    &ctx,
                    &key,
                    &root.tname,
                    false,
                    true,
                    simultaneous_other,
                    false,
                    &past_refs,
                    &self.token_times,
                )?;
                snapshot_ok = outcome.ok;
                if outcome.stale {
                    has_stale = true;
                }

                if snapshot_ok {
                    let handle = outcome.handle.unwrap();
                    if !outcome.onlyref {
                        past_refs.push(handle);
                        self.finish_cbt_for_set(handle, false);
                    }

                    let scd = self.snapmgr.get_scdir(&key, &root.tname);
                    scd.running = true;
                    mod_path = scd.target.clone();
                }
            } else {
                ctx.log.log(
                    LogLevel::Debug,
                    format!(
                        "Cannot access \"{}\". Not creating snapshot.",
                        root_path
                    ),
                );
            }

            if !snapshot_ok {
                if root.has_flag(flags::REQUIRE_SNAPSHOT) {
                    ctx.log.log(
                        LogLevel::Error,
                        format!("Creating snapshot of \"{}\" failed.", root.tname),
                    );
                    walker.index_error = true;
                } else {
                    ctx.log.log(
                        LogLevel::Info,
                        format!("Backing up \"{}\" without snapshot.", root.tname),
                    );
                    ctx.fileserv.share_dir(start_token, &root.tname, &root_path);
                }
                self.disable_cbt_for(&root_path);
            } else {
                let cbt_ok = self
                    .snapmgr
                    .scdir(&key, &root.tname)
                    .and_then(|s| s.ref_handle)
                    .and_then(|h| self.snapmgr.snapshot_ref(h))
                    .map(|r| r.cbt)
                    .unwrap_or(false);
                if !cbt_ok {
                    self.disable_cbt_for(&root_path);
                }
            }

            if !walker.index_error && !ctx.stop_requested() {
                let volume = ctx
                    .platform
                    .folder_mount(&root_path)
                    .unwrap_or_else(|| "/".to_string());

                walker.cursor.keep_files =
                    root.has_flag(flags::KEEP_FILES) && !root.reset_keep && follow_last;

                let params = WalkRoot {
                    root_index: i,
                    volume,
                    mod_path,
                    flags: root.flags,
                    use_db: !full,
                    tgroup: root.db_tgroup(),
                };

                ctx.log
                    .log(LogLevel::Debug, format!("Indexing \"{}\"...", root.tname));
                walker.walk_root(&mut out, &params)?;
                walker.commit()?;
            }

            if ctx.stop_requested() || walker.index_error {
                for r in walker.roots.clone() {
                    if r.group == group {
                        self.snapmgr.release(&ctx, &key, &r.tname, false, -1, None)?;
                    }
                }
                out.discard()?;
                ctx.change_source.lock().unfreeze();

                if ctx.stop_requested() {
                    ctx.log
                        .log(LogLevel::Error, "Indexing files failed, because it was stopped");
                    return Ok(IndexOutcome::Stopped);
                }
                return Ok(IndexOutcome::IndexError);
            }

            if !root.symlinked {
                ctx.log.log(
                    LogLevel::Info,
                    format!(
                        "Indexing of \"{}\" done. {} filesystem lookups {} db lookups and {} db updates",
                        root.tname, walker.c_fs, walker.c_db, walker.c_db_update
                    ),
                );
            }

            i += 1;
        }

        // Carry forward whatever the previous list still holds past the
        // last new entry.
        walker
            .cursor
            .add_from_last_upto(&mut out, "", false, 0, true)?;

        walker.commit()?;

        let stage = out.finish()?;
        {
            let _guard = ctx.filelist_mutex.lock();
            std::fs::rename(&stage, &dest_path)?;
        }

        if !has_stale {
            ctx.log
                .log(LogLevel::Debug, "Deleting backup of changed dirs...");
            ctx.dao.delete_saved_changed_dirs()?;
            if group == dao::groups::DEFAULT {
                ctx.dao.misc_set(
                    "last_filebackup_filetime_lower",
                    &snapdex_core::fsutil::now_ms().to_string(),
                )?;
            }
        } else {
            ctx.log.log(
                LogLevel::Info,
                "Did not delete backup of changed dirs because a stale snapshot was used.",
            );
        }

        ctx.change_source.lock().unfreeze();

        // Clear one-shot keep resets and drop unconfirmed symlinked roots.
        for root in walker.roots.iter() {
            if root.group != group {
                continue;
            }
            if root.reset_keep {
                ctx.dao.set_reset_keep(root.id, false)?;
            }
            if root.symlinked && !root.symlinked_confirmed {
                ctx.dao.del_backup_dir(root.id)?;
            }
        }

        for root in walker.roots.iter() {
            if root.group != group || (root.symlinked && !root.symlinked_confirmed) {
                continue;
            }
            for error in ctx.take_read_errors(&root.tname) {
                ctx.log.log(
                    LogLevel::Warn,
                    format!(
                        "Error reading from file {} at position {}: {}",
                        error.file_path, error.file_pos, error.message
                    ),
                );
            }
        }

        Ok(IndexOutcome::Done)
    }
}
