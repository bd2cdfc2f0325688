//! Snapshot manager
//!
//! Snapshots are owned by an arena of [`SnapshotRef`] nodes addressed by
//! integer handles; [`ScopedDir`] entries hold non-owning handles. A ref is
//! created when no existing snapshot matches the volume and token policy,
//! jointly owned by every scoped dir resolving through it, and destroyed
//! when its start-token multiset empties. Created snapshots are persisted so
//! a crash during a backup becomes a clean state on the next start.

use crate::context::{IndexerContext, LogLevel};
use crate::{SNAPSHOT_RESTART_TIMEOUT_SECS, SNAPSHOT_TIMEOUT_SECS, TOKEN_IDLE_TIMEOUT_SECS};
use anyhow::Result;
use dao::ShadowRow;
use snapdex_core::escape::escape_param;
use snapdex_core::fsutil::{now_ms, now_secs};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// Platform snapshot provider.
pub trait SnapshotBackend: Send + Sync {
    /// Take a snapshot of `volume` as part of set `ssetid`; returns the
    /// mount path exposing it.
    fn create(&self, ssetid: Uuid, volume: &str, logical_name: &str) -> Result<String>;

    fn remove(&self, ssetid: Uuid, volpath: &str, volume: &str) -> Result<()>;

    /// Whether snapshots appear as locally mounted filesystems.
    fn locally_mounted(&self) -> bool;

    /// Whether an existing snapshot mount is still usable.
    fn is_openable(&self, volpath: &str) -> bool {
        Path::new(volpath).exists()
    }
}

/// Backend for platforms without snapshot support; roots degrade to
/// non-snapshot backups (and fail if they carry `RequireSnapshot`).
pub struct NullSnapshots;

impl SnapshotBackend for NullSnapshots {
    fn create(&self, _ssetid: Uuid, volume: &str, _logical_name: &str) -> Result<String> {
        anyhow::bail!("snapshots are not configured for volume {}", volume)
    }

    fn remove(&self, _ssetid: Uuid, _volpath: &str, _volume: &str) -> Result<()> {
        Ok(())
    }

    fn locally_mounted(&self) -> bool {
        true
    }
}

/// One live snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRef {
    pub ssetid: Uuid,
    /// Path where the snapshot is mounted.
    pub volpath: String,
    /// Volume the snapshot was taken of.
    pub target: String,
    /// Multiset of server tokens currently using this snapshot.
    pub start_tokens: Vec<String>,
    pub start_time: i64,
    pub ok: bool,
    pub for_imagebackup: bool,
    pub clientsubname: String,
    pub cbt: bool,
    pub save_id: i64,
    /// Attach without appending the token once (re-reference of a running
    /// scoped dir).
    pub dontincrement: bool,
}

/// Key of the scoped-dir map: one namespace per server token, subclient and
/// backup kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScKey {
    pub start_token: String,
    pub clientsubname: String,
    pub for_imagebackup: bool,
}

/// A logical directory exposed to the server, possibly resolving through a
/// snapshot.
#[derive(Debug, Clone)]
pub struct ScopedDir {
    pub dir: String,
    /// Path currently exposed (snapshot path while a ref is attached).
    pub target: String,
    pub orig_target: String,
    pub ref_handle: Option<usize>,
    pub running: bool,
    pub fileserv: bool,
    pub start_time: i64,
}

impl ScopedDir {
    fn new(dir: &str) -> Self {
        Self {
            dir: dir.to_string(),
            target: String::new(),
            orig_target: String::new(),
            ref_handle: None,
            running: false,
            fileserv: false,
            start_time: 0,
        }
    }
}

/// Outcome of [`SnapshotManager::start`].
#[derive(Debug, Clone, Copy)]
pub struct StartOutcome {
    pub ok: bool,
    /// An existing snapshot was attached instead of created.
    pub onlyref: bool,
    /// The attached snapshot predates this backup request.
    pub stale: bool,
    pub handle: Option<usize>,
}

#[derive(Default)]
pub struct SnapshotManager {
    refs: Vec<Option<SnapshotRef>>,
    scdirs: HashMap<ScKey, HashMap<String, ScopedDir>>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_scdir(&mut self, key: &ScKey, name: &str) -> &mut ScopedDir {
        self.scdirs
            .entry(key.clone())
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| ScopedDir::new(name))
    }

    pub fn scdir(&self, key: &ScKey, name: &str) -> Option<&ScopedDir> {
        self.scdirs.get(key)?.get(name)
    }

    pub fn snapshot_ref(&self, handle: usize) -> Option<&SnapshotRef> {
        self.refs.get(handle)?.as_ref()
    }

    pub fn snapshot_ref_mut(&mut self, handle: usize) -> Option<&mut SnapshotRef> {
        self.refs.get_mut(handle)?.as_mut()
    }

    fn live_handles(&self) -> Vec<usize> {
        (0..self.refs.len())
            .filter(|&i| self.refs[i].is_some())
            .collect()
    }

    /// Handles of every ref in a snapshot set.
    pub fn refs_in_set(&self, ssetid: Uuid) -> Vec<usize> {
        self.live_handles()
            .into_iter()
            .filter(|&i| self.refs[i].as_ref().unwrap().ssetid == ssetid)
            .collect()
    }

    /// Acquire a snapshot for a scoped dir, reusing an existing one when
    /// the volume and token policy allow it.
    ///
    /// `mandatory_ref` fails instead of creating; `no_restart` protects refs
    /// created earlier in the same run from being restarted.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        ctx: &IndexerContext,
        key: &ScKey,
        name: &str,
        mandatory_ref: bool,
        allow_restart: bool,
        simultaneous_other: bool,
        for_image: bool,
        no_restart: &[usize],
        token_times: &HashMap<String, i64>,
    ) -> Result<StartOutcome> {
        self.cleanup_saved(ctx, !simultaneous_other, &key.start_token)?;

        let orig_target = self.get_scdir(key, name).orig_target.clone();

        let wpath = if ctx.snapshots.locally_mounted() {
            ctx.platform
                .folder_mount(&orig_target)
                .unwrap_or_else(|| orig_target.clone())
        } else {
            let scd = self.get_scdir(key, name);
            scd.target = "/".to_string();
            "/".to_string()
        };

        let mut stale = false;
        if let Some(handle) = self.find_existing(
            ctx,
            key,
            name,
            &wpath,
            allow_restart,
            simultaneous_other,
            for_image,
            no_restart,
            token_times,
            &mut stale,
        )? {
            return Ok(StartOutcome {
                ok: true,
                onlyref: true,
                stale,
                handle: Some(handle),
            });
        }

        if mandatory_ref {
            return Ok(StartOutcome {
                ok: false,
                onlyref: true,
                stale,
                handle: None,
            });
        }

        self.create_new(ctx, key, name, for_image, &wpath, &orig_target, stale)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_new(
        &mut self,
        ctx: &IndexerContext,
        key: &ScKey,
        name: &str,
        for_image: bool,
        wpath: &str,
        orig_target: &str,
        stale: bool,
    ) -> Result<StartOutcome> {
        let ssetid = Uuid::new_v4();
        let handle = self.alloc_ref(SnapshotRef {
            ssetid,
            volpath: String::new(),
            target: wpath.to_string(),
            start_tokens: vec![key.start_token.clone()],
            start_time: now_secs(),
            ok: false,
            for_imagebackup: for_image,
            clientsubname: key.clientsubname.clone(),
            cbt: false,
            save_id: -1,
            dontincrement: false,
        });
        self.get_scdir(key, name).ref_handle = Some(handle);

        ctx.log.log(
            LogLevel::Debug,
            format!("Creating snapshot of \"{}\"...", name),
        );

        match ctx.snapshots.create(ssetid, wpath, name) {
            Ok(volpath) => {
                let fileserv = self.get_scdir(key, name).fileserv;
                let row = ShadowRow {
                    id: 0,
                    ssetid,
                    volpath: volpath.clone(),
                    target: wpath.to_string(),
                    tname: name.to_string(),
                    orig_target: orig_target.to_string(),
                    filesrv: fileserv,
                    starttoken: key.start_token.clone(),
                    clientsubname: key.clientsubname.clone(),
                    for_imagebackup: for_image,
                    starttime_ms: now_ms(),
                    refs: if for_image { 1 } else { 0 },
                };
                let save_id = ctx.dao.add_shadowcopy(row)?;

                let cbt_enabled = ctx.cbt.is_enabled(wpath);
                {
                    let r = self.refs[handle].as_mut().unwrap();
                    r.volpath = volpath.clone();
                    r.ok = true;
                    r.save_id = save_id;
                    r.cbt = cbt_enabled;
                }

                let target = mounted_target(&volpath, orig_target, wpath);
                self.get_scdir(key, name).target = target;

                Ok(StartOutcome {
                    ok: true,
                    onlyref: false,
                    stale,
                    handle: Some(handle),
                })
            }
            Err(e) => {
                ctx.log.log(
                    LogLevel::Error,
                    format!("Creating snapshot of \"{}\" failed: {}", name, e),
                );
                self.refs[handle] = None;
                let scd = self.get_scdir(key, name);
                scd.ref_handle = None;
                scd.target = scd.orig_target.clone();
                Ok(StartOutcome {
                    ok: false,
                    onlyref: false,
                    stale,
                    handle: None,
                })
            }
        }
    }

    /// Scan existing refs in reverse insertion order for a reusable
    /// snapshot; restart-eligible candidates are released and the scan
    /// continues.
    #[allow(clippy::too_many_arguments)]
    fn find_existing(
        &mut self,
        ctx: &IndexerContext,
        key: &ScKey,
        name: &str,
        wpath: &str,
        allow_restart: bool,
        simultaneous_other: bool,
        for_image: bool,
        no_restart: &[usize],
        token_times: &HashMap<String, i64>,
        stale: &mut bool,
    ) -> Result<Option<usize>> {
        let mut handles = self.live_handles();
        handles.reverse();

        for i in handles {
            let candidate = match &self.refs[i] {
                Some(r) => r.clone(),
                None => continue, // released by an earlier restart iteration
            };

            if candidate.target != wpath
                || !candidate.ok
                || candidate.clientsubname != key.clientsubname
            {
                continue;
            }

            let do_restart = !no_restart.contains(&i);

            // A token counts as foreign only while its server is active.
            let only_own_tokens = candidate.start_tokens.iter().all(|t| {
                t == &key.start_token || token_idle(token_times, t)
            });

            if !only_own_tokens {
                continue;
            }

            let cannot_open = !ctx.snapshots.is_openable(&candidate.volpath);
            if cannot_open && !do_restart {
                ctx.log.log(
                    LogLevel::Warn,
                    format!(
                        "Cannot open snapshot at \"{}\". Creating new or choosing other.",
                        candidate.volpath
                    ),
                );
                continue;
            }

            let too_old = now_secs() - candidate.start_time > SNAPSHOT_RESTART_TIMEOUT_SECS;

            if do_restart && allow_restart && (too_old || only_own_tokens || cannot_open) {
                if candidate.for_imagebackup == for_image || !simultaneous_other {
                    ctx.log.log(
                        LogLevel::Info,
                        format!(
                            "Restarting snapshot of {} (started by this server or too old)",
                            candidate.target
                        ),
                    );
                    self.restart_candidate(ctx, key, name, i)?;
                    continue;
                }

                ctx.log.log(
                    LogLevel::Info,
                    format!(
                        "Not restarting snapshot of {}: other backup kind running simultaneously",
                        candidate.target
                    ),
                );
            }

            if cannot_open {
                continue;
            }

            // Attach.
            {
                let r = self.refs[i].as_mut().unwrap();
                if r.dontincrement {
                    r.dontincrement = false;
                } else {
                    r.start_tokens.push(key.start_token.clone());
                }
            }

            let candidate = self.refs[i].as_ref().unwrap().clone();
            let scd = self.get_scdir(key, name);
            scd.ref_handle = Some(i);
            scd.target = mounted_target(&candidate.volpath, &scd.orig_target.clone(), wpath);

            if for_image && candidate.save_id != -1 {
                ctx.dao.mod_shadowcopy_refcount(candidate.save_id, 1)?;
            }

            // A reused snapshot that would have restarted is stale for
            // changed-dir bookkeeping.
            *stale = do_restart && !allow_restart;

            ctx.log
                .log(LogLevel::Debug, "Snapshot already present.".to_string());
            return Ok(Some(i));
        }

        Ok(None)
    }

    /// Release every scoped dir of this server resolving through `handle`
    /// (and its snapshot-set siblings), so a fresh snapshot can be taken.
    fn restart_candidate(
        &mut self,
        ctx: &IndexerContext,
        key: &ScKey,
        keep_name: &str,
        handle: usize,
    ) -> Result<()> {
        let ssetid = self.refs[handle].as_ref().unwrap().ssetid;
        let for_image = self.refs[handle].as_ref().unwrap().for_imagebackup;

        let server_key = ScKey {
            start_token: key.start_token.clone(),
            clientsubname: key.clientsubname.clone(),
            for_imagebackup: for_image,
        };

        loop {
            let next = self
                .scdirs
                .get(&server_key)
                .and_then(|dirs| {
                    dirs.iter()
                        .find(|(_, d)| {
                            d.ref_handle
                                .and_then(|h| self.refs.get(h).cloned().flatten())
                                .map(|r| r.ssetid == ssetid)
                                .unwrap_or(false)
                        })
                        .map(|(n, _)| n.clone())
                })
                ;

            match next {
                Some(dir_name) => {
                    self.release(
                        ctx,
                        &server_key,
                        &dir_name,
                        false,
                        -1,
                        Some((key.clone(), keep_name.to_string())),
                    )?;
                }
                None => break,
            }
        }

        let scd = self.get_scdir(key, keep_name);
        scd.target = scd.orig_target.clone();
        Ok(())
    }

    /// Release a scoped dir's hold on its snapshot. Deletes the platform
    /// snapshot when this was the last holder (or the ref aged out), then
    /// garbage-collects refs with no remaining tokens.
    pub fn release(
        &mut self,
        ctx: &IndexerContext,
        key: &ScKey,
        name: &str,
        for_image: bool,
        save_id: i64,
        dontdel: Option<(ScKey, String)>,
    ) -> Result<bool> {
        let scd = match self.scdirs.get(key).and_then(|d| d.get(name)) {
            Some(s) => s.clone(),
            None => return Ok(false),
        };

        if for_image {
            let target_id = scd
                .ref_handle
                .and_then(|h| self.refs.get(h).cloned().flatten())
                .map(|r| r.save_id)
                .filter(|&id| id != -1)
                .or(if save_id != -1 { Some(save_id) } else { None });
            if let Some(id) = target_id {
                ctx.dao.mod_shadowcopy_refcount(id, -1)?;
            }
        }

        let mut ok = true;

        if let Some(handle) = scd.ref_handle {
            if let Some(r) = self.refs.get(handle).cloned().flatten() {
                let last_holder = r.start_tokens.is_empty()
                    || (r.start_tokens.len() == 1 && r.start_tokens[0] == key.start_token);
                let aged_out = now_secs() - r.start_time > SNAPSHOT_TIMEOUT_SECS;

                if last_holder || aged_out {
                    ctx.log.log(
                        LogLevel::Debug,
                        format!("Deleting snapshot for path \"{}\"", scd.target),
                    );
                    if let Err(e) = ctx.snapshots.remove(r.ssetid, &r.volpath, &r.target) {
                        ctx.log.log(
                            LogLevel::Error,
                            format!("Deleting snapshot of \"{}\" failed: {}", scd.dir, e),
                        );
                        ok = false;
                    }
                    if r.save_id != -1 {
                        ctx.dao.del_shadowcopy(r.save_id)?;
                    }
                }

                // Remove this server's token.
                if let Some(r) = self.refs[handle].as_mut() {
                    if let Some(pos) =
                        r.start_tokens.iter().position(|t| t == &key.start_token)
                    {
                        r.start_tokens.remove(pos);
                    }
                }
            }
        }

        self.cleanup_saved(ctx, false, &key.start_token)?;
        self.collect_unreferenced(ctx, dontdel)?;

        Ok(ok)
    }

    /// Free refs with no remaining tokens and detach the scoped dirs that
    /// were resolving through them.
    fn collect_unreferenced(
        &mut self,
        ctx: &IndexerContext,
        dontdel: Option<(ScKey, String)>,
    ) -> Result<()> {
        loop {
            let dead = self.live_handles().into_iter().find(|&i| {
                self.refs[i]
                    .as_ref()
                    .map(|r| r.start_tokens.is_empty())
                    .unwrap_or(false)
            });

            let handle = match dead {
                Some(h) => h,
                None => return Ok(()),
            };

            ctx.log.log(
                LogLevel::Debug,
                format!(
                    "Dropping snapshot reference for \"{}\"",
                    self.refs[handle].as_ref().unwrap().target
                ),
            );

            for (server_key, dirs) in self.scdirs.iter_mut() {
                let names: Vec<String> = dirs
                    .iter()
                    .filter(|(_, d)| d.ref_handle == Some(handle))
                    .map(|(n, _)| n.clone())
                    .collect();

                for dir_name in names {
                    let keep = dontdel
                        .as_ref()
                        .map(|(k, n)| k == server_key && *n == dir_name)
                        .unwrap_or(false);

                    let d = dirs.get_mut(&dir_name).unwrap();
                    if d.fileserv {
                        ctx.fileserv
                            .share_dir(&server_key.start_token, &d.dir, &d.orig_target);
                    }
                    d.target = d.orig_target.clone();
                    d.ref_handle = None;

                    if !keep {
                        dirs.remove(&dir_name);
                    }
                }
            }

            self.refs[handle] = None;
        }
    }

    /// Delete persisted snapshots no in-memory ref accounts for. With
    /// `start`, also reclaims device snapshots left behind by this server's
    /// previous backup attempt.
    pub fn cleanup_saved(
        &mut self,
        ctx: &IndexerContext,
        start: bool,
        current_token: &str,
    ) -> Result<bool> {
        let rows = ctx.dao.get_shadowcopies()?;
        let mut ok = true;

        for row in rows {
            let in_memory = self.live_handles().into_iter().any(|i| {
                let r = self.refs[i].as_ref().unwrap();
                r.save_id == row.id || r.ssetid == row.ssetid
            });
            if in_memory {
                continue;
            }

            let age_secs = (now_ms() - row.starttime_ms) / 1000;
            let reclaim = row.refs <= 0
                || age_secs > SNAPSHOT_TIMEOUT_SECS
                || (start
                    && !row.filesrv
                    && row.refs == 1
                    && !current_token.is_empty()
                    && row.starttoken == current_token);

            if reclaim {
                if let Err(e) = ctx.snapshots.remove(row.ssetid, &row.volpath, &row.target) {
                    ctx.log.log(
                        LogLevel::Error,
                        format!("Removing saved snapshot {} failed: {}", row.volpath, e),
                    );
                    ok = false;
                    continue;
                }
                ctx.dao.del_shadowcopy(row.id)?;
            }
        }

        Ok(ok)
    }

    /// Crash recovery at startup: reclaim persisted snapshots with no
    /// holders or past the hard timeout.
    pub fn startup_cleanup(&mut self, ctx: &IndexerContext) -> Result<()> {
        self.cleanup_saved(ctx, false, "")?;
        Ok(())
    }

    /// Resolve a `save_id` to the exposed snapshot path.
    pub fn lookup(&self, ctx: &IndexerContext, save_id: i64) -> Result<Option<String>> {
        for i in self.live_handles() {
            let r = self.refs[i].as_ref().unwrap();
            if r.save_id == save_id {
                return Ok(Some(r.volpath.clone()));
            }
        }
        Ok(ctx.dao.get_shadowcopy(save_id)?.map(|row| row.volpath))
    }

    /// Refresh a snapshot's start time so timeout reclamation does not fire.
    pub fn ping(&mut self, ctx: &IndexerContext, key: &ScKey, name: &str) -> Result<bool> {
        let handle = match self.scdirs.get(key).and_then(|d| d.get(name)) {
            Some(s) => s.ref_handle,
            None => None,
        };

        if let Some(handle) = handle {
            if let Some(r) = self.refs[handle].as_mut() {
                r.start_time = now_secs();
                if r.save_id != -1 {
                    ctx.dao.update_shadowcopy_starttime(r.save_id, now_ms())?;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pipe-delimited sibling-volume enumeration appended to a
    /// `done-<id>-<path>` reply.
    pub fn sibling_info(&self, handle: usize) -> String {
        let me = match self.refs.get(handle).cloned().flatten() {
            Some(r) => r,
            None => return String::new(),
        };

        let mut info = String::new();
        for (n, i) in self.live_handles().into_iter().enumerate() {
            if i == handle {
                continue;
            }
            let r = self.refs[i].as_ref().unwrap();
            if r.ssetid == me.ssetid {
                info.push_str(&format!(
                    "&vol_{}={}&id_{}={}",
                    n,
                    escape_param(&r.target),
                    n,
                    r.save_id
                ));
            }
        }

        if !info.is_empty() {
            info.replace_range(0..1, "|");
        }
        info
    }

    fn alloc_ref(&mut self, r: SnapshotRef) -> usize {
        self.refs.push(Some(r));
        self.refs.len() - 1
    }
}

/// Rebase `orig_target` from its volume onto the snapshot mount.
fn mounted_target(volpath: &str, orig_target: &str, wpath: &str) -> String {
    let suffix = orig_target.strip_prefix(wpath).unwrap_or("");
    let suffix = suffix.trim_start_matches('/');
    if suffix.is_empty() {
        volpath.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", volpath.trim_end_matches('/'), suffix)
    }
}

fn token_idle(token_times: &HashMap<String, i64>, token: &str) -> bool {
    match token_times.get(token) {
        Some(&last) => now_secs() - last >= TOKEN_IDLE_TIMEOUT_SECS,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mounted_target() {
        assert_eq!(mounted_target("/mnt/snap0", "/data/docs", "/"), "/mnt/snap0/data/docs");
        assert_eq!(mounted_target("/mnt/snap0", "/", "/"), "/mnt/snap0");
        assert_eq!(
            mounted_target("/mnt/snap0/", "/home/user", "/home"),
            "/mnt/snap0/user"
        );
    }

    #[test]
    fn test_token_idle() {
        let mut times = HashMap::new();
        assert!(token_idle(&times, "unknown"));

        times.insert("fresh".to_string(), now_secs());
        assert!(!token_idle(&times, "fresh"));

        times.insert("old".to_string(), now_secs() - TOKEN_IDLE_TIMEOUT_SECS - 5);
        assert!(token_idle(&times, "old"));
    }
}
