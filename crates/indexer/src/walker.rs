//! Recursive directory walker
//!
//! Produces the contribution of one backup root to the file list, merging
//! filesystem enumeration with the persistent file cache: unchanged
//! directories are served from cache, changed ones are re-enumerated and
//! written back with compare-and-swap on the row generation. Hashes are
//! carried forward from the cache when name, change indicator and size
//! still match, and computed otherwise.

use crate::context::{IndexerContext, LogLevel};
use crate::emitter::{FileListWriter, KeepCursor};
use crate::filter::{is_excluded, is_included, IncludePattern};
use anyhow::Result;
use base64::Engine;
use dao::{flags, BackupRoot, FileBatch, HardlinkBatch};
use snapdex_core::escape::escape_param;
use snapdex_core::fileinfo::encode_change_indicator;
use snapdex_core::fsutil::{add_trailing_sep, now_ms, path_key, remove_trailing_sep};
use snapdex_core::hash::{hash_file, to_hex, HashAlgo};
use snapdex_core::FileAndHash;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Per-root walk parameters.
#[derive(Debug, Clone)]
pub struct WalkRoot {
    /// Index into the walker's root list.
    pub root_index: usize,
    /// Normalized volume of the root, used for changed-dir lookups and
    /// hard-link keys.
    pub volume: String,
    /// Filesystem path to read from (snapshot mount while one is attached).
    pub mod_path: String,
    pub flags: u32,
    /// Serve unchanged directories from the cache.
    pub use_db: bool,
    pub tgroup: i32,
}

pub struct Walker<'a> {
    ctx: &'a IndexerContext,
    /// Backup roots of this run; symlink discovery may append.
    pub roots: Vec<BackupRoot>,
    /// Sorted directory cache keys reported changed since the last run.
    pub changed_dirs: Vec<String>,
    /// Sorted open-file keys (`dir_key` + name).
    pub open_files: Vec<String>,
    pub file_batch: FileBatch,
    pub link_batch: HardlinkBatch,
    pub cursor: KeepCursor,
    pub exclude: Vec<String>,
    pub include: Vec<IncludePattern>,
    pub hash_algo: HashAlgo,
    pub index_error: bool,

    pub c_fs: u64,
    pub c_db: u64,
    pub c_db_update: u64,

    can_watch: bool,
    calc_hashes: bool,
    verify: bool,
    proper_symlinks: bool,
    with_orig_path: bool,
    with_sequence: bool,
    rand_state: u64,
}

impl<'a> Walker<'a> {
    pub fn new(
        ctx: &'a IndexerContext,
        roots: Vec<BackupRoot>,
        cursor: KeepCursor,
        hash_algo: HashAlgo,
    ) -> Self {
        let settings = ctx.settings.read();
        let can_watch = ctx.change_source.lock().can_watch();
        Self {
            ctx,
            roots,
            changed_dirs: Vec::new(),
            open_files: Vec::new(),
            file_batch: FileBatch::new(),
            link_batch: HardlinkBatch::new(),
            cursor,
            exclude: Vec::new(),
            include: Vec::new(),
            hash_algo,
            index_error: false,
            c_fs: 0,
            c_db: 0,
            c_db_update: 0,
            can_watch,
            calc_hashes: settings.calculate_filehashes_on_client,
            verify: settings.end_to_end_file_backup_verification,
            proper_symlinks: settings.with_proper_symlinks,
            with_orig_path: settings.with_orig_path,
            with_sequence: settings.with_sequence,
            rand_state: now_ms() as u64 | 1,
        }
    }

    /// Flush buffered cache and hard-link writes.
    pub fn commit(&mut self) -> Result<()> {
        self.file_batch.flush(&self.ctx.dao)?;
        self.link_batch.flush(&self.ctx.dao)?;
        Ok(())
    }

    /// Walk one backup root, emitting its subtree.
    pub fn walk_root(&mut self, out: &mut FileListWriter, params: &WalkRoot) -> Result<bool> {
        let root = self.roots[params.root_index].clone();
        self.walk_dir(
            out,
            params,
            remove_trailing_sep(&root.path),
            remove_trailing_sep(&params.mod_path),
            &root.tname,
            true,
            root.symlinked,
            0,
        )
    }

    /// Returns whether the subtree contributed any included entry.
    #[allow(clippy::too_many_arguments)]
    fn walk_dir(
        &mut self,
        out: &mut FileListWriter,
        params: &WalkRoot,
        orig_dir: &str,
        dir: &str,
        named_path: &str,
        first: bool,
        symlinked: bool,
        depth: usize,
    ) -> Result<bool> {
        if self.ctx.stop_requested() {
            return Ok(false);
        }

        let mut orig_dir = orig_dir.to_string();
        let mut dir = dir.to_string();
        let mut fn_filter: Option<String> = None;
        let mut close_dir = false;
        let mut depth = depth;
        let mut extra = String::new();

        if first {
            let meta = fs::metadata(&dir);
            let meta = match meta {
                Ok(m) => m,
                Err(e) => {
                    let optional = params.flags & flags::OPTIONAL != 0
                        || (symlinked && params.flags & flags::SYMLINKS_OPTIONAL != 0);
                    if optional {
                        self.ctx.log.log(
                            LogLevel::Info,
                            format!("Cannot access \"{}\". Not backing it up: {}", dir, e),
                        );
                    } else {
                        self.ctx.log.log(
                            LogLevel::Error,
                            format!("Cannot access path to backup: \"{}\": {}", dir, e),
                        );
                        self.index_error = true;
                    }
                    return Ok(false);
                }
            };

            if self.with_orig_path {
                extra.push_str(&format!(
                    "&orig_path={}&orig_sep=%2F",
                    escape_param(&orig_dir)
                ));
            }

            if self.with_sequence {
                if let Some((next, id)) = self.ctx.platform.query_usn(Path::new(&dir)) {
                    extra.push_str(&format!("&sequence_next={}&sequence_id={}", next, id));
                }
            }

            if meta.is_file() {
                // Single-file root: walk the parent, filtered to this name.
                let p = PathBuf::from(&dir);
                fn_filter = p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned());
                dir = parent_str(&dir);
                orig_dir = parent_str(&orig_dir);
            } else {
                close_dir = true;
                let change = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);

                self.cursor
                    .add_from_last_upto(out, named_path, true, depth, false)?;
                out.write_dir(
                    named_path,
                    self.with_orig_path,
                    encode_change_indicator(change, false, false),
                    &extra,
                )?;
                extra.clear();
                depth += 1;
            }
        }

        let use_db = !first && params.use_db;
        let (files, _generation) = self.get_files_proxy(
            params,
            &orig_dir,
            &dir,
            named_path,
            use_db,
            params.use_db,
            fn_filter.as_deref(),
        )?;

        if self.index_error {
            return Ok(false);
        }

        let mut has_include = false;

        // Files first, directories after; both passes in listing order.
        for (i, f) in files.iter().enumerate() {
            if f.isdir {
                continue;
            }
            if (f.issym && !self.proper_symlinks && params.flags & flags::FOLLOW_SYMLINKS == 0)
                || (f.isspecial && !self.proper_symlinks)
            {
                continue;
            }

            let orig_file = format!("{}/{}", orig_dir, f.name);
            let named_file = format!("{}/{}", named_path, f.name);
            if self.skip_file(&orig_file, &named_file) {
                continue;
            }

            if !use_db && f.nlinks > 1 && self.ctx.platform.can_enumerate_hardlinks() {
                self.handle_hardlinks(&params.volume, &dir, &orig_dir, &f.name)?;
            }

            has_include = true;

            let listname = if first && fn_filter.is_some() && i == 0 {
                named_path.to_string()
            } else {
                f.name.clone()
            };

            self.cursor
                .add_from_last_upto(out, &listname, false, depth, false)?;

            // Single-file roots carry the root-level extras on their entry.
            let mut extra = if first && fn_filter.is_some() && i == 0 {
                std::mem::take(&mut extra)
            } else {
                String::new()
            };
            if self.calc_hashes && !f.hash.is_empty() {
                // URL-safe alphabet so hash values never collide with the
                // extra-parameter escaping.
                extra.push_str(&format!(
                    "&{}={}",
                    self.hash_algo.extra_key(),
                    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&f.hash)
                ));
            }
            if self.verify && !f.isspecial {
                if let Ok(h) = hash_file(&Path::new(&dir).join(&f.name), HashAlgo::Sha256) {
                    extra.push_str(&format!("&sha256_verify={}", to_hex(&h)));
                }
            }
            if f.issym && self.proper_symlinks {
                let target = f.output_symlink_target.clone().unwrap_or_default();
                extra.push_str(&format!("&sym_target={}", escape_param(&target)));
            }
            if f.isspecial && self.proper_symlinks {
                extra.push_str("&special=1");
            }

            out.write_file(&listname, f.size, f.change_indicator, &extra)?;
        }

        for (i, f) in files.iter().enumerate() {
            if !f.isdir {
                continue;
            }
            if (f.issym && !self.proper_symlinks && params.flags & flags::FOLLOW_SYMLINKS == 0)
                || (f.isspecial && !self.proper_symlinks)
            {
                continue;
            }

            let orig_sub = format!("{}/{}", orig_dir, f.name);
            let named_sub = format!("{}/{}", named_path, f.name);

            if is_excluded(&self.exclude, &orig_sub) || is_excluded(&self.exclude, &named_sub) {
                continue;
            }

            let mut worthless_orig = false;
            let mut worthless_named = false;
            let curr_included =
                is_included(&self.include, &orig_sub, Some(&mut worthless_orig))
                    || is_included(&self.include, &named_sub, Some(&mut worthless_named));
            if curr_included {
                has_include = true;
            }

            if !curr_included && worthless_orig && worthless_named {
                continue;
            }

            let rollback_pos = out.pos()?;
            let rollback_cursor = self.cursor.save_state();

            let mut extra = String::new();
            if f.issym && self.proper_symlinks {
                let target = f.output_symlink_target.clone().unwrap_or_default();
                extra.push_str(&format!("&sym_target={}", escape_param(&target)));
            }
            if f.isspecial && self.proper_symlinks {
                extra.push_str("&special=1");
            }

            let listname = if first && fn_filter.is_some() && i == 0 {
                named_path.to_string()
            } else {
                f.name.clone()
            };

            self.cursor
                .add_from_last_upto(out, &listname, true, depth, false)?;
            out.write_dir(&listname, self.with_orig_path, f.change_indicator, &extra)?;

            let sub_included = if !f.issym || !self.proper_symlinks {
                self.walk_dir(
                    out,
                    params,
                    &orig_sub,
                    &format!("{}/{}", dir, f.name),
                    &named_sub,
                    false,
                    false,
                    depth + 1,
                )?
            } else {
                // Symlinked dirs are emitted as links; their content arrives
                // under its own (symlinked) backup root.
                true
            };

            self.cursor.add_from_last_lift_depth(out, depth)?;
            out.write_close(self.proper_symlinks)?;

            if sub_included {
                has_include = true;
            } else if !curr_included {
                // Nothing below matched an include: unwind the subtree.
                self.cursor.restore(rollback_cursor)?;
                out.rollback_to(rollback_pos)?;
            }

            if self.index_error {
                return Ok(false);
            }
        }

        if close_dir {
            self.cursor.add_from_last_lift_depth(out, depth - 1)?;
            out.write_close(self.proper_symlinks)?;
        }

        Ok(has_include)
    }

    fn skip_file(&self, orig_path: &str, named_path: &str) -> bool {
        if is_excluded(&self.exclude, orig_path) || is_excluded(&self.exclude, named_path) {
            return true;
        }
        if !is_included(&self.include, orig_path, None)
            && !is_included(&self.include, named_path, None)
        {
            return true;
        }
        false
    }

    /// Resolve a directory's listing: enumerate the filesystem when the
    /// directory changed (or nothing can watch), serve from the cache
    /// otherwise. Cache rows are created/updated through the write batch.
    #[allow(clippy::too_many_arguments)]
    fn get_files_proxy(
        &mut self,
        params: &WalkRoot,
        orig_path: &str,
        path: &str,
        named_path: &str,
        use_db: bool,
        use_db_hashes: bool,
        fn_filter: Option<&str>,
    ) -> Result<(Vec<FileAndHash>, i64)> {
        let dir_key = add_trailing_sep(orig_path);
        let use_db = use_db && self.can_watch;

        let dir_changed =
            !self.can_watch || self.changed_dirs.binary_search(&dir_key).is_ok();

        if !use_db || dir_changed {
            self.c_fs += 1;

            let mut fs_files = self.enumerate(params, path, orig_path, named_path)?;
            if let Some(filter) = fn_filter {
                fs_files.retain(|f| f.name == filter);
            }
            self.resolve_symlinks(params, orig_path, path, &mut fs_files);

            let cached = if use_db_hashes && self.calc_hashes {
                self.ctx.dao.get_files(&dir_key, params.tgroup)?
            } else {
                None
            };

            if dir_changed && self.can_watch {
                self.perturb_open_files(&dir_key, &mut fs_files);
            }

            if self.calc_hashes {
                self.add_missing_hashes(
                    cached.as_ref().map(|(_, files)| files.as_slice()),
                    &mut fs_files,
                    orig_path,
                    path,
                    named_path,
                )?;
            }

            match cached {
                Some((generation, db_files)) => {
                    if fs_files != db_files {
                        self.c_db_update += 1;
                        self.file_batch.modify(
                            &self.ctx.dao,
                            &dir_key,
                            params.tgroup,
                            fs_files.clone(),
                            generation,
                        )?;
                    }
                    Ok((fs_files, generation))
                }
                None => {
                    self.file_batch
                        .add(&self.ctx.dao, &dir_key, params.tgroup, fs_files.clone())?;
                    Ok((fs_files, 0))
                }
            }
        } else if let Some((generation, mut db_files)) =
            self.ctx.dao.get_files(&dir_key, params.tgroup)?
        {
            self.c_db += 1;

            self.resolve_symlinks(params, orig_path, path, &mut db_files);

            if self.calc_hashes
                && self.add_missing_hashes(None, &mut db_files, orig_path, path, named_path)?
            {
                self.c_db_update += 1;
                self.file_batch.modify(
                    &self.ctx.dao,
                    &dir_key,
                    params.tgroup,
                    db_files.clone(),
                    generation,
                )?;
            }

            Ok((db_files, generation))
        } else {
            self.c_fs += 1;

            let mut fs_files = self.enumerate(params, path, orig_path, named_path)?;
            self.resolve_symlinks(params, orig_path, path, &mut fs_files);
            if self.calc_hashes {
                self.add_missing_hashes(None, &mut fs_files, orig_path, path, named_path)?;
            }
            self.file_batch
                .add(&self.ctx.dao, &dir_key, params.tgroup, fs_files.clone())?;
            Ok((fs_files, 0))
        }
    }

    /// List one directory of the (possibly snapshotted) filesystem.
    fn enumerate(
        &mut self,
        params: &WalkRoot,
        path: &str,
        orig_path: &str,
        _named_path: &str,
    ) -> Result<Vec<FileAndHash>> {
        let read_dir = match fs::read_dir(path) {
            Ok(rd) => rd,
            Err(e) => {
                let root_exists = Path::new(&params.mod_path).exists();
                if root_exists {
                    self.ctx.log.log(
                        LogLevel::Error,
                        format!(
                            "Error while getting files in folder \"{}\". User may not have permissions to access this folder: {}",
                            path, e
                        ),
                    );
                } else {
                    self.ctx.log.log(
                        LogLevel::Error,
                        format!(
                            "Error while getting files in folder \"{}\": {}. Access to root directory is gone too. Snapshot was probably deleted while indexing.",
                            path, e
                        ),
                    );
                }
                self.ctx
                    .on_read_error("", orig_path, 0, &e.to_string());
                self.index_error = true;
                return Ok(Vec::new());
            }
        };

        let mut files = Vec::new();
        for entry in read_dir {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    self.ctx.log.log(
                        LogLevel::Warn,
                        format!("Error reading entry in \"{}\": {}", path, e),
                    );
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.path().symlink_metadata() {
                Ok(m) => m,
                Err(e) => {
                    self.ctx.log.log(
                        LogLevel::Warn,
                        format!("Cannot stat \"{}\": {}", entry.path().display(), e),
                    );
                    self.ctx
                        .on_read_error("", &format!("{}/{}", orig_path, name), 0, &e.to_string());
                    continue;
                }
            };

            let issym = meta.file_type().is_symlink();
            let isdir = if issym {
                fs::metadata(entry.path()).map(|m| m.is_dir()).unwrap_or(false)
            } else {
                meta.is_dir()
            };
            let isspecial = !issym && !isdir && !meta.is_file();

            let change = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            #[cfg(unix)]
            let nlinks = {
                use std::os::unix::fs::MetadataExt;
                meta.nlink()
            };
            #[cfg(not(unix))]
            let nlinks = 1u64;

            let symlink_target = if issym {
                fs::read_link(entry.path())
                    .ok()
                    .map(|t| t.to_string_lossy().into_owned())
            } else {
                None
            };

            files.push(FileAndHash {
                name,
                size: if isdir { 0 } else { meta.len() as i64 },
                change_indicator: encode_change_indicator(change, issym, isspecial),
                hash: Vec::new(),
                isdir,
                issym,
                isspecial,
                nlinks,
                symlink_target,
                output_symlink_target: None,
            });
        }

        files.sort();
        Ok(files)
    }

    /// Carry hashes over from the cache row where `(name, change_indicator,
    /// size)` still match; compute the rest.
    fn add_missing_hashes(
        &mut self,
        db_files: Option<&[FileAndHash]>,
        fs_files: &mut [FileAndHash],
        orig_path: &str,
        file_path: &str,
        named_path: &str,
    ) -> Result<bool> {
        let mut calculated = false;

        for f in fs_files.iter_mut() {
            if f.isdir || f.isspecial || !f.hash.is_empty() {
                continue;
            }

            let orig_file = format!("{}/{}", orig_path, f.name);
            let named_file = format!("{}/{}", named_path, f.name);
            if is_excluded(&self.exclude, &orig_file)
                || is_excluded(&self.exclude, &named_file)
                || (!is_included(&self.include, &orig_file, None)
                    && !is_included(&self.include, &named_file, None))
            {
                continue;
            }

            if let Some(db) = db_files {
                if let Ok(pos) = db.binary_search_by(|d| d.name.as_str().cmp(&f.name)) {
                    let d = &db[pos];
                    if !d.isdir
                        && d.change_indicator == f.change_indicator
                        && d.size == f.size
                        && !d.hash.is_empty()
                    {
                        f.hash = d.hash.clone();
                        continue;
                    }
                }
            }

            let full = Path::new(file_path).join(&f.name);
            self.ctx
                .log
                .log(LogLevel::Debug, format!("Hashing file \"{}\"", full.display()));
            match hash_file(&full, self.hash_algo) {
                Ok(h) => {
                    f.hash = h;
                    calculated = true;
                }
                Err(e) => {
                    self.ctx.log.log(
                        LogLevel::Warn,
                        format!("Error hashing \"{}\": {}", full.display(), e),
                    );
                    self.ctx
                        .on_read_error("", &orig_file, 0, &e.to_string());
                }
            }
        }

        Ok(calculated)
    }

    /// A file open while the snapshot was taken gets its change indicator
    /// perturbed so the next run retransmits it once it closes.
    fn perturb_open_files(&mut self, dir_key: &str, files: &mut [FileAndHash]) {
        for f in files.iter_mut() {
            if f.isdir {
                continue;
            }
            let key = format!("{}{}", dir_key, f.name);
            if self.open_files.binary_search(&key).is_ok() {
                self.ctx
                    .log
                    .log(LogLevel::Debug, format!("File is open: {}", f.name));

                if f.change_indicator == 0 {
                    f.change_indicator = self.next_rand() as i64;
                }
                f.change_indicator = f
                    .change_indicator
                    .wrapping_mul(self.next_rand().max(2) as i64)
                    .wrapping_mul(self.next_rand().max(2) as i64);
            }
        }
    }

    fn next_rand(&mut self) -> u32 {
        // xorshift64*
        let mut x = self.rand_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rand_state = x;
        (x.wrapping_mul(0x2545F4914F6CDD1D) >> 32) as u32
    }

    /// Record the hard-link edges of a multi-link file and queue the other
    /// link locations for re-indexing.
    fn handle_hardlinks(
        &mut self,
        volume: &str,
        dir: &str,
        orig_dir: &str,
        name: &str,
    ) -> Result<()> {
        let fs_path = Path::new(dir).join(name);
        let (high, low) = match self.ctx.platform.file_ref(&fs_path) {
            Some(frn) => frn,
            None => return Ok(()),
        };

        self.link_batch
            .reset(&self.ctx.dao, volume, high, low)?;

        let links = self.ctx.platform.enumerate_hardlinks(volume, &fs_path)?;
        let this_key = format!("{}{}", add_trailing_sep(orig_dir), name);
        let is_open = self.open_files.binary_search(&this_key).is_ok();

        for link in links {
            let parent = match link.parent() {
                Some(p) => p.to_path_buf(),
                None => continue,
            };

            if let Some((parent_high, parent_low)) = self.ctx.platform.file_ref(&parent) {
                self.link_batch.add(
                    &self.ctx.dao,
                    volume,
                    high,
                    low,
                    parent_high,
                    parent_low,
                )?;
            }

            let parent_key = path_key(&parent);
            if let Err(pos) = self.changed_dirs.binary_search(&parent_key) {
                self.changed_dirs.insert(pos, parent_key.clone());
            }

            if is_open {
                let link_name = link
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let sibling_key = format!("{}{}", parent_key, link_name);
                if let Err(pos) = self.open_files.binary_search(&sibling_key) {
                    self.open_files.insert(pos, sibling_key);
                }
            }
        }

        Ok(())
    }

    /// Compute list-facing symlink targets; following symlinks may append a
    /// new (symlinked) backup root and confirms roots that are pointed at.
    fn resolve_symlinks(
        &mut self,
        params: &WalkRoot,
        orig_dir: &str,
        _fs_dir: &str,
        files: &mut [FileAndHash],
    ) {
        for f in files.iter_mut() {
            if !f.issym || f.output_symlink_target.is_some() {
                continue;
            }

            let raw = match &f.symlink_target {
                Some(t) => t.clone(),
                None => continue,
            };

            let abs = absolutize(orig_dir, &raw);

            // Target inside a known root: rewrite to the logical name and
            // confirm symlinked roots.
            let mut resolved = None;
            for root in self.roots.iter_mut() {
                let root_path = remove_trailing_sep(&root.path).to_string();
                if abs == root_path || abs.starts_with(&format!("{}/", root_path)) {
                    root.symlinked_confirmed = true;
                    let rest = &abs[root_path.len()..];
                    resolved = Some(format!("{}{}", root.tname, rest));
                    break;
                }
            }

            if resolved.is_none()
                && params.flags & flags::FOLLOW_SYMLINKS != 0
                && f.isdir
            {
                resolved = Some(self.add_symlink_root(params, &abs));
            }

            f.output_symlink_target = Some(resolved.unwrap_or(raw));
        }
    }

    /// Append a new symlinked backup root for a followed symlink target.
    fn add_symlink_root(&mut self, params: &WalkRoot, target: &str) -> String {
        let base = Path::new(target)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sym".to_string());

        let mut tname = base.clone();
        let mut counter = 1;
        while self.roots.iter().any(|r| r.tname == tname) {
            tname = format!("{}_{}", base, counter);
            counter += 1;
        }

        let root = BackupRoot {
            id: 0,
            tname: tname.clone(),
            path: target.to_string(),
            group: self.roots[params.root_index].group,
            flags: params.flags | flags::SYMLINKS_OPTIONAL,
            symlinked: true,
            symlinked_confirmed: true,
            server_default: false,
            reset_keep: false,
        };

        match self.ctx.dao.add_backup_dir(root.clone()) {
            Ok(id) => {
                let mut root = root;
                root.id = id;
                self.roots.push(root);
            }
            Err(e) => {
                self.ctx.log.log(
                    LogLevel::Warn,
                    format!("Failed persisting symlinked backup root {}: {}", tname, e),
                );
                self.roots.push(root);
            }
        }

        tname
    }
}

fn parent_str(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

/// Textually resolve `target` relative to `base`, folding `.` and `..`.
fn absolutize(base: &str, target: &str) -> String {
    let joined = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("{}/{}", base, target)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}
