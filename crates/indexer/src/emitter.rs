//! File-list emitter with "keep" alignment
//!
//! New entries stream to `<stage>` in depth-first lexicographic order; for
//! roots flagged `KeepFiles` the previous list is interleaved: before an
//! entry at `(depth, name, isdir)` is written, cursor entries still
//! lexicographically behind at that depth (or anywhere deeper) are copied
//! verbatim. The stage file is truncated at the final write position and
//! atomically renamed over the published list.

use crate::lastlist::{CursorState, LastFileList, ListEntry};
use anyhow::{Context, Result};
use snapdex_core::escape::{escape_list_name, escape_param};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct FileListWriter {
    out: BufWriter<File>,
    path: PathBuf,
    entries: u64,
}

impl FileListWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            entries: 0,
        })
    }

    pub fn write_file(
        &mut self,
        name: &str,
        size: i64,
        change_indicator: i64,
        extra: &str,
    ) -> Result<()> {
        write!(
            self.out,
            "f\"{}\" {} {}",
            escape_list_name(name),
            size,
            change_indicator
        )?;
        self.write_extra(extra)?;
        self.entries += 1;
        Ok(())
    }

    pub fn write_dir(
        &mut self,
        name: &str,
        with_change: bool,
        change_indicator: i64,
        extra: &str,
    ) -> Result<()> {
        write!(self.out, "d\"{}\"", escape_list_name(name))?;
        if with_change {
            write!(self.out, " 0 {}", change_indicator)?;
        }
        self.write_extra(extra)?;
        self.entries += 1;
        Ok(())
    }

    pub fn write_close(&mut self, proper_symlinks: bool) -> Result<()> {
        if proper_symlinks {
            writeln!(self.out, "u")?;
        } else {
            writeln!(self.out, "d\"..\"")?;
        }
        self.entries += 1;
        Ok(())
    }

    fn write_extra(&mut self, extra: &str) -> Result<()> {
        if extra.is_empty() {
            writeln!(self.out)?;
        } else if let Some(rest) = extra.strip_prefix('&') {
            writeln!(self.out, "#{}", rest)?;
        } else {
            writeln!(self.out, "{}", extra)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Current write position (flushes buffered output).
    pub fn pos(&mut self) -> Result<u64> {
        self.out.flush()?;
        Ok(self.out.get_mut().stream_position()?)
    }

    /// Rewind to `pos`, discarding an unwound subtree.
    pub fn rollback_to(&mut self, pos: u64) -> Result<()> {
        self.out.flush()?;
        self.out.get_mut().seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Flush, truncate trailing bytes past the write position and sync.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.out.flush()?;
        let file = self.out.get_mut();
        let pos = file.stream_position()?;
        file.set_len(pos)?;
        file.sync_all()?;
        Ok(self.path)
    }

    /// Abandon the stage file.
    pub fn discard(self) -> Result<()> {
        drop(self.out);
        std::fs::remove_file(&self.path).ok();
        Ok(())
    }
}

/// Alignment cursor over the previous run's list.
pub struct KeepCursor {
    list: Option<LastFileList>,
    /// Entries of the current root are carried forward.
    pub keep_files: bool,
    proper_symlinks: bool,
}

/// Saved emitter+cursor position for subtree rollback.
pub struct KeepState {
    cursor: Option<CursorState>,
}

impl KeepCursor {
    pub fn disabled() -> Self {
        Self {
            list: None,
            keep_files: false,
            proper_symlinks: true,
        }
    }

    /// Follow the previous list at `path` when it exists.
    pub fn open(path: &Path, proper_symlinks: bool) -> Result<Self> {
        Ok(Self {
            list: LastFileList::open(path)?,
            keep_files: false,
            proper_symlinks,
        })
    }

    pub fn following(&self) -> bool {
        self.list.is_some()
    }

    pub fn save_state(&self) -> KeepState {
        KeepState {
            cursor: self.list.as_ref().map(|l| l.save_state()),
        }
    }

    pub fn restore(&mut self, state: KeepState) -> Result<()> {
        if let (Some(list), Some(cursor)) = (self.list.as_mut(), state.cursor) {
            list.restore(cursor)?;
        }
        Ok(())
    }

    /// Copy cursor entries that sort before `(depth, name, isdir)`; a cursor
    /// entry equal to the new entry is stepped over without copying. With
    /// `finish` everything remaining is copied.
    pub fn add_from_last_upto(
        &mut self,
        out: &mut FileListWriter,
        name: &str,
        isdir: bool,
        depth: usize,
        finish: bool,
    ) -> Result<()> {
        let Some(list) = self.list.as_mut() else {
            return Ok(());
        };
        if !list.prime() {
            return Ok(());
        }

        loop {
            let item = match &list.item {
                Some(i) => i.clone(),
                None => return Ok(()),
            };

            if !finish
                && ((item.name.as_str() > name && item.isdir == isdir && depth == list.depth)
                    || depth > list.depth)
            {
                return Ok(());
            }

            if !finish && item.name == name && item.isdir == isdir && depth == list.depth {
                list.advance(false);
                return Ok(());
            }

            if self.keep_files {
                if item.isdir {
                    copy_dir_subtree(list, out, self.proper_symlinks)?;
                } else {
                    copy_entry(&item, out, self.proper_symlinks)?;
                }
            }

            if !list.advance(false) {
                return Ok(());
            }
        }
    }

    /// Copy cursor entries until the cursor is back at `depth` (used after
    /// recursion returns, before the closing marker).
    pub fn add_from_last_lift_depth(
        &mut self,
        out: &mut FileListWriter,
        depth: usize,
    ) -> Result<()> {
        let Some(list) = self.list.as_mut() else {
            return Ok(());
        };
        if !list.prime() {
            return Ok(());
        }

        while list.depth > depth {
            if self.keep_files {
                let item = list.item.clone().unwrap();
                if item.isdir {
                    copy_dir_subtree(list, out, self.proper_symlinks)?;
                } else {
                    copy_entry(&item, out, self.proper_symlinks)?;
                }
            }

            if !list.advance(false) {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Copy the current entry verbatim.
fn copy_entry(item: &ListEntry, out: &mut FileListWriter, proper_symlinks: bool) -> Result<()> {
    if item.is_close {
        return out.write_close(proper_symlinks);
    }

    let extra = extras_string(&item.extras);
    if item.isdir {
        out.write_dir(&item.name, item.has_change, item.change_indicator, &extra)
    } else {
        out.write_file(&item.name, item.size, item.change_indicator, &extra)
    }
}

/// Copy the current directory entry and its whole subtree verbatim, leaving
/// the cursor on the subtree's closing entry.
fn copy_dir_subtree(
    list: &mut LastFileList,
    out: &mut FileListWriter,
    proper_symlinks: bool,
) -> Result<()> {
    let curr_depth = list.depth;
    loop {
        let item = match &list.item {
            Some(i) => i.clone(),
            None => return Ok(()),
        };

        copy_entry(&item, out, proper_symlinks)?;

        if list.depth_next > curr_depth {
            if !list.advance(true) {
                return Ok(());
            }
        } else {
            return Ok(());
        }
    }
}

/// Re-encode parsed extras as `&k=v&…`.
pub fn extras_string(extras: &[(String, String)]) -> String {
    let mut s = String::new();
    for (k, v) in extras {
        s.push_str(&format!("&{}={}", k, escape_param(v)));
    }
    s
}
