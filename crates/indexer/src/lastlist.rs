//! Streamed cursor over the previous run's file list
//!
//! The previous list is read as a forward cursor with an implicit depth
//! counter: descending on `d"name"`, ascending on `d".."` / `u`. The
//! emitter aligns this cursor with the entries it writes so `KeepFiles`
//! roots carry forward entries the filesystem no longer has.

use anyhow::{Context, Result};
use snapdex_core::escape::unescape_param;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// One parsed line of a file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub isdir: bool,
    /// `d".."` or `u`.
    pub is_close: bool,
    pub size: i64,
    pub change_indicator: i64,
    /// Directory entries may omit size/change.
    pub has_change: bool,
    pub extras: Vec<(String, String)>,
}

impl ListEntry {
    fn close() -> Self {
        Self {
            name: "..".to_string(),
            isdir: true,
            is_close: true,
            size: 0,
            change_indicator: 0,
            has_change: false,
            extras: Vec::new(),
        }
    }
}

/// Parse one line of the list format. Returns `None` for blank/garbage
/// lines.
pub fn parse_line(line: &str) -> Option<ListEntry> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line == "u" {
        return Some(ListEntry::close());
    }

    let isdir = match line.chars().next()? {
        'f' => false,
        'd' => true,
        _ => return None,
    };

    let bytes = line.as_bytes();
    if bytes.len() < 3 || bytes[1] != b'"' {
        return None;
    }

    // Name with \" and \\ escapes.
    let mut name_bytes = Vec::new();
    let mut i = 2;
    loop {
        if i >= bytes.len() {
            return None;
        }
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                name_bytes.push(bytes[i + 1]);
                i += 2;
            }
            b'"' => {
                i += 1;
                break;
            }
            c => {
                name_bytes.push(c);
                i += 1;
            }
        }
    }
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    if isdir && name == ".." {
        return Some(ListEntry::close());
    }

    let rest = &line[i..];
    let (meta, extras_raw) = match rest.find('#') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };

    let mut size = 0i64;
    let mut change_indicator = 0i64;
    let mut has_change = false;
    let mut fields = meta.split_whitespace();
    if let Some(s) = fields.next() {
        size = s.parse().unwrap_or(0);
        if let Some(c) = fields.next() {
            change_indicator = c.parse().unwrap_or(0);
            has_change = true;
        }
    }

    let mut extras = Vec::new();
    if !extras_raw.is_empty() {
        for kv in extras_raw.split('&') {
            match kv.split_once('=') {
                Some((k, v)) => extras.push((k.to_string(), unescape_param(v))),
                None => extras.push((kv.to_string(), String::new())),
            }
        }
    }

    Some(ListEntry {
        name,
        isdir,
        is_close: false,
        size,
        change_indicator,
        has_change,
        extras,
    })
}

/// Saved cursor position for rollback of unwound subtrees.
#[derive(Debug, Clone)]
pub struct CursorState {
    pos: u64,
    item: Option<ListEntry>,
    depth: usize,
    depth_next: usize,
    finished: bool,
}

pub struct LastFileList {
    reader: BufReader<File>,
    /// Byte offset of the next unread line.
    pos: u64,
    pub item: Option<ListEntry>,
    pub depth: usize,
    pub depth_next: usize,
    finished: bool,
}

impl LastFileList {
    /// Open the previous list; `Ok(None)` when it does not exist.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Some(Self {
            reader: BufReader::new(file),
            pos: 0,
            item: None,
            depth: 0,
            depth_next: 0,
            finished: false,
        }))
    }

    /// Advance to the next entry; with `with_up == false` close markers are
    /// skipped (depth bookkeeping still applies). Returns false at the end.
    pub fn advance(&mut self, with_up: bool) -> bool {
        loop {
            if self.finished {
                self.item = None;
                return false;
            }

            let mut line = String::new();
            let read = match self.reader.read_line(&mut line) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Error reading from last file list: {}", e);
                    0
                }
            };

            if read == 0 {
                self.finished = true;
                self.item = None;
                return false;
            }
            self.pos += read as u64;

            let entry = match parse_line(&line) {
                Some(e) => e,
                None => continue,
            };

            self.depth = self.depth_next;
            if entry.is_close {
                self.depth_next = self.depth_next.saturating_sub(1);
            } else if entry.isdir {
                self.depth_next += 1;
            }

            if !with_up && entry.is_close {
                continue;
            }

            self.item = Some(entry);
            return true;
        }
    }

    /// Ensure an item is loaded; false when the list is exhausted.
    pub fn prime(&mut self) -> bool {
        if self.item.is_some() {
            return true;
        }
        self.advance(false)
    }

    pub fn save_state(&self) -> CursorState {
        CursorState {
            pos: self.pos,
            item: self.item.clone(),
            depth: self.depth,
            depth_next: self.depth_next,
            finished: self.finished,
        }
    }

    pub fn restore(&mut self, state: CursorState) -> Result<()> {
        self.reader.seek(SeekFrom::Start(state.pos))?;
        self.pos = state.pos;
        self.item = state.item;
        self.depth = state.depth;
        self.depth_next = state.depth_next;
        self.finished = state.finished;
        Ok(())
    }
}
