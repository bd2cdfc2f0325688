//! Binary control records
//!
//! The embedding service hands the controller length-delimited binary
//! records: one action byte followed by typed fields (strings are u32
//! length-prefixed UTF-8, integers little-endian). Replies travel back as
//! UTF-8 strings on the per-message channel.

use anyhow::{bail, Result};

pub const ACTION_START_FULL_FILE_BACKUP: u8 = 0;
pub const ACTION_START_INCR_FILE_BACKUP: u8 = 1;
pub const ACTION_CREATE_SHADOWCOPY: u8 = 2;
pub const ACTION_RELEASE_SHADOWCOPY: u8 = 3;
pub const ACTION_LOOKUP_SHADOWCOPY: u8 = 4;
pub const ACTION_UPDATE_CBT: u8 = 7;
pub const ACTION_STOP: u8 = 8;
pub const ACTION_GET_LOG: u8 = 9;
pub const ACTION_PING_SHADOWCOPY: u8 = 10;
pub const ACTION_REFERENCE_SHADOWCOPY: u8 = 11;
pub const ACTION_SNAPSHOT_CBT: u8 = 12;

/// Parsed controller request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRecord {
    StartFileBackup {
        full: bool,
        start_token: String,
        group: i32,
        flags: u32,
        clientsubname: String,
        sha_version: i32,
        running_jobs: i32,
        async_index: bool,
        async_ticket: String,
    },
    Shadowcopy {
        reference: bool,
        logical_dir: String,
        start_token: String,
        image_backup: u8,
        fileserv: bool,
        clientsubname: String,
        running_jobs: i32,
    },
    ReleaseShadowcopy {
        logical_dir: String,
        start_token: String,
        image_backup: u8,
        save_id: i64,
        clientsubname: String,
        issues: i32,
    },
    LookupShadowcopy {
        save_id: i64,
    },
    PingShadowcopy {
        logical_dir: String,
        start_token: String,
        image_backup: u8,
        clientsubname: String,
    },
    UpdateCbt,
    SnapshotCbt {
        volume: String,
    },
    GetLog,
    Stop,
}

impl ControlRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = RecordReader::new(data);
        let action = r.get_u8()?;

        match action {
            ACTION_START_FULL_FILE_BACKUP | ACTION_START_INCR_FILE_BACKUP => {
                Ok(ControlRecord::StartFileBackup {
                    full: action == ACTION_START_FULL_FILE_BACKUP,
                    start_token: r.get_str()?,
                    group: r.get_i32()?,
                    flags: r.get_u32()?,
                    clientsubname: r.get_str()?,
                    sha_version: r.get_i32()?,
                    running_jobs: r.get_i32().unwrap_or(2),
                    async_index: r.get_u8().unwrap_or(0) == 1,
                    async_ticket: r.get_str().unwrap_or_default(),
                })
            }
            ACTION_CREATE_SHADOWCOPY | ACTION_REFERENCE_SHADOWCOPY => {
                Ok(ControlRecord::Shadowcopy {
                    reference: action == ACTION_REFERENCE_SHADOWCOPY,
                    logical_dir: r.get_str()?,
                    start_token: r.get_str()?,
                    image_backup: r.get_u8()?,
                    fileserv: r.get_u8()? != 0,
                    clientsubname: r.get_str().unwrap_or_default(),
                    running_jobs: r.get_i32().unwrap_or(2),
                })
            }
            ACTION_RELEASE_SHADOWCOPY => Ok(ControlRecord::ReleaseShadowcopy {
                logical_dir: r.get_str()?,
                start_token: r.get_str()?,
                image_backup: r.get_u8()?,
                save_id: r.get_i64().unwrap_or(-1),
                clientsubname: r.get_str().unwrap_or_default(),
                issues: r.get_i32().unwrap_or(0),
            }),
            ACTION_LOOKUP_SHADOWCOPY => Ok(ControlRecord::LookupShadowcopy {
                save_id: r.get_i64()?,
            }),
            ACTION_PING_SHADOWCOPY => Ok(ControlRecord::PingShadowcopy {
                logical_dir: r.get_str()?,
                start_token: r.get_str()?,
                image_backup: r.get_u8()?,
                clientsubname: r.get_str().unwrap_or_default(),
            }),
            ACTION_UPDATE_CBT => Ok(ControlRecord::UpdateCbt),
            ACTION_SNAPSHOT_CBT => Ok(ControlRecord::SnapshotCbt {
                volume: r.get_str()?,
            }),
            ACTION_GET_LOG => Ok(ControlRecord::GetLog),
            ACTION_STOP => Ok(ControlRecord::Stop),
            other => bail!("unknown control action {}", other),
        }
    }

    /// Encode back to the wire form (used by the embedding service and by
    /// tests).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        match self {
            ControlRecord::StartFileBackup {
                full,
                start_token,
                group,
                flags,
                clientsubname,
                sha_version,
                running_jobs,
                async_index,
                async_ticket,
            } => {
                w.put_u8(if *full {
                    ACTION_START_FULL_FILE_BACKUP
                } else {
                    ACTION_START_INCR_FILE_BACKUP
                });
                w.put_str(start_token);
                w.put_i32(*group);
                w.put_u32(*flags);
                w.put_str(clientsubname);
                w.put_i32(*sha_version);
                w.put_i32(*running_jobs);
                w.put_u8(u8::from(*async_index));
                w.put_str(async_ticket);
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
                w.put_u8(if *reference {
                    ACTION_REFERENCE_SHADOWCOPY
                } else {
                    ACTION_CREATE_SHADOWCOPY
                });
                w.put_str(logical_dir);
                w.put_str(start_token);
                w.put_u8(*image_backup);
                w.put_u8(u8::from(*fileserv));
                w.put_str(clientsubname);
                w.put_i32(*running_jobs);
            }
            ControlRecord::ReleaseShadowcopy {
                logical_dir,
                start_token,
                image_backup,
                save_id,
                clientsubname,
                issues,
            } => {
                w.put_u8(ACTION_RELEASE_SHADOWCOPY);
                w.put_str(logical_dir);
                w.put_str(start_token);
                w.put_u8(*image_backup);
                w.put_i64(*save_id);
                w.put_str(clientsubname);
                w.put_i32(*issues);
            }
            ControlRecord::LookupShadowcopy { save_id } => {
                w.put_u8(ACTION_LOOKUP_SHADOWCOPY);
                w.put_i64(*save_id);
            }
            ControlRecord::PingShadowcopy {
                logical_dir,
                start_token,
                image_backup,
                clientsubname,
            } => {
                w.put_u8(ACTION_PING_SHADOWCOPY);
                w.put_str(logical_dir);
                w.put_str(start_token);
                w.put_u8(*image_backup);
                w.put_str(clientsubname);
            }
            ControlRecord::UpdateCbt => w.put_u8(ACTION_UPDATE_CBT),
            ControlRecord::SnapshotCbt { volume } => {
                w.put_u8(ACTION_SNAPSHOT_CBT);
                w.put_str(volume);
            }
            ControlRecord::GetLog => w.put_u8(ACTION_GET_LOG),
            ControlRecord::Stop => w.put_u8(ACTION_STOP),
        }
        w.into_inner()
    }
}

struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            bail!("control record truncated at byte {}", self.pos);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

struct RecordWriter {
    data: Vec<u8>,
}

impl RecordWriter {
    fn new() -> Self {
        Self { data: Vec::new() }
    }

    fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, v: &str) {
        self.put_u32(v.len() as u32);
        self.data.extend_from_slice(v.as_bytes());
    }

    fn into_inner(self) -> Vec<u8> {
        self.data
    }
}
