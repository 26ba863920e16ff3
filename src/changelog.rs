//! Change-log: the ordered stream of metadata mutations. Every entry gets a
//! version from the metadata counter, goes to disk (through the background
//! saver by default), is broadcast to synchronised metaloggers in the same
//! call, and is kept in an in-memory ring so late joiners can catch up
//! without a full metadata download.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::bgsaver::BgSaverHandle;
use crate::error::{MasterError, Result};
use crate::metadata::Metadata;

pub const MAX_LOG_LINE_SIZE: usize = 200_000;
pub const OLD_CHANGES_BLOCK_SIZE: usize = 5000;
// accounting overhead per stored entry, matching the ring's bookkeeping cost
const ENTRY_OVERHEAD: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    Background,
    Async,
    Sync,
}

impl SaveMode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SaveMode::Async,
            2 => SaveMode::Sync,
            _ => SaveMode::Background,
        }
    }
}

/// Downstream fan-out of freshly persisted entries. Implemented by the
/// metalogger session set; tests plug in a recorder.
pub trait LogBroadcast {
    fn broadcast_logstring(&mut self, version: u64, data: &[u8]);
    fn broadcast_logrotate(&mut self);
    /// Lowest changelog version some delayed receiver still needs;
    /// `current` when everyone is in sync.
    fn min_version(&self, current: u64) -> u64;
}

/// Null broadcast used before the metalogger module is wired up.
pub struct NoBroadcast;

impl LogBroadcast for NoBroadcast {
    fn broadcast_logstring(&mut self, _version: u64, _data: &[u8]) {}
    fn broadcast_logrotate(&mut self) {}
    fn min_version(&self, current: u64) -> u64 {
        current
    }
}

struct Entry {
    version: u64,
    /// Entry text, NUL-terminated the way receivers expect it.
    data: Vec<u8>,
}

struct Block {
    entries: Vec<Entry>,
    size: u64,
    min_timestamp: u32,
    min_version: u64,
}

pub struct Changelog {
    dir: PathBuf,
    blocks: VecDeque<Block>,
    total_size: u64,
    last_change: f64,
    current_file: Option<File>,
    pub save_mode: SaveMode,
    pub back_logs: u32,
    pub preserve_seconds: u32,
    pub max_size: u64,
    saver: Option<BgSaverHandle>,
}

impl Changelog {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            blocks: VecDeque::new(),
            total_size: 0,
            last_change: 0.0,
            current_file: None,
            save_mode: SaveMode::Background,
            back_logs: 50,
            preserve_seconds: 5000,
            max_size: 500 * 1024 * 1024,
            saver: None,
        }
    }

    pub fn reload(&mut self, cfg: &crate::config::Config) {
        self.save_mode = SaveMode::from_u8(cfg.changelog_save_mode);
        self.back_logs = cfg.back_logs;
        self.preserve_seconds = cfg.changelog_preserve_seconds;
        self.max_size = cfg.changelog_max_bytes();
    }

    pub fn set_saver(&mut self, saver: Option<BgSaverHandle>) {
        self.saver = saver;
    }

    /// Appends one mutation record: assigns the version, persists the line,
    /// broadcasts it, and stores it in the ring. The only hard failure is a
    /// background save mode with no live saver - that would silently lose
    /// the mutation, which the caller must treat as fatal.
    pub fn append(
        &mut self,
        meta: &mut Metadata,
        bcast: &mut dyn LogBroadcast,
        now_wall: u32,
        now_mono: f64,
        text: &str,
    ) -> Result<u64> {
        let mut text = text;
        if text.len() > MAX_LOG_LINE_SIZE {
            let mut cut = MAX_LOG_LINE_SIZE;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text = &text[..cut];
        }
        let version = meta.version_inc();

        match self.save_mode {
            SaveMode::Background => {
                let ok = self
                    .saver
                    .as_ref()
                    .map(|h| h.changelog(version, now_wall, text))
                    .unwrap_or(false);
                if !ok {
                    warn!("problems with data write subprocess detected - changelog line lost - force termination");
                    return Err(MasterError::SaverUnavailable);
                }
            }
            SaveMode::Async | SaveMode::Sync => {
                if self.current_file.is_none() {
                    self.current_file = OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(self.dir.join(crate::bgsaver::CHANGELOG_FILE))
                        .ok();
                    if self.current_file.is_none() {
                        warn!("lost change {}: {}", version, text);
                    }
                }
                if let Some(f) = self.current_file.as_mut() {
                    let _ = writeln!(f, "{}: {}", version, text);
                    let _ = f.flush();
                    if self.save_mode == SaveMode::Sync {
                        let _ = f.sync_data();
                    }
                }
            }
        }

        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        self.store_logstring(meta, bcast, version, data, now_wall);
        self.last_change = now_mono;
        Ok(version)
    }

    fn store_logstring(
        &mut self,
        meta: &Metadata,
        bcast: &mut dyn LogBroadcast,
        version: u64,
        data: Vec<u8>,
        now: u32,
    ) {
        bcast.broadcast_logstring(version, &data);

        if self.preserve_seconds == 0 {
            self.blocks.clear();
            self.total_size = 0;
            return;
        }
        let need_block = match self.blocks.back() {
            None => true,
            Some(b) => b.entries.len() >= OLD_CHANGES_BLOCK_SIZE,
        };
        if need_block {
            self.blocks.push_back(Block {
                entries: Vec::with_capacity(OLD_CHANGES_BLOCK_SIZE.min(64)),
                size: 0,
                min_timestamp: now,
                min_version: version,
            });
            self.trim(meta, bcast, now);
        }
        let entry_size = data.len() as u64 + ENTRY_OVERHEAD;
        let block = self.blocks.back_mut().expect("block just ensured");
        block.entries.push(Entry { version, data });
        block.size += entry_size;
        self.total_size += entry_size;
    }

    /// Drops head blocks no receiver can still need, once they are old
    /// enough or the ring outgrew its byte budget.
    fn trim(&mut self, meta: &Metadata, bcast: &dyn LogBroadcast, now: u32) {
        let keep = meta.chlog_keep_version().min(bcast.min_version(meta.version()));
        while self.blocks.len() >= 2 {
            let next = &self.blocks[1];
            let expired = next.min_timestamp.saturating_add(self.preserve_seconds) < now;
            if next.min_version < keep && (expired || self.total_size > self.max_size) {
                let head = self.blocks.pop_front().expect("len checked");
                self.total_size -= head.size;
            } else {
                break;
            }
        }
    }

    /// Replays stored entries starting at `version`, up to `limit` of them.
    /// Returns how many were delivered.
    pub fn get_old_changes(
        &self,
        version: u64,
        limit: u32,
        send: &mut dyn FnMut(u64, &[u8]),
    ) -> u32 {
        let mut sent = 0u32;
        let mut start = false;
        for (i, block) in self.blocks.iter().enumerate() {
            let next_min = self.blocks.get(i + 1).map(|b| b.min_version);
            if block.min_version <= version && next_min.map(|m| m > version).unwrap_or(true) {
                start = true;
            }
            if start {
                for e in &block.entries {
                    if version <= e.version {
                        if sent < limit {
                            send(e.version, &e.data);
                            sent += 1;
                        } else {
                            return sent;
                        }
                    }
                }
            }
        }
        sent
    }

    /// Oldest version still held in memory; the current metadata version
    /// when the ring is empty.
    pub fn min_version(&self, meta: &Metadata) -> u64 {
        self.blocks
            .front()
            .map(|b| b.min_version)
            .unwrap_or_else(|| meta.version())
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn blocks_held(&self) -> usize {
        self.blocks.len()
    }

    pub fn oldest_timestamp(&self) -> Option<u32> {
        self.blocks.front().map(|b| b.min_timestamp)
    }

    /// Rotates `changelog.N.mfs` files. Background rotation is preferred;
    /// any trouble with the saver falls back to doing it inline.
    pub fn rotate(&mut self, mut foreground: bool, broadcast: bool, bcast: &mut dyn LogBroadcast) {
        if self.save_mode != SaveMode::Background {
            foreground = true;
        }
        if !foreground {
            let ok = self.saver.as_ref().map(|h| h.rotatelog()).unwrap_or(false);
            if !ok {
                foreground = true;
            }
        }
        if foreground {
            if let Some(f) = self.current_file.take() {
                if self.save_mode == SaveMode::Sync {
                    let _ = f.sync_data();
                }
            }
            crate::bgsaver::rotate_changelogs(&self.dir, self.back_logs);
        }
        if broadcast {
            bcast.broadcast_logrotate();
        }
    }

    /// Keeps the downstream stream alive: after 30 s without any mutation an
    /// IDLE record is appended so receivers can tell silence from loss.
    pub fn send_idle(
        &mut self,
        meta: &mut Metadata,
        bcast: &mut dyn LogBroadcast,
        now_wall: u32,
        now_mono: f64,
    ) -> Result<()> {
        if self.last_change + 30.0 <= now_mono {
            self.append(meta, bcast, now_wall, now_mono, &format!("{}|IDLE()", now_wall))?;
        }
        Ok(())
    }

    pub fn info(&self, meta: &Metadata, out: &mut String) {
        use std::fmt::Write as _;
        let _ = writeln!(out, "[changelog]");
        match self.blocks.front() {
            Some(b) => {
                let _ = writeln!(out, "oldest_metaversion: {}", b.min_version);
                let _ = writeln!(out, "oldest_timestamp: {}", b.min_timestamp);
                let _ = writeln!(out, "total_size: {}", self.total_size);
            }
            None => {
                let _ = writeln!(out, "changelog memory is empty");
            }
        }
        let keep = meta.chlog_keep_version();
        if keep < meta.version() {
            let _ = writeln!(out, "min_changelog_kept_for_metadata_sending: {}", keep);
        } else {
            let _ = writeln!(out, "min_changelog_kept_for_metadata_sending: -");
        }
    }
}

/// Escapes a name for embedding in a changelog record: control bytes and the
/// record delimiters `,%()` become `%XX`.
pub fn escape_name(name: &[u8]) -> String {
    let mut out = String::with_capacity(name.len());
    for &c in name {
        if c < 32 || c >= 127 || c == b',' || c == b'%' || c == b'(' || c == b')' {
            out.push('%');
            out.push(char::from_digit((c >> 4) as u32, 16).expect("nibble").to_ascii_uppercase());
            out.push(char::from_digit((c & 0xF) as u32, 16).expect("nibble").to_ascii_uppercase());
        } else {
            out.push(c as char);
        }
    }
    out
}

/// First entry version of a changelog file, 0 when unreadable or malformed.
pub fn find_first_version(path: &Path) -> u64 {
    let mut buf = [0u8; 50];
    let Ok(mut f) = File::open(path) else { return 0 };
    let Ok(n) = f.read(&mut buf) else { return 0 };
    parse_version_prefix(&buf[..n]).unwrap_or(0)
}

/// Last entry version of a changelog file, scanning backwards from the end.
pub fn find_last_version(path: &Path) -> u64 {
    let Ok(mut f) = File::open(path) else { return 0 };
    let Ok(meta) = f.metadata() else { return 0 };
    let size = meta.len();
    if size == 0 {
        return 0;
    }
    // read a bounded tail; lines are capped well below this
    let tail = size.min((MAX_LOG_LINE_SIZE + 64) as u64);
    if f.seek(SeekFrom::Start(size - tail)).is_err() {
        return 0;
    }
    let mut buf = Vec::with_capacity(tail as usize);
    if f.read_to_end(&mut buf).is_err() {
        return 0;
    }
    if buf.last() != Some(&b'\n') {
        return 0; // garbage at the end of file
    }
    let body = &buf[..buf.len() - 1];
    let line_start = body
        .iter()
        .rposition(|&c| c == b'\n')
        .map(|p| p + 1)
        .unwrap_or(0);
    parse_version_prefix(&body[line_start..]).unwrap_or(0)
}

fn parse_version_prefix(line: &[u8]) -> Option<u64> {
    let mut v: u64 = 0;
    let mut digits = 0;
    for &c in line {
        match c {
            b'0'..=b'9' => {
                v = v.checked_mul(10)?.checked_add((c - b'0') as u64)?;
                digits += 1;
            }
            b':' if digits > 0 => return Some(v),
            _ => return None,
        }
    }
    None
}

/// Recognises the changelog file names the master and metaloggers produce.
pub fn check_name(name: &str) -> bool {
    for prefix in ["changelog.", "changelog_ml.", "changelog_ml_back."] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if let Some(num) = rest.strip_suffix(".mfs") {
                return !num.is_empty() && num.bytes().all(|c| c.is_ascii_digit());
            }
        }
    }
    false
}
