//! Background data writer. Metadata images and changelog appends go through
//! a supervised worker so an fsync stall can never block the coordination
//! loop. The worker owns `.bgwriter.lock`, answers a heartbeat, and never
//! retries on its own - callers own retry policy. When the worker falls
//! silent for too long the master gives up and terminates itself: losing the
//! process is recoverable, silently losing mutations is not.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::error::{MasterError, Result};

pub const CHANGELOG_FILE: &str = "changelog.0.mfs";
pub const DOWNLOAD_TMP_FILE: &str = "metadata_download.tmp";
pub const LOCK_FILE: &str = ".bgwriter.lock";

/// Heartbeat silence after which the master terminates itself.
const DEAD_AFTER_SECONDS: u32 = 300;
const REPORT_EVERY_SECONDS: u32 = 50;

pub enum SaverCmd {
    Start { speed_limit: u32 },
    Write { offset: u64, data: Vec<u8>, crc: u32 },
    Finish,
    Changelog { version: u64, ts: u32, line: String },
    RotateLog,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaverEvent {
    Alive,
    /// Status for the oldest unanswered Start/Write/Finish: 1 ok, 0 failed.
    Done(u8),
    ChangelogAck(u32),
    Exited,
}

pub type DoneFn = Box<dyn FnOnce(i32) + Send>;

#[derive(Clone)]
pub struct BgSaverHandle {
    tx: Sender<SaverCmd>,
}

impl BgSaverHandle {
    pub fn send(&self, cmd: SaverCmd) -> bool {
        self.tx.send(cmd).is_ok()
    }

    pub fn changelog(&self, version: u64, ts: u32, line: &str) -> bool {
        self.send(SaverCmd::Changelog {
            version,
            ts,
            line: line.to_string(),
        })
    }

    pub fn rotatelog(&self) -> bool {
        self.send(SaverCmd::RotateLog)
    }
}

/// Parent-side supervision state.
pub struct SaverMonitor {
    handle: Option<BgSaverHandle>,
    events: Option<Receiver<SaverEvent>>,
    join: Option<thread::JoinHandle<()>>,
    pending: VecDeque<DoneFn>,
    started: Instant,
    pub last_activity: f64,
    last_check: f64,
    check_count: u32,
    last_report: u32,
    pub changelog_delay: u32,
    pub terminating: bool,
    term_delay: u8,
    pub dead: bool,
}

impl SaverMonitor {
    /// Forks off the worker thread. The data directory must already exist.
    pub fn spawn(data_dir: &Path, back_logs: u32) -> Result<Self> {
        let lock_path = data_dir.join(LOCK_FILE);
        let lf = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if !lock::try_lock(&lf) {
            return Err(MasterError::Config(format!(
                "bgsaver lock exists ({})",
                lock_path.display()
            )));
        }
        drop(lf); // the worker takes the lock itself

        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ev_tx, ev_rx) = mpsc::channel();
        let dir = data_dir.to_path_buf();
        let join = thread::Builder::new()
            .name("bgsaver".to_string())
            .spawn(move || worker(dir, back_logs, cmd_rx, ev_tx))
            .map_err(MasterError::Io)?;

        Ok(Self {
            handle: Some(BgSaverHandle { tx: cmd_tx }),
            events: Some(ev_rx),
            join: Some(join),
            pending: VecDeque::new(),
            started: Instant::now(),
            last_activity: 0.0,
            last_check: 0.0,
            check_count: 0,
            last_report: 0,
            changelog_delay: 0,
            terminating: false,
            term_delay: 0,
            dead: false,
        })
    }

    /// A monitor with no worker behind it; every request fails immediately.
    pub fn disabled() -> Self {
        Self {
            handle: None,
            events: None,
            join: None,
            pending: VecDeque::new(),
            started: Instant::now(),
            last_activity: 0.0,
            last_check: 0.0,
            check_count: 0,
            last_report: 0,
            changelog_delay: 0,
            terminating: false,
            term_delay: 0,
            dead: true,
        }
    }

    pub fn handle(&self) -> Option<BgSaverHandle> {
        if self.dead {
            None
        } else {
            self.handle.clone()
        }
    }

    fn send_or_fail(&mut self, cmd: SaverCmd, done: DoneFn) {
        let alive = !self.dead && self.handle.as_ref().map(|h| h.send(cmd)).unwrap_or(false);
        if alive {
            self.pending.push_back(done);
        } else {
            done(-1);
        }
    }

    /// START: the worker opens the download temp file exclusively.
    pub fn open(&mut self, speed_limit: u32, done: DoneFn) {
        self.send_or_fail(SaverCmd::Start { speed_limit }, done);
    }

    /// WRITE at an absolute offset; the crc guards the channel crossing.
    pub fn store(&mut self, offset: u64, data: Vec<u8>, crc: u32, done: DoneFn) {
        self.send_or_fail(SaverCmd::Write { offset, data, crc }, done);
    }

    /// FINISH: fsync and close.
    pub fn close_file(&mut self, done: DoneFn) {
        self.send_or_fail(SaverCmd::Finish, done);
    }

    /// Pumps worker events without blocking. Returns true when the master
    /// must terminate (worker died outside of shutdown).
    pub fn drain_events(&mut self, now_mono: f64) -> bool {
        if self.events.is_none() {
            return false;
        }
        let mut worker_exited = false;
        loop {
            let recv_result = self.events.as_ref().unwrap().try_recv();
            match recv_result {
                Ok(ev) => self.process(ev, now_mono, &mut worker_exited),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    worker_exited = true;
                    break;
                }
            }
        }
        if worker_exited && !self.dead {
            self.dead = true;
            self.handle = None;
            for done in self.pending.drain(..) {
                done(-1);
            }
            if !self.terminating {
                error!("connection lost with background data writer - exiting");
                return true;
            }
        }
        false
    }

    fn process(&mut self, ev: SaverEvent, now_mono: f64, worker_exited: &mut bool) {
        match ev {
            SaverEvent::Alive => self.last_activity = now_mono,
            SaverEvent::Done(status) => {
                if let Some(done) = self.pending.pop_front() {
                    done(status as i32);
                } else {
                    warn!("unexpected status packet from background data writer");
                }
            }
            SaverEvent::ChangelogAck(ts_ack) => {
                let now_wall = crate::runtime::wall_now();
                self.changelog_delay = if now_wall > ts_ack {
                    now_wall - ts_ack - 1
                } else {
                    0
                };
            }
            SaverEvent::Exited => *worker_exited = true,
        }
    }

    /// Blocking event fetch used by tests and by shutdown draining.
    pub fn next_event(&mut self, timeout: Duration) -> Option<SaverEvent> {
        let now_mono = self.started.elapsed().as_secs_f64();
        let ev = self.events.as_ref()?.recv_timeout(timeout).ok()?;
        let mut worker_exited = false;
        self.process(ev, now_mono, &mut worker_exited);
        if worker_exited {
            self.dead = true;
            self.handle = None;
        }
        Some(ev)
    }

    /// One-second health tick; returns true when the master must terminate.
    pub fn alive_check(&mut self, now_mono: f64) -> bool {
        if self.dead {
            return false;
        }
        if self.last_check + 5.0 < now_mono {
            // the loop itself stalled; do not blame the worker yet
            self.check_count = 0;
        } else if self.check_count < 5 {
            self.check_count += 1;
        }
        self.last_check = now_mono;

        if self.check_count >= 5 {
            let silent = now_mono - self.last_activity;
            if silent > (self.last_report + REPORT_EVERY_SECONDS) as f64 {
                self.last_report += REPORT_EVERY_SECONDS;
                if self.last_report < DEAD_AFTER_SECONDS {
                    warn!(
                        "background data writer is not responding (last ping received more than {} seconds ago)",
                        self.last_report
                    );
                } else {
                    error!(
                        "background data writer is not responding (last ping received more than {} seconds ago) - terminating",
                        self.last_report
                    );
                    return true;
                }
            } else if silent < 5.0 {
                self.last_report = 0;
            }
        }
        false
    }

    /// Shutdown: two quiet ticks, then TERMINATE goes out once.
    pub fn term_tick(&mut self) {
        self.term_delay += 1;
        if self.term_delay > 2 && !self.terminating {
            self.terminating = true;
            if let Some(h) = &self.handle {
                h.send(SaverCmd::Terminate);
            }
        }
    }

    pub fn can_exit(&self) -> bool {
        self.dead || self.last_report > 0
    }

    pub fn shutdown_join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

// ---------------------------------------------------------------------------
// worker side

fn worker(dir: PathBuf, back_logs: u32, rx: Receiver<SaverCmd>, tx: Sender<SaverEvent>) {
    let lock = match OpenOptions::new()
        .read(true)
        .write(true)
        .open(dir.join(LOCK_FILE))
    {
        Ok(f) => f,
        Err(e) => {
            error!("background data writer - can't open lockfile: {}", e);
            let _ = tx.send(SaverEvent::Exited);
            return;
        }
    };
    if !lock::try_lock(&lock) {
        error!("background data writer - can't get lock on lockfile");
        let _ = tx.send(SaverEvent::Exited);
        return;
    }

    let mut meta_fd: Option<File> = None;
    let mut log_fd: Option<File> = None;
    let mut bytes: u64 = 0;
    let mut start_time = Instant::now();
    let mut speed_limit: u32 = 0;
    let mut last_ack_ts: u32 = 0;
    let mut chlog_lost: u32 = 0;
    let started = Instant::now();
    let mut last_alive = -1.0f64;

    loop {
        let now = started.elapsed().as_secs_f64();
        if last_alive + 1.0 < now {
            if tx.send(SaverEvent::Alive).is_err() {
                break;
            }
            last_alive = now;
        }
        let cmd = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(cmd) => cmd,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match cmd {
            SaverCmd::Start { speed_limit: limit } => {
                speed_limit = limit;
                meta_fd = None;
                let status = match File::create(dir.join(DOWNLOAD_TMP_FILE)) {
                    Ok(f) => {
                        meta_fd = Some(f);
                        bytes = 0;
                        start_time = Instant::now();
                        1
                    }
                    Err(e) => {
                        error!("background data writer - error opening '{}': {}", DOWNLOAD_TMP_FILE, e);
                        0
                    }
                };
                finish_status(&dir, &tx, status);
            }
            SaverCmd::Write { offset, data, crc } => {
                let status = match meta_fd.as_ref() {
                    Some(f) => {
                        if crc != crc32fast::hash(&data) {
                            error!("background data writer - crc error (write packet)");
                            0
                        } else if let Err(e) = write_at(f, &data, offset) {
                            error!(
                                "background data writer - error writing '{}': {}",
                                DOWNLOAD_TMP_FILE, e
                            );
                            0
                        } else {
                            if speed_limit > 0 {
                                bytes += data.len() as u64;
                                let expected = bytes as f64 / speed_limit as f64;
                                let passed = start_time.elapsed().as_secs_f64();
                                if expected > passed {
                                    thread::sleep(Duration::from_secs_f64(expected - passed));
                                }
                            }
                            1
                        }
                    }
                    None => 0,
                };
                if status == 0 {
                    meta_fd = None;
                }
                finish_status(&dir, &tx, status);
            }
            SaverCmd::Finish => {
                let status = match meta_fd.take() {
                    Some(f) => match f.sync_all() {
                        Ok(()) => 1,
                        Err(e) => {
                            error!(
                                "background data writer - error syncing '{}': {}",
                                DOWNLOAD_TMP_FILE, e
                            );
                            0
                        }
                    },
                    None => 0,
                };
                finish_status(&dir, &tx, status);
            }
            SaverCmd::Changelog { version, ts, line } => {
                if log_fd.is_none() {
                    log_fd = OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(dir.join(CHANGELOG_FILE))
                        .map_err(|e| {
                            error!(
                                "background data writer - error opening '{}': {}",
                                CHANGELOG_FILE, e
                            );
                            e
                        })
                        .ok();
                }
                let mut status = 0u8;
                if let Some(f) = log_fd.as_mut() {
                    if writeln!(f, "{}: {}", version, line).is_ok() {
                        status = 1;
                    } else {
                        error!("background data writer - error writing '{}'", CHANGELOG_FILE);
                    }
                }
                if status == 1 {
                    if ts >= last_ack_ts {
                        last_ack_ts = ts;
                        let _ = tx.send(SaverEvent::ChangelogAck(ts));
                    }
                    chlog_lost = 0;
                } else {
                    if chlog_lost == 0 {
                        warn!("changelog lost !!!");
                    } else if chlog_lost == 100_000 {
                        warn!("next 100000 changelogs are lost !!!");
                        chlog_lost = 0;
                    }
                    chlog_lost += 1;
                }
            }
            SaverCmd::RotateLog => {
                if let Some(f) = log_fd.take() {
                    if let Err(e) = f.sync_all() {
                        error!("background data writer - error syncing '{}': {}", CHANGELOG_FILE, e);
                    }
                }
                rotate_changelogs(&dir, back_logs);
            }
            SaverCmd::Terminate => {
                info!("background data writer - terminating");
                if let Some(f) = log_fd.take() {
                    let _ = f.sync_all();
                }
                if meta_fd.take().is_some() {
                    info!("background data writer - removing unfinished metadata file");
                    let _ = std::fs::remove_file(dir.join(DOWNLOAD_TMP_FILE));
                }
                break;
            }
        }
    }
    lock::unlock(&lock);
    info!("background data writer - exiting");
    let _ = tx.send(SaverEvent::Exited);
}

fn finish_status(dir: &Path, tx: &Sender<SaverEvent>, status: u8) {
    if status == 0 {
        let _ = std::fs::remove_file(dir.join(DOWNLOAD_TMP_FILE));
    }
    let _ = tx.send(SaverEvent::Done(status));
}

/// Renames `changelog.N.mfs` up the chain, dropping the oldest.
pub fn rotate_changelogs(dir: &Path, back_logs: u32) {
    if back_logs > 0 {
        for i in (1..=back_logs).rev() {
            let from = dir.join(format!("changelog.{}.mfs", i - 1));
            let to = dir.join(format!("changelog.{}.mfs", i));
            if let Err(e) = std::fs::rename(&from, &to) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(
                        "error renaming '{}'->'{}': {}",
                        from.display(),
                        to.display(),
                        e
                    );
                }
            }
        }
    } else if let Err(e) = std::fs::remove_file(dir.join(CHANGELOG_FILE)) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("error deleting '{}': {}", CHANGELOG_FILE, e);
        }
    }
}

#[cfg(unix)]
fn write_at(f: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    f.write_all_at(data, offset)
}

#[cfg(not(unix))]
fn write_at(f: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0usize;
    while written < data.len() {
        written += f.seek_write(&data[written..], offset + written as u64)?;
    }
    Ok(())
}

#[cfg(unix)]
mod lock {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    pub fn try_lock(f: &File) -> bool {
        // advisory lock; released automatically when the fd closes
        unsafe { libc::flock(f.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
    }

    pub fn unlock(f: &File) {
        unsafe {
            libc::flock(f.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(not(unix))]
mod lock {
    use std::fs::File;

    pub fn try_lock(_f: &File) -> bool {
        true
    }

    pub fn unlock(_f: &File) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn wait_done(mon: &mut SaverMonitor) -> Option<u8> {
        for _ in 0..200 {
            match mon.next_event(Duration::from_millis(50)) {
                Some(SaverEvent::Done(st)) => return Some(st),
                Some(_) => continue,
                None => continue,
            }
        }
        None
    }

    #[test]
    fn write_then_finish_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        let mut mon = SaverMonitor::spawn(dir.path(), 2).unwrap();
        mon.open(0, Box::new(|_| {}));
        assert_eq!(wait_done(&mut mon), Some(1));

        let a = b"hello ".to_vec();
        let b = b"world".to_vec();
        mon.store(0, a.clone(), crc32fast::hash(&a), Box::new(|_| {}));
        assert_eq!(wait_done(&mut mon), Some(1));
        mon.store(6, b.clone(), crc32fast::hash(&b), Box::new(|_| {}));
        assert_eq!(wait_done(&mut mon), Some(1));
        mon.close_file(Box::new(|_| {}));
        assert_eq!(wait_done(&mut mon), Some(1));

        let content = std::fs::read(dir.path().join(DOWNLOAD_TMP_FILE)).unwrap();
        assert_eq!(content, b"hello world");
    }

    #[test]
    fn crc_mismatch_fails_and_drops_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut mon = SaverMonitor::spawn(dir.path(), 2).unwrap();
        let status = Arc::new(Mutex::new(None));
        let s2 = status.clone();
        mon.open(0, Box::new(|_| {}));
        assert_eq!(wait_done(&mut mon), Some(1));
        mon.store(
            0,
            b"data".to_vec(),
            0xBAD0BAD0,
            Box::new(move |st| *s2.lock().unwrap() = Some(st)),
        );
        assert_eq!(wait_done(&mut mon), Some(0));
        assert_eq!(*status.lock().unwrap(), Some(0));
        assert!(!dir.path().join(DOWNLOAD_TMP_FILE).exists());
    }

    #[test]
    fn changelog_appends_and_acks() {
        let dir = tempfile::tempdir().unwrap();
        let mut mon = SaverMonitor::spawn(dir.path(), 2).unwrap();
        let h = mon.handle().unwrap();
        assert!(h.changelog(17, 1234, "0|TEST()"));
        let mut acked = None;
        for _ in 0..200 {
            if let Some(SaverEvent::ChangelogAck(ts)) = mon.next_event(Duration::from_millis(50)) {
                acked = Some(ts);
                break;
            }
        }
        assert_eq!(acked, Some(1234));
        let text = std::fs::read_to_string(dir.path().join(CHANGELOG_FILE)).unwrap();
        assert_eq!(text, "17: 0|TEST()\n");
    }

    #[test]
    fn rotation_renames_chain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("changelog.0.mfs"), "zero").unwrap();
        std::fs::write(dir.path().join("changelog.1.mfs"), "one").unwrap();
        rotate_changelogs(dir.path(), 2);
        assert!(!dir.path().join("changelog.0.mfs").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("changelog.1.mfs")).unwrap(),
            "zero"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("changelog.2.mfs")).unwrap(),
            "one"
        );
    }

    #[test]
    fn terminate_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut mon = SaverMonitor::spawn(dir.path(), 2).unwrap();
        mon.open(0, Box::new(|_| {}));
        assert_eq!(wait_done(&mut mon), Some(1));
        mon.terminating = true;
        mon.handle().unwrap().send(SaverCmd::Terminate);
        let mut exited = false;
        for _ in 0..200 {
            if let Some(SaverEvent::Exited) = mon.next_event(Duration::from_millis(50)) {
                exited = true;
                break;
            }
        }
        assert!(exited);
        assert!(!dir.path().join(DOWNLOAD_TMP_FILE).exists());
        assert!(mon.can_exit());
        mon.shutdown_join();
    }
}
