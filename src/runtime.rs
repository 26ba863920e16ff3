//! The daemon's cooperative loop: a timer wheel with monotonic catch-up,
//! signal-driven reload/shutdown, and the shutdown ordering (want-exit, then
//! poll can-exit until unanimous, then destruct).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{MasterError, Result};
use crate::master::{Clock, Master};
use crate::metadata::ChunkRegistry;

pub const LOCK_FILE: &str = "chunkmasterd.lock";
pub const INFO_FILE: &str = "chunkmaster.info.txt";

/// Wall clock in whole seconds since the epoch.
pub fn wall_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Wall clock in microseconds.
pub fn utime_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// timer wheel

/// At most this many late firings are caught up per tick; a wheel that falls
/// further behind realigns instead of replaying history.
const MAX_LATE_RUNS: u32 = 10;
/// A forward wall-clock jump beyond this is treated as a clock step.
const JUMP_US: u64 = 5_000_000;

struct TimerEntry<T> {
    period_us: u64,
    offset_us: u64,
    next_us: u64,
    task: T,
}

pub struct TimerWheel<T> {
    entries: Vec<TimerEntry<T>>,
    prev_us: u64,
}

impl<T: Copy> TimerWheel<T> {
    pub fn new(now_us: u64) -> Self {
        Self {
            entries: Vec::new(),
            prev_us: now_us,
        }
    }

    pub fn register(&mut self, now_us: u64, period_s: u64, offset_s: u64, task: T) {
        let period_us = period_s.max(1) * 1_000_000;
        let offset_us = offset_s * 1_000_000;
        let mut next_us = (now_us / period_us) * period_us + offset_us;
        while next_us < now_us {
            next_us += period_us;
        }
        self.entries.push(TimerEntry {
            period_us,
            offset_us,
            next_us,
            task,
        });
    }

    /// Advances the wheel to `now_us`, appending due tasks in registration
    /// order (repeated for catch-up, capped).
    pub fn advance(&mut self, now_us: u64, fired: &mut Vec<T>) {
        if now_us < self.prev_us {
            // clock went backward: keep each entry's remaining wait so
            // nothing fires early
            for e in self.entries.iter_mut() {
                let mut remaining = e.next_us.saturating_sub(self.prev_us);
                if remaining > e.period_us {
                    remaining = e.period_us;
                }
                e.next_us = (now_us / e.period_us) * e.period_us + e.offset_us;
                while e.next_us <= now_us + remaining {
                    e.next_us += e.period_us;
                }
            }
        } else if now_us > self.prev_us + JUMP_US {
            // clock jumped forward: realign without replaying the gap
            for e in self.entries.iter_mut() {
                e.next_us = (now_us / e.period_us) * e.period_us + e.offset_us;
                while now_us >= e.next_us {
                    e.next_us += e.period_us;
                }
            }
        }
        for e in self.entries.iter_mut() {
            if now_us >= e.next_us {
                let mut count = 0;
                while now_us >= e.next_us && count < MAX_LATE_RUNS {
                    fired.push(e.task);
                    e.next_us += e.period_us;
                    count += 1;
                }
                if now_us >= e.next_us {
                    e.next_us = (now_us / e.period_us) * e.period_us + e.offset_us;
                    while now_us >= e.next_us {
                        e.next_us += e.period_us;
                    }
                }
            }
        }
        self.prev_us = now_us;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Second,
    TenSecond,
    Minute,
    RemoveUnused,
    Hourly,
}

// ---------------------------------------------------------------------------
// daemon lock file

/// Takes the daemon lock and records our pid in it.
pub fn acquire_daemon_lock(data_path: &Path) -> Result<File> {
    let path = data_path.join(LOCK_FILE);
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    if !try_lock(&f) {
        return Err(MasterError::Config(format!(
            "daemon already running (lock held on {})",
            path.display()
        )));
    }
    f.set_len(0)?;
    writeln!(f, "{}", std::process::id())?;
    f.sync_all()?;
    Ok(f)
}

/// Pid recorded in the lock file, if any.
pub fn read_daemon_pid(data_path: &Path) -> Option<i32> {
    let mut s = String::new();
    File::open(data_path.join(LOCK_FILE))
        .ok()?
        .read_to_string(&mut s)
        .ok()?;
    s.trim().parse().ok()
}

/// True when some process still holds the daemon lock.
pub fn lock_is_held(data_path: &Path) -> bool {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .open(data_path.join(LOCK_FILE))
    {
        Ok(f) => {
            if try_lock(&f) {
                unlock(&f);
                false
            } else {
                true
            }
        }
        Err(_) => false,
    }
}

#[cfg(unix)]
fn try_lock(f: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    unsafe { libc::flock(f.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(unix)]
fn unlock(f: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(f.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock(_f: &File) -> bool {
    true
}

#[cfg(not(unix))]
fn unlock(_f: &File) {}

// ---------------------------------------------------------------------------
// the loop

pub struct Runtime {
    pub master: Arc<Mutex<Master>>,
    config_path: Option<PathBuf>,
    _lock: File,
}

impl Runtime {
    /// Builds the full daemon: lock file, background saver, listeners.
    pub async fn start(cfg: Config, config_path: Option<PathBuf>) -> Result<Self> {
        std::fs::create_dir_all(&cfg.data_path)?;
        let lock = acquire_daemon_lock(&cfg.data_path)?;
        let saver = crate::bgsaver::SaverMonitor::spawn(&cfg.data_path, cfg.back_logs)?;
        let mut master = Master::new(cfg, Box::new(ChunkRegistry::new()), Clock::real())?;
        master.attach_saver(saver);
        let master = Arc::new(Mutex::new(master));
        crate::net::spawn_listeners(master.clone()).await?;
        Ok(Self {
            master,
            config_path,
            _lock: lock,
        })
    }

    /// Serves until terminated. SIGHUP reloads, SIGUSR1 dumps info,
    /// SIGTERM/SIGINT (or an internal fatal condition) wind the loop down.
    pub async fn serve(self) -> Result<()> {
        let mut wheel = TimerWheel::new(utime_now());
        let now = utime_now();
        wheel.register(now, 1, 0, Task::Second);
        wheel.register(now, 10, 0, Task::TenSecond);
        wheel.register(now, 60, 0, Task::Minute);
        wheel.register(now, 600, 300, Task::RemoveUnused);
        wheel.register(now, 3600, 0, Task::Hourly);

        #[cfg(unix)]
        let (mut sigterm, mut sigint, mut sighup, mut sigusr1) = {
            use tokio::signal::unix::{signal, SignalKind};
            (
                signal(SignalKind::terminate())?,
                signal(SignalKind::interrupt())?,
                signal(SignalKind::hangup())?,
                signal(SignalKind::user_defined1())?,
            )
        };

        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut fired: Vec<Task> = Vec::new();
        let mut last_turn = utime_now();

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = tick.tick() => {}
                _ = sigterm.recv() => {
                    info!("terminate signal received");
                    self.master.lock().want_exit();
                }
                _ = sigint.recv() => {
                    info!("terminate signal received");
                    self.master.lock().want_exit();
                }
                _ = sighup.recv() => {
                    self.reload();
                }
                _ = sigusr1.recv() => {
                    self.dump_info();
                }
            }
            #[cfg(not(unix))]
            tokio::select! {
                _ = tick.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("terminate signal received");
                    self.master.lock().want_exit();
                }
            }

            let now_us = utime_now();
            if now_us > last_turn + 5_000_000 {
                let late = now_us - last_turn;
                warn!(
                    "long loop detected ({}.{:06}s)",
                    late / 1_000_000,
                    late % 1_000_000
                );
            }
            last_turn = now_us;

            fired.clear();
            wheel.advance(now_us, &mut fired);
            let mut m = self.master.lock();
            m.each_loop();
            for t in fired.drain(..) {
                match t {
                    Task::Second => m.second_tick(),
                    Task::TenSecond => m.ten_second_tick(),
                    Task::Minute => m.minute_tick(),
                    Task::RemoveUnused => m.remove_unused_tick(),
                    Task::Hourly => m.hourly_tick(),
                }
            }
            if m.exit_requested {
                m.want_exit();
            }
            if m.exiting && m.can_exit() {
                m.destruct();
                info!("exited");
                return Ok(());
            }
        }
    }

    fn reload(&self) {
        let Some(path) = self.config_path.as_deref() else {
            warn!("no configuration file to reload");
            return;
        };
        match Config::load(path) {
            Ok(cfg) => self.master.lock().reload(cfg),
            Err(e) => warn!("config reload failed: {}", e),
        }
    }

    fn dump_info(&self) {
        let (dump, dir) = {
            let m = self.master.lock();
            (m.info_dump(), m.cfg.data_path.clone())
        };
        let path = dir.join(INFO_FILE);
        match std::fs::write(&path, dump) {
            Ok(()) => info!("info dumped to {}", path.display()),
            Err(e) => warn!("can't write info dump: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fired_for(wheel: &mut TimerWheel<u8>, now: u64) -> Vec<u8> {
        let mut v = Vec::new();
        wheel.advance(now, &mut v);
        v
    }

    #[test]
    fn fires_on_schedule_with_offset() {
        let start = 1_000_000_000_u64; // an arbitrary aligned instant
        let mut w = TimerWheel::new(start);
        w.register(start, 2, 1, 7u8);
        // next fire at the next (2s + 1s offset) boundary
        assert!(fired_for(&mut w, start + 500_000).is_empty());
        let v = fired_for(&mut w, start + 1_000_000);
        assert_eq!(v, vec![7]);
        assert!(fired_for(&mut w, start + 1_500_000).is_empty());
        assert_eq!(fired_for(&mut w, start + 3_000_000), vec![7]);
    }

    #[test]
    fn catch_up_is_capped() {
        let start = 2_000_000_000_u64;
        let mut w = TimerWheel::new(start);
        w.register(start, 1, 0, 1u8);
        // 4 seconds late (below the step threshold): replays each missed run
        // including the one due right now
        let v = fired_for(&mut w, start + 4_000_000);
        assert_eq!(v.len(), 5);
        // after realignment the cadence continues normally
        assert_eq!(fired_for(&mut w, start + 5_000_000).len(), 1);
    }

    #[test]
    fn forward_jump_realigns() {
        let start = 3_000_000_000_u64;
        let mut w = TimerWheel::new(start);
        w.register(start, 1, 0, 1u8);
        // an hour-long step is a clock jump, not a backlog
        let v = fired_for(&mut w, start + 3_600_000_000);
        assert!(v.is_empty());
        assert_eq!(fired_for(&mut w, start + 3_601_000_000).len(), 1);
    }

    #[test]
    fn backward_jump_never_fires_early() {
        let start = 4_000_500_000_u64;
        let mut w = TimerWheel::new(start);
        w.register(start, 10, 0, 1u8);
        assert!(fired_for(&mut w, start + 1_000_000).is_empty());
        // clock stepped back 100 s; the entry waits at least its remaining
        // time (and then realigns to the period grid)
        let back = start - 99_000_000;
        assert!(fired_for(&mut w, back).is_empty());
        assert!(fired_for(&mut w, back + 8_500_000).is_empty());
        assert!(fired_for(&mut w, back + 10_000_000).is_empty());
        assert!(fired_for(&mut w, back + 14_000_000).is_empty());
        assert_eq!(fired_for(&mut w, back + 18_500_000).len(), 1);
    }

    #[test]
    fn daemon_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = acquire_daemon_lock(dir.path()).unwrap();
        assert!(lock_is_held(dir.path()));
        assert_eq!(read_daemon_pid(dir.path()), Some(std::process::id() as i32));
        assert!(acquire_daemon_lock(dir.path()).is_err());
        drop(lock);
        assert!(!lock_is_held(dir.path()));
    }
}
