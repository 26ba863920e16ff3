//! The master state bundle: every subsystem the coordination plane mutates,
//! owned by one struct so the event loop (and the tests) drive it through a
//! single handle.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::bgsaver::SaverMonitor;
use crate::changelog::Changelog;
use crate::config::Config;
use crate::csdb::Csdb;
use crate::error::Result;
use crate::matocs::CsServSet;
use crate::matoml::MlServSet;
use crate::metadata::{ChunkSubsystem, Metadata};
use crate::multilan::MultiLan;
use crate::topology::Topology;

/// Wall/monotonic time source; tests freeze it.
pub struct Clock {
    origin: Instant,
    fake: Option<(u32, f64)>,
}

impl Clock {
    pub fn real() -> Self {
        Self {
            origin: Instant::now(),
            fake: None,
        }
    }

    pub fn fake(wall: u32, mono: f64) -> Self {
        Self {
            origin: Instant::now(),
            fake: Some((wall, mono)),
        }
    }

    /// Seconds since the epoch, truncated the way the wire carries it.
    pub fn wall(&self) -> u32 {
        match self.fake {
            Some((w, _)) => w,
            None => crate::runtime::wall_now(),
        }
    }

    /// Monotonic seconds; never jumps with the wall clock.
    pub fn mono(&self) -> f64 {
        match self.fake {
            Some((_, m)) => m,
            None => self.origin.elapsed().as_secs_f64(),
        }
    }

    pub fn advance(&mut self, secs: u32) {
        if let Some((w, m)) = &mut self.fake {
            *w += secs;
            *m += secs as f64;
        }
    }
}

pub struct Master {
    pub cfg: Config,
    pub clock: Clock,
    pub meta: Metadata,
    pub chunks: Box<dyn ChunkSubsystem>,
    pub csdb: Csdb,
    pub topology: Topology,
    pub multilan: MultiLan,
    pub changelog: Changelog,
    pub cs: CsServSet,
    pub ml: MlServSet,
    pub saver: SaverMonitor,
    /// Shutdown has been requested; `can_exit` polling is under way.
    pub exiting: bool,
    /// Something unrecoverable happened; the loop must wind down now.
    pub exit_requested: bool,
    store_status: Option<Arc<AtomicI32>>,
}

impl Master {
    pub fn new(cfg: Config, chunks: Box<dyn ChunkSubsystem>, clock: Clock) -> Result<Self> {
        let mut csdb = Csdb::new();
        csdb.reload(&cfg);
        let mut changelog = Changelog::new(&cfg.data_path);
        changelog.reload(&cfg);
        let mut topology = Topology::new();
        topology.reload(&cfg.topology_path());
        let mut multilan = MultiLan::new();
        multilan.configure(cfg.multilan_bits, cfg.multilan_classes.as_deref());
        multilan.ipmap.load(&cfg.ipmap_path());
        let mut cs = CsServSet::new();
        cs.check_mode = cfg.cs_check_mode;
        cs.reserve = cfg.parse_reserve_space()?;
        let mut ml = MlServSet::new();
        ml.set_data_dir(cfg.data_path.clone());
        let meta_id = crate::runtime::utime_now();

        Ok(Self {
            cfg,
            clock,
            meta: Metadata::new(meta_id),
            chunks,
            csdb,
            topology,
            multilan,
            changelog,
            cs,
            ml,
            saver: SaverMonitor::disabled(),
            exiting: false,
            exit_requested: false,
            store_status: None,
        })
    }

    /// Wires up a spawned background saver; the changelog routes background
    /// writes through it from now on.
    pub fn attach_saver(&mut self, saver: SaverMonitor) {
        self.changelog.set_saver(saver.handle());
        self.saver = saver;
    }

    /// Appends a mutation record. An unpersistable record forces
    /// termination - better a dead master than a diverged one.
    pub fn changelog_line(&mut self, text: String) {
        let now_wall = self.clock.wall();
        let now_mono = self.clock.mono();
        self.ml.now = now_mono;
        if self
            .changelog
            .append(&mut self.meta, &mut self.ml, now_wall, now_mono, &text)
            .is_err()
        {
            self.exit_requested = true;
        }
    }

    /// Streams a metadata snapshot through the background saver. The ring
    /// keeps every changelog entry from the snapshot version until the send
    /// completes, so a receiver can replay the gap.
    pub fn store_metadata(&mut self) {
        if self.store_status.is_some() {
            info!("metadata store already in progress");
            return;
        }
        let version = self.meta.version();
        self.meta.set_chlog_keep_version(version);
        let mut image = Vec::with_capacity(24);
        image.extend_from_slice(b"MFSM NEW");
        image.extend_from_slice(&version.to_be_bytes());
        image.extend_from_slice(&self.meta.id().to_be_bytes());

        let status = Arc::new(AtomicI32::new(i32::MIN));
        let done = status.clone();
        self.store_status = Some(status);
        let crc = crc32fast::hash(&image);
        self.saver.open(self.cfg.meta_save_speed_limit, Box::new(|_| {}));
        self.saver.store(0, image, crc, Box::new(|_| {}));
        self.saver
            .close_file(Box::new(move |st| done.store(st, Ordering::SeqCst)));
    }

    fn poll_store_status(&mut self) {
        let finished = match &self.store_status {
            Some(st) => {
                let v = st.load(Ordering::SeqCst);
                if v == i32::MIN {
                    None
                } else {
                    Some(v)
                }
            }
            None => return,
        };
        if let Some(status) = finished {
            self.store_status = None;
            self.meta.clear_chlog_keep_version();
            if status == 1 {
                info!("metadata snapshot stored");
                // a fresh image starts a fresh changelog chain
                self.ml.now = self.clock.mono();
                self.changelog.rotate(false, true, &mut self.ml);
            } else {
                warn!("metadata snapshot store failed (status: {})", status);
            }
        }
    }

    // -- periodic work ----------------------------------------------------

    /// Once per second: health checks, keepalives, state transitions.
    pub fn second_tick(&mut self) {
        let now_wall = self.clock.wall();
        let now_mono = self.clock.mono();
        self.ml.now = now_mono;

        let mut events = Vec::new();
        self.csdb.self_check(now_wall, &mut |l| events.push(l));
        for l in events {
            self.changelog_line(l);
        }

        self.cs.hlstatus_fix(&self.csdb, now_wall);
        self.cs.calculate_space();
        self.cs.chunks_delays();

        if self
            .changelog
            .send_idle(&mut self.meta, &mut self.ml, now_wall, now_mono)
            .is_err()
        {
            self.exit_requested = true;
        }

        crate::matocs::keepalive_tick(self);
        crate::matoml::keepalive_tick(self);
        crate::matoml::pump_delayed(self);

        if self.saver.drain_events(now_mono) {
            self.exit_requested = true;
        }
        if self.saver.alive_check(now_mono) {
            self.exit_requested = true;
        }
        if self.exiting {
            self.saver.term_tick();
        }
        self.poll_store_status();
    }

    /// Every ten seconds: forced-timeout broadcasts.
    pub fn ten_second_tick(&mut self) {
        crate::matocs::broadcast_timeout(self);
        crate::matoml::broadcast_timeout(self);
    }

    /// Every minute: latch reason counters for reporting.
    pub fn minute_tick(&mut self) {
        self.cs.latch_reason_counters();
    }

    /// Every ten minutes: drop long-disconnected servers.
    pub fn remove_unused_tick(&mut self) {
        let now = self.clock.wall();
        let mut events = Vec::new();
        self.csdb.remove_unused(now, &mut |l| events.push(l));
        for l in events {
            self.changelog_line(l);
        }
    }

    pub fn hourly_tick(&mut self) {
        self.ml.warn_if_no_metaloggers();
    }

    /// Cheap per-loop upkeep.
    pub fn each_loop(&mut self) {
        self.cs.recalculate_server_counters(&self.csdb);
    }

    // -- admin operations --------------------------------------------------

    pub fn csserv_maintenance(&mut self, ip: u32, port: u16, on: bool) -> u8 {
        let now = self.clock.wall();
        let mut events = Vec::new();
        let status = self.csdb.maintenance(ip, port, on, now, &mut |l| events.push(l));
        for l in events {
            self.changelog_line(l);
        }
        status
    }

    pub fn csserv_remove(&mut self, ip: u32, port: u16) -> u8 {
        let now = self.clock.wall();
        let mut events = Vec::new();
        let status = self.csdb.remove_server(ip, port, now, &mut |l| events.push(l));
        for l in events {
            self.changelog_line(l);
        }
        status
    }

    // -- shutdown ordering -------------------------------------------------

    pub fn want_exit(&mut self) {
        if !self.exiting {
            info!("shutdown requested");
            self.exiting = true;
        }
    }

    pub fn can_exit(&self) -> bool {
        self.saver.can_exit()
            && self.cs.no_more_pending_jobs()
            && self.ml.no_more_pending_jobs()
    }

    pub fn destruct(&mut self) {
        crate::matocs::disconnect_all(self);
        crate::matoml::disconnect_all(self);
        self.saver.shutdown_join();
        info!("master modules shut down");
    }

    /// SIGHUP: re-read the configuration and push it into every subsystem.
    pub fn reload(&mut self, mut cfg: Config) {
        cfg.normalize();
        if cfg.matocs_listen != self.cfg.matocs_listen
            || cfg.matoml_listen != self.cfg.matoml_listen
        {
            warn!("listen address changed in configuration - restart required to apply");
        }
        info!("reloading config files");
        self.csdb.reload(&cfg);
        self.changelog.reload(&cfg);
        self.topology.reload(&cfg.topology_path());
        self.multilan
            .configure(cfg.multilan_bits, cfg.multilan_classes.as_deref());
        self.multilan.ipmap.load(&cfg.ipmap_path());
        self.cs.check_mode = cfg.cs_check_mode;
        if let Ok(reserve) = cfg.parse_reserve_space() {
            self.cs.reserve = reserve;
        }
        self.cfg = cfg;
    }

    /// SIGUSR1 info dump, one report of every subsystem.
    pub fn info_dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        self.changelog.info(&self.meta, &mut out);
        let _ = writeln!(
            out,
            "[space]\ntotal: {}\nused: {}\nfree: {}\navail: {}\nusagediff: {}",
            self.cs.total_space(),
            self.cs.used_space(),
            self.cs.free_space(),
            self.cs.avail_space(),
            self.cs.usage_diff()
        );
        let _ = writeln!(
            out,
            "[servers]\nvalid: {}\nalmost_full: {}\nrepl_allowed: {}\nknown: {}",
            self.cs.valid_servers,
            self.cs.almostfull_servers,
            self.cs.replallowed_servers,
            self.csdb.servers_count()
        );
        for (version, ip) in self.ml.mloglist() {
            let _ = writeln!(
                out,
                "metalogger: {} (version {:X})",
                crate::proto::ip_to_str(ip),
                version
            );
        }
        let _ = writeln!(out);
        crate::matocs::extra_info(self, &mut out);
        out
    }
}
