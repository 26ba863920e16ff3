//! Master <-> metalogger/supervisor sessions. Metaloggers mirror the
//! changelog stream and can download the metadata image in ranged chunks;
//! supervisors only fetch a state snapshot. A metalogger that asks for an
//! old changelog version is served from the in-memory ring and kept in
//! DELAYED state until it has caught up.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::changelog::LogBroadcast;
use crate::error::{MasterError, Result};
use crate::master::Master;
use crate::matocs::Outbox;
use crate::proto::{self, wire::PacketReader, wire::PacketWriter};
use crate::SessId;

/// Entries delivered per catch-up round; a session that needs more stays
/// DELAYED and is pumped again next round.
pub const OLD_CHANGES_GROUP_COUNT: u32 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlClientType {
    Unknown,
    Metalogger,
    Supervisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    None,
    Delayed,
    Sync,
}

pub struct MlSession {
    pub outbox: Outbox,
    pub kill: bool,
    pub timeout: u16,
    pub servstrip: String,
    pub version: u32,
    pub serv_ip: u32,
    pub clienttype: MlClientType,
    pub logstate: LogState,
    pub next_log_version: u64,
    pub last_enqueue: f64,
    dl_meta: Option<File>,
    dl_chain1: Option<File>,
    dl_chain2: Option<File>,
}

impl MlSession {
    fn new(peer_ip: u32, outbox: Outbox, timeout: u16, now_mono: f64) -> Self {
        Self {
            outbox,
            kill: false,
            timeout,
            servstrip: proto::ip_to_str(peer_ip),
            version: 0,
            serv_ip: peer_ip,
            clienttype: MlClientType::Unknown,
            logstate: LogState::None,
            next_log_version: 0,
            last_enqueue: now_mono,
            dl_meta: None,
            dl_chain1: None,
            dl_chain2: None,
        }
    }

    fn send(&mut self, frame: Bytes, now_mono: f64) {
        self.outbox.push(frame);
        self.last_enqueue = now_mono;
    }

    pub fn client_name(&self) -> &'static str {
        match self.clienttype {
            MlClientType::Metalogger => match self.logstate {
                LogState::Delayed => "METALOGGER-DELAYED",
                LogState::Sync => "METALOGGER-SYNC",
                LogState::None => "METALOGGER",
            },
            MlClientType::Supervisor => "SUPERVISOR",
            MlClientType::Unknown => "UNKNOWN",
        }
    }
}

pub struct MlServSet {
    pub sessions: FxHashMap<SessId, MlSession>,
    next_sid: SessId,
    data_dir: PathBuf,
    /// Monotonic-clock hint refreshed by the owner before bursts of sends.
    pub now: f64,
}

impl Default for MlServSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MlServSet {
    pub fn new() -> Self {
        Self {
            sessions: FxHashMap::default(),
            next_sid: 1,
            data_dir: PathBuf::from("."),
            now: 0.0,
        }
    }

    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    pub fn session(&self, sid: SessId) -> Option<&MlSession> {
        self.sessions.get(&sid)
    }

    pub fn session_mut(&mut self, sid: SessId) -> Option<&mut MlSession> {
        self.sessions.get_mut(&sid)
    }

    /// (version, ip) of every connected metalogger, for reporting.
    pub fn mloglist(&self) -> Vec<(u32, u32)> {
        self.sessions
            .values()
            .filter(|s| !s.kill && s.clienttype == MlClientType::Metalogger)
            .map(|s| (s.version, s.serv_ip))
            .collect()
    }

    pub fn warn_if_no_metaloggers(&self) {
        if !self.sessions.values().any(|s| !s.kill) {
            info!("no metaloggers connected !!!");
        }
    }

    pub fn no_more_pending_jobs(&self) -> bool {
        // queued frames live in the socket writers; DELAYED catch-up is the
        // only state worth waiting for
        !self
            .sessions
            .values()
            .any(|s| !s.kill && s.logstate == LogState::Delayed)
    }
}

impl LogBroadcast for MlServSet {
    fn broadcast_logstring(&mut self, version: u64, data: &[u8]) {
        let now = self.now;
        for s in self.sessions.values_mut() {
            if !s.kill
                && s.version > 0
                && s.clienttype == MlClientType::Metalogger
                && s.logstate == LogState::Sync
            {
                let mut w =
                    PacketWriter::new(proto::MATOAN_METACHANGES_LOG, 9 + data.len() as u32);
                w.put_u8(0xFF).put_u64(version).put_bytes(data);
                s.send(w.finish(), now);
            }
        }
    }

    fn broadcast_logrotate(&mut self) {
        let now = self.now;
        for s in self.sessions.values_mut() {
            if !s.kill && s.version > 0 && s.clienttype == MlClientType::Metalogger {
                let mut w = PacketWriter::new(proto::MATOAN_METACHANGES_LOG, 1);
                w.put_u8(0x55);
                s.send(w.finish(), now);
            }
        }
    }

    fn min_version(&self, current: u64) -> u64 {
        self.sessions
            .values()
            .filter(|s| !s.kill && s.logstate == LogState::Delayed)
            .map(|s| s.next_log_version)
            .fold(current, u64::min)
    }
}

// ---------------------------------------------------------------------------
// lifecycle

pub fn accept(m: &mut Master, peer_ip: u32, outbox: Outbox) -> SessId {
    let timeout = if m.cfg.matoml_force_timeout > 0 {
        m.cfg.matoml_force_timeout as u16
    } else {
        m.cfg.matoml_timeout as u16
    };
    let sid = m.ml.next_sid;
    m.ml.next_sid += 1;
    let sess = MlSession::new(peer_ip, outbox, timeout, m.clock.mono());
    m.ml.sessions.insert(sid, sess);
    sid
}

fn kill(m: &mut Master, sid: SessId) {
    if let Some(s) = m.ml.sessions.get_mut(&sid) {
        s.kill = true;
    }
}

pub fn session_closed(m: &mut Master, sid: SessId) {
    if let Some(s) = m.ml.sessions.remove(&sid) {
        if s.clienttype != MlClientType::Supervisor {
            info!(
                "connection with {}({}) has been closed",
                s.client_name(),
                s.servstrip
            );
        }
    }
}

pub fn disconnect_all(m: &mut Master) {
    let sids: Vec<SessId> = m.ml.sessions.keys().copied().collect();
    for sid in sids {
        session_closed(m, sid);
    }
}

pub fn keepalive_tick(m: &mut Master) {
    let now = m.clock.mono();
    for s in m.ml.sessions.values_mut() {
        if !s.kill
            && s.last_enqueue + 1.0 < now
            && s.clienttype != MlClientType::Unknown
            && s.clienttype != MlClientType::Supervisor
        {
            s.send(proto::framing::nop_frame(), now);
        }
    }
}

/// Per-loop catch-up for DELAYED sessions: replay the next group of stored
/// entries; a short group means the session has caught up and goes SYNC.
pub fn pump_delayed(m: &mut Master) {
    let now = m.clock.mono();
    let delayed: Vec<SessId> = m
        .ml
        .sessions
        .iter()
        .filter(|(_, s)| !s.kill && s.logstate == LogState::Delayed)
        .map(|(&sid, _)| sid)
        .collect();
    for sid in delayed {
        let from = m.ml.sessions[&sid].next_log_version;
        let mut frames: Vec<Bytes> = Vec::new();
        let n = m
            .changelog
            .get_old_changes(from, OLD_CHANGES_GROUP_COUNT, &mut |version, data| {
                let mut w =
                    PacketWriter::new(proto::MATOAN_METACHANGES_LOG, 9 + data.len() as u32);
                w.put_u8(0xFF).put_u64(version).put_bytes(data);
                frames.push(w.finish());
            });
        let Some(s) = m.ml.sessions.get_mut(&sid) else { continue };
        for f in frames {
            s.send(f, now);
        }
        if n < OLD_CHANGES_GROUP_COUNT {
            s.logstate = LogState::Sync;
        } else {
            s.next_log_version = from + n as u64;
        }
    }
}

/// Forced-timeout push; only metaloggers new enough accept it.
pub fn broadcast_timeout(m: &mut Master) {
    if m.cfg.matoml_force_timeout == 0 {
        return;
    }
    let force = m.cfg.matoml_force_timeout as u16;
    let now = m.clock.mono();
    for s in m.ml.sessions.values_mut() {
        if !s.kill
            && s.clienttype == MlClientType::Metalogger
            && s.version >= proto::version2int(4, 24, 0)
        {
            s.timeout = force;
            let mut w = PacketWriter::new(proto::ANTOAN_FORCE_TIMEOUT, 2);
            w.put_u16(force);
            s.send(w.finish(), now);
        }
    }
}

// ---------------------------------------------------------------------------
// inbound dispatch

pub fn handle_frame(m: &mut Master, sid: SessId, ptype: u32, data: &[u8]) {
    match m.ml.sessions.get(&sid) {
        Some(s) if !s.kill => {}
        _ => return,
    }
    match ptype {
        proto::ANTOAN_NOP => {}
        proto::ANTOAN_UNKNOWN_COMMAND => {}
        proto::ANTOAN_BAD_COMMAND_SIZE => {}
        proto::ANTOAN_GET_VERSION => get_version(m, sid, data),
        proto::ANTOAN_GET_CONFIG => get_config(m, sid, data),
        proto::ANTOMA_REGISTER => register(m, sid, data),
        proto::ANTOMA_STORE_METADATA => store_metadata(m, sid, data),
        proto::ANTOMA_DOWNLOAD_START => download_start(m, sid, data),
        proto::ANTOMA_DOWNLOAD_REQUEST => download_request(m, sid, data),
        proto::ANTOMA_DOWNLOAD_END => download_end(m, sid, data),
        _ => {
            warn!("master control module: got unknown message (type:{})", ptype);
            kill(m, sid);
        }
    }
}

fn get_version(m: &mut Master, sid: SessId, data: &[u8]) {
    if !data.is_empty() && data.len() != 4 {
        warn!("GET_VERSION - wrong size ({}/4|0)", data.len());
        kill(m, sid);
        return;
    }
    let vstring = proto::version_str();
    let now = m.clock.mono();
    let Some(s) = m.ml.sessions.get_mut(&sid) else { return };
    let mut w = if data.len() == 4 {
        let msgid = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let mut w = PacketWriter::new(proto::ANTOAN_VERSION, 8 + vstring.len() as u32);
        w.put_u32(msgid);
        w
    } else {
        PacketWriter::new(proto::ANTOAN_VERSION, 4 + vstring.len() as u32)
    };
    w.put_u16(proto::VERSION_MAJ)
        .put_u8(proto::VERSION_MID)
        .put_u8(proto::VERSION_MIN)
        .put_bytes(vstring.as_bytes());
    s.send(w.finish(), now);
}

fn get_config(m: &mut Master, sid: SessId, data: &[u8]) {
    let parsed = (|| -> Result<(u32, String)> {
        let mut r = PacketReader::new(data);
        let msgid = r.get_u32()?;
        let nleng = r.get_u8()? as usize;
        let name = r.get_bytes(nleng)?;
        if r.remaining() != 0 {
            return Err(MasterError::Protocol("trailing bytes".into()));
        }
        Ok((msgid, String::from_utf8_lossy(name).into_owned()))
    })();
    let Ok((msgid, name)) = parsed else {
        warn!("GET_CONFIG - wrong size ({})", data.len());
        kill(m, sid);
        return;
    };
    let value = m.cfg.lookup(&name).unwrap_or_default();
    let mut vbytes = value.into_bytes();
    vbytes.truncate(255);
    let now = m.clock.mono();
    let Some(s) = m.ml.sessions.get_mut(&sid) else { return };
    let mut w = if msgid == 0 {
        let mut w = PacketWriter::new(
            proto::ANTOAN_CONFIG_VALUE,
            6 + name.len() as u32 + vbytes.len() as u32,
        );
        w.put_u32(0).put_u8(name.len() as u8).put_bytes(name.as_bytes());
        w
    } else {
        let mut w = PacketWriter::new(proto::ANTOAN_CONFIG_VALUE, 5 + vbytes.len() as u32);
        w.put_u32(msgid);
        w
    };
    w.put_u8(vbytes.len() as u8).put_bytes(&vbytes);
    s.send(w.finish(), now);
}

/// Whether this peer version expects a MASTER_ACK to its register packet.
fn wants_ack(version: u32) -> bool {
    (version >= proto::version2int(1, 7, 25) && version < proto::version2int(2, 0, 0))
        || (version >= proto::version2int(2, 0, 0) && (version & 1) != 0)
        || version >= proto::version2int(4, 0, 0)
}

fn register(m: &mut Master, sid: SessId, data: &[u8]) {
    if m.ml.sessions.get(&sid).map(|s| s.version).unwrap_or(0) > 0 {
        warn!("got register message from registered metalogger !!!");
        kill(m, sid);
        return;
    }
    if data.is_empty() {
        warn!("REGISTER - wrong size ({})", data.len());
        kill(m, sid);
        return;
    }
    let rversion = data[0];
    match rversion {
        1 => register_metalogger_simple(m, sid, &data[1..], data.len()),
        2 => register_metalogger_advanced(m, sid, &data[1..], data.len()),
        4 => register_supervisor(m, sid, &data[1..], data.len()),
        3 => {
            warn!("REGISTER - protocol not supported");
            kill(m, sid);
        }
        _ => {
            warn!("REGISTER - wrong version ({}/1)", rversion);
            kill(m, sid);
        }
    }
}

fn read_version_timeout(m: &Master, body: &[u8]) -> Result<(u32, u16)> {
    let mut r = PacketReader::new(body);
    let version = r.get_u32()?;
    let wire_timeout = r.get_u16()?;
    let timeout = if m.cfg.matoml_force_timeout > 0 {
        m.cfg.matoml_force_timeout as u16
    } else {
        wire_timeout
    };
    Ok((version, timeout))
}

fn apply_timeout(s: &mut MlSession, timeout: u16) {
    s.timeout = timeout;
    if s.timeout < 10 {
        info!(
            "REGISTER communication timeout too small ({} seconds - should be at least 10 seconds)",
            s.timeout
        );
        if s.timeout < 3 {
            s.timeout = 3;
        }
    }
}

fn register_metalogger_simple(m: &mut Master, sid: SessId, body: &[u8], length: usize) {
    if length != 7 {
        warn!("REGISTER (logger 1) - wrong size ({}/7)", length);
        kill(m, sid);
        return;
    }
    let Ok((version, timeout)) = read_version_timeout(m, body) else {
        kill(m, sid);
        return;
    };
    let now = m.clock.mono();
    let Some(s) = m.ml.sessions.get_mut(&sid) else { return };
    s.clienttype = MlClientType::Metalogger;
    s.version = version;
    apply_timeout(s, timeout);
    if wants_ack(version) {
        let mut w = PacketWriter::new(proto::MATOAN_MASTER_ACK, 5);
        w.put_u8(1).put_u32(proto::VERSHEX);
        s.send(w.finish(), now);
    }
    s.logstate = LogState::Sync;
    info!(
        "metalogger {} registered (using simple register protocol)",
        s.servstrip
    );
}

fn register_metalogger_advanced(m: &mut Master, sid: SessId, body: &[u8], length: usize) {
    if length != 15 {
        warn!("REGISTER (logger 2) - wrong size ({}/15)", length);
        kill(m, sid);
        return;
    }
    let parsed = (|| -> Result<(u32, u16, u64)> {
        let (version, timeout) = read_version_timeout(m, body)?;
        let mut r = PacketReader::new(&body[6..]);
        Ok((version, timeout, r.get_u64()?))
    })();
    let Ok((version, timeout, req_minversion)) = parsed else {
        kill(m, sid);
        return;
    };
    let chlog_minversion = m.changelog.min_version(&m.meta);
    let now = m.clock.mono();

    // decide sync-vs-catchup before touching the session
    let in_ring = chlog_minversion != 0 && chlog_minversion <= req_minversion;
    let mut frames: Vec<Bytes> = Vec::new();
    let mut delivered = 0u32;
    if in_ring {
        delivered = m
            .changelog
            .get_old_changes(req_minversion, OLD_CHANGES_GROUP_COUNT, &mut |v, d| {
                let mut w = PacketWriter::new(proto::MATOAN_METACHANGES_LOG, 9 + d.len() as u32);
                w.put_u8(0xFF).put_u64(v).put_bytes(d);
                frames.push(w.finish());
            });
    }

    let Some(s) = m.ml.sessions.get_mut(&sid) else { return };
    s.clienttype = MlClientType::Metalogger;
    s.version = version;
    apply_timeout(s, timeout);
    if wants_ack(version) {
        let mut w = PacketWriter::new(proto::MATOAN_MASTER_ACK, 5);
        w.put_u8(if in_ring { 0 } else { 1 }).put_u32(proto::VERSHEX);
        s.send(w.finish(), now);
    }
    if in_ring {
        for f in frames {
            s.send(f, now);
        }
        if delivered < OLD_CHANGES_GROUP_COUNT {
            s.logstate = LogState::Sync;
        } else {
            s.next_log_version = req_minversion + delivered as u64;
            s.logstate = LogState::Delayed;
        }
    } else {
        // desync: receiver must fetch a fresh image, but current entries flow
        s.logstate = LogState::Sync;
    }
    info!(
        "metalogger {} registered (using advanced register protocol)",
        s.servstrip
    );
}

fn register_supervisor(m: &mut Master, sid: SessId, body: &[u8], length: usize) {
    if length != 7 {
        warn!("REGISTER (supervisor) - wrong size ({}/7)", length);
        kill(m, sid);
        return;
    }
    let Ok((mut version, timeout)) = read_version_timeout(m, body) else {
        kill(m, sid);
        return;
    };
    if version >= proto::version2int(4, 23, 5) && version < proto::version2int(4, 48, 0) {
        version |= 1;
    }
    let meta_version = m.meta.version();
    let meta_id = m.meta.id();
    let utime = crate::runtime::utime_now();
    let now = m.clock.mono();
    let Some(s) = m.ml.sessions.get_mut(&sid) else { return };
    s.clienttype = MlClientType::Supervisor;
    s.version = version;
    apply_timeout(s, timeout);
    let mode = if version < proto::version2int(3, 0, 0) {
        u8::from(version >= proto::version2int(2, 0, 82))
    } else if version < proto::version2int(4, 0, 0) {
        if version >= proto::version2int(3, 0, 107) {
            2
        } else {
            u8::from(version >= proto::version2int(3, 0, 59))
        }
    } else if version >= proto::version2int(4, 17, 0) {
        2
    } else {
        1
    };
    let size = match mode {
        2 => 40,
        1 => 28,
        _ => 20,
    };
    let mut w = PacketWriter::new(proto::MATOAN_STATE, size);
    w.put_u8(0xFF).put_u8(0xFF).put_u8(0xFF).put_u8(0xFF);
    w.put_u32(0).put_u32(0);
    w.put_u64(meta_version);
    if mode > 0 {
        w.put_u64(meta_id);
    }
    if mode > 1 {
        w.put_u64(utime);
        w.put_u32(0);
    }
    s.send(w.finish(), now);
}

fn store_metadata(m: &mut Master, sid: SessId, data: &[u8]) {
    if !data.is_empty() {
        warn!("STORE_METADATA - wrong size ({}/0)", data.len());
        kill(m, sid);
        return;
    }
    let is_supervisor = m
        .ml
        .sessions
        .get(&sid)
        .map(|s| s.clienttype == MlClientType::Supervisor)
        .unwrap_or(false);
    if !is_supervisor {
        warn!("STORE_METADATA - wrong client type");
        kill(m, sid);
        return;
    }
    m.store_metadata();
}

fn close_downloads(s: &mut MlSession) {
    s.dl_meta = None;
    s.dl_chain1 = None;
    s.dl_chain2 = None;
}

fn download_start(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() != 1 {
        warn!("DOWNLOAD_START - wrong size ({}/1)", data.len());
        kill(m, sid);
        return;
    }
    let filenum = data[0];
    let dir = m.ml.data_dir.clone();
    let now = m.clock.mono();
    let Some(s) = m.ml.sessions.get_mut(&sid) else { return };
    match filenum {
        1 => {
            close_downloads(s);
            s.dl_meta = File::open(dir.join("metadata.mfs.back")).ok();
            s.dl_chain1 = File::open(dir.join("changelog.0.mfs")).ok();
            s.dl_chain2 = File::open(dir.join("changelog.1.mfs")).ok();
        }
        2 => {
            close_downloads(s);
            s.dl_meta = File::open(dir.join("sessions.mfs")).ok();
        }
        11 => {
            s.dl_meta = s.dl_chain1.take();
        }
        12 => {
            s.dl_meta = s.dl_chain2.take();
        }
        _ => {
            s.kill = true;
            return;
        }
    }
    match s.dl_meta.as_mut() {
        Some(f) => {
            let size = f.seek(SeekFrom::End(0)).unwrap_or(0);
            let mut w = PacketWriter::new(proto::MATOAN_DOWNLOAD_INFO, 8);
            w.put_u64(size);
            s.send(w.finish(), now);
        }
        None if filenum == 11 || filenum == 12 => {
            // a missing changelog chain is an empty file, not an error
            let mut w = PacketWriter::new(proto::MATOAN_DOWNLOAD_INFO, 8);
            w.put_u64(0);
            s.send(w.finish(), now);
        }
        None => {
            let mut w = PacketWriter::new(proto::MATOAN_DOWNLOAD_INFO, 1);
            w.put_u8(0xFF);
            s.send(w.finish(), now);
        }
    }
}

fn download_request(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() != 12 {
        warn!("DOWNLOAD_REQUEST - wrong size ({}/12)", data.len());
        kill(m, sid);
        return;
    }
    let mut r = PacketReader::new(data);
    let offset = r.get_u64().expect("size checked");
    let leng = r.get_u32().expect("size checked");
    let now = m.clock.mono();
    let Some(s) = m.ml.sessions.get_mut(&sid) else { return };
    let Some(f) = s.dl_meta.as_mut() else {
        warn!("DOWNLOAD_REQUEST - file not opened");
        s.kill = true;
        return;
    };
    let mut buf = vec![0u8; leng as usize];
    let read_ok = read_at(f, &mut buf, offset);
    if !read_ok {
        warn!("error reading metafile");
        s.kill = true;
        return;
    }
    let crc = crc32fast::hash(&buf);
    let mut w = PacketWriter::new(proto::MATOAN_DOWNLOAD_DATA, 16 + leng);
    w.put_u64(offset).put_u32(leng).put_u32(crc).put_bytes(&buf);
    s.send(w.finish(), now);
}

fn download_end(m: &mut Master, sid: SessId, data: &[u8]) {
    if !data.is_empty() {
        warn!("DOWNLOAD_END - wrong size ({}/0)", data.len());
        kill(m, sid);
        return;
    }
    if let Some(s) = m.ml.sessions.get_mut(&sid) {
        s.dl_meta = None;
    }
}

#[cfg(unix)]
fn read_at(f: &mut File, buf: &mut [u8], offset: u64) -> bool {
    use std::os::unix::fs::FileExt;
    f.read_exact_at(buf, offset).is_ok()
}

#[cfg(not(unix))]
fn read_at(f: &mut File, buf: &mut [u8], offset: u64) -> bool {
    use std::io::Read;
    f.seek(SeekFrom::Start(offset)).is_ok() && f.read_exact(buf).is_ok()
}
