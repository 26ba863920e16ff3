//! Master <-> chunkserver protocol sessions: registration handshake, space
//! and load reports, chunk inventory streams, and the per-chunk command
//! dispatch with its ledger bookkeeping.

pub mod select;

use std::collections::VecDeque;

use bytes::Bytes;
use rand::RngCore;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::{MasterError, Result};
use crate::ledger::{
    OpLedger, OpReason, OpType, RepRecord, RepType, ReplLedger, ReplReason,
    EC_REPLICATION_WEIGHT, FULL_REPLICATION_WEIGHT, LOCALPART_REPLICATION_WEIGHT, OP_REASONS,
    REPL_REASONS,
};
use crate::master::Master;
use crate::proto::{self, wire::PacketReader, wire::PacketWriter};
use crate::SessId;

const NEW_CHUNK_DELAY: u8 = 5;
const LOST_CHUNK_DELAY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegPhase {
    Unregistered,
    Waiting,
    Registered,
}

/// Where a session's outbound frames go: a live socket writer or, in tests,
/// a plain queue.
pub enum Outbox {
    Net(tokio::sync::mpsc::UnboundedSender<Bytes>),
    Queue(VecDeque<Bytes>),
}

impl Outbox {
    pub fn queue() -> Self {
        Outbox::Queue(VecDeque::new())
    }

    pub fn push(&mut self, frame: Bytes) {
        match self {
            Outbox::Net(tx) => {
                let _ = tx.send(frame);
            }
            Outbox::Queue(q) => q.push_back(frame),
        }
    }

    /// Test-side inspection of queued frames.
    pub fn pop(&mut self) -> Option<Bytes> {
        match self {
            Outbox::Net(_) => None,
            Outbox::Queue(q) => q.pop_front(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ReasonCounters {
    pub repl_read_ok: [u32; REPL_REASONS],
    pub repl_read_err: [u32; REPL_REASONS],
    pub repl_write_ok: [u32; REPL_REASONS],
    pub repl_write_err: [u32; REPL_REASONS],
    pub del_ok: [u32; OP_REASONS],
    pub del_err: [u32; OP_REASONS],
}

pub struct CsSession {
    pub outbox: Outbox,
    pub kill: bool,
    pub peer_ip: u32,
    pub servdesc: String,
    pub version: u32,
    pub serv_ip: u32,
    pub serv_port: u16,
    pub timeout: u16,
    pub load: u32,
    pub hlstatus: u8,
    pub usedspace: u64,
    pub totalspace: u64,
    pub chunkscount: u32,
    pub todelusedspace: u64,
    pub todeltotalspace: u64,
    pub todelchunkscount: u32,
    pub errorcounter: u32,
    pub writecounter: u16,
    pub rrepcounter: u16,
    pub wrepcounter: u16,
    pub delcounter: u16,
    pub labelmask: u32,
    pub labelstr: Option<String>,
    pub create_total: u32,
    pub rrep_total: u32,
    pub wrep_total: u32,
    pub del_total: u32,
    pub counters_since: f64,
    /// Chunk-subsystem slot; `MAX_CS_COUNT` until the handshake assigns one.
    pub csid: u16,
    pub reg: RegPhase,
    pub lostchunkdelay: u8,
    pub newchunkdelay: u8,
    pub receivingchunks: u8,
    nonce: Option<[u8; 32]>,
    pub counters: ReasonCounters,
    pub latched: ReasonCounters,
    pub dist: u32,
    pub first: bool,
    pub corr: f64,
    pub csdb: Option<crate::csdb::CsdbId>,
    pub last_enqueue: f64,
}

impl CsSession {
    fn new(peer_ip: u32, outbox: Outbox, timeout: u16, now_mono: f64) -> Self {
        Self {
            outbox,
            kill: false,
            peer_ip,
            servdesc: format!("{}:0", proto::ip_to_str(peer_ip)),
            version: 0,
            serv_ip: 0,
            serv_port: 0,
            timeout,
            load: 0,
            hlstatus: proto::HLSTATUS_DEFAULT,
            usedspace: 0,
            totalspace: 0,
            chunkscount: 0,
            todelusedspace: 0,
            todeltotalspace: 0,
            todelchunkscount: 0,
            errorcounter: 0,
            writecounter: 0,
            rrepcounter: 0,
            wrepcounter: 0,
            delcounter: 0,
            labelmask: 0,
            labelstr: None,
            create_total: 0,
            rrep_total: 0,
            wrep_total: 0,
            del_total: 0,
            counters_since: now_mono,
            csid: proto::MAX_CS_COUNT,
            reg: RegPhase::Unregistered,
            lostchunkdelay: LOST_CHUNK_DELAY,
            newchunkdelay: NEW_CHUNK_DELAY,
            receivingchunks: proto::TRANSFERRING_NEW_CHUNKS | proto::TRANSFERRING_LOST_CHUNKS,
            nonce: None,
            counters: ReasonCounters::default(),
            latched: ReasonCounters::default(),
            dist: 0,
            first: true,
            corr: 0.0,
            csdb: None,
            last_enqueue: now_mono,
        }
    }

    pub fn send(&mut self, frame: Bytes, now_mono: f64) {
        self.outbox.push(frame);
        self.last_enqueue = now_mono;
    }
}

pub struct CsServSet {
    pub sessions: FxHashMap<SessId, CsSession>,
    pub by_csid: FxHashMap<u16, SessId>,
    next_sid: SessId,
    pub ops: OpLedger,
    pub reps: ReplLedger,
    /// Union of every session's transfer state.
    pub receivingchunks: u8,
    pub check_mode: u8,
    wrr_fcnt: u32,
    pub valid_servers: u16,
    pub almostfull_servers: u16,
    pub replallowed_servers: u16,
    gtotal: u64,
    gused: u64,
    gavail: u64,
    gfree: u64,
    gusagediff: u32,
    pub reserve: crate::config::ReserveSpace,
}

impl Default for CsServSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CsServSet {
    pub fn new() -> Self {
        Self {
            sessions: FxHashMap::default(),
            by_csid: FxHashMap::default(),
            next_sid: 1,
            ops: OpLedger::default(),
            reps: ReplLedger::default(),
            receivingchunks: proto::TRANSFERRING_NEW_CHUNKS | proto::TRANSFERRING_LOST_CHUNKS,
            check_mode: 0,
            wrr_fcnt: 0,
            valid_servers: 0,
            almostfull_servers: 0,
            replallowed_servers: 0,
            gtotal: 0,
            gused: 0,
            gavail: 0,
            gfree: 0,
            gusagediff: 0,
            reserve: crate::config::ReserveSpace::Bytes(0),
        }
    }

    pub fn session(&self, sid: SessId) -> Option<&CsSession> {
        self.sessions.get(&sid)
    }

    pub fn session_mut(&mut self, sid: SessId) -> Option<&mut CsSession> {
        self.sessions.get_mut(&sid)
    }

    pub fn sid_of_csid(&self, csid: u16) -> Option<SessId> {
        self.by_csid.get(&csid).copied()
    }

    pub fn total_space(&self) -> u64 {
        self.gtotal
    }

    pub fn used_space(&self) -> u64 {
        self.gused
    }

    pub fn free_space(&self) -> u64 {
        self.gfree
    }

    pub fn avail_space(&self) -> u64 {
        self.gavail
    }

    pub fn have_availspace(&self) -> bool {
        self.gavail > 0
    }

    pub fn usage_diff(&self) -> u32 {
        self.gusagediff
    }

    /// The oldest protocol version among connected servers, 0 with none.
    pub fn min_cs_version(&self) -> u32 {
        self.sessions
            .values()
            .filter(|s| !s.kill && s.csdb.is_some())
            .map(|s| s.version)
            .min()
            .unwrap_or(0)
    }

    /// True when no session has unfinished work the shutdown should wait on.
    pub fn no_more_pending_jobs(&self) -> bool {
        self.sessions
            .values()
            .all(|s| (s.rrepcounter | s.wrepcounter | s.delcounter) == 0)
    }

    /// Per-chunk-subsystem request: track writes being set up or torn down.
    pub fn write_counters(&mut self, sid: SessId, inc: bool) {
        if let Some(s) = self.sessions.get_mut(&sid) {
            if inc {
                s.writecounter += 1;
            } else if s.writecounter == 0 {
                warn!("can't decrease write counter - structure error");
            } else {
                s.writecounter -= 1;
            }
        }
    }

    /// Latches and clears the reason-tagged counters; the latched copies
    /// feed the periodic report.
    pub fn latch_reason_counters(&mut self) {
        for s in self.sessions.values_mut() {
            if !s.kill {
                s.latched = s.counters.clone();
                s.counters = ReasonCounters::default();
            }
        }
    }

    /// Ticks down the inventory-transfer delays for servers too old to
    /// report the state themselves, and refreshes the global union.
    pub fn chunks_delays(&mut self) {
        self.receivingchunks = 0;
        for s in self.sessions.values_mut() {
            if s.kill {
                continue;
            }
            if s.version < proto::version2int(4, 32, 0) {
                s.receivingchunks = 0;
                if s.lostchunkdelay > 0 {
                    s.lostchunkdelay -= 1;
                    s.receivingchunks |= proto::TRANSFERRING_LOST_CHUNKS;
                }
                if s.newchunkdelay > 0 {
                    s.newchunkdelay -= 1;
                    s.receivingchunks |= proto::TRANSFERRING_NEW_CHUNKS;
                }
            }
            self.receivingchunks |= s.receivingchunks;
        }
    }

    fn finish_replication(&mut self, dst: SessId, rec: &RepRecord, ok: bool) {
        let reason = rec.reason as usize;
        for &src in &rec.sources {
            if let Some(s) = self.sessions.get_mut(&src) {
                s.rrepcounter = s.rrepcounter.saturating_sub(rec.rweight as u16);
                if ok {
                    s.counters.repl_read_ok[reason] += rec.rweight as u32;
                } else {
                    s.counters.repl_read_err[reason] += rec.rweight as u32;
                }
            }
        }
        if let Some(s) = self.sessions.get_mut(&dst) {
            s.wrepcounter = s.wrepcounter.saturating_sub(rec.wweight as u16);
            if ok {
                s.counters.repl_write_ok[reason] += rec.wweight as u32;
            } else {
                s.counters.repl_write_err[reason] += rec.wweight as u32;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// session lifecycle

pub fn accept(m: &mut Master, peer_ip: u32, outbox: Outbox) -> SessId {
    let timeout = if m.cfg.matocs_force_timeout > 0 {
        m.cfg.matocs_force_timeout as u16
    } else {
        m.cfg.matocs_timeout as u16
    };
    let sid = m.cs.next_sid;
    m.cs.next_sid += 1;
    let sess = CsSession::new(peer_ip, outbox, timeout, m.clock.mono());
    m.cs.sessions.insert(sid, sess);
    sid
}

fn kill(m: &mut Master, sid: SessId) {
    if let Some(s) = m.cs.sessions.get_mut(&sid) {
        s.kill = true;
    }
}

/// Full teardown of a session: ledgers finalised as failures, the chunk
/// subsystem and CSDB informed, the entry removed.
pub fn session_closed(m: &mut Master, sid: SessId) {
    let Some(sess) = m.cs.sessions.get(&sid) else { return };
    let us = sess.usedspace as f64 / (1024.0 * 1024.0 * 1024.0);
    let ts = sess.totalspace as f64 / (1024.0 * 1024.0 * 1024.0);
    info!(
        "chunkserver {} disconnected, usedspace: {} ({:.2} GiB), totalspace: {} ({:.2} GiB)",
        sess.servdesc, sess.usedspace, us, sess.totalspace, ts
    );
    let csid = sess.csid;
    let csdb_id = sess.csdb;

    let op_records = m.cs.ops.remove_session(sid);
    for rec in op_records {
        if rec.optype == OpType::Delete {
            if let Some(s) = m.cs.sessions.get_mut(&sid) {
                s.delcounter = s.delcounter.saturating_sub(1);
                s.counters.del_err[rec.reason as usize] += 1;
            }
        }
    }

    let (as_dst, as_src) = m.cs.reps.remove_session(sid);
    for rec in as_dst {
        // the dying session is the destination; sources stay alive
        let failed = RepRecord {
            reason: ReplReason::Disconnect,
            ..rec
        };
        m.cs.finish_replication(sid, &failed, false);
    }
    for (rec, rweight) in as_src {
        if let Some(s) = m.cs.sessions.get_mut(&sid) {
            s.rrepcounter = s.rrepcounter.saturating_sub(rweight as u16);
            s.counters.repl_read_err[ReplReason::Disconnect as usize] += rweight as u32;
        }
        let _ = rec;
    }

    if csid != proto::MAX_CS_COUNT {
        m.chunks.server_disconnected(csid);
        m.cs.by_csid.remove(&csid);
    }
    if let Some(id) = csdb_id {
        let now = m.clock.wall();
        m.csdb.lost_connection(id, now);
    }
    m.cs.sessions.remove(&sid);
}

pub fn disconnect_all(m: &mut Master) {
    let sids: Vec<SessId> = m.cs.sessions.keys().copied().collect();
    for sid in sids {
        session_closed(m, sid);
    }
}

/// Emits a keepalive on every session whose outbound side has been quiet
/// for over a second.
pub fn keepalive_tick(m: &mut Master) {
    let now = m.clock.mono();
    for s in m.cs.sessions.values_mut() {
        if !s.kill && s.last_enqueue + 1.0 < now {
            s.send(proto::framing::nop_frame(), now);
        }
    }
}

/// Pushes the forced timeout to peers new enough to accept it; older peers
/// silently keep whatever they advertised.
pub fn broadcast_timeout(m: &mut Master) {
    if m.cfg.matocs_force_timeout == 0 {
        return;
    }
    let force = m.cfg.matocs_force_timeout as u16;
    let now = m.clock.mono();
    for s in m.cs.sessions.values_mut() {
        if !s.kill && s.version >= proto::version2int(4, 12, 0) {
            s.timeout = force;
            let mut w = PacketWriter::new(proto::ANTOAN_FORCE_TIMEOUT, 2);
            w.put_u16(force);
            s.send(w.finish(), now);
        }
    }
}

/// Asks still-registering servers (new enough to understand it) to announce
/// a particular chunk as soon as they see it.
pub fn broadcast_regfirst_chunk(m: &mut Master, chunkid: u64) {
    let now = m.clock.mono();
    for s in m.cs.sessions.values_mut() {
        if !s.kill && s.reg != RegPhase::Registered && s.version >= proto::version2int(4, 30, 0) {
            let mut w = PacketWriter::new(proto::MATOCS_REGISTER_FIRST, 8);
            w.put_u64(chunkid);
            s.send(w.finish(), now);
        }
    }
}

/// Chunk presence probe, gated by the check-mode knob.
pub fn broadcast_chunk_status(m: &mut Master, chunkid: u64) {
    if m.cs.check_mode == 0 {
        return;
    }
    let now = m.clock.mono();
    for s in m.cs.sessions.values_mut() {
        if !s.kill
            && s.version >= proto::version2int(4, 32, 0)
            && s.reg == RegPhase::Registered
            && s.receivingchunks == 0
        {
            let mut w = PacketWriter::new(proto::MATOCS_CHUNK_STATUS, 8);
            w.put_u64(chunkid);
            s.send(w.finish(), now);
        }
    }
}

/// Client-facing address of a connected server, rewritten for the client's
/// LAN when the master knows a better route.
pub fn get_csdata(m: &Master, sid: SessId, client_ip: u32) -> Option<(u32, u16, u32, u32)> {
    let s = m.cs.session(sid)?;
    if s.kill {
        return None;
    }
    let ip = m.multilan.map(s.serv_ip, client_ip);
    Some((ip, s.serv_port, s.version, s.labelmask))
}

// ---------------------------------------------------------------------------
// inbound dispatch

pub fn handle_frame(m: &mut Master, sid: SessId, ptype: u32, data: &[u8]) {
    {
        let Some(s) = m.cs.sessions.get(&sid) else { return };
        if s.kill {
            return;
        }
        if ptype != proto::CSTOMA_REGISTER
            && ptype != proto::ANTOAN_NOP
            && s.csid == proto::MAX_CS_COUNT
        {
            warn!("got command type {} from unregistered chunk server", ptype);
            kill(m, sid);
            return;
        }
    }
    match ptype {
        proto::ANTOAN_NOP => {}
        proto::ANTOAN_UNKNOWN_COMMAND => {}
        proto::ANTOAN_BAD_COMMAND_SIZE => {}
        proto::ANTOAN_GET_VERSION => get_version(m, sid, data),
        proto::ANTOAN_GET_CONFIG => get_config(m, sid, data),
        proto::CSTOMA_REGISTER => register(m, sid, data),
        proto::CSTOMA_SPACE => space(m, sid, data),
        proto::CSTOMA_CURRENT_LOAD => current_load(m, sid, data),
        proto::CSTOMA_CHUNK_DAMAGED => chunk_damaged(m, sid, data),
        proto::CSTOMA_CHUNK_LOST => chunks_lost(m, sid, data),
        proto::CSTOMA_CHUNK_NEW => chunks_new(m, sid, data),
        proto::CSTOMA_CHUNK_DOESNT_EXIST => nonexistent_chunks(m, sid, data),
        proto::CSTOMA_ERROR_OCCURRED => error_occurred(m, sid, data),
        proto::CSTOMA_LABELS => labels(m, sid, data),
        proto::CSTOMA_CHUNK_STATUS => got_chunk_status(m, sid, data),
        proto::CSTOMA_CREATE => got_createchunk_status(m, sid, data),
        proto::CSTOMA_DELETE => got_deletechunk_status(m, sid, data),
        proto::CSTOMA_REPLICATE
        | proto::CSTOMA_REPLICATE_SPLIT
        | proto::CSTOMA_REPLICATE_RECOVER
        | proto::CSTOMA_REPLICATE_JOIN => got_replicatechunk_status(m, sid, data),
        proto::CSTOMA_SET_VERSION => got_setchunkversion_status(m, sid, data),
        proto::CSTOMA_DUPLICATE => got_duplicatechunk_status(m, sid, data),
        proto::CSTOMA_TRUNCATE => got_truncatechunk_status(m, sid, data),
        proto::CSTOMA_DUPTRUNC => got_duptruncchunk_status(m, sid, data),
        proto::CSTOMA_LOCALSPLIT => got_localsplitchunk_status(m, sid, data),
        proto::CSTOMA_CHUNKOP => got_chunkop_status(m, sid, data),
        _ => {
            warn!("master <-> chunkservers module: got unknown message (type:{})", ptype);
            kill(m, sid);
        }
    }
}

fn get_version(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() != 0 && data.len() != 4 {
        warn!("GET_VERSION - wrong size ({}/4|0)", data.len());
        kill(m, sid);
        return;
    }
    let vstring = proto::version_str();
    let now = m.clock.mono();
    let Some(s) = m.cs.sessions.get_mut(&sid) else { return };
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
    let Some(s) = m.cs.sessions.get_mut(&sid) else { return };
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

struct RegisterBegin {
    version: u32,
    serv_ip: u32,
    serv_port: u16,
    timeout: u16,
    csid: u16,
    usedspace: u64,
    totalspace: u64,
    chunkscount: u32,
    todelusedspace: u64,
    todeltotalspace: u64,
    todelchunkscount: u32,
}

fn register(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() % 2 == 0 {
        warn!("REGISTER: chunkserver is too old");
        kill(m, sid);
        return;
    }
    let rversion = data[0];
    let reg = match m.cs.sessions.get(&sid) {
        Some(s) => s.reg,
        None => return,
    };
    if reg == RegPhase::Registered && rversion != 63 {
        warn!("got register message from registered chunkserver !!!");
        kill(m, sid);
        return;
    }
    match rversion {
        60 => register_begin(m, sid, &data[1..], data.len()),
        61 => register_chunks(m, sid, &data[1..], data.len()),
        62 => register_end(m, sid, data.len()),
        63 => register_disconnect(m, sid, data.len()),
        _ => {
            warn!("REGISTER - register version not supported ({}/60..63)", rversion);
            kill(m, sid);
        }
    }
}

fn register_begin(m: &mut Master, sid: SessId, body: &[u8], length: usize) {
    if length != 55 && length != 71 {
        warn!("REGISTER (BEGIN) - wrong size ({}/55|71)", length);
        kill(m, sid);
        return;
    }
    let mut r = PacketReader::new(body);

    if let Some(code) = m.cfg.auth_code.clone() {
        if length == 55 {
            // no credentials yet: issue the nonce challenge
            let mut nonce = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut nonce);
            let now = m.clock.mono();
            let Some(s) = m.cs.sessions.get_mut(&sid) else { return };
            s.nonce = Some(nonce);
            let mut w = PacketWriter::new(proto::MATOCS_MASTER_ACK, 33);
            w.put_u8(3).put_bytes(&nonce);
            s.send(w.finish(), now);
            return;
        }
        let Ok(digest) = r.get_bytes(16) else {
            kill(m, sid);
            return;
        };
        let nonce = m.cs.sessions.get(&sid).and_then(|s| s.nonce);
        let ok = nonce
            .map(|n| {
                let mut ctx = md5::Context::new();
                ctx.consume(&n[0..16]);
                ctx.consume(code.as_bytes());
                ctx.consume(&n[16..32]);
                ctx.compute().0 == digest
            })
            .unwrap_or(false);
        if !ok {
            warn!("REGISTER (BEGIN) - access denied - check password");
            kill(m, sid);
            return;
        }
    } else if length == 71 {
        warn!("REGISTER (BEGIN) - unexpected credentials (no auth code configured)");
        kill(m, sid);
        return;
    }

    let parsed = (|| -> Result<RegisterBegin> {
        Ok(RegisterBegin {
            version: r.get_u32()?,
            serv_ip: r.get_u32()?,
            serv_port: r.get_u16()?,
            timeout: r.get_u16()?,
            csid: r.get_u16()?,
            usedspace: r.get_u64()?,
            totalspace: r.get_u64()?,
            chunkscount: r.get_u32()?,
            todelusedspace: r.get_u64()?,
            todeltotalspace: r.get_u64()?,
            todelchunkscount: r.get_u32()?,
        })
    })();
    let Ok(mut reg) = parsed else {
        warn!("REGISTER (BEGIN) - malformed packet");
        kill(m, sid);
        return;
    };

    if m.cfg.matocs_force_timeout > 0 {
        reg.timeout = m.cfg.matocs_force_timeout as u16;
    } else if reg.timeout == 0 {
        reg.timeout = m.cfg.matocs_timeout as u16;
    }
    if reg.timeout < 10 {
        warn!(
            "REGISTER communication timeout too small ({} seconds - should be at least 10 seconds)",
            reg.timeout
        );
        kill(m, sid);
        return;
    }

    let peer_ip = m.cs.sessions.get(&sid).map(|s| s.peer_ip).unwrap_or(0);
    if reg.serv_ip == 0 {
        reg.serv_ip = peer_ip;
    }
    if let Some((mask, src, dst)) = m.cfg.remap() {
        if reg.serv_ip & mask == src {
            reg.serv_ip = (reg.serv_ip & !mask) | dst;
        }
    }
    let servdesc = format!("{}:{}", proto::ip_to_str(reg.serv_ip), reg.serv_port);
    if reg.serv_ip & 0xFF000000 == 0x7F000000 {
        warn!(
            "chunkserver connected using localhost ({}) - you cannot use localhost for communication between chunkserver and master",
            servdesc
        );
        kill(m, sid);
        return;
    }

    let now = m.clock.wall();
    let mut events = Vec::new();
    let csdb_id = m.csdb.new_connection(reg.serv_ip, reg.serv_port, reg.csid, sid, now, &mut |l| {
        events.push(l)
    });
    let Some(csdb_id) = csdb_id else {
        warn!("can't accept chunkserver {}", servdesc);
        for l in events {
            m.changelog_line(l);
        }
        kill(m, sid);
        return;
    };
    let db_csid = m.csdb.get_csid(csdb_id, now, &mut |l| events.push(l));
    for l in events {
        m.changelog_line(l);
    }

    let us = reg.usedspace as f64 / (1024.0 * 1024.0 * 1024.0);
    let ts = reg.totalspace as f64 / (1024.0 * 1024.0 * 1024.0);
    info!(
        "chunkserver {} register begin, usedspace: {} ({:.2} GiB), totalspace: {} ({:.2} GiB)",
        servdesc, reg.usedspace, us, reg.totalspace, ts
    );

    let meta_id = m.meta.id();
    let slot = m.chunks.server_connected(sid);
    let now_mono = m.clock.mono();
    let Some(s) = m.cs.sessions.get_mut(&sid) else { return };
    s.version = reg.version;
    s.serv_ip = reg.serv_ip;
    s.serv_port = reg.serv_port;
    s.timeout = reg.timeout;
    s.usedspace = reg.usedspace;
    s.totalspace = reg.totalspace;
    s.chunkscount = reg.chunkscount;
    s.todelusedspace = reg.todelusedspace;
    s.todeltotalspace = reg.todeltotalspace;
    s.todelchunkscount = reg.todelchunkscount;
    s.servdesc = servdesc;
    s.csdb = Some(csdb_id);
    s.reg = RegPhase::Waiting;
    if reg.version >= proto::version2int(1, 6, 28) {
        let mode = reg.version >= proto::version2int(2, 0, 33);
        let mut w = PacketWriter::new(proto::MATOCS_MASTER_ACK, if mode { 17 } else { 9 });
        w.put_u8(0)
            .put_u32(proto::VERSHEX)
            .put_u16(reg.timeout)
            .put_u16(db_csid);
        if mode {
            w.put_u64(meta_id);
        }
        s.send(w.finish(), now_mono);
    }
    s.csid = slot;
    m.cs.by_csid.insert(slot, sid);
}

fn register_chunks(m: &mut Master, sid: SessId, body: &[u8], length: usize) {
    if (length - 1) % 12 != 0 {
        warn!("REGISTER (CHUNKS) - wrong size ({}/1+N*12)", length);
        kill(m, sid);
        return;
    }
    let (csid, version, has_csdb) = match m.cs.sessions.get_mut(&sid) {
        Some(s) => {
            if s.csdb.is_some() {
                s.newchunkdelay = NEW_CHUNK_DELAY;
                s.receivingchunks |= proto::TRANSFERRING_NEW_CHUNKS;
            }
            (s.csid, s.version, s.csdb.is_some())
        }
        None => return,
    };
    if !has_csdb {
        warn!("REGISTER (CHUNKS) - CHUNKS packet before proper BEGIN packet");
        kill(m, sid);
        return;
    }
    m.cs.receivingchunks |= proto::TRANSFERRING_NEW_CHUNKS;
    let mut r = PacketReader::new(body);
    while r.remaining() >= 12 {
        let (chunkid, ecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
        let chunkversion = r.get_u32().expect("size checked");
        m.chunks.server_has_chunk(csid, chunkid, ecid, chunkversion);
    }
    if version >= proto::version2int(2, 0, 0) {
        let now = m.clock.mono();
        if let Some(s) = m.cs.sessions.get_mut(&sid) {
            let mut w = PacketWriter::new(proto::MATOCS_MASTER_ACK, 1);
            w.put_u8(0);
            s.send(w.finish(), now);
        }
    }
}

fn register_end(m: &mut Master, sid: SessId, length: usize) {
    if length != 1 {
        warn!("REGISTER (END) - wrong size ({}/1)", length);
        kill(m, sid);
        return;
    }
    let csid = match m.cs.sessions.get_mut(&sid) {
        Some(s) if s.csdb.is_some() => {
            info!("chunkserver {} register end", s.servdesc);
            s.reg = RegPhase::Registered;
            s.csid
        }
        Some(_) => {
            warn!("REGISTER (END) - END packet before proper BEGIN packet");
            kill(m, sid);
            return;
        }
        None => return,
    };
    m.chunks.server_register_end(csid);
}

fn register_disconnect(m: &mut Master, sid: SessId, length: usize) {
    if length != 1 {
        warn!("REGISTER (DISCONNECT) - wrong size ({}/1)", length);
        kill(m, sid);
        return;
    }
    let csdb_id = match m.cs.sessions.get(&sid) {
        Some(s) => {
            info!("chunkserver {} graceful disconnection", s.servdesc);
            s.csdb
        }
        None => return,
    };
    if let Some(id) = csdb_id {
        let now = m.clock.wall();
        let mut events = Vec::new();
        m.csdb.temporary_maintenance_mode(id, now, &mut |l| events.push(l));
        for l in events {
            m.changelog_line(l);
        }
    }
    kill(m, sid);
}

fn space(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() != 16 && data.len() != 32 && data.len() != 40 {
        warn!("SPACE - wrong size ({}/16|32|40)", data.len());
        kill(m, sid);
        return;
    }
    let Some(s) = m.cs.sessions.get_mut(&sid) else { return };
    let mut r = PacketReader::new(data);
    s.usedspace = r.get_u64().expect("size checked");
    s.totalspace = r.get_u64().expect("size checked");
    if data.len() == 40 {
        s.chunkscount = r.get_u32().expect("size checked");
    }
    if data.len() >= 32 {
        s.todelusedspace = r.get_u64().expect("size checked");
        s.todeltotalspace = r.get_u64().expect("size checked");
        if data.len() == 40 {
            s.todelchunkscount = r.get_u32().expect("size checked");
        }
    }
}

fn current_load(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() < 4 || data.len() > 6 {
        warn!("CURRENT_LOAD - wrong size ({}/4-6)", data.len());
        kill(m, sid);
        return;
    }
    let (load, csdb_id) = {
        let Some(s) = m.cs.sessions.get_mut(&sid) else { return };
        let mut r = PacketReader::new(data);
        s.load = r.get_u32().expect("size checked");
        if data.len() >= 5 {
            s.hlstatus = r.get_u8().expect("size checked");
        }
        if data.len() >= 6 {
            s.receivingchunks = r.get_u8().expect("size checked");
        }
        (s.load, s.csdb)
    };
    if let Some(id) = csdb_id {
        let now = m.clock.wall();
        m.csdb.server_load(id, load, now);
    }
}

fn chunk_batch(m: &mut Master, sid: SessId, data: &[u8], what: &str) -> Option<(u16, usize)> {
    if data.len() % 8 != 0 {
        warn!("{} - wrong size ({}/N*8)", what, data.len());
        kill(m, sid);
        return None;
    }
    let csid = m.cs.sessions.get(&sid).map(|s| s.csid)?;
    Some((csid, data.len() / 8))
}

fn chunk_damaged(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((csid, n)) = chunk_batch(m, sid, data, "CHUNK_DAMAGED") else { return };
    let mut r = PacketReader::new(data);
    for _ in 0..n {
        let (chunkid, ecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
        m.chunks.chunk_damaged(csid, chunkid, ecid);
    }
}

fn chunks_lost(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((csid, n)) = chunk_batch(m, sid, data, "CHUNK_LOST") else { return };
    if let Some(s) = m.cs.sessions.get_mut(&sid) {
        s.lostchunkdelay = LOST_CHUNK_DELAY;
        s.receivingchunks |= proto::TRANSFERRING_LOST_CHUNKS;
    }
    m.cs.receivingchunks |= proto::TRANSFERRING_LOST_CHUNKS;
    let mut r = PacketReader::new(data);
    for _ in 0..n {
        let (chunkid, ecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
        m.chunks.chunk_lost(csid, chunkid, ecid, false);
    }
}

fn nonexistent_chunks(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((csid, n)) = chunk_batch(m, sid, data, "CHUNK_DOESNT_EXIST") else { return };
    let mut r = PacketReader::new(data);
    for _ in 0..n {
        let (chunkid, ecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
        m.chunks.chunk_lost(csid, chunkid, ecid, true);
    }
}

fn chunks_new(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() % 12 != 0 {
        warn!("CHUNK_NEW - wrong size ({}/N*12)", data.len());
        kill(m, sid);
        return;
    }
    let csid = match m.cs.sessions.get_mut(&sid) {
        Some(s) => {
            s.newchunkdelay = NEW_CHUNK_DELAY;
            s.receivingchunks |= proto::TRANSFERRING_NEW_CHUNKS;
            s.csid
        }
        None => return,
    };
    m.cs.receivingchunks |= proto::TRANSFERRING_NEW_CHUNKS;
    let mut r = PacketReader::new(data);
    while r.remaining() >= 12 {
        let (chunkid, ecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
        let version = r.get_u32().expect("size checked");
        m.chunks.server_has_chunk(csid, chunkid, ecid, version);
    }
}

fn error_occurred(m: &mut Master, sid: SessId, data: &[u8]) {
    if !data.is_empty() {
        warn!("ERROR_OCCURRED - wrong size ({}/0)", data.len());
        kill(m, sid);
        return;
    }
    if let Some(s) = m.cs.sessions.get_mut(&sid) {
        s.errorcounter += 1;
    }
}

fn labels(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() != 4 {
        warn!("LABELS - wrong size ({}/4)", data.len());
        kill(m, sid);
        return;
    }
    let Some(s) = m.cs.sessions.get_mut(&sid) else { return };
    s.labelmask = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let mut txt = String::new();
    for i in 0..26u32 {
        if s.labelmask & (1 << i) != 0 {
            if !txt.is_empty() {
                txt.push(',');
            }
            txt.push((b'A' + i as u8) as char);
        }
    }
    s.labelstr = Some(txt);
}

fn got_chunk_status(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() < 8 || data.len() % 8 != 0 || data.len() / 8 > 256 {
        warn!("CHUNK_STATUS - wrong size ({}/8+8*n)", data.len());
        kill(m, sid);
        return;
    }
    let skip = match m.cs.sessions.get(&sid) {
        Some(s) => s.receivingchunks != 0 || s.reg != RegPhase::Registered,
        None => return,
    };
    if skip || m.cs.check_mode == 0 {
        return;
    }
    let mut r = PacketReader::new(data);
    let chunkid = r.get_u64().expect("size checked");
    let mut parts = 0u32;
    while r.remaining() >= 8 {
        let _ecid = r.get_u8().expect("size checked");
        let _damaged = r.get_u8().expect("size checked");
        let _blocks = r.get_u16().expect("size checked");
        let _version = r.get_u32().expect("size checked");
        parts += 1;
    }
    debug!("chunk {:016X} status report with {} parts", chunkid, parts);
}

// ---------------------------------------------------------------------------
// per-chunk command acknowledgements

fn status_ack(m: &mut Master, sid: SessId, data: &[u8], what: &str) -> Option<(u64, u8, u8)> {
    if data.len() != 9 {
        warn!("{} - wrong size ({}/9)", what, data.len());
        kill(m, sid);
        return None;
    }
    let mut r = PacketReader::new(data);
    let (chunkid, ecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
    let status = r.get_u8().expect("size checked");
    Some((chunkid, ecid, status))
}

fn log_chunk_status(sess: &str, chunkid: u64, ecid: u8, what: &str, status: u8) {
    if status != proto::STATUS_OK {
        info!(
            "({}) chunk: {:016X}{} {} status: {}",
            sess,
            chunkid,
            proto::ecid_to_str(ecid),
            what,
            proto::status_str(status)
        );
    }
}

fn got_createchunk_status(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((chunkid, ecid, status)) = status_ack(m, sid, data, "CSTOMA_CREATE") else { return };
    let Some(s) = m.cs.sessions.get(&sid) else { return };
    log_chunk_status(&s.servdesc, chunkid, ecid, "creation", status);
    let csid = s.csid;
    m.chunks.got_create_status(csid, chunkid, ecid, status);
}

fn got_deletechunk_status(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((chunkid, ecid, status)) = status_ack(m, sid, data, "CSTOMA_DELETE") else { return };
    let combined = proto::combine_chunkid(chunkid, ecid);
    let ok = status == proto::STATUS_OK;
    if let Some(rec) = m.cs.ops.end(combined, sid) {
        if rec.optype == OpType::Delete {
            if let Some(s) = m.cs.sessions.get_mut(&sid) {
                s.delcounter = s.delcounter.saturating_sub(1);
                if ok {
                    s.counters.del_ok[rec.reason as usize] += 1;
                } else {
                    s.counters.del_err[rec.reason as usize] += 1;
                }
            }
        }
    }
    let Some(s) = m.cs.sessions.get(&sid) else { return };
    log_chunk_status(&s.servdesc, chunkid, ecid, "deletion", status);
    let csid = s.csid;
    m.chunks.got_delete_status(csid, chunkid, ecid, status);
}

fn got_replicatechunk_status(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() != 13 {
        warn!("CSTOMA_REPLICATE - wrong size ({}/13)", data.len());
        kill(m, sid);
        return;
    }
    let mut r = PacketReader::new(data);
    let (chunkid, ecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
    let version = r.get_u32().expect("size checked");
    let status = r.get_u8().expect("size checked");
    let combined = proto::combine_chunkid(chunkid, ecid);
    let ok = status == proto::STATUS_OK;
    if let Some(rec) = m.cs.reps.end(combined, version, sid) {
        if !ok {
            info!(
                "chunk: {:016X}{} {} replication status: {}",
                chunkid,
                proto::ecid_to_str(ecid),
                rec.reptype.as_str(),
                proto::status_str(status)
            );
        }
        m.cs.finish_replication(sid, &rec, ok);
    } else {
        debug!(
            "unexpected replication status for chunk {:016X}{} from session {}",
            chunkid,
            proto::ecid_to_str(ecid),
            sid
        );
    }
    let csid = match m.cs.sessions.get(&sid) {
        Some(s) => s.csid,
        None => return,
    };
    m.chunks.got_replicate_status(csid, chunkid, ecid, version, status);
}

fn got_setchunkversion_status(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((chunkid, ecid, status)) = status_ack(m, sid, data, "CSTOMA_SET_VERSION") else {
        return;
    };
    let Some(s) = m.cs.sessions.get(&sid) else { return };
    log_chunk_status(&s.servdesc, chunkid, ecid, "set version", status);
    let csid = s.csid;
    m.chunks.got_setversion_status(csid, chunkid, ecid, status);
}

fn got_duplicatechunk_status(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((chunkid, ecid, status)) = status_ack(m, sid, data, "CSTOMA_DUPLICATE") else { return };
    let Some(s) = m.cs.sessions.get(&sid) else { return };
    log_chunk_status(&s.servdesc, chunkid, ecid, "duplication", status);
    let csid = s.csid;
    m.chunks.got_duplicate_status(csid, chunkid, ecid, status);
}

fn got_truncatechunk_status(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((chunkid, ecid, status)) = status_ack(m, sid, data, "CSTOMA_TRUNCATE") else { return };
    let Some(s) = m.cs.sessions.get(&sid) else { return };
    log_chunk_status(&s.servdesc, chunkid, ecid, "truncate", status);
    let csid = s.csid;
    m.chunks.got_truncate_status(csid, chunkid, ecid, status);
}

fn got_duptruncchunk_status(m: &mut Master, sid: SessId, data: &[u8]) {
    let Some((chunkid, ecid, status)) = status_ack(m, sid, data, "CSTOMA_DUPTRUNC") else { return };
    let Some(s) = m.cs.sessions.get(&sid) else { return };
    log_chunk_status(&s.servdesc, chunkid, ecid, "duplication with truncate", status);
    let csid = s.csid;
    m.chunks.got_duptrunc_status(csid, chunkid, ecid, status);
}

fn got_localsplitchunk_status(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() != 13 {
        warn!("CSTOMA_LOCALSPLIT - wrong size ({}/13)", data.len());
        kill(m, sid);
        return;
    }
    let mut r = PacketReader::new(data);
    let chunkid = r.get_u64().expect("size checked");
    let version = r.get_u32().expect("size checked");
    let status = r.get_u8().expect("size checked");
    let ok = status == proto::STATUS_OK;
    if let Some(rec) = m.cs.reps.end(chunkid, version, sid) {
        m.cs.finish_replication(sid, &rec, ok);
    }
    let Some(s) = m.cs.sessions.get(&sid) else { return };
    if status != proto::STATUS_OK {
        info!(
            "({}) chunk: {:016X} localsplit status: {}",
            s.servdesc,
            chunkid,
            proto::status_str(status)
        );
    }
    let csid = s.csid;
    m.chunks.got_localsplit_status(csid, chunkid, version, status);
}

fn got_chunkop_status(m: &mut Master, sid: SessId, data: &[u8]) {
    if data.len() != 33 {
        warn!("CSTOMA_CHUNKOP - wrong size ({}/33)", data.len());
        kill(m, sid);
        return;
    }
    let mut r = PacketReader::new(data);
    let (chunkid, ecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
    let version = r.get_u32().expect("size checked");
    let newversion = r.get_u32().expect("size checked");
    let (copychunkid, copyecid) = proto::split_chunkid(r.get_u64().expect("size checked"));
    let _copyversion = r.get_u32().expect("size checked");
    let _leng = r.get_u32().expect("size checked");
    let status = r.get_u8().expect("size checked");
    let csid = match m.cs.sessions.get(&sid) {
        Some(s) => s.csid,
        None => return,
    };
    if newversion != version {
        m.chunks.got_chunkop_status(csid, chunkid, ecid, status);
    }
    if copychunkid > 0 {
        m.chunks.got_chunkop_status(csid, copychunkid, copyecid, status);
    }
}

// ---------------------------------------------------------------------------
// outbound commands

fn send_to(m: &mut Master, sid: SessId, frame: Bytes) {
    let now = m.clock.mono();
    if let Some(s) = m.cs.sessions.get_mut(&sid) {
        if !s.kill {
            s.send(frame, now);
        }
    }
}

pub fn send_createchunk(m: &mut Master, sid: SessId, chunkid: u64, ecid: u8, version: u32) {
    let mut w = PacketWriter::new(proto::MATOCS_CREATE, 12);
    w.put_u64(proto::combine_chunkid(chunkid, ecid)).put_u32(version);
    send_to(m, sid, w.finish());
}

pub fn send_deletechunk(
    m: &mut Master,
    sid: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    reason: OpReason,
) -> Result<()> {
    let combined = proto::combine_chunkid(chunkid, ecid);
    if m.cs.ops.contains(combined, sid) {
        return Err(MasterError::AlreadyPending);
    }
    let now = m.clock.mono();
    let Some(s) = m.cs.sessions.get_mut(&sid) else { return Ok(()) };
    if s.kill {
        return Ok(());
    }
    let mut w = PacketWriter::new(proto::MATOCS_DELETE, 12);
    w.put_u64(combined).put_u32(version);
    s.send(w.finish(), now);
    s.delcounter += 1;
    s.del_total += 1;
    m.cs.ops.begin(combined, version, sid, OpType::Delete, reason);
    Ok(())
}

fn begin_replication(
    m: &mut Master,
    combined: u64,
    version: u32,
    dst: SessId,
    sources: &[SessId],
    rweight: u8,
    wweight: u8,
    reptype: RepType,
    reason: ReplReason,
) {
    m.cs
        .reps
        .begin(combined, version, dst, sources, rweight, wweight, reptype, reason);
    for src in sources {
        if let Some(s) = m.cs.sessions.get_mut(src) {
            s.rrepcounter += rweight as u16;
            s.rrep_total += 1;
        }
    }
    if let Some(s) = m.cs.sessions.get_mut(&dst) {
        s.wrepcounter += wweight as u16;
        s.wrep_total += 1;
    }
}

pub fn send_replicatechunk(
    m: &mut Master,
    dst: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    src: SessId,
    reason: ReplReason,
) -> Result<()> {
    let combined = proto::combine_chunkid(chunkid, ecid);
    if m.cs.reps.contains(combined, version, dst) {
        return Err(MasterError::AlreadyPending);
    }
    let (src_ip, src_port, src_alive) = match m.cs.sessions.get(&src) {
        Some(s) => (s.serv_ip, s.serv_port, !s.kill),
        None => return Ok(()),
    };
    let dst_alive = m.cs.sessions.get(&dst).map(|s| !s.kill).unwrap_or(false);
    if !src_alive || !dst_alive {
        return Ok(());
    }
    let w8 = if ecid == 0 {
        FULL_REPLICATION_WEIGHT
    } else {
        EC_REPLICATION_WEIGHT
    };
    let mut w = PacketWriter::new(proto::MATOCS_REPLICATE, 18);
    w.put_u64(combined).put_u32(version).put_u32(src_ip).put_u16(src_port);
    send_to(m, dst, w.finish());
    begin_replication(m, combined, version, dst, &[src], w8, w8, RepType::Simple, reason);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn send_replicatechunk_split(
    m: &mut Master,
    dst: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    src: SessId,
    src_ecid: u8,
    partno: u8,
    parts: u8,
    reason: ReplReason,
) -> Result<()> {
    let combined = proto::combine_chunkid(chunkid, ecid);
    if m.cs.reps.contains(combined, version, dst) {
        return Err(MasterError::AlreadyPending);
    }
    let (src_ip, src_port, src_alive) = match m.cs.sessions.get(&src) {
        Some(s) => (s.serv_ip, s.serv_port, !s.kill),
        None => return Ok(()),
    };
    let dst_alive = m.cs.sessions.get(&dst).map(|s| !s.kill).unwrap_or(false);
    if !src_alive || !dst_alive {
        return Ok(());
    }
    let mut w = PacketWriter::new(proto::MATOCS_REPLICATE_SPLIT, 28);
    w.put_u64(combined)
        .put_u32(version)
        .put_u32(src_ip)
        .put_u16(src_port)
        .put_u64(proto::combine_chunkid(chunkid, src_ecid))
        .put_u8(partno)
        .put_u8(parts);
    send_to(m, dst, w.finish());
    begin_replication(
        m,
        combined,
        version,
        dst,
        &[src],
        EC_REPLICATION_WEIGHT,
        EC_REPLICATION_WEIGHT,
        RepType::Split,
        reason,
    );
    Ok(())
}

fn survivor_endpoints(m: &Master, survivors: &[SessId]) -> Option<Vec<(u32, u16)>> {
    survivors
        .iter()
        .map(|sid| {
            m.cs.sessions
                .get(sid)
                .filter(|s| !s.kill)
                .map(|s| (s.serv_ip, s.serv_port))
        })
        .collect()
}

pub fn send_replicatechunk_recover(
    m: &mut Master,
    dst: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    survivors: &[SessId],
    survivor_ecids: &[u8],
    reason: ReplReason,
) -> Result<()> {
    let combined = proto::combine_chunkid(chunkid, ecid);
    if m.cs.reps.contains(combined, version, dst) {
        return Err(MasterError::AlreadyPending);
    }
    if m.cs.sessions.get(&dst).map(|s| s.kill).unwrap_or(true) {
        return Ok(());
    }
    let Some(endpoints) = survivor_endpoints(m, survivors) else {
        return Ok(());
    };
    let parts = survivors.len() as u8;
    let mut w = PacketWriter::new(
        proto::MATOCS_REPLICATE_RECOVER,
        8 + 4 + 16 + 1 + parts as u32 * 14,
    );
    w.put_u64(combined).put_u32(version);
    match parts {
        8 => {
            w.put_u32(0x88888888).put_u32(0x44444444).put_u32(0x22222222).put_u32(0x11111111);
        }
        4 => {
            w.put_u32(0x8888).put_u32(0x4444).put_u32(0x2222).put_u32(0x1111);
        }
        _ => {
            w.put_u32(0).put_u32(0).put_u32(0).put_u32(0);
        }
    }
    w.put_u8(parts);
    for (i, (ip, port)) in endpoints.iter().enumerate() {
        w.put_u32(*ip).put_u16(*port).put_u64(proto::combine_chunkid(chunkid, survivor_ecids[i]));
    }
    send_to(m, dst, w.finish());
    begin_replication(
        m,
        combined,
        version,
        dst,
        survivors,
        EC_REPLICATION_WEIGHT,
        EC_REPLICATION_WEIGHT,
        RepType::Recover,
        reason,
    );
    Ok(())
}

pub fn send_replicatechunk_join(
    m: &mut Master,
    dst: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    survivors: &[SessId],
    survivor_ecids: &[u8],
    reason: ReplReason,
) -> Result<()> {
    let combined = proto::combine_chunkid(chunkid, ecid);
    if m.cs.reps.contains(combined, version, dst) {
        return Err(MasterError::AlreadyPending);
    }
    if m.cs.sessions.get(&dst).map(|s| s.kill).unwrap_or(true) {
        return Ok(());
    }
    let Some(endpoints) = survivor_endpoints(m, survivors) else {
        return Ok(());
    };
    let parts = survivors.len() as u8;
    let mut w = PacketWriter::new(proto::MATOCS_REPLICATE_JOIN, 8 + 4 + 1 + parts as u32 * 14);
    w.put_u64(combined).put_u32(version).put_u8(parts);
    for (i, (ip, port)) in endpoints.iter().enumerate() {
        w.put_u32(*ip).put_u16(*port).put_u64(proto::combine_chunkid(chunkid, survivor_ecids[i]));
    }
    send_to(m, dst, w.finish());
    begin_replication(
        m,
        combined,
        version,
        dst,
        survivors,
        EC_REPLICATION_WEIGHT,
        FULL_REPLICATION_WEIGHT,
        RepType::Join,
        reason,
    );
    Ok(())
}

pub fn send_localsplitchunk(
    m: &mut Master,
    sid: SessId,
    chunkid: u64,
    version: u32,
    missingmask: u32,
    parts: u8,
    reason: ReplReason,
) -> Result<()> {
    if m.cs.reps.contains(chunkid, version, sid) {
        return Err(MasterError::AlreadyPending);
    }
    let send_parts = match m.cs.sessions.get(&sid) {
        Some(s) if !s.kill => s.version >= proto::version2int(4, 25, 0),
        _ => return Ok(()),
    };
    let mut w = PacketWriter::new(
        proto::MATOCS_LOCALSPLIT,
        if send_parts { 17 } else { 16 },
    );
    w.put_u64(chunkid).put_u32(version).put_u32(missingmask);
    if send_parts {
        w.put_u8(parts);
    }
    send_to(m, sid, w.finish());
    begin_replication(
        m,
        chunkid,
        version,
        sid,
        &[sid],
        FULL_REPLICATION_WEIGHT,
        LOCALPART_REPLICATION_WEIGHT * missingmask.count_ones() as u8,
        RepType::LocalSplit,
        reason,
    );
    Ok(())
}

pub fn send_setchunkversion(
    m: &mut Master,
    sid: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    oldversion: u32,
) {
    let mut w = PacketWriter::new(proto::MATOCS_SET_VERSION, 16);
    w.put_u64(proto::combine_chunkid(chunkid, ecid)).put_u32(version).put_u32(oldversion);
    send_to(m, sid, w.finish());
}

#[allow(clippy::too_many_arguments)]
pub fn send_duplicatechunk(
    m: &mut Master,
    sid: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    oldchunkid: u64,
    oldecid: u8,
    oldversion: u32,
) {
    let mut w = PacketWriter::new(proto::MATOCS_DUPLICATE, 24);
    w.put_u64(proto::combine_chunkid(chunkid, ecid))
        .put_u32(version)
        .put_u64(proto::combine_chunkid(oldchunkid, oldecid))
        .put_u32(oldversion);
    send_to(m, sid, w.finish());
}

pub fn send_truncatechunk(
    m: &mut Master,
    sid: SessId,
    chunkid: u64,
    ecid: u8,
    length: u32,
    version: u32,
    oldversion: u32,
) {
    let mut w = PacketWriter::new(proto::MATOCS_TRUNCATE, 20);
    w.put_u64(proto::combine_chunkid(chunkid, ecid))
        .put_u32(length)
        .put_u32(version)
        .put_u32(oldversion);
    send_to(m, sid, w.finish());
}

#[allow(clippy::too_many_arguments)]
pub fn send_duptruncchunk(
    m: &mut Master,
    sid: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    oldchunkid: u64,
    oldecid: u8,
    oldversion: u32,
    length: u32,
) {
    let mut w = PacketWriter::new(proto::MATOCS_DUPTRUNC, 28);
    w.put_u64(proto::combine_chunkid(chunkid, ecid))
        .put_u32(version)
        .put_u64(proto::combine_chunkid(oldchunkid, oldecid))
        .put_u32(oldversion)
        .put_u32(length);
    send_to(m, sid, w.finish());
}

#[allow(clippy::too_many_arguments)]
pub fn send_chunkop(
    m: &mut Master,
    sid: SessId,
    chunkid: u64,
    ecid: u8,
    version: u32,
    newversion: u32,
    copychunkid: u64,
    copyecid: u8,
    copyversion: u32,
    leng: u32,
) {
    let mut w = PacketWriter::new(proto::MATOCS_CHUNKOP, 32);
    w.put_u64(proto::combine_chunkid(chunkid, ecid))
        .put_u32(version)
        .put_u32(newversion)
        .put_u64(proto::combine_chunkid(copychunkid, copyecid))
        .put_u32(copyversion)
        .put_u32(leng);
    send_to(m, sid, w.finish());
}

/// Whether this server may take part in EC split operations.
pub fn can_split_chunks(m: &Master, sid: SessId) -> bool {
    match m.cs.sessions.get(&sid) {
        Some(s) => {
            select::replication_usability(s, &m.csdb) == 2
                && s.version >= proto::version2int(4, 49, 0)
        }
        None => false,
    }
}

/// Per-server section of the info dump.
pub fn extra_info(m: &Master, out: &mut String) {
    use std::fmt::Write as _;
    let now = m.clock.wall();
    let mono = m.clock.mono();
    for s in m.cs.sessions.values() {
        let Some(csdb_id) = s.csdb else { continue };
        if s.kill {
            continue;
        }
        let dur = (mono - s.counters_since).max(1.0);
        let usage = if s.totalspace > 0 {
            100.0 * (s.usedspace as f64 / s.totalspace as f64).min(1.0)
        } else {
            0.0
        };
        let hlname = match s.hlstatus {
            proto::HLSTATUS_DEFAULT => "DEFAULT",
            proto::HLSTATUS_OK => "OK",
            proto::HLSTATUS_OVERLOADED => "OVERLOADED",
            proto::HLSTATUS_LSREBALANCE => "LSREBALANCE",
            proto::HLSTATUS_GRACEFUL => "GRACEFUL",
            proto::HLSTATUS_HSREBALANCE => "HSREBALANCE",
            _ => "UNKNOWN",
        };
        let _ = writeln!(out, "[chunkserver {}]", s.servdesc);
        let _ = writeln!(
            out,
            "usedspace: {}\ntotalspace: {}\nusage: {:.2}%",
            s.usedspace, s.totalspace, usage
        );
        let _ = writeln!(
            out,
            "load: {}\ntimeout: {}\nchunkscount: {}",
            s.load, s.timeout, s.chunkscount
        );
        let _ = writeln!(
            out,
            "errorcounter: {}\nwritecounter: {}\nrrepcounter: {:.3}\nwrepcounter: {:.3}\ndelcounter: {}",
            s.errorcounter,
            s.writecounter,
            s.rrepcounter as f64 / FULL_REPLICATION_WEIGHT as f64,
            s.wrepcounter as f64 / FULL_REPLICATION_WEIGHT as f64,
            s.delcounter
        );
        let _ = writeln!(
            out,
            "create/s: {:.4}\nrrep/s: {:.4}\nwrep/s: {:.4}\ndel/s: {:.4}",
            s.create_total as f64 / dur,
            s.rrep_total as f64 / dur,
            s.wrep_total as f64 / dur,
            s.del_total as f64 / dur
        );
        let _ = writeln!(
            out,
            "csid: {}\ndist: {}\nfirst: {}\ncorr: {:.4}",
            s.csid, s.dist, s.first as u8, s.corr
        );
        let _ = writeln!(
            out,
            "hlstatus: {} ({})\noverloaded: {}\nmaintained: {}\n",
            s.hlstatus,
            hlname,
            m.csdb.is_overloaded(csdb_id, now) as u8,
            m.csdb.is_maintained(csdb_id) as u8
        );
    }
    let _ = writeln!(out, "[replications/deletions stats]");
    for s in m.cs.sessions.values() {
        if s.kill || s.csdb.is_none() {
            continue;
        }
        for reason in ReplReason::all() {
            let i = reason as usize;
            if (s.latched.repl_read_ok[i] | s.latched.repl_read_err[i]) != 0 {
                let _ = writeln!(
                    out,
                    "cs {} ; replication source ; reason: {} ; ok/err: {:.3}/{:.3}",
                    s.servdesc,
                    reason.as_str(),
                    s.latched.repl_read_ok[i] as f64 / FULL_REPLICATION_WEIGHT as f64,
                    s.latched.repl_read_err[i] as f64 / FULL_REPLICATION_WEIGHT as f64
                );
            }
            if (s.latched.repl_write_ok[i] | s.latched.repl_write_err[i]) != 0 {
                let _ = writeln!(
                    out,
                    "cs {} ; replication target ; reason: {} ; ok/err: {:.3}/{:.3}",
                    s.servdesc,
                    reason.as_str(),
                    s.latched.repl_write_ok[i] as f64 / FULL_REPLICATION_WEIGHT as f64,
                    s.latched.repl_write_err[i] as f64 / FULL_REPLICATION_WEIGHT as f64
                );
            }
        }
        for reason in OpReason::all() {
            let i = reason as usize;
            if (s.latched.del_ok[i] | s.latched.del_err[i]) != 0 {
                let _ = writeln!(
                    out,
                    "cs {} ; deletion ; reason: {} ; ok/err: {}/{}",
                    s.servdesc,
                    reason.as_str(),
                    s.latched.del_ok[i],
                    s.latched.del_err[i]
                );
            }
        }
    }
    let _ = writeln!(out, "\n[pending operations]");
    for (sid, rec) in m.cs.reps.iter() {
        let dst = m.cs.sessions.get(&sid).map(|s| s.servdesc.as_str()).unwrap_or("?");
        let srcs: Vec<&str> = rec
            .sources
            .iter()
            .filter_map(|s| m.cs.sessions.get(s).map(|x| x.servdesc.as_str()))
            .collect();
        let _ = writeln!(
            out,
            "operation REPLICATE_{} : chunk {:016X}_{:08X} ; reason: {} ; servers: {} -> {}",
            rec.reptype.as_str(),
            rec.chunkid,
            rec.version,
            rec.reason.as_str(),
            srcs.join(","),
            dst
        );
    }
    for (sid, rec) in m.cs.ops.iter() {
        let srv = m.cs.sessions.get(&sid).map(|s| s.servdesc.as_str()).unwrap_or("?");
        let _ = writeln!(
            out,
            "operation {} : chunk {:016X}_{:08X} ; reason: {} ; server: {}",
            rec.optype.as_str(),
            rec.chunkid,
            rec.version,
            rec.reason.as_str(),
            srv
        );
    }
}
