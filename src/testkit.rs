//! Shared helpers for the unit and integration suites: a master wired to a
//! temporary directory, queue-backed sessions, and raw packet builders that
//! mimic what real peers put on the wire.

use std::ops::{Deref, DerefMut};

use crate::config::Config;
use crate::master::{Clock, Master};
use crate::matocs::{self, Outbox};
use crate::metadata::ChunkRegistry;
use crate::proto;
use crate::SessId;

/// A master bound to a scratch directory that lives as long as the handle.
pub struct TestMaster {
    pub master: Master,
    _dir: tempfile::TempDir,
}

impl Deref for TestMaster {
    type Target = Master;
    fn deref(&self) -> &Master {
        &self.master
    }
}

impl DerefMut for TestMaster {
    fn deref_mut(&mut self) -> &mut Master {
        &mut self.master
    }
}

/// Frozen clock, async changelog persistence, no background saver.
pub fn master_for_tests() -> TestMaster {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = Config::default();
    cfg.data_path = dir.path().to_path_buf();
    cfg.changelog_save_mode = 1;
    cfg.normalize();
    let master = Master::new(cfg, Box::new(ChunkRegistry::new()), Clock::fake(100_000, 1000.0))
        .expect("master");
    TestMaster { master, _dir: dir }
}

/// The type-60 register payload a chunk server sends first.
pub fn register_begin_payload(
    version: u32,
    ip: u32,
    port: u16,
    timeout: u16,
    csid: u16,
    usedspace: u64,
    totalspace: u64,
) -> Vec<u8> {
    let mut p = Vec::with_capacity(55);
    p.push(60u8);
    p.extend_from_slice(&version.to_be_bytes());
    p.extend_from_slice(&ip.to_be_bytes());
    p.extend_from_slice(&port.to_be_bytes());
    p.extend_from_slice(&timeout.to_be_bytes());
    p.extend_from_slice(&csid.to_be_bytes());
    p.extend_from_slice(&usedspace.to_be_bytes());
    p.extend_from_slice(&totalspace.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes()); // chunk count
    p.extend_from_slice(&0u64.to_be_bytes()); // todel used
    p.extend_from_slice(&0u64.to_be_bytes()); // todel total
    p.extend_from_slice(&0u32.to_be_bytes()); // todel chunks
    p
}

/// The type-61 inventory payload: `(chunkid+ecid, version)` records.
pub fn register_chunks_payload(chunks: &[(u64, u8, u32)]) -> Vec<u8> {
    let mut p = Vec::with_capacity(1 + chunks.len() * 12);
    p.push(61u8);
    for &(chunkid, ecid, version) in chunks {
        p.extend_from_slice(&proto::combine_chunkid(chunkid, ecid).to_be_bytes());
        p.extend_from_slice(&version.to_be_bytes());
    }
    p
}

/// Drives a full registration (begin, empty inventory, end) over a
/// queue-backed session and clears the post-registration transfer delays so
/// selection sees the server immediately.
pub fn connect_server(m: &mut Master, ip: u32, port: u16, totalspace: u64, usedspace: u64) -> SessId {
    let sid = matocs::accept(m, ip, Outbox::queue());
    let begin = register_begin_payload(
        proto::version2int(4, 50, 0),
        ip,
        port,
        0,
        0,
        usedspace,
        totalspace,
    );
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &begin);
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &register_chunks_payload(&[]));
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &[62u8]);
    let s = m.cs.session_mut(sid).expect("registered session");
    assert!(!s.kill, "registration was rejected");
    s.receivingchunks = 0;
    s.lostchunkdelay = 0;
    s.newchunkdelay = 0;
    // drop the handshake replies so tests start from an empty queue
    while s.outbox.pop().is_some() {}
    sid
}

/// Pops the next queued frame of a session as `(type, payload)`.
pub fn next_frame(m: &mut Master, sid: SessId) -> Option<(u32, Vec<u8>)> {
    let s = m.cs.session_mut(sid)?;
    let frame = s.outbox.pop()?;
    let ptype = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    Some((ptype, frame[8..].to_vec()))
}

/// Same for metalogger sessions.
pub fn next_ml_frame(m: &mut Master, sid: SessId) -> Option<(u32, Vec<u8>)> {
    let s = m.ml.session_mut(sid)?;
    let frame = s.outbox.pop()?;
    let ptype = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    Some((ptype, frame[8..].to_vec()))
}
