//! Contracts between the coordination plane and its collaborators: the
//! metadata version counter and the chunk subsystem. The chunk subsystem
//! proper (goal evaluation, replication planning inputs) lives outside this
//! crate's core; `ChunkRegistry` is the built-in implementation that keeps
//! the session plumbing honest and is what the daemon and the tests run
//! against.

use tracing::debug;

use crate::proto::MAX_CS_COUNT;

/// Metadata version counter and identity. Every mutation of the filesystem
/// state bumps `version`; changelog entries carry the value.
pub struct Metadata {
    version: u64,
    id: u64,
    chlog_keep: u64,
}

impl Metadata {
    pub fn new(id: u64) -> Self {
        Self {
            version: 1,
            id,
            chlog_keep: u64::MAX,
        }
    }

    /// Bumps and returns the version assigned to the next change.
    pub fn version_inc(&mut self) -> u64 {
        let v = self.version;
        self.version += 1;
        v
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, v: u64) {
        self.version = v;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lowest changelog version that must stay in memory because a metadata
    /// image send is in progress; `u64::MAX` when none is.
    pub fn chlog_keep_version(&self) -> u64 {
        self.chlog_keep
    }

    pub fn set_chlog_keep_version(&mut self, v: u64) {
        self.chlog_keep = v;
    }

    pub fn clear_chlog_keep_version(&mut self) {
        self.chlog_keep = u64::MAX;
    }
}

/// What the chunk subsystem must hear about from the session plane.
/// Status bytes are the wire values; the subsystem owns retry policy.
pub trait ChunkSubsystem: Send {
    /// A chunk server finished its identity handshake; returns the slot id
    /// the session will use for chunk bookkeeping.
    fn server_connected(&mut self, sid: crate::SessId) -> u16;
    fn server_disconnected(&mut self, csid: u16);
    fn server_register_end(&mut self, csid: u16);
    fn server_has_chunk(&mut self, csid: u16, chunkid: u64, ecid: u8, version: u32);
    fn chunk_lost(&mut self, csid: u16, chunkid: u64, ecid: u8, nonexistent: bool);
    fn chunk_damaged(&mut self, csid: u16, chunkid: u64, ecid: u8);
    fn got_create_status(&mut self, csid: u16, chunkid: u64, ecid: u8, status: u8);
    fn got_delete_status(&mut self, csid: u16, chunkid: u64, ecid: u8, status: u8);
    fn got_replicate_status(&mut self, csid: u16, chunkid: u64, ecid: u8, version: u32, status: u8);
    fn got_setversion_status(&mut self, csid: u16, chunkid: u64, ecid: u8, status: u8);
    fn got_duplicate_status(&mut self, csid: u16, chunkid: u64, ecid: u8, status: u8);
    fn got_truncate_status(&mut self, csid: u16, chunkid: u64, ecid: u8, status: u8);
    fn got_duptrunc_status(&mut self, csid: u16, chunkid: u64, ecid: u8, status: u8);
    fn got_localsplit_status(&mut self, csid: u16, chunkid: u64, version: u32, status: u8);
    fn got_chunkop_status(&mut self, csid: u16, chunkid: u64, ecid: u8, status: u8);
    /// "Marked for removal" status reported per server in listings.
    fn mfr_status(&self, csid: u16) -> u8;
}

/// Minimal chunk-slot registry: allocates the per-server slots the protocol
/// needs and counts inventory, leaving goal logic to the real subsystem.
#[derive(Default)]
pub struct ChunkRegistry {
    slots: Vec<Option<crate::SessId>>,
    pub chunks_heard: u64,
    pub lost_heard: u64,
    pub damaged_heard: u64,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl ChunkSubsystem for ChunkRegistry {
    fn server_connected(&mut self, sid: crate::SessId) -> u16 {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(sid);
                return i as u16;
            }
        }
        let idx = self.slots.len();
        if idx >= MAX_CS_COUNT as usize {
            return MAX_CS_COUNT;
        }
        self.slots.push(Some(sid));
        idx as u16
    }

    fn server_disconnected(&mut self, csid: u16) {
        if let Some(slot) = self.slots.get_mut(csid as usize) {
            *slot = None;
        }
    }

    fn server_register_end(&mut self, csid: u16) {
        debug!("chunk registry: server slot {} finished registration", csid);
    }

    fn server_has_chunk(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _version: u32) {
        self.chunks_heard += 1;
    }

    fn chunk_lost(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _nonexistent: bool) {
        self.lost_heard += 1;
    }

    fn chunk_damaged(&mut self, _csid: u16, _chunkid: u64, _ecid: u8) {
        self.damaged_heard += 1;
    }

    fn got_create_status(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _status: u8) {}
    fn got_delete_status(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _status: u8) {}
    fn got_replicate_status(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _version: u32, _status: u8) {}
    fn got_setversion_status(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _status: u8) {}
    fn got_duplicate_status(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _status: u8) {}
    fn got_truncate_status(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _status: u8) {}
    fn got_duptrunc_status(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _status: u8) {}
    fn got_localsplit_status(&mut self, _csid: u16, _chunkid: u64, _version: u32, _status: u8) {}
    fn got_chunkop_status(&mut self, _csid: u16, _chunkid: u64, _ecid: u8, _status: u8) {}

    fn mfr_status(&self, _csid: u16) -> u8 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_strictly_monotonic() {
        let mut m = Metadata::new(0xABCD);
        let a = m.version_inc();
        let b = m.version_inc();
        assert!(b > a);
        assert_eq!(m.version(), b + 1);
    }

    #[test]
    fn registry_reuses_lowest_slot() {
        let mut reg = ChunkRegistry::new();
        assert_eq!(reg.server_connected(10), 0);
        assert_eq!(reg.server_connected(11), 1);
        reg.server_disconnected(0);
        assert_eq!(reg.server_connected(12), 0);
        assert_eq!(reg.slot_count(), 2);
    }
}
