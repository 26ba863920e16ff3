//! In-flight command bookkeeping. Two ledgers guarantee at most one
//! outstanding operation or replication per (chunk, server) pair and carry
//! the weights that must be returned to the per-server counters when the
//! command is acknowledged or the server dies.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::SessId;

pub const FULL_REPLICATION_WEIGHT: u8 = 8;
pub const EC_REPLICATION_WEIGHT: u8 = 4;
pub const LOCALPART_REPLICATION_WEIGHT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Delete,
    Create,
    SetVersion,
    Truncate,
    Duplicate,
    DupTrunc,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Delete => "DELETE",
            OpType::Create => "CREATE",
            OpType::SetVersion => "SETVERSION",
            OpType::Truncate => "TRUNCATE",
            OpType::Duplicate => "DUPLICATE",
            OpType::DupTrunc => "DUPTRUNC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepType {
    Simple,
    Split,
    Recover,
    Join,
    LocalSplit,
}

impl RepType {
    pub fn as_str(self) -> &'static str {
        match self {
            RepType::Simple => "SIMPLE",
            RepType::Split => "SPLIT",
            RepType::Recover => "RECOVER",
            RepType::Join => "JOIN",
            RepType::LocalSplit => "LOCALSPLIT",
        }
    }
}

pub const REPL_REASONS: usize = 8;

/// Why a replication was scheduled; indexes the per-server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplReason {
    Undergoal = 0,
    WrongLabels = 1,
    Rebalance = 2,
    Recover = 3,
    Join = 4,
    Split = 5,
    Disconnect = 6,
    Other = 7,
}

impl ReplReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplReason::Undergoal => "undergoal",
            ReplReason::WrongLabels => "wrong labels",
            ReplReason::Rebalance => "rebalance",
            ReplReason::Recover => "recover",
            ReplReason::Join => "join",
            ReplReason::Split => "split",
            ReplReason::Disconnect => "disconnect",
            ReplReason::Other => "other",
        }
    }

    pub fn all() -> [ReplReason; REPL_REASONS] {
        [
            ReplReason::Undergoal,
            ReplReason::WrongLabels,
            ReplReason::Rebalance,
            ReplReason::Recover,
            ReplReason::Join,
            ReplReason::Split,
            ReplReason::Disconnect,
            ReplReason::Other,
        ]
    }
}

pub const OP_REASONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpReason {
    Overgoal = 0,
    WrongVersion = 1,
    Unused = 2,
    Invalid = 3,
    Other = 4,
}

impl OpReason {
    pub fn as_str(self) -> &'static str {
        match self {
            OpReason::Overgoal => "overgoal",
            OpReason::WrongVersion => "wrong version",
            OpReason::Unused => "unused",
            OpReason::Invalid => "invalid",
            OpReason::Other => "other",
        }
    }

    pub fn all() -> [OpReason; OP_REASONS] {
        [
            OpReason::Overgoal,
            OpReason::WrongVersion,
            OpReason::Unused,
            OpReason::Invalid,
            OpReason::Other,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct OpRecord {
    pub chunkid: u64, // combined with ecid
    pub version: u32,
    pub optype: OpType,
    pub reason: OpReason,
}

/// Per-chunk commands awaiting acknowledgement, keyed by (chunk, server).
#[derive(Default)]
pub struct OpLedger {
    map: FxHashMap<(u64, SessId), OpRecord>,
}

impl OpLedger {
    pub fn contains(&self, chunkid: u64, sid: SessId) -> bool {
        self.map.contains_key(&(chunkid, sid))
    }

    pub fn begin(&mut self, chunkid: u64, version: u32, sid: SessId, optype: OpType, reason: OpReason) {
        self.map.insert(
            (chunkid, sid),
            OpRecord {
                chunkid,
                version,
                optype,
                reason,
            },
        );
    }

    pub fn end(&mut self, chunkid: u64, sid: SessId) -> Option<OpRecord> {
        self.map.remove(&(chunkid, sid))
    }

    /// Pulls every record of a dying session; the caller finalises them as
    /// failures.
    pub fn remove_session(&mut self, sid: SessId) -> Vec<OpRecord> {
        let keys: Vec<(u64, SessId)> = self
            .map
            .keys()
            .filter(|(_, s)| *s == sid)
            .copied()
            .collect();
        keys.into_iter()
            .map(|k| self.map.remove(&k).expect("key just listed"))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessId, &OpRecord)> {
        self.map.iter().map(|((_, sid), rec)| (*sid, rec))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RepRecord {
    pub chunkid: u64, // combined with ecid
    pub version: u32,
    pub rweight: u8,
    pub wweight: u8,
    pub reptype: RepType,
    pub reason: ReplReason,
    pub sources: SmallVec<[SessId; 8]>,
}

/// In-flight replications keyed by (chunk, version, destination).
#[derive(Default)]
pub struct ReplLedger {
    map: FxHashMap<(u64, u32, SessId), RepRecord>,
}

impl ReplLedger {
    pub fn contains(&self, chunkid: u64, version: u32, dst: SessId) -> bool {
        self.map.contains_key(&(chunkid, version, dst))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        &mut self,
        chunkid: u64,
        version: u32,
        dst: SessId,
        sources: &[SessId],
        rweight: u8,
        wweight: u8,
        reptype: RepType,
        reason: ReplReason,
    ) {
        if sources.is_empty() {
            return;
        }
        self.map.insert(
            (chunkid, version, dst),
            RepRecord {
                chunkid,
                version,
                rweight,
                wweight,
                reptype,
                reason,
                sources: SmallVec::from_slice(sources),
            },
        );
    }

    pub fn end(&mut self, chunkid: u64, version: u32, dst: SessId) -> Option<RepRecord> {
        self.map.remove(&(chunkid, version, dst))
    }

    /// Removes every record touching a dying session. Returns the records it
    /// was the destination of, plus `(record clone, weight)` pairs for each
    /// record it served as a source for (the source is dropped from the
    /// surviving record).
    pub fn remove_session(&mut self, sid: SessId) -> (Vec<RepRecord>, Vec<(RepRecord, u8)>) {
        let dst_keys: Vec<(u64, u32, SessId)> = self
            .map
            .keys()
            .filter(|(_, _, d)| *d == sid)
            .copied()
            .collect();
        let as_dst: Vec<RepRecord> = dst_keys
            .into_iter()
            .map(|k| self.map.remove(&k).expect("key just listed"))
            .collect();

        let mut as_src = Vec::new();
        for rec in self.map.values_mut() {
            let before = rec.sources.len();
            rec.sources.retain(|s| *s != sid);
            if rec.sources.len() != before {
                as_src.push((rec.clone(), rec.rweight));
            }
        }
        (as_dst, as_src)
    }

    pub fn get(&self, chunkid: u64, version: u32, dst: SessId) -> Option<&RepRecord> {
        self.map.get(&(chunkid, version, dst))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessId, &RepRecord)> {
        self.map.iter().map(|((_, _, dst), rec)| (*dst, rec))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_outstanding_op() {
        let mut ops = OpLedger::default();
        ops.begin(7, 1, 3, OpType::Delete, OpReason::Overgoal);
        assert!(ops.contains(7, 3));
        assert!(!ops.contains(7, 4));
        let rec = ops.end(7, 3).unwrap();
        assert_eq!(rec.optype, OpType::Delete);
        assert!(ops.end(7, 3).is_none());
    }

    #[test]
    fn session_removal_pulls_all_records() {
        let mut ops = OpLedger::default();
        ops.begin(1, 1, 3, OpType::Delete, OpReason::Overgoal);
        ops.begin(2, 1, 3, OpType::Create, OpReason::Other);
        ops.begin(3, 1, 4, OpType::Delete, OpReason::Unused);
        let pulled = ops.remove_session(3);
        assert_eq!(pulled.len(), 2);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn replication_source_and_destination_removal() {
        let mut reps = ReplLedger::default();
        reps.begin(10, 1, 100, &[200, 201], 4, 4, RepType::Recover, ReplReason::Recover);
        reps.begin(11, 1, 200, &[100], 8, 8, RepType::Simple, ReplReason::Undergoal);
        // 200 dies: destination of chunk 11, source of chunk 10
        let (as_dst, as_src) = reps.remove_session(200);
        assert_eq!(as_dst.len(), 1);
        assert_eq!(as_dst[0].chunkid, 11);
        assert_eq!(as_src.len(), 1);
        assert_eq!(as_src[0].1, 4);
        // surviving record no longer references 200
        let rec = reps.get(10, 1, 100).unwrap();
        assert_eq!(rec.sources.as_slice(), &[201]);
    }

    #[test]
    fn duplicate_replication_detected() {
        let mut reps = ReplLedger::default();
        reps.begin(10, 1, 100, &[200], 8, 8, RepType::Simple, ReplReason::Undergoal);
        assert!(reps.contains(10, 1, 100));
        assert!(!reps.contains(10, 2, 100));
        assert!(!reps.contains(10, 1, 101));
    }
}
