//! Server selection: grouping by replication eligibility, fair-share
//! counters with per-second jitter, and the weighted round-robin used to
//! place new chunks.

use rand::Rng;

use crate::csdb::Csdb;
use crate::ledger::FULL_REPLICATION_WEIGHT;
use crate::proto::{
    CHUNK_SIZE, HLSTATUS_DEFAULT, HLSTATUS_GRACEFUL, HLSTATUS_HSREBALANCE, HLSTATUS_LSREBALANCE,
    HLSTATUS_OK, HLSTATUS_OVERLOADED, TRANSFERRING_LOST_CHUNKS, TRANSFERRING_NEW_CHUNKS,
};

use super::{CsServSet, CsSession, RegPhase};

/// Far above any sane replication limit; returned for ineligible servers.
pub const OVER_ANY_LIMIT: f64 = 10_000_000.0;

pub const CSSTATE_OK: usize = 0;
pub const CSSTATE_OVERLOADED: usize = 1;
pub const CSSTATE_LIMIT_REACHED: usize = 2;
pub const CSSTATE_NO_SPACE: usize = 3;

/// Deterministic per-server, per-second fraction in [0,1). Spreads servers
/// with equal counters without a shared random stream.
pub fn jitter(csid: u16, now: u32) -> f64 {
    let v = (csid as u32)
        .wrapping_mul(0x9874_BF31)
        .wrapping_add(now.wrapping_mul(0xB489_FC37));
    v as f64 / 4294967296.0
}

fn hl_standard(hlstatus: u8) -> bool {
    hlstatus == HLSTATUS_DEFAULT || hlstatus == HLSTATUS_OK || hlstatus == HLSTATUS_LSREBALANCE
}

/// 0 = unusable, 1 = busy but present (overloaded/maintained), 2 = usable.
pub fn replication_usability(sess: &CsSession, csdb: &Csdb) -> u8 {
    let Some(csdb_id) = sess.csdb else { return 0 };
    if sess.kill
        || sess.totalspace == 0
        || sess.usedspace > sess.totalspace
        || (sess.totalspace - sess.usedspace) <= sess.totalspace / 100
        || sess.reg != RegPhase::Registered
        || (sess.receivingchunks & TRANSFERRING_NEW_CHUNKS) != 0
    {
        return 0;
    }
    if hl_standard(sess.hlstatus) && !csdb.is_maintained(csdb_id) {
        2
    } else {
        1
    }
}

/// Write-side fair-share counter; `OVER_ANY_LIMIT` when the server cannot
/// take replication writes at all.
pub fn replication_write_counter(sess: &CsSession, csdb: &Csdb, now: u32) -> f64 {
    if replication_usability(sess, csdb) == 0 {
        return OVER_ANY_LIMIT;
    }
    sess.wrepcounter as f64 / FULL_REPLICATION_WEIGHT as f64 + jitter(sess.csid, now)
}

/// Read-side fair-share counter.
pub fn replication_read_counter(sess: &CsSession, now: u32) -> f64 {
    if sess.kill || sess.csdb.is_none() || (sess.receivingchunks & TRANSFERRING_LOST_CHUNKS) != 0 {
        return OVER_ANY_LIMIT;
    }
    sess.rrepcounter as f64 / FULL_REPLICATION_WEIGHT as f64 + jitter(sess.csid, now)
}

impl CsServSet {
    fn live_sessions(&self) -> impl Iterator<Item = &CsSession> {
        self.sessions.values().filter(|s| !s.kill)
    }

    /// Servers ordered by disk usage, restricted to standard writable ones.
    pub fn getservers_ordered(&self, csdb: &Csdb) -> Vec<u16> {
        let mut tab: Vec<(f64, u16)> = self
            .live_sessions()
            .filter(|s| {
                s.totalspace > 0
                    && s.usedspace <= s.totalspace
                    && s.csdb.map(|id| !csdb.is_maintained(id)).unwrap_or(false)
                    && hl_standard(s.hlstatus)
            })
            .map(|s| (s.usedspace as f64 / s.totalspace as f64, s.csid))
            .collect();
        tab.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        tab.into_iter().map(|(_, csid)| csid).collect()
    }

    /// Candidates for a new chunk, best placement first, plus the count of
    /// servers skipped because they are overloaded.
    pub fn getservers_wrandom(&mut self, csdb: &Csdb) -> (Vec<u16>, u16) {
        let mut std_ids: Vec<crate::SessId> = Vec::new();
        let mut grace_ids: Vec<crate::SessId> = Vec::new();
        let mut overloaded = 0u16;

        for (&sid, s) in self.sessions.iter() {
            if s.kill || s.totalspace == 0 || s.usedspace > s.totalspace {
                continue;
            }
            let Some(csdb_id) = s.csdb else { continue };
            if (s.totalspace - s.usedspace) <= CHUNK_SIZE * (1 + s.writecounter as u64 * 10) {
                continue;
            }
            if s.hlstatus == HLSTATUS_OVERLOADED || s.hlstatus == HLSTATUS_HSREBALANCE {
                overloaded += 1;
                continue;
            }
            if (s.hlstatus != HLSTATUS_DEFAULT && s.hlstatus != HLSTATUS_OK)
                || csdb.is_maintained(csdb_id)
            {
                grace_ids.push(sid);
            } else {
                std_ids.push(sid);
            }
        }

        // more than 20% of the pool sitting in grace would starve writes
        if grace_ids.len() * 5 > grace_ids.len() + std_ids.len() {
            std_ids.append(&mut grace_ids);
        }

        self.weighted_roundrobin_sort(&mut std_ids);
        let csids = std_ids
            .iter()
            .map(|sid| self.sessions[sid].csid)
            .collect();
        (csids, overloaded)
    }

    fn wrr_totalspace(&self) -> u64 {
        self.live_sessions()
            .filter(|s| s.totalspace > 0 && s.usedspace <= s.totalspace && s.csdb.is_some())
            .map(|s| s.totalspace)
            .sum()
    }

    /// Orders candidates by accumulated placement error; heavily penalises
    /// servers with writes already in flight to avoid trashing one disk.
    fn weighted_roundrobin_sort(&self, ids: &mut Vec<crate::SessId>) {
        let totalspace = self.wrr_totalspace();
        let mut tab: Vec<(f64, crate::SessId)> = ids
            .iter()
            .map(|&sid| {
                let s = &self.sessions[&sid];
                let mut err = if s.first {
                    1.0
                } else {
                    let expdist = totalspace as f64 / s.totalspace as f64;
                    (expdist + s.corr) / (s.dist as f64 + 1.0)
                };
                err += 1000.0
                    * (s.writecounter as f64
                        + s.wrepcounter as f64 / FULL_REPLICATION_WEIGHT as f64);
                (err, sid)
            })
            .collect();
        tab.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        ids.clear();
        ids.extend(tab.into_iter().map(|(_, sid)| sid));
    }

    /// Accounts a committed placement: advances every server's round-robin
    /// distance and the chosen servers' correction terms. Every
    /// `10 x live servers` selections the accumulated correlation is reset
    /// from fresh randomness so the rotation cannot drift into lockstep.
    pub fn useservers_wrandom(&mut self, chosen: &[crate::SessId]) {
        let totalspace = self.wrr_totalspace();
        let mut totalcnt = 0u32;
        for s in self.sessions.values_mut() {
            if !s.kill && s.totalspace > 0 && s.usedspace <= s.totalspace && s.csdb.is_some() {
                totalcnt += 1;
                s.dist += chosen.len() as u32;
            }
        }

        self.wrr_fcnt += chosen.len() as u32;
        if self.wrr_fcnt > totalcnt * 10 {
            self.wrr_fcnt = 0;
            let mut rng = rand::thread_rng();
            for s in self.sessions.values_mut() {
                if !s.kill && s.totalspace > 0 && s.usedspace <= s.totalspace && s.csdb.is_some() {
                    let dist = totalspace as f64 / s.totalspace as f64;
                    let cap = ((dist * 1000.0) as u32).max(1);
                    s.dist = rng.gen_range(0..cap) / 1000;
                    s.corr = 0.0;
                }
            }
            for sid in chosen {
                if let Some(s) = self.sessions.get_mut(sid) {
                    s.create_total += 1;
                }
            }
        } else {
            let cnt = chosen.len() as u32;
            for (i, sid) in chosen.iter().enumerate() {
                let Some(s) = self.sessions.get_mut(sid) else { continue };
                if s.first {
                    s.first = false;
                } else {
                    let expdist = totalspace as f64 / s.totalspace as f64;
                    s.corr += expdist - (s.dist as f64 + i as f64 + 1.0 - cnt as f64);
                }
                s.dist = cnt - i as u32 - 1;
                s.create_total += 1;
            }
        }
    }

    /// All servers where replication is at least conceivable (has space,
    /// possibly busy right now).
    pub fn getservers_replpossible(&self) -> Vec<u16> {
        self.live_sessions()
            .filter(|s| s.csdb.is_some())
            .filter(|s| {
                !(s.totalspace == 0
                    || s.totalspace.saturating_sub(s.usedspace) <= s.totalspace / 100)
            })
            .map(|s| s.csid)
            .collect()
    }

    /// Servers currently allowed as low-priority replication targets.
    pub fn getservers_replallowed(&self, csdb: &Csdb) -> Vec<u16> {
        self.live_sessions()
            .filter(|s| replication_usability(s, csdb) == 2)
            .map(|s| s.csid)
            .collect()
    }

    /// Groups every connected server into the four replication states, in
    /// state order, with normal and overloaded segments shuffled. Returns
    /// the ordered csids and the segment boundaries.
    pub fn get_server_groups(&self, csdb: &Csdb, replimit: f64, now: u32) -> (Vec<u16>, [u16; 4]) {
        let mut groups: [Vec<u16>; 4] = Default::default();
        for s in self.live_sessions() {
            if s.csdb.is_none() {
                continue;
            }
            let a = jitter(s.csid, now);
            let state = if s.totalspace == 0
                || s.totalspace.saturating_sub(s.usedspace) <= s.totalspace / 100
            {
                CSSTATE_NO_SPACE
            } else if s.wrepcounter as f64 / FULL_REPLICATION_WEIGHT as f64 + a >= replimit
                || s.reg != RegPhase::Registered
                || (s.receivingchunks & TRANSFERRING_NEW_CHUNKS) != 0
            {
                CSSTATE_LIMIT_REACHED
            } else if !(hl_standard(s.hlstatus)
                && !csdb.is_maintained(s.csdb.expect("checked above")))
            {
                CSSTATE_OVERLOADED
            } else {
                CSSTATE_OK
            };
            groups[state].push(s.csid);
        }
        let mut rng = rand::thread_rng();
        for g in groups.iter_mut().take(2) {
            // Fisher-Yates, matching the incremental shuffle of the source
            for i in (1..g.len()).rev() {
                let r = rng.gen_range(0..=i);
                g.swap(i, r);
            }
        }
        let mut positions = [0u16; 4];
        let mut csids = Vec::new();
        for (i, g) in groups.iter().enumerate() {
            positions[i] = csids.len() as u16 + g.len() as u16;
            csids.extend_from_slice(g);
        }
        (csids, positions)
    }

    /// Destinations under the caller's replication limit, shuffled. With
    /// `highpriority`, overloaded-but-under-limit servers are appended after
    /// the standard ones. `allservflag` stays true only when no server was
    /// rejected for having reached the limit.
    pub fn getservers_lessrepl(
        &self,
        csdb: &Csdb,
        replimit: f64,
        highpriority: bool,
        now: u32,
    ) -> (Vec<u16>, bool) {
        let mut out: Vec<u16> = Vec::new();
        let mut hp: Vec<u16> = Vec::new();
        let mut allservflag = true;
        let mut hpadd = false;
        for s in self.live_sessions() {
            let a = jitter(s.csid, now);
            let under = s.wrepcounter as f64 / FULL_REPLICATION_WEIGHT as f64 + a < replimit;
            match replication_usability(s, csdb) {
                2 => {
                    if under {
                        out.push(s.csid);
                    } else {
                        allservflag = false;
                    }
                }
                1 => {
                    if under {
                        hpadd = true;
                        hp.push(s.csid);
                    } else if highpriority {
                        allservflag = false;
                    }
                }
                _ => {}
            }
        }
        let mut rng = rand::thread_rng();
        for i in (1..out.len()).rev() {
            let r = rng.gen_range(0..=i);
            out.swap(i, r);
        }
        if highpriority && hpadd {
            for i in (1..hp.len()).rev() {
                let r = rng.gen_range(0..=i);
                hp.swap(i, r);
            }
            out.extend_from_slice(&hp);
        }
        (out, allservflag)
    }

    /// Refreshes the cached server counters; runs once per loop turn.
    pub fn recalculate_server_counters(&mut self, csdb: &Csdb) {
        let mut valid = 0u16;
        let mut almostfull = 0u16;
        let mut replallowed = 0u16;
        for s in self.sessions.values() {
            if s.kill || s.totalspace == 0 || s.usedspace > s.totalspace || s.csdb.is_none() {
                continue;
            }
            valid += 1;
            if (s.totalspace - s.usedspace) <= s.totalspace / 100 {
                almostfull += 1;
            }
            if replication_usability(s, csdb) == 2 {
                replallowed += 1;
            }
        }
        self.valid_servers = valid;
        self.almostfull_servers = almostfull;
        self.replallowed_servers = replallowed;
    }

    /// Refreshes the global space gauges from the per-server reports and the
    /// configured reserve.
    pub fn calculate_space(&mut self) {
        let mut tspace = 0u64;
        let mut uspace = 0u64;
        let mut muspace = 0u64;
        let mut mtspace = 0u64;
        let mut usagemax = 0u32;
        let mut usagemin = 0u32;
        let mut seen = false;
        for s in self.sessions.values() {
            if s.kill || s.totalspace == 0 {
                continue;
            }
            let usage = (s.usedspace as f64 / s.totalspace as f64).clamp(0.0, 1.0);
            let mpusage = (100_000.0 * usage) as u32;
            if !seen {
                usagemax = mpusage;
                usagemin = mpusage;
                seen = true;
            } else {
                usagemax = usagemax.max(mpusage);
                usagemin = usagemin.min(mpusage);
            }
            tspace += s.totalspace;
            uspace += s.usedspace;
            muspace = muspace.max(s.usedspace);
            mtspace = mtspace.max(s.totalspace);
        }
        let rspace = match self.reserve {
            crate::config::ReserveSpace::Bytes(b) => b,
            crate::config::ReserveSpace::Percent(p) => (p * (tspace as f64 / 100.0)) as u64,
            crate::config::ReserveSpace::ChunkserverUsed(m) => (m * muspace as f64) as u64,
            crate::config::ReserveSpace::ChunkserverTotal(m) => (m * mtspace as f64) as u64,
        };
        self.gtotal = tspace;
        self.gused = uspace;
        self.gfree = tspace - uspace;
        self.gavail = self.gfree.saturating_sub(rspace);
        self.gusagediff = usagemax - usagemin;
    }

    /// Applies overload grace transitions for servers that do not report a
    /// heavy-load status themselves.
    pub fn hlstatus_fix(&mut self, csdb: &Csdb, now: u32) {
        for s in self.sessions.values_mut() {
            if s.kill || s.totalspace == 0 {
                continue;
            }
            let Some(csdb_id) = s.csdb else { continue };
            if s.hlstatus == HLSTATUS_DEFAULT || s.hlstatus == HLSTATUS_GRACEFUL {
                s.hlstatus = if csdb.is_overloaded(csdb_id, now) {
                    HLSTATUS_GRACEFUL
                } else {
                    HLSTATUS_DEFAULT
                };
            }
        }
    }
}
