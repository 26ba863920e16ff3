//! Chunk-server database: the durable directory of every chunk server the
//! master has ever talked to, separate from the live protocol sessions.
//! Entries survive disconnects; the csid assigned here is stable across
//! reconnects and appears on the wire, so allocation is deterministic
//! (lowest free id).

use std::io::{Read, Write};

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::error::{MasterError, Result};
use crate::proto::ip_to_str;
use crate::SessId;

pub const CSDB_OP_ADD: u8 = 0;
pub const CSDB_OP_DEL: u8 = 1;
pub const CSDB_OP_NEWIPPORT: u8 = 2;
pub const CSDB_OP_NEWID: u8 = 3;
pub const CSDB_OP_MAINTENANCEON: u8 = 4;
pub const CSDB_OP_MAINTENANCEOFF: u8 = 5;
pub const CSDB_OP_MAINTENANCETMP: u8 = 6;

const STORE_MVER: u8 = 0x13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    Off,
    On,
    Temporary,
}

impl Maintenance {
    pub fn as_u8(self) -> u8 {
        match self {
            Maintenance::Off => 0,
            Maintenance::On => 1,
            Maintenance::Temporary => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Maintenance::On,
            2 => Maintenance::Temporary,
            _ => Maintenance::Off,
        }
    }

    pub fn active(self) -> bool {
        self != Maintenance::Off
    }
}

pub type CsdbId = u32;

#[derive(Debug)]
pub struct CsdbEntry {
    pub ip: u32,
    pub port: u16,
    pub csid: u16,
    pub number: u16,
    pub heavy_load_ts: u32,
    pub load: u32,
    pub maintenance: Maintenance,
    pub maintenance_timeout: u32,
    pub disconnection_time: u32,
    pub tmpremoved: bool,
    pub session: Option<SessId>,
}

impl CsdbEntry {
    fn new(ip: u32, port: u16, now: u32) -> Self {
        Self {
            ip,
            port,
            csid: 0,
            number: 0,
            heavy_load_ts: 0,
            load: 0,
            maintenance: Maintenance::Off,
            maintenance_timeout: 0,
            disconnection_time: now,
            tmpremoved: false,
            session: None,
        }
    }
}

pub struct Csdb {
    entries: Vec<Option<CsdbEntry>>,
    by_addr: FxHashMap<(u32, u16), CsdbId>,
    by_csid: Vec<Option<CsdbId>>, // indexed by csid, slot 0 unused
    next_csid: u16,
    servers: u32,
    disconnected: u32,
    disconnected_in_maintenance: u32,
    tmpremoved: u32,
    loadsum: u64,

    // reloadable configuration
    pub heavy_load_grace_period: u32,
    pub heavy_load_threshold: u32,
    pub heavy_load_ratio_threshold: f64,
    pub maintenance_mode_timeout: u32,
    pub temp_maintenance_mode_timeout: u32,
    pub seconds_to_remove_unused: u32,
}

impl Default for Csdb {
    fn default() -> Self {
        Self::new()
    }
}

impl Csdb {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_addr: FxHashMap::default(),
            by_csid: vec![None; 65536],
            next_csid: 1,
            servers: 0,
            disconnected: 0,
            disconnected_in_maintenance: 0,
            tmpremoved: 0,
            loadsum: 0,
            heavy_load_grace_period: 900,
            heavy_load_threshold: 150,
            heavy_load_ratio_threshold: 3.0,
            maintenance_mode_timeout: 0,
            temp_maintenance_mode_timeout: 1800,
            seconds_to_remove_unused: 7 * 86400,
        }
    }

    pub fn reload(&mut self, cfg: &crate::config::Config) {
        self.heavy_load_grace_period = cfg.cs_heavy_load_grace_period;
        self.heavy_load_threshold = cfg.cs_heavy_load_threshold;
        self.heavy_load_ratio_threshold = cfg.cs_heavy_load_ratio_threshold;
        self.maintenance_mode_timeout = cfg.cs_maintenance_mode_timeout;
        self.temp_maintenance_mode_timeout = cfg.cs_temp_maintenance_mode_timeout;
        self.seconds_to_remove_unused = cfg.seconds_to_remove_unused_cs();
    }

    pub fn get(&self, id: CsdbId) -> Option<&CsdbEntry> {
        self.entries.get(id as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: CsdbId) -> Option<&mut CsdbEntry> {
        self.entries.get_mut(id as usize).and_then(Option::as_mut)
    }

    pub fn by_csid(&self, csid: u16) -> Option<CsdbId> {
        self.by_csid[csid as usize]
    }

    pub fn find(&self, ip: u32, port: u16) -> Option<CsdbId> {
        self.by_addr.get(&(ip, port)).copied()
    }

    fn alloc(&mut self, entry: CsdbEntry) -> CsdbId {
        let key = (entry.ip, entry.port);
        for (idx, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                self.by_addr.insert(key, idx as CsdbId);
                return idx as CsdbId;
            }
        }
        self.entries.push(Some(entry));
        let id = (self.entries.len() - 1) as CsdbId;
        self.by_addr.insert(key, id);
        id
    }

    fn new_csid(&mut self) -> u16 {
        while (self.next_csid as usize) < 65536 && self.by_csid[self.next_csid as usize].is_some() {
            self.next_csid += 1;
        }
        self.next_csid
    }

    fn del_csid(&mut self, csid: u16) {
        self.by_csid[csid as usize] = None;
        if csid < self.next_csid {
            self.next_csid = csid;
        }
    }

    fn reconnect(&mut self, id: CsdbId, sid: SessId) {
        let e = self.entries[id as usize].as_mut().expect("live entry");
        e.session = Some(sid);
        self.disconnected -= 1;
        if e.maintenance.active() {
            self.disconnected_in_maintenance -= 1;
        }
        if e.tmpremoved {
            e.tmpremoved = false;
            self.tmpremoved -= 1;
        }
    }

    /// Registers a connecting chunk server and returns its database handle,
    /// or `None` when an entry with the same identity is still connected.
    /// Emits replayable events through `clog`.
    pub fn new_connection(
        &mut self,
        ip: u32,
        port: u16,
        csid: u16,
        sid: SessId,
        now: u32,
        clog: &mut dyn FnMut(String),
    ) -> Option<CsdbId> {
        let strip = ip_to_str(ip);
        let csidptr = if csid > 0 { self.by_csid[csid as usize] } else { None };

        // fast path: known csid with unchanged address
        if let Some(id) = csidptr {
            let e = self.get(id).expect("csid index out of sync");
            if e.ip == ip && e.port == port {
                if e.session.is_some() {
                    info!(
                        "csdb: found cs using ip:port and csid ({}:{},{}), but server is still connected",
                        strip, port, csid
                    );
                    return None;
                }
                info!("csdb: found cs using ip:port and csid ({}:{},{})", strip, port, csid);
                self.reconnect(id, sid);
                return Some(id);
            }
        }

        // slow path: by address
        if let Some(id) = self.find(ip, port) {
            if self.get(id).expect("addr index out of sync").session.is_some() {
                info!(
                    "csdb: found cs using ip:port ({}:{},{}), but server is still connected",
                    strip, port, csid
                );
                return None;
            }
            self.reconnect(id, sid);
            return Some(id);
        }

        // address not found but csid known: the server moved
        if let Some(id) = csidptr {
            if self.get(id).expect("csid index out of sync").session.is_none() {
                let e = self.entries[id as usize].as_mut().expect("live entry");
                let prev = (e.ip, e.port);
                info!(
                    "csdb: found cs using csid ({}:{},{}) - previous ip:port ({}:{})",
                    strip,
                    port,
                    csid,
                    ip_to_str(prev.0),
                    prev.1
                );
                e.ip = ip;
                e.port = port;
                self.by_addr.remove(&prev);
                self.by_addr.insert((ip, port), id);
                clog(format!(
                    "{}|CSDBOP({},{},{},{})",
                    now, CSDB_OP_NEWIPPORT, ip, port, csid
                ));
                self.reconnect(id, sid);
                return Some(id);
            }
        }

        // brand-new server
        info!("csdb: server not found ({}:{},{}), add it to database", strip, port, csid);
        let mut entry = CsdbEntry::new(ip, port, now);
        let mut csid = csid;
        if csid > 0 {
            if self.by_csid[csid as usize].is_none() {
                entry.csid = csid;
            } else {
                csid = 0;
            }
        }
        entry.session = Some(sid);
        let id = self.alloc(entry);
        if csid > 0 {
            self.by_csid[csid as usize] = Some(id);
        }
        self.servers += 1;
        clog(format!("{}|CSDBOP({},{},{},{})", now, CSDB_OP_ADD, ip, port, csid));
        Some(id)
    }

    pub fn lost_connection(&mut self, id: CsdbId, now: u32) {
        if let Some(e) = self.entries.get_mut(id as usize).and_then(Option::as_mut) {
            e.disconnection_time = now;
            e.session = None;
            self.disconnected += 1;
            if e.maintenance.active() {
                self.disconnected_in_maintenance += 1;
            }
        }
    }

    /// Assigns a csid on first need; the allocation is replayed through the
    /// changelog so restarted masters agree on ids.
    pub fn get_csid(&mut self, id: CsdbId, now: u32, clog: &mut dyn FnMut(String)) -> u16 {
        let e = self.get(id).expect("get_csid on dead entry");
        if e.csid != 0 {
            return e.csid;
        }
        let csid = self.new_csid();
        let e = self.entries[id as usize].as_mut().expect("live entry");
        e.csid = csid;
        let (ip, port) = (e.ip, e.port);
        self.by_csid[csid as usize] = Some(id);
        clog(format!("{}|CSDBOP({},{},{},{})", now, CSDB_OP_NEWID, ip, port, csid));
        info!("csdb: generate new server id for ({}:{}): {}", ip_to_str(ip), port, csid);
        csid
    }

    /// Updates the load report and flags the heavy-load state when the load
    /// exceeds both the absolute threshold and the peer-relative ratio.
    pub fn server_load(&mut self, id: CsdbId, load: u32, now: u32) {
        let servers = self.servers;
        let Some(e) = self.entries.get_mut(id as usize).and_then(Option::as_mut) else {
            return;
        };
        self.loadsum -= e.load as u64;
        let loadavg = if servers > 1 {
            self.loadsum as f64 / (servers - 1) as f64
        } else {
            load as f64
        };
        e.load = load;
        self.loadsum += load as u64;
        if load > self.heavy_load_threshold && (load as f64) > loadavg * self.heavy_load_ratio_threshold {
            info!(
                "heavy load server detected ({}:{}); load: {} ; threshold: {} ; loadavg (without this server): {:.2} ; ratio_threshold: {:.2}",
                ip_to_str(e.ip),
                e.port,
                load,
                self.heavy_load_threshold,
                loadavg,
                self.heavy_load_ratio_threshold
            );
            e.heavy_load_ts = now;
        }
    }

    pub fn is_overloaded(&self, id: CsdbId, now: u32) -> bool {
        match self.get(id) {
            Some(e) => e.heavy_load_ts + self.heavy_load_grace_period > now,
            None => false,
        }
    }

    pub fn is_maintained(&self, id: CsdbId) -> bool {
        self.get(id).map(|e| e.maintenance.active()).unwrap_or(false)
    }

    /// Grace time left for reporting: seconds until the server returns to
    /// standard write selection, 0 when it was never heavy-loaded.
    pub fn grace_remaining(&self, id: CsdbId, now: u32) -> u32 {
        match self.get(id) {
            Some(e) if e.heavy_load_ts + self.heavy_load_grace_period > now => {
                e.heavy_load_ts + self.heavy_load_grace_period - now
            }
            _ => 0,
        }
    }

    /// Graceful-disconnect hint: the server intends to come right back.
    pub fn temporary_maintenance_mode(&mut self, id: CsdbId, now: u32, clog: &mut dyn FnMut(String)) {
        let timeout = if self.temp_maintenance_mode_timeout > 0 {
            now + self.temp_maintenance_mode_timeout
        } else {
            0
        };
        let Some(e) = self.entries.get_mut(id as usize).and_then(Option::as_mut) else {
            return;
        };
        if e.session.is_some() && e.maintenance == Maintenance::Off {
            e.maintenance = Maintenance::Temporary;
            e.maintenance_timeout = timeout;
            clog(format!(
                "{}|CSDBOP({},{},{},{})",
                now, CSDB_OP_MAINTENANCETMP, e.ip, e.port, timeout
            ));
        }
    }

    pub fn maintenance(
        &mut self,
        ip: u32,
        port: u16,
        on: bool,
        now: u32,
        clog: &mut dyn FnMut(String),
    ) -> u8 {
        let timeout = if on && self.maintenance_mode_timeout > 0 {
            now + self.maintenance_mode_timeout
        } else {
            0
        };
        let Some(id) = self.find(ip, port) else {
            return crate::proto::ERROR_NOTFOUND;
        };
        let e = self.entries[id as usize].as_mut().expect("live entry");
        let switching = (e.maintenance.active() && !on) || (e.maintenance == Maintenance::Off && on);
        if switching {
            e.maintenance = if on { Maintenance::On } else { Maintenance::Off };
            e.maintenance_timeout = timeout;
            if on {
                clog(format!(
                    "{}|CSDBOP({},{},{},{})",
                    now, CSDB_OP_MAINTENANCEON, ip, port, timeout
                ));
            } else {
                clog(format!("{}|CSDBOP({},{},{},0)", now, CSDB_OP_MAINTENANCEOFF, ip, port));
            }
            if e.session.is_none() {
                if on {
                    self.disconnected_in_maintenance += 1;
                } else {
                    self.disconnected_in_maintenance -= 1;
                }
            }
        }
        crate::proto::STATUS_OK
    }

    /// Clears the heavy-load grace early.
    pub fn back_to_work(&mut self, ip: u32, port: u16) -> u8 {
        match self.find(ip, port) {
            Some(id) => {
                self.entries[id as usize].as_mut().expect("live entry").heavy_load_ts = 0;
                crate::proto::STATUS_OK
            }
            None => crate::proto::ERROR_NOTFOUND,
        }
    }

    /// Removes a disconnected server for good.
    pub fn remove_server(&mut self, ip: u32, port: u16, now: u32, clog: &mut dyn FnMut(String)) -> u8 {
        let Some(id) = self.find(ip, port) else {
            return crate::proto::ERROR_NOTFOUND;
        };
        if self.get(id).expect("addr index out of sync").session.is_some() {
            return crate::proto::ERROR_ACTIVE;
        }
        self.drop_entry(id);
        clog(format!("{}|CSDBOP({},{},{},0)", now, CSDB_OP_DEL, ip, port));
        crate::proto::STATUS_OK
    }

    fn drop_entry(&mut self, id: CsdbId) {
        let e = self.entries[id as usize].take().expect("drop of dead entry");
        self.by_addr.remove(&(e.ip, e.port));
        if e.csid > 0 {
            self.del_csid(e.csid);
        }
        if e.maintenance.active() {
            self.disconnected_in_maintenance -= 1;
        }
        if e.tmpremoved {
            self.tmpremoved -= 1;
        }
        self.loadsum -= e.load as u64;
        self.servers -= 1;
        self.disconnected -= 1;
    }

    /// Drops entries that have been disconnected longer than the configured
    /// retention. Runs on a slow timer.
    pub fn remove_unused(&mut self, now: u32, clog: &mut dyn FnMut(String)) {
        if self.seconds_to_remove_unused == 0 {
            return;
        }
        let stale: Vec<CsdbId> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let e = slot.as_ref()?;
                (e.session.is_none()
                    && e.disconnection_time + self.seconds_to_remove_unused < now)
                    .then_some(idx as CsdbId)
            })
            .collect();
        for id in stale {
            let (ip, port) = {
                let e = self.get(id).expect("stale entry vanished");
                (e.ip, e.port)
            };
            self.drop_entry(id);
            clog(format!("{}|CSDBOP({},{},{},0)", now, CSDB_OP_DEL, ip, port));
        }
    }

    /// Re-verifies the derived counters and expires maintenance timeouts.
    /// A reconnect also cancels temporary maintenance (the graceful-restart
    /// hint is consumed once the server is back).
    pub fn self_check(&mut self, now: u32, clog: &mut dyn FnMut(String)) {
        let mut ds = 0;
        let mut dsm = 0;
        let mut s = 0;
        let mut trs = 0;
        for slot in self.entries.iter_mut() {
            let Some(e) = slot.as_mut() else { continue };
            let expired = e.maintenance.active()
                && e.maintenance_timeout > 0
                && now > e.maintenance_timeout;
            if (e.maintenance == Maintenance::Temporary && e.session.is_some()) || expired {
                if e.session.is_none() {
                    self.disconnected_in_maintenance -= 1;
                }
                e.maintenance = Maintenance::Off;
                e.maintenance_timeout = 0;
                clog(format!(
                    "{}|CSDBOP({},{},{},0)",
                    now, CSDB_OP_MAINTENANCEOFF, e.ip, e.port
                ));
            }
            s += 1;
            if e.tmpremoved {
                trs += 1;
            }
            if e.session.is_none() {
                ds += 1;
                if e.maintenance.active() {
                    dsm += 1;
                }
            }
        }
        if s != self.servers {
            warn!("csdb: servers counter mismatch - fixing ({}->{})", self.servers, s);
            self.servers = s;
        }
        if ds != self.disconnected {
            warn!(
                "csdb: disconnected servers counter mismatch - fixing ({}->{})",
                self.disconnected, ds
            );
            self.disconnected = ds;
        }
        if dsm != self.disconnected_in_maintenance {
            warn!(
                "csdb: disconnected and being maintained servers counter mismatch - fixing ({}->{})",
                self.disconnected_in_maintenance, dsm
            );
            self.disconnected_in_maintenance = dsm;
        }
        if trs != self.tmpremoved {
            warn!(
                "csdb: temporary removed servers counter mismatch - fixing ({}->{})",
                self.tmpremoved, trs
            );
            self.tmpremoved = trs;
        }
    }

    /// Replays a CSDBOP changelog record.
    pub fn mr_op(&mut self, op: u8, ip: u32, port: u16, arg: u32, now: u32) -> u8 {
        use crate::proto::{ERROR_MISMATCH, STATUS_OK};
        match op {
            CSDB_OP_ADD => {
                if self.find(ip, port).is_some() {
                    return ERROR_MISMATCH;
                }
                if arg > 65535 || (arg > 0 && self.by_csid[arg as usize].is_some()) {
                    return ERROR_MISMATCH;
                }
                let mut e = CsdbEntry::new(ip, port, now);
                e.csid = arg as u16;
                let id = self.alloc(e);
                if arg > 0 {
                    self.by_csid[arg as usize] = Some(id);
                }
                self.servers += 1;
                self.disconnected += 1;
                STATUS_OK
            }
            CSDB_OP_DEL => match self.find(ip, port) {
                Some(id) if self.get(id).expect("index").session.is_none() => {
                    self.drop_entry(id);
                    STATUS_OK
                }
                _ => ERROR_MISMATCH,
            },
            CSDB_OP_NEWIPPORT => {
                if arg == 0 || arg > 65535 {
                    return ERROR_MISMATCH;
                }
                let Some(id) = self.by_csid[arg as usize] else {
                    return ERROR_MISMATCH;
                };
                let e = self.entries[id as usize].as_mut().expect("csid index");
                let prev = (e.ip, e.port);
                e.ip = ip;
                e.port = port;
                self.by_addr.remove(&prev);
                self.by_addr.insert((ip, port), id);
                STATUS_OK
            }
            CSDB_OP_NEWID => {
                if arg == 0 || arg > 65535 || self.by_csid[arg as usize].is_some() {
                    return ERROR_MISMATCH;
                }
                let Some(id) = self.find(ip, port) else {
                    return ERROR_MISMATCH;
                };
                let old = self.get(id).expect("index").csid;
                if old != arg as u16 {
                    if old > 0 {
                        self.del_csid(old);
                    }
                    self.entries[id as usize].as_mut().expect("index").csid = arg as u16;
                    self.by_csid[arg as usize] = Some(id);
                }
                STATUS_OK
            }
            CSDB_OP_MAINTENANCEON | CSDB_OP_MAINTENANCEOFF | CSDB_OP_MAINTENANCETMP => {
                let Some(id) = self.find(ip, port) else {
                    return ERROR_MISMATCH;
                };
                let disconnected = self.get(id).expect("index").session.is_none();
                let e = self.entries[id as usize].as_mut().expect("index");
                let target = match op {
                    CSDB_OP_MAINTENANCEON => Maintenance::On,
                    CSDB_OP_MAINTENANCETMP => Maintenance::Temporary,
                    _ => Maintenance::Off,
                };
                if disconnected {
                    if e.maintenance == Maintenance::Off && target.active() {
                        self.disconnected_in_maintenance += 1;
                    } else if e.maintenance.active() && target == Maintenance::Off {
                        self.disconnected_in_maintenance -= 1;
                    }
                }
                let e = self.entries[id as usize].as_mut().expect("index");
                e.maintenance = target;
                e.maintenance_timeout = arg;
                STATUS_OK
            }
            _ => ERROR_MISMATCH,
        }
    }

    pub fn have_all_servers(&self) -> bool {
        self.disconnected == 0
    }

    pub fn have_more_than_half_servers(&self) -> bool {
        let total = self.servers - self.tmpremoved;
        total == 0 || (self.disconnected - self.tmpremoved) < (total + 1) / 2
    }

    /// False only when every disconnected server is under maintenance:
    /// undergoal replication would churn data that is about to come back.
    pub fn replicate_undergoals(&self) -> bool {
        !(self.disconnected > 0 && self.disconnected == self.disconnected_in_maintenance)
    }

    /// Deterministic numbering of active servers by (ip, port); returns the
    /// count of numbered servers.
    pub fn sort_servers(&mut self) -> u16 {
        let mut ids: Vec<CsdbId> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                slot.as_ref()
                    .filter(|e| !e.tmpremoved)
                    .map(|_| idx as CsdbId)
            })
            .collect();
        ids.sort_by_key(|&id| {
            let e = self.get(id).expect("sorting live entries");
            (e.ip, e.port)
        });
        for (i, id) in ids.iter().enumerate() {
            self.entries[*id as usize].as_mut().expect("index").number = (i + 1) as u16;
        }
        ids.len() as u16
    }

    pub fn servers_count(&self) -> u16 {
        (self.servers - self.tmpremoved) as u16
    }

    pub fn number_of(&self, id: CsdbId) -> u16 {
        self.get(id).map(|e| e.number).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CsdbId, &CsdbEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|e| (idx as CsdbId, e)))
    }

    /// Writes the persistence image: entry count, then 13-byte records.
    pub fn store<W: Write>(&self, w: &mut W) -> Result<()> {
        let count = self.entries.iter().filter(|s| s.is_some()).count() as u32;
        w.write_all(&count.to_be_bytes())?;
        for (_, e) in self.iter() {
            let mut rec = [0u8; 13];
            rec[0..4].copy_from_slice(&e.ip.to_be_bytes());
            rec[4..6].copy_from_slice(&e.port.to_be_bytes());
            rec[6..8].copy_from_slice(&e.csid.to_be_bytes());
            rec[8] = e.maintenance.as_u8();
            rec[9..13].copy_from_slice(&e.maintenance_timeout.to_be_bytes());
            w.write_all(&rec)?;
        }
        Ok(())
    }

    pub const fn store_mver() -> u8 {
        STORE_MVER
    }

    /// Loads a persistence image written by this or an older master.
    pub fn load<R: Read>(&mut self, r: &mut R, mver: u8, now: u32) -> Result<()> {
        let mut cnt = [0u8; 4];
        r.read_exact(&mut cnt)?;
        let mut count = u32::from_be_bytes(cnt);
        let bsize: usize = match mver {
            0..=0x10 => 6,
            0x11 => 8,
            0x12 => 9,
            _ => 13,
        };
        let mut rec = [0u8; 13];
        while count > 0 {
            r.read_exact(&mut rec[..bsize])?;
            let ip = u32::from_be_bytes([rec[0], rec[1], rec[2], rec[3]]);
            let port = u16::from_be_bytes([rec[4], rec[5]]);
            let csid = if mver >= 0x11 {
                u16::from_be_bytes([rec[6], rec[7]])
            } else {
                0
            };
            let maintenance = if mver >= 0x12 { rec[8] } else { 0 };
            let maintenance_timeout = if mver >= 0x13 {
                u32::from_be_bytes([rec[9], rec[10], rec[11], rec[12]])
            } else {
                0
            };
            if self.find(ip, port).is_some() {
                return Err(MasterError::Corruption(format!(
                    "repeated chunkserver entry (ip:{},port:{})",
                    ip_to_str(ip),
                    port
                )));
            }
            if csid > 0 && self.by_csid[csid as usize].is_some() {
                return Err(MasterError::Corruption(format!(
                    "repeated chunkserver entry (csid:{})",
                    csid
                )));
            }
            let mut e = CsdbEntry::new(ip, port, now);
            e.csid = csid;
            e.maintenance = Maintenance::from_u8(maintenance);
            e.maintenance_timeout = maintenance_timeout;
            let id = self.alloc(e);
            if csid > 0 {
                self.by_csid[csid as usize] = Some(id);
            }
            self.servers += 1;
            self.disconnected += 1;
            if maintenance != 0 {
                self.disconnected_in_maintenance += 1;
            }
            count -= 1;
        }
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.entries.clear();
        self.by_addr.clear();
        self.by_csid.iter_mut().for_each(|s| *s = None);
        self.next_csid = 1;
        self.servers = 0;
        self.disconnected = 0;
        self.disconnected_in_maintenance = 0;
        self.tmpremoved = 0;
        self.loadsum = 0;
    }
}
