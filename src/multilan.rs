//! Multi-LAN address translation. Chunk servers on multi-homed hosts report
//! one address; clients on another LAN segment need the address rewritten
//! into their own subnet. A static per-server map takes precedence, then the
//! LAN-class rewrite `(client & mask) | (server & !mask)` applies when both
//! sides fall into configured classes.

use std::fs;
use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::config::parse_ip;

/// Static (server ip, client subnet) -> served ip table, loaded from the
/// ipmap file: one `server_ip client_net/bits served_ip` entry per line.
#[derive(Default)]
pub struct IpMap {
    entries: FxHashMap<u32, Vec<(u32, u32, u32)>>, // servip -> (net, mask, served)
}

impl IpMap {
    pub fn map(&self, servip: u32, clientip: u32) -> Option<u32> {
        let rules = self.entries.get(&servip)?;
        rules
            .iter()
            .find(|(net, mask, _)| clientip & mask == *net)
            .map(|&(_, _, served)| served)
    }

    pub fn load_str(&mut self, text: &str) {
        self.entries.clear();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let parsed = (|| {
                let servip = parse_ip(parts.next()?)?;
                let (netstr, bitsstr) = parts.next()?.split_once('/')?;
                let net = parse_ip(netstr)?;
                let bits: u32 = bitsstr.parse().ok()?;
                if bits == 0 || bits > 32 {
                    return None;
                }
                let mask = (!0u32) << (32 - bits);
                let served = parse_ip(parts.next()?)?;
                Some((servip, net & mask, mask, served))
            })();
            match parsed {
                Some((servip, net, mask, served)) => {
                    self.entries
                        .entry(servip)
                        .or_default()
                        .push((net, mask, served));
                }
                None => warn!("ipmap: malformed entry in line: {}", idx + 1),
            }
        }
    }

    pub fn load(&mut self, path: &Path) {
        match fs::read_to_string(path) {
            Ok(text) => {
                self.load_str(&text);
                info!("ipmap file has been loaded ({} servers)", self.entries.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("can't read ipmap file ({}): {}", path.display(), e),
        }
    }
}

#[derive(Default)]
pub struct MultiLan {
    mask: u32,
    classes: Vec<u32>,
    pub ipmap: IpMap,
}

impl MultiLan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjusts a server address so the given client can reach it.
    pub fn map(&self, servip: u32, clientip: u32) -> u32 {
        if clientip == 0 {
            return servip;
        }
        if let Some(mapped) = self.ipmap.map(servip, clientip) {
            return mapped;
        }
        if self.mask == 0 {
            return servip;
        }
        let mut vmask = 0u8;
        for class in &self.classes {
            if vmask == 3 {
                break;
            }
            if clientip & self.mask == class & self.mask {
                vmask |= 1;
            }
            if servip & self.mask == class & self.mask {
                vmask |= 2;
            }
        }
        if vmask == 3 {
            (clientip & self.mask) | (servip & !self.mask)
        } else {
            servip
        }
    }

    /// Picks, out of the addresses a multi-homed server reported, the one on
    /// the master's own LAN class. An ambiguous result (two candidates) falls
    /// back to the original address.
    pub fn match_local(&self, servip: u32, iptab: &[u32]) -> u32 {
        if self.mask == 0 || iptab.is_empty() {
            return servip;
        }
        if !self
            .classes
            .iter()
            .any(|c| servip & self.mask == c & self.mask)
        {
            return servip;
        }
        let mut res = 0u32;
        for &ip in iptab {
            if ip & !self.mask != servip & !self.mask {
                continue;
            }
            for class in &self.classes {
                if ip & self.mask == class & self.mask {
                    if res == 0 {
                        res = ip;
                    } else {
                        return servip;
                    }
                }
            }
        }
        if res == 0 {
            servip
        } else {
            res
        }
    }

    /// Applies the `multilan_bits` / `multilan_classes` configuration pair.
    /// Both must be present; otherwise the class rewrite is disabled.
    pub fn configure(&mut self, bits: u8, classlist: Option<&str>) {
        self.mask = 0;
        self.classes.clear();
        let Some(classlist) = classlist else { return };
        if bits == 0 || bits > 32 {
            warn!("wrong value for multilan_bits ({}; should be between 1 and 32)", bits);
            return;
        }
        let mask = (!0u32) << (32 - bits as u32);
        match parse_netlist(classlist, mask) {
            Ok(classes) => {
                info!(
                    "accepted {} lans for multilan configuration with {} bits (mask: {})",
                    classes.len(),
                    bits,
                    crate::proto::ip_to_str(mask)
                );
                self.mask = mask;
                self.classes = classes;
            }
            Err(e) => warn!("error parsing ip class from multilan_classes - {}", e),
        }
    }
}

/// Comma/semicolon separated list of ip classes, each already aligned to the
/// common mask.
pub fn parse_netlist(netlist: &str, commonmask: u32) -> Result<Vec<u32>, String> {
    let mut out = Vec::new();
    for item in netlist.split([',', ';']) {
        let item = item.trim();
        if item.is_empty() {
            return Err("found empty class".to_string());
        }
        // accept short forms like "10.10.10" by padding to four octets
        let mut octets: Vec<&str> = item.split('.').collect();
        if octets.len() > 4 {
            return Err(format!("too many octets ({})", item));
        }
        while octets.len() < 4 {
            octets.push("0");
        }
        let mut ip = 0u32;
        for o in octets {
            let v: u32 = o
                .trim()
                .parse()
                .map_err(|_| format!("bad octet ({})", item))?;
            if v > 255 {
                return Err(format!("octet>255 ({})", item));
            }
            ip = (ip << 8) | v;
        }
        if ip & commonmask != ip {
            return Err(format!("garbage bits at the end of ip class ({})", item));
        }
        if ip == 0 {
            return Err("found empty class".to_string());
        }
        out.push(ip);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> u32 {
        parse_ip(s).unwrap()
    }

    fn lan() -> MultiLan {
        let mut ml = MultiLan::new();
        ml.configure(24, Some("192.168.1.0, 10.0.0.0"));
        ml
    }

    #[test]
    fn class_rewrite() {
        let ml = lan();
        // server 192.168.1.7 seen by client 10.0.0.3 -> 10.0.0.7
        assert_eq!(ml.map(ip("192.168.1.7"), ip("10.0.0.3")), ip("10.0.0.7"));
        // client outside any class keeps the original address
        assert_eq!(ml.map(ip("192.168.1.7"), ip("172.16.0.1")), ip("192.168.1.7"));
        // zero client ip is a no-op
        assert_eq!(ml.map(ip("192.168.1.7"), 0), ip("192.168.1.7"));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let ml = lan();
        for (s, c) in [
            ("192.168.1.7", "10.0.0.3"),
            ("10.0.0.9", "192.168.1.44"),
            ("172.16.5.5", "10.0.0.3"),
        ] {
            let once = ml.map(ip(s), ip(c));
            assert_eq!(ml.map(once, ip(c)), once);
        }
    }

    #[test]
    fn static_map_takes_precedence() {
        let mut ml = lan();
        ml.ipmap
            .load_str("192.168.1.7 10.0.0.0/24 10.99.99.7\n# comment\n");
        assert_eq!(ml.map(ip("192.168.1.7"), ip("10.0.0.3")), ip("10.99.99.7"));
        // other clients still go through the class rewrite
        assert_eq!(ml.map(ip("192.168.1.8"), ip("10.0.0.3")), ip("10.0.0.8"));
    }

    #[test]
    fn match_local_picks_unique_candidate() {
        let ml = lan();
        let tab = [ip("172.16.0.7"), ip("10.0.0.7")];
        assert_eq!(ml.match_local(ip("192.168.1.7"), &tab), ip("10.0.0.7"));
        // ambiguous: two candidates in configured classes
        let tab = [ip("10.0.0.7"), ip("192.168.1.7")];
        assert_eq!(ml.match_local(ip("192.168.1.7"), &tab), ip("192.168.1.7"));
        // nothing matches
        assert_eq!(ml.match_local(ip("192.168.1.7"), &[ip("172.16.0.9")]), ip("192.168.1.7"));
    }

    #[test]
    fn netlist_validation() {
        assert!(parse_netlist("192.168.1.0", 0xFFFFFF00).is_ok());
        assert!(parse_netlist("192.168.300.0", 0xFFFFFF00).is_err());
        assert!(parse_netlist("192.168.1.5", 0xFFFFFF00).is_err());
        assert!(parse_netlist("", 0xFFFFFF00).is_err());
        assert_eq!(
            parse_netlist("10.10.10, 172.16.5.0", 0xFFFFFF00).unwrap(),
            vec![ip("10.10.10.0"), ip("172.16.5.0")]
        );
    }
}
