//! Network topology: maps IPv4 addresses to racks and computes the distance
//! metric used by placement and read selection.
//!
//! The topology file has one entry per line: `network rack_path`, where
//! `network` is `ip`, `ip/prefix`, `ip/mask`, `ip1-ip2` or `*`, and
//! `rack_path` is a `|`-separated path. Identical paths share one numeric
//! rack id. Lookup runs over an interval tree that is rebalanced after every
//! load.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

// ---------------------------------------------------------------------------
// interval tree

struct ItNode {
    from: u32,
    to: u32,
    id: u32,
    left: Option<Box<ItNode>>,
    right: Option<Box<ItNode>>,
}

#[derive(Default)]
pub struct IntervalTree {
    root: Option<Box<ItNode>>,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Inserts `[from, to] -> id`, splitting or consuming overlapping
    /// intervals. `id == 0` removes the range instead.
    pub fn add_interval(&mut self, from: u32, to: u32, id: u32) {
        let (f, t) = if to < from { (to, from) } else { (from, to) };
        if id == 0 {
            Self::delete(&mut self.root, f, t);
        } else {
            Self::add(&mut self.root, f, t, id);
        }
    }

    pub fn find(&self, v: u32) -> u32 {
        let mut n = self.root.as_deref();
        while let Some(node) = n {
            if v >= node.from && v <= node.to {
                return node.id;
            }
            n = if v < node.from {
                node.left.as_deref()
            } else {
                node.right.as_deref()
            };
        }
        0
    }

    fn add(slot: &mut Option<Box<ItNode>>, f: u32, t: u32, id: u32) {
        match slot {
            None => {
                *slot = Some(Box::new(ItNode {
                    from: f,
                    to: t,
                    id,
                    left: None,
                    right: None,
                }));
            }
            Some(n) => {
                if t < n.from {
                    Self::add(&mut n.left, f, t, id);
                } else if f > n.to {
                    Self::add(&mut n.right, f, t, id);
                } else if f <= n.from && t >= n.to {
                    // new range swallows this node
                    if f < n.from {
                        Self::delete(&mut n.left, f, n.from - 1);
                    }
                    if t > n.to {
                        Self::delete(&mut n.right, n.to + 1, t);
                    }
                    n.from = f;
                    n.to = t;
                    n.id = id;
                } else if f >= n.from && t <= n.to {
                    // new range inside this node
                    if f > n.from {
                        let (nf, oid) = (n.from, n.id);
                        Self::add(&mut n.left, nf, f - 1, oid);
                    }
                    if t < n.to {
                        let (nt, oid) = (n.to, n.id);
                        Self::add(&mut n.right, t + 1, nt, oid);
                    }
                    n.from = f;
                    n.to = t;
                    n.id = id;
                } else if f < n.from {
                    n.from = t + 1;
                    Self::add(&mut n.left, f, t, id);
                } else {
                    n.to = f - 1;
                    Self::add(&mut n.right, f, t, id);
                }
            }
        }
    }

    fn delete(slot: &mut Option<Box<ItNode>>, f: u32, t: u32) {
        let Some(n) = slot else { return };
        if t < n.from {
            Self::delete(&mut n.left, f, t);
        } else if f > n.to {
            Self::delete(&mut n.right, f, t);
        } else if f <= n.from && t >= n.to {
            if f < n.from {
                Self::delete(&mut n.left, f, n.from - 1);
            }
            if t > n.to {
                Self::delete(&mut n.right, n.to + 1, t);
            }
            Self::remove_node(slot);
        } else if f >= n.from && t <= n.to {
            if f == n.from {
                n.from = t + 1;
            } else if t == n.to {
                n.to = f - 1;
            } else {
                let (nt, oid) = (n.to, n.id);
                Self::add(&mut n.right, t + 1, nt, oid);
                n.to = f - 1;
            }
        } else if f < n.from {
            n.from = t + 1;
            Self::delete(&mut n.left, f, t);
        } else {
            n.to = f - 1;
            Self::delete(&mut n.right, f, t);
        }
    }

    fn remove_node(slot: &mut Option<Box<ItNode>>) {
        let Some(n) = slot.as_mut() else { return };
        if n.left.is_none() {
            *slot = n.right.take();
        } else if n.right.is_none() {
            *slot = n.left.take();
        } else {
            // replace with in-order successor
            let (f, t, id) = Self::detach_min(&mut n.right);
            n.from = f;
            n.to = t;
            n.id = id;
        }
    }

    fn detach_min(slot: &mut Option<Box<ItNode>>) -> (u32, u32, u32) {
        let n = slot.as_mut().expect("detach_min on empty subtree");
        if n.left.is_some() {
            Self::detach_min(&mut n.left)
        } else {
            let node = slot.take().expect("slot emptied concurrently");
            *slot = node.right;
            (node.from, node.to, node.id)
        }
    }

    /// Converts the insert-order-skewed tree into a balanced one, merging
    /// adjacent intervals that carry the same id.
    pub fn rebalance(&mut self) {
        let mut list = Vec::new();
        Self::collect(self.root.take(), &mut list);
        let mut merged: Vec<(u32, u32, u32)> = Vec::with_capacity(list.len());
        for iv in list {
            match merged.last_mut() {
                Some(last) if last.2 == iv.2 && last.1.wrapping_add(1) == iv.0 => {
                    last.1 = iv.1;
                }
                _ => merged.push(iv),
            }
        }
        self.root = Self::build(&merged);
    }

    fn collect(node: Option<Box<ItNode>>, out: &mut Vec<(u32, u32, u32)>) {
        if let Some(n) = node {
            Self::collect(n.left, out);
            out.push((n.from, n.to, n.id));
            Self::collect(n.right, out);
        }
    }

    fn build(sorted: &[(u32, u32, u32)]) -> Option<Box<ItNode>> {
        if sorted.is_empty() {
            return None;
        }
        let mid = sorted.len() / 2;
        let (from, to, id) = sorted[mid];
        Some(Box::new(ItNode {
            from,
            to,
            id,
            left: Self::build(&sorted[..mid]),
            right: Self::build(&sorted[mid + 1..]),
        }))
    }
}

// ---------------------------------------------------------------------------
// rack names

#[derive(Default)]
struct RackTable {
    names: Vec<String>, // index = rack id; slot 0 reserved
    ids: HashMap<String, u32>,
}

impl RackTable {
    fn new() -> Self {
        Self {
            names: vec![String::new()],
            ids: HashMap::new(),
        }
    }

    fn id_for(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    fn name_of(&self, id: u32) -> Option<&str> {
        if id == 0 {
            return Some("");
        }
        self.names.get(id as usize).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// topology proper

pub struct Topology {
    tree: IntervalTree,
    racks: RackTable,
    loaded: bool,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Self {
            tree: IntervalTree::new(),
            racks: RackTable::new(),
            loaded: false,
        }
    }

    pub fn rack_id(&self, ip: u32) -> u32 {
        self.tree.find(ip)
    }

    /// 0 = same machine, 1 = same rack, otherwise 2 plus the larger count of
    /// path components remaining after the common prefix of the two rack
    /// paths. This is the metric the fleet already runs with; it is kept
    /// exactly, asymmetry of path depth included.
    pub fn distance(&self, ip1: u32, ip2: u32) -> u8 {
        if ip1 == ip2 {
            return 0;
        }
        let rid1 = self.tree.find(ip1);
        let rid2 = self.tree.find(ip2);
        if rid1 == rid2 {
            return 1;
        }
        let rname1 = self.racks.name_of(rid1);
        let rname2 = self.racks.name_of(rid2);
        let (Some(rname1), Some(rname2)) = (rname1, rname2) else {
            return 1;
        };
        let b1 = rname1.as_bytes();
        let b2 = rname2.as_bytes();

        let mut lastbar = 0usize;
        let mut pos = 0usize;
        // one path ending exactly where the other descends keeps the
        // boundary separator in the depth count (parent vs child rack);
        // a mismatch inside a component does not (sibling racks)
        let mut prefix_of_other = false;
        loop {
            let c1 = b1.get(pos).copied();
            let c2 = b2.get(pos).copied();
            match (c1, c2) {
                (None, Some(b'|')) | (Some(b'|'), None) => {
                    lastbar = pos;
                    prefix_of_other = true;
                    break;
                }
                (a, b) if a != b => break,
                (Some(b'|'), _) => {
                    lastbar = pos;
                }
                (None, None) => return 1, // identical paths, distinct ids
                _ => {}
            }
            pos += 1;
        }

        let tail_bars = |bytes: &[u8]| -> u8 {
            let start = if !prefix_of_other && bytes.get(lastbar) == Some(&b'|') {
                lastbar + 1
            } else {
                lastbar
            };
            bytes[start.min(bytes.len())..]
                .iter()
                .filter(|&&c| c == b'|')
                .count() as u8
        };
        let l1 = tail_bars(b1);
        let l2 = tail_bars(b2);
        2 + l1.max(l2)
    }

    /// Parses a network designator into an inclusive ip range.
    pub fn parse_net(net: &str) -> Option<(u32, u32)> {
        if net == "*" {
            return Some((0, u32::MAX));
        }
        if let Some((ipstr, rest)) = net.split_once('/') {
            let ip = crate::config::parse_ip(ipstr)?;
            // prefix length or explicit mask
            let mask = if !rest.contains('.') {
                let bits: u32 = rest.parse().ok()?;
                if bits > 32 {
                    return None;
                }
                if bits == 0 {
                    0
                } else {
                    (!0u32) << (32 - bits)
                }
            } else {
                crate::config::parse_ip(rest)?
            };
            let from = ip & mask;
            return Some((from, from | !mask));
        }
        if let Some((a, b)) = net.split_once('-') {
            let from = crate::config::parse_ip(a)?;
            let to = crate::config::parse_ip(b)?;
            return Some((from, to));
        }
        let ip = crate::config::parse_ip(net)?;
        Some((ip, ip))
    }

    fn parse_line(&mut self, line: &str, lineno: u32) -> Option<(u32, u32, u32)> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut parts = line.split_whitespace();
        let net = parts.next()?;
        let Some(rack) = parts.next() else {
            warn!("topology: incomplete definition in line: {}", lineno);
            return None;
        };
        if let Some(garbage) = parts.next() {
            if !garbage.starts_with('#') {
                warn!("topology: garbage found at the end of line: {}", lineno);
                return None;
            }
        }
        let Some((from, to)) = Self::parse_net(net) else {
            warn!("topology: incorrect ip/network definition in line: {}", lineno);
            return None;
        };
        let rid = self.racks.id_for(rack);
        Some((from, to, rid))
    }

    /// Parses topology text into a fresh tree, replacing the previous
    /// mapping wholesale. Unparseable lines are skipped with a warning.
    pub fn load_str(&mut self, text: &str) {
        self.racks = RackTable::new();
        let mut tree = IntervalTree::new();
        for (idx, line) in text.lines().enumerate() {
            if let Some((from, to, rid)) = self.parse_line(line, idx as u32 + 1) {
                tree.add_interval(from, to, rid);
            }
        }
        tree.rebalance();
        self.tree = tree;
        self.loaded = true;
        info!("topology has been loaded");
    }

    pub fn reload(&mut self, path: &Path) {
        match fs::read_to_string(path) {
            Ok(text) => self.load_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.loaded {
                    warn!(
                        "topology configuration file ({}) not found - network topology not changed",
                        path.display()
                    );
                } else {
                    warn!(
                        "topology configuration file ({}) not found - network topology not defined",
                        path.display()
                    );
                }
            }
            Err(e) => {
                warn!(
                    "can't open topology configuration file ({}): {}",
                    path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> u32 {
        crate::config::parse_ip(s).unwrap()
    }

    #[test]
    fn parse_net_forms() {
        assert_eq!(Topology::parse_net("*"), Some((0, u32::MAX)));
        assert_eq!(Topology::parse_net("10.0.0.1"), Some((ip("10.0.0.1"), ip("10.0.0.1"))));
        assert_eq!(
            Topology::parse_net("10.0.0.0/24"),
            Some((ip("10.0.0.0"), ip("10.0.0.255")))
        );
        assert_eq!(
            Topology::parse_net("10.0.0.0/255.255.255.0"),
            Some((ip("10.0.0.0"), ip("10.0.0.255")))
        );
        assert_eq!(
            Topology::parse_net("10.0.0.5-10.0.0.9"),
            Some((ip("10.0.0.5"), ip("10.0.0.9")))
        );
        assert_eq!(Topology::parse_net("10.0.0.0/33"), None);
        assert_eq!(Topology::parse_net("bogus"), None);
    }

    #[test]
    fn interval_tree_overlaps() {
        let mut t = IntervalTree::new();
        t.add_interval(0, 100, 1);
        t.add_interval(40, 60, 2); // punches a hole
        assert_eq!(t.find(10), 1);
        assert_eq!(t.find(50), 2);
        assert_eq!(t.find(90), 1);
        t.add_interval(0, 200, 3); // swallows everything
        assert_eq!(t.find(50), 3);
        assert_eq!(t.find(150), 3);
        t.add_interval(80, 120, 0); // delete a middle range
        assert_eq!(t.find(100), 0);
        assert_eq!(t.find(70), 3);
        assert_eq!(t.find(130), 3);
    }

    #[test]
    fn rebalance_merges_adjacent() {
        let mut t = IntervalTree::new();
        t.add_interval(0, 9, 1);
        t.add_interval(10, 19, 1);
        t.add_interval(20, 29, 2);
        t.rebalance();
        assert_eq!(t.find(5), 1);
        assert_eq!(t.find(15), 1);
        assert_eq!(t.find(25), 2);
        assert_eq!(t.find(30), 0);
    }

    #[test]
    fn distance_metric() {
        let mut topo = Topology::new();
        topo.load_str("10.0.0.0/24 rack1\n10.0.1.0/24 rack1|shelfA\n");
        // same ip
        assert_eq!(topo.distance(ip("10.0.0.5"), ip("10.0.0.5")), 0);
        // same rack
        assert_eq!(topo.distance(ip("10.0.0.5"), ip("10.0.0.6")), 1);
        // rack1 vs rack1|shelfA: common prefix "rack1", one extra component
        assert_eq!(topo.distance(ip("10.0.0.5"), ip("10.0.1.5")), 3);
        // unknown vs known rack
        assert_eq!(topo.distance(ip("192.168.0.1"), ip("10.0.0.5")), 2);
    }

    #[test]
    fn distance_sibling_racks() {
        let mut topo = Topology::new();
        topo.load_str("10.0.0.0/24 dc|r1\n10.0.1.0/24 dc|r2\n10.0.2.0/24 dc|r2|shelf\n");
        // same parent, different leaf component
        assert_eq!(topo.distance(ip("10.0.0.1"), ip("10.0.1.1")), 2);
        // parent rack vs its descendant
        assert_eq!(topo.distance(ip("10.0.1.1"), ip("10.0.2.1")), 3);
    }

    #[test]
    fn distance_disjoint_paths() {
        let mut topo = Topology::new();
        topo.load_str("10.0.0.0/24 dc1|r1\n10.0.1.0/24 dc2|r2|shelf\n");
        // no common prefix; tails are dc1|r1 (1 bar) and dc2|r2|shelf (2 bars)
        assert_eq!(topo.distance(ip("10.0.0.1"), ip("10.0.1.1")), 4);
    }

    #[test]
    fn comments_and_garbage() {
        let mut topo = Topology::new();
        topo.load_str("# comment\n\n10.0.0.0/24 rackA # trailing\nbroken-line\n");
        assert_eq!(topo.rack_id(ip("10.0.0.1")), 1);
        assert_eq!(topo.rack_id(ip("10.0.1.1")), 0);
    }
}
