use chunkmaster::config::parse_ip;
use chunkmaster::topology::Topology;

fn ip(s: &str) -> u32 {
    parse_ip(s).unwrap()
}

#[test]
fn topology_file_drives_distance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mfstopology.cfg");
    std::fs::write(
        &path,
        "# rack map\n10.0.0.0/24 rack1\n10.0.1.0/24 rack1|shelfA\n192.168.0.0-192.168.0.255 rack2\n",
    )
    .unwrap();

    let mut topo = Topology::new();
    topo.reload(&path);

    assert_eq!(topo.distance(ip("10.0.0.5"), ip("10.0.0.6")), 1);
    assert_eq!(topo.distance(ip("10.0.0.5"), ip("10.0.1.5")), 3);
    assert_eq!(topo.distance(ip("10.0.0.5"), ip("192.168.0.9")), 2);
    assert_eq!(topo.distance(ip("192.168.0.1"), ip("192.168.0.200")), 1);
    // unknown addresses share rack id 0: same-rack distance
    assert_eq!(topo.distance(ip("172.16.0.1"), ip("172.16.5.1")), 1);
}

#[test]
fn missing_file_leaves_topology_undefined() {
    let dir = tempfile::tempdir().unwrap();
    let mut topo = Topology::new();
    topo.reload(&dir.path().join("nonexistent.cfg"));
    assert_eq!(topo.rack_id(ip("10.0.0.1")), 0);
    assert_eq!(topo.distance(ip("10.0.0.1"), ip("10.0.0.2")), 1);
}

#[test]
fn reload_replaces_the_previous_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mfstopology.cfg");
    std::fs::write(&path, "10.0.0.0/24 old\n").unwrap();
    let mut topo = Topology::new();
    topo.reload(&path);
    let old_id = topo.rack_id(ip("10.0.0.1"));
    assert_ne!(old_id, 0);

    std::fs::write(&path, "10.0.0.0/16 fresh\n").unwrap();
    topo.reload(&path);
    assert_ne!(topo.rack_id(ip("10.0.200.1")), 0);
    assert_eq!(topo.distance(ip("10.0.0.1"), ip("10.0.200.1")), 1);
}

#[test]
fn master_picks_up_configured_paths() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("topo.cfg"), "10.1.0.0/16 dc|row|rack9\n").unwrap();
    std::fs::write(
        dir.path().join("ipmap.cfg"),
        "10.1.0.7 192.168.7.0/24 192.168.7.77\n",
    )
    .unwrap();
    let mut cfg = chunkmaster::Config::default();
    cfg.data_path = dir.path().to_path_buf();
    cfg.changelog_save_mode = 1;
    cfg.topology_filename = Some(dir.path().join("topo.cfg"));
    cfg.ipmap_filename = Some(dir.path().join("ipmap.cfg"));
    cfg.multilan_bits = 24;
    cfg.multilan_classes = Some("10.1.0.0, 192.168.7.0".to_string());
    cfg.normalize();
    let m = chunkmaster::Master::new(
        cfg,
        Box::new(chunkmaster::metadata::ChunkRegistry::new()),
        chunkmaster::Clock::fake(1000, 0.0),
    )
    .unwrap();

    assert_ne!(m.topology.rack_id(ip("10.1.2.3")), 0);
    // the static map wins over the class rewrite
    assert_eq!(
        m.multilan.map(ip("10.1.0.7"), ip("192.168.7.3")),
        ip("192.168.7.77")
    );
    // the class rewrite applies to other servers
    assert_eq!(
        m.multilan.map(ip("10.1.0.9"), ip("192.168.7.3")),
        ip("192.168.7.9")
    );
}
