use chunkmaster::matocs;
use chunkmaster::proto;
use chunkmaster::testkit::{connect_server, master_for_tests};

fn load_report(load: u32) -> Vec<u8> {
    load.to_be_bytes().to_vec()
}

#[test]
fn heavy_load_server_sits_out_the_grace_period() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    // five servers: one hot, four quiet (grace pool stays under 20%)
    let hot = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let mut quiet = Vec::new();
    for i in 0..4u32 {
        quiet.push(connect_server(m, 0x0A000002 + i, 9422, 1 << 40, 1 << 30));
    }
    for &sid in &quiet {
        matocs::handle_frame(m, sid, proto::CSTOMA_CURRENT_LOAD, &load_report(10));
    }
    let flagged_at = m.clock.wall();
    matocs::handle_frame(m, hot, proto::CSTOMA_CURRENT_LOAD, &load_report(1000));

    let hot_csid = m.cs.session(hot).unwrap().csid;
    let csdb_id = m.cs.session(hot).unwrap().csdb.unwrap();
    assert!(m.csdb.is_overloaded(csdb_id, flagged_at));

    // within the grace period the server is in GRACEFUL state and absent
    // from write selection
    m.cs.hlstatus_fix(&m.csdb, m.clock.wall());
    assert_eq!(m.cs.session(hot).unwrap().hlstatus, proto::HLSTATUS_GRACEFUL);
    let (csids, _) = m.cs.getservers_wrandom(&m.csdb);
    assert_eq!(csids.len(), 4);
    assert!(!csids.contains(&hot_csid));

    m.clock.advance(899);
    m.cs.hlstatus_fix(&m.csdb, m.clock.wall());
    let (csids, _) = m.cs.getservers_wrandom(&m.csdb);
    assert!(!csids.contains(&hot_csid));

    // at flagged_at + 900 the grace expires and selection sees it again
    m.clock.advance(1);
    assert!(!m.csdb.is_overloaded(csdb_id, m.clock.wall()));
    m.cs.hlstatus_fix(&m.csdb, m.clock.wall());
    assert_eq!(m.cs.session(hot).unwrap().hlstatus, proto::HLSTATUS_DEFAULT);
    let (csids, _) = m.cs.getservers_wrandom(&m.csdb);
    assert!(csids.contains(&hot_csid));
}

#[test]
fn load_below_ratio_threshold_is_not_flagged() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let b = connect_server(m, 0x0A000002, 9422, 1 << 40, 1 << 30);
    matocs::handle_frame(m, a, proto::CSTOMA_CURRENT_LOAD, &load_report(200));
    // 180 > absolute threshold but not 3x the peer average (200)
    matocs::handle_frame(m, b, proto::CSTOMA_CURRENT_LOAD, &load_report(180));
    let id = m.cs.session(b).unwrap().csdb.unwrap();
    assert!(!m.csdb.is_overloaded(id, m.clock.wall()));
}

#[test]
fn self_reported_status_is_respected() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let b = connect_server(m, 0x0A000002, 9422, 1 << 40, 1 << 30);
    let _ = b;
    // 5-byte report carries an explicit heavy-load status
    let mut rep = load_report(10);
    rep.push(proto::HLSTATUS_OVERLOADED);
    matocs::handle_frame(m, a, proto::CSTOMA_CURRENT_LOAD, &rep);
    assert_eq!(m.cs.session(a).unwrap().hlstatus, proto::HLSTATUS_OVERLOADED);
    let a_csid = m.cs.session(a).unwrap().csid;
    let (csids, overloaded) = m.cs.getservers_wrandom(&m.csdb);
    assert!(!csids.contains(&a_csid));
    assert_eq!(overloaded, 1);

    // hlstatus_fix leaves self-reported states alone
    m.cs.hlstatus_fix(&m.csdb, m.clock.wall());
    assert_eq!(m.cs.session(a).unwrap().hlstatus, proto::HLSTATUS_OVERLOADED);
}

#[test]
fn six_byte_report_updates_transfer_state() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let mut rep = load_report(10);
    rep.push(proto::HLSTATUS_OK);
    rep.push(proto::TRANSFERRING_NEW_CHUNKS);
    matocs::handle_frame(m, a, proto::CSTOMA_CURRENT_LOAD, &rep);
    let s = m.cs.session(a).unwrap();
    assert_eq!(s.hlstatus, proto::HLSTATUS_OK);
    assert_eq!(s.receivingchunks, proto::TRANSFERRING_NEW_CHUNKS);
}
