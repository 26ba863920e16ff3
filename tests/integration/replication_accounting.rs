use chunkmaster::ledger::{OpReason, ReplReason, FULL_REPLICATION_WEIGHT};
use chunkmaster::matocs::{self};
use chunkmaster::proto;
use chunkmaster::testkit::{connect_server, master_for_tests, next_frame};

const W: u16 = FULL_REPLICATION_WEIGHT as u16;

#[test]
fn simple_replication_weights_and_ack() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30); // destination
    let b = connect_server(m, 0x0A000002, 9422, 1 << 40, 1 << 30); // source

    matocs::send_replicatechunk(m, a, 0xC, 0, 1, b, ReplReason::Undergoal).unwrap();
    assert_eq!(m.cs.session(a).unwrap().wrepcounter, W);
    assert_eq!(m.cs.session(b).unwrap().rrepcounter, W);

    // the REPLICATE command names the source endpoint
    let (ptype, body) = next_frame(m, a).unwrap();
    assert_eq!(ptype, proto::MATOCS_REPLICATE);
    assert_eq!(u64::from_be_bytes(body[0..8].try_into().unwrap()), 0xC);
    assert_eq!(u32::from_be_bytes(body[8..12].try_into().unwrap()), 1);
    assert_eq!(u32::from_be_bytes(body[12..16].try_into().unwrap()), 0x0A000002);
    assert_eq!(u16::from_be_bytes(body[16..18].try_into().unwrap()), 9422);

    // a second outstanding replication of the same chunk to A is refused
    assert!(matocs::send_replicatechunk(m, a, 0xC, 0, 1, b, ReplReason::Undergoal).is_err());

    // successful acknowledgement releases the exact recorded weights
    let mut ack = Vec::new();
    ack.extend_from_slice(&0xCu64.to_be_bytes());
    ack.extend_from_slice(&1u32.to_be_bytes());
    ack.push(proto::STATUS_OK);
    matocs::handle_frame(m, a, proto::CSTOMA_REPLICATE, &ack);
    assert_eq!(m.cs.session(a).unwrap().wrepcounter, 0);
    assert_eq!(m.cs.session(b).unwrap().rrepcounter, 0);
    let sa = m.cs.session(a).unwrap();
    assert_eq!(
        sa.counters.repl_write_ok[ReplReason::Undergoal as usize],
        FULL_REPLICATION_WEIGHT as u32
    );
    let sb = m.cs.session(b).unwrap();
    assert_eq!(
        sb.counters.repl_read_ok[ReplReason::Undergoal as usize],
        FULL_REPLICATION_WEIGHT as u32
    );
    // and the ledger record is gone: a fresh replication is accepted again
    assert!(matocs::send_replicatechunk(m, a, 0xC, 0, 1, b, ReplReason::Undergoal).is_ok());
}

#[test]
fn destination_death_restores_counters_with_disconnect_reason() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let b = connect_server(m, 0x0A000002, 9422, 1 << 40, 1 << 30);

    matocs::send_replicatechunk(m, a, 0xC, 0, 1, b, ReplReason::Undergoal).unwrap();
    matocs::session_closed(m, a);

    assert!(m.cs.session(a).is_none());
    let sb = m.cs.session(b).unwrap();
    assert_eq!(sb.rrepcounter, 0);
    assert_eq!(
        sb.counters.repl_read_err[ReplReason::Disconnect as usize],
        FULL_REPLICATION_WEIGHT as u32
    );
}

#[test]
fn source_death_restores_its_own_counter() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let b = connect_server(m, 0x0A000002, 9422, 1 << 40, 1 << 30);

    matocs::send_replicatechunk(m, a, 0xC, 0, 1, b, ReplReason::Undergoal).unwrap();
    matocs::session_closed(m, b);

    // the replication record survives without its source; the destination
    // keeps its weight until the (now doomed) transfer is acknowledged
    let sa = m.cs.session(a).unwrap();
    assert_eq!(sa.wrepcounter, W);
    assert!(m.cs.reps.contains(0xC, 1, a));
}

#[test]
fn ec_weights_are_half() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let b = connect_server(m, 0x0A000002, 9422, 1 << 40, 1 << 30);
    let ecid = 0x20; // a data part, not a full copy
    matocs::send_replicatechunk(m, a, 0xC, ecid, 1, b, ReplReason::Recover).unwrap();
    assert_eq!(m.cs.session(a).unwrap().wrepcounter, W / 2);
    assert_eq!(m.cs.session(b).unwrap().rrepcounter, W / 2);
}

#[test]
fn recover_fans_in_from_all_survivors() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let dst = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let s1 = connect_server(m, 0x0A000002, 9422, 1 << 40, 1 << 30);
    let s2 = connect_server(m, 0x0A000003, 9422, 1 << 40, 1 << 30);
    let s3 = connect_server(m, 0x0A000004, 9422, 1 << 40, 1 << 30);
    let s4 = connect_server(m, 0x0A000005, 9422, 1 << 40, 1 << 30);

    matocs::send_replicatechunk_recover(
        m,
        dst,
        0xD,
        0x10,
        7,
        &[s1, s2, s3, s4],
        &[0x11, 0x12, 0x13, 0x14],
        ReplReason::Recover,
    )
    .unwrap();
    let (ptype, body) = next_frame(m, dst).unwrap();
    assert_eq!(ptype, proto::MATOCS_REPLICATE_RECOVER);
    // parts == 4 selects the 16-bit recovery masks
    assert_eq!(u32::from_be_bytes(body[12..16].try_into().unwrap()), 0x8888);
    assert_eq!(body[28], 4);
    for sid in [s1, s2, s3, s4] {
        assert_eq!(m.cs.session(sid).unwrap().rrepcounter, W / 2);
    }
    assert_eq!(m.cs.session(dst).unwrap().wrepcounter, W / 2);
}

#[test]
fn localsplit_weights_scale_with_missing_parts() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    // three parts missing
    matocs::send_localsplitchunk(m, a, 0xE, 3, 0b0000_0111, 8, ReplReason::Split).unwrap();
    let s = m.cs.session(a).unwrap();
    assert_eq!(s.rrepcounter, W); // reads as a full copy
    assert_eq!(s.wrepcounter, 3); // one write unit per missing part

    let mut ack = Vec::new();
    ack.extend_from_slice(&0xEu64.to_be_bytes());
    ack.extend_from_slice(&3u32.to_be_bytes());
    ack.push(proto::STATUS_OK);
    matocs::handle_frame(m, a, proto::CSTOMA_LOCALSPLIT, &ack);
    let s = m.cs.session(a).unwrap();
    assert_eq!(s.rrepcounter, 0);
    assert_eq!(s.wrepcounter, 0);
}

#[test]
fn delete_ledger_allows_one_outstanding_per_pair() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let a = connect_server(m, 0x0A000001, 9422, 1 << 40, 1 << 30);
    let b = connect_server(m, 0x0A000002, 9422, 1 << 40, 1 << 30);

    matocs::send_deletechunk(m, a, 0xF, 0, 2, OpReason::Overgoal).unwrap();
    assert!(matocs::send_deletechunk(m, a, 0xF, 0, 2, OpReason::Overgoal).is_err());
    // same chunk on another server is independent
    matocs::send_deletechunk(m, b, 0xF, 0, 2, OpReason::Overgoal).unwrap();
    assert_eq!(m.cs.session(a).unwrap().delcounter, 1);

    let mut ack = Vec::new();
    ack.extend_from_slice(&0xFu64.to_be_bytes());
    ack.push(proto::STATUS_OK);
    matocs::handle_frame(m, a, proto::CSTOMA_DELETE, &ack);
    let sa = m.cs.session(a).unwrap();
    assert_eq!(sa.delcounter, 0);
    assert_eq!(sa.counters.del_ok[OpReason::Overgoal as usize], 1);
    assert!(matocs::send_deletechunk(m, a, 0xF, 0, 2, OpReason::Overgoal).is_ok());
}
