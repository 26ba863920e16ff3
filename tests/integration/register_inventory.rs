use chunkmaster::matocs::{self, Outbox, RegPhase};
use chunkmaster::proto;
use chunkmaster::testkit::{master_for_tests, next_frame, register_begin_payload, register_chunks_payload};

#[test]
fn full_registration_handshake() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let ip = 0x0A000001; // 10.0.0.1
    let sid = matocs::accept(m, ip, Outbox::queue());

    let begin = register_begin_payload(
        proto::version2int(4, 50, 0),
        ip,
        9422,
        0,
        0,
        0,
        1 << 40, // 1 TiB
    );
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &begin);

    // MASTER_ACK: mode 0, master version, negotiated timeout, csid, meta id
    let (ptype, ack) = next_frame(m, sid).expect("ack after register begin");
    assert_eq!(ptype, proto::MATOCS_MASTER_ACK);
    assert_eq!(ack.len(), 17);
    assert_eq!(ack[0], 0);
    assert_eq!(u32::from_be_bytes([ack[1], ack[2], ack[3], ack[4]]), proto::VERSHEX);
    assert_eq!(u16::from_be_bytes([ack[5], ack[6]]), 10); // default timeout
    let db_csid = u16::from_be_bytes([ack[7], ack[8]]);
    assert_eq!(db_csid, 1); // first server gets the lowest free id
    let meta_id = u64::from_be_bytes(ack[9..17].try_into().unwrap());
    assert_eq!(meta_id, m.meta.id());

    {
        let s = m.cs.session(sid).unwrap();
        assert_eq!(s.reg, RegPhase::Waiting);
        assert_eq!(s.totalspace, 1 << 40);
        assert_ne!(s.csid, proto::MAX_CS_COUNT);
    }
    let csdb_id = m.csdb.find(ip, 9422).expect("csdb entry");
    assert_eq!(m.csdb.get(csdb_id).unwrap().csid, db_csid);
    assert_eq!(m.csdb.get(csdb_id).unwrap().session, Some(sid));

    // inventory packet: one chunk, acked with a single zero byte
    let inv = register_chunks_payload(&[(0x1, 0, 1)]);
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &inv);
    let (ptype, ack) = next_frame(m, sid).expect("ack after inventory");
    assert_eq!(ptype, proto::MATOCS_MASTER_ACK);
    assert_eq!(ack, vec![0u8]);
    assert_ne!(
        m.cs.session(sid).unwrap().receivingchunks & proto::TRANSFERRING_NEW_CHUNKS,
        0
    );

    // registration end
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &[62u8]);
    assert_eq!(m.cs.session(sid).unwrap().reg, RegPhase::Registered);
}

#[test]
fn second_connection_for_same_identity_is_refused() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let ip = 0x0A000001;
    let sid1 = matocs::accept(m, ip, Outbox::queue());
    let begin = register_begin_payload(proto::version2int(4, 50, 0), ip, 9422, 0, 0, 0, 1 << 40);
    matocs::handle_frame(m, sid1, proto::CSTOMA_REGISTER, &begin);
    assert!(!m.cs.session(sid1).unwrap().kill);

    let sid2 = matocs::accept(m, ip, Outbox::queue());
    let begin2 = register_begin_payload(proto::version2int(4, 50, 0), ip, 9422, 0, 0, 0, 1 << 40);
    matocs::handle_frame(m, sid2, proto::CSTOMA_REGISTER, &begin2);
    assert!(m.cs.session(sid2).unwrap().kill);
}

#[test]
fn csid_survives_reconnect_on_new_address() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid1 = matocs::accept(m, 0x0A000001, Outbox::queue());
    let begin = register_begin_payload(
        proto::version2int(4, 50, 0),
        0x0A000001,
        9422,
        0,
        0,
        0,
        1 << 40,
    );
    matocs::handle_frame(m, sid1, proto::CSTOMA_REGISTER, &begin);
    let (_, ack) = next_frame(m, sid1).unwrap();
    let db_csid = u16::from_be_bytes([ack[5 + 2], ack[6 + 2]]);
    matocs::session_closed(m, sid1);

    // same csid, different ip:port
    let sid2 = matocs::accept(m, 0x0A000009, Outbox::queue());
    let begin = register_begin_payload(
        proto::version2int(4, 50, 0),
        0x0A000009,
        9400,
        0,
        db_csid,
        0,
        1 << 40,
    );
    matocs::handle_frame(m, sid2, proto::CSTOMA_REGISTER, &begin);
    let (_, ack) = next_frame(m, sid2).unwrap();
    assert_eq!(u16::from_be_bytes([ack[7], ack[8]]), db_csid);
    assert!(m.csdb.find(0x0A000009, 9400).is_some());
    assert!(m.csdb.find(0x0A000001, 9422).is_none());
}

#[test]
fn graceful_disconnect_enters_temporary_maintenance() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matocs::accept(m, 0x0A000001, Outbox::queue());
    let begin = register_begin_payload(
        proto::version2int(4, 50, 0),
        0x0A000001,
        9422,
        0,
        0,
        0,
        1 << 40,
    );
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &begin);
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &[63u8]);
    assert!(m.cs.session(sid).unwrap().kill);
    let id = m.csdb.find(0x0A000001, 9422).unwrap();
    assert!(m.csdb.is_maintained(id));
}

#[test]
fn localhost_registration_is_rejected() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matocs::accept(m, 0x7F000001, Outbox::queue());
    let begin = register_begin_payload(
        proto::version2int(4, 50, 0),
        0, // let the master take the peer address
        9422,
        0,
        0,
        0,
        1 << 40,
    );
    matocs::handle_frame(m, sid, proto::CSTOMA_REGISTER, &begin);
    assert!(m.cs.session(sid).unwrap().kill);
}

#[test]
fn commands_from_unregistered_server_kill_the_session() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matocs::accept(m, 0x0A000001, Outbox::queue());
    matocs::handle_frame(m, sid, proto::CSTOMA_SPACE, &[0u8; 16]);
    assert!(m.cs.session(sid).unwrap().kill);
}
