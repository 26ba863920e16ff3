use chunkmaster::changelog::{LogBroadcast, OLD_CHANGES_BLOCK_SIZE};
use chunkmaster::matocs::Outbox;
use chunkmaster::matoml::{self, LogState, MlClientType};
use chunkmaster::proto;
use chunkmaster::testkit::{master_for_tests, next_ml_frame};

fn register_simple(version: u32, timeout: u16) -> Vec<u8> {
    let mut p = vec![1u8];
    p.extend_from_slice(&version.to_be_bytes());
    p.extend_from_slice(&timeout.to_be_bytes());
    p
}

fn register_advanced(version: u32, timeout: u16, minversion: u64) -> Vec<u8> {
    let mut p = vec![2u8];
    p.extend_from_slice(&version.to_be_bytes());
    p.extend_from_slice(&timeout.to_be_bytes());
    p.extend_from_slice(&minversion.to_be_bytes());
    p
}

#[test]
fn sync_metalogger_sees_strictly_increasing_versions() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000050, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_simple(proto::version2int(4, 40, 0), 10),
    );
    assert_eq!(m.ml.session(sid).unwrap().logstate, LogState::Sync);
    // MASTER_ACK(1, VERSHEX)
    let (ptype, ack) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ptype, proto::MATOAN_MASTER_ACK);
    assert_eq!(ack[0], 1);

    for i in 0..50 {
        m.changelog_line(format!("{}|SETPATH({})", 100_000 + i, i));
    }
    let mut last = 0u64;
    let mut seen = 0;
    while let Some((ptype, body)) = next_ml_frame(m, sid) {
        assert_eq!(ptype, proto::MATOAN_METACHANGES_LOG);
        assert_eq!(body[0], 0xFF);
        let version = u64::from_be_bytes(body[1..9].try_into().unwrap());
        assert!(version > last, "versions must be strictly increasing");
        last = version;
        // the record text arrives NUL-terminated
        assert_eq!(body.last(), Some(&0u8));
        seen += 1;
    }
    assert_eq!(seen, 50);
}

#[test]
fn advanced_register_replays_backlog() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    for i in 0..20 {
        m.changelog_line(format!("{}|MKDIR({})", 100_000, i));
    }
    let sid = matoml::accept(m, 0x0A000051, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_advanced(proto::version2int(4, 40, 0), 10, 5),
    );
    // MASTER_ACK(0): the ring covers the requested version
    let (_, ack) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ack[0], 0);
    let mut versions = Vec::new();
    while let Some((_, body)) = next_ml_frame(m, sid) {
        versions.push(u64::from_be_bytes(body[1..9].try_into().unwrap()));
    }
    assert_eq!(versions.first(), Some(&5));
    assert_eq!(versions.last(), Some(&20));
    assert_eq!(m.ml.session(sid).unwrap().logstate, LogState::Sync);
}

#[test]
fn advanced_register_below_ring_desyncs() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    // push enough entries to roll the first block out of the ring
    m.changelog.preserve_seconds = 1;
    m.changelog.max_size = 1;
    for i in 0..(OLD_CHANGES_BLOCK_SIZE as u32 * 2 + 10) {
        m.clock.advance(1);
        m.changelog_line(format!("{}|WRITE({})", m.clock.wall(), i));
    }
    let ring_min = m.changelog.min_version(&m.meta);
    assert!(ring_min > 1);

    let sid = matoml::accept(m, 0x0A000052, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_advanced(proto::version2int(4, 40, 0), 10, 1),
    );
    // MASTER_ACK(1): desync, the receiver must download a fresh image
    let (_, ack) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ack[0], 1);
    assert_eq!(m.ml.session(sid).unwrap().logstate, LogState::Sync);
    assert!(next_ml_frame(m, sid).is_none());
}

#[test]
fn delayed_metalogger_is_pumped_until_sync() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let total = OLD_CHANGES_BLOCK_SIZE as u32 * 3;
    for i in 0..total {
        m.changelog_line(format!("{}|APPEND({})", 100_000, i));
    }
    let sid = matoml::accept(m, 0x0A000053, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_advanced(proto::version2int(4, 40, 0), 10, 1),
    );
    // exactly one catch-up group was delivered so far
    assert_eq!(m.ml.session(sid).unwrap().logstate, LogState::Delayed);
    let mut received = 0u32;
    while next_ml_frame(m, sid).is_some() {
        received += 1;
    }
    assert_eq!(received, 10_000 + 1); // ack + first group

    // a delayed receiver pins the ring against trimming
    assert_eq!(m.ml.min_version(m.meta.version()), 1 + 10_000);

    matoml::pump_delayed(m);
    while next_ml_frame(m, sid).is_some() {
        received += 1;
    }
    matoml::pump_delayed(m);
    while next_ml_frame(m, sid).is_some() {
        received += 1;
    }
    assert_eq!(m.ml.session(sid).unwrap().logstate, LogState::Sync);
    assert_eq!(received, total + 1);
}

#[test]
fn rotate_broadcasts_the_marker() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000054, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_simple(proto::version2int(4, 40, 0), 10),
    );
    let _ = next_ml_frame(m, sid); // ack
    let chunkmaster::Master {
        ref mut changelog,
        ref mut ml,
        ..
    } = *m;
    changelog.rotate(true, true, ml);
    let (ptype, body) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ptype, proto::MATOAN_METACHANGES_LOG);
    assert_eq!(body, vec![0x55]);
}

#[test]
fn supervisor_never_receives_changelogs() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000055, Outbox::queue());
    let mut p = vec![4u8];
    p.extend_from_slice(&proto::version2int(4, 20, 0).to_be_bytes());
    p.extend_from_slice(&10u16.to_be_bytes());
    matoml::handle_frame(m, sid, proto::ANTOMA_REGISTER, &p);
    assert_eq!(m.ml.session(sid).unwrap().clienttype, MlClientType::Supervisor);

    // STATE snapshot: mode 2 for a 4.17+ supervisor, 40 bytes
    let (ptype, body) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ptype, proto::MATOAN_STATE);
    assert_eq!(body.len(), 40);
    assert_eq!(&body[0..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
    let meta_version = u64::from_be_bytes(body[12..20].try_into().unwrap());
    assert_eq!(meta_version, m.meta.version());
    let meta_id = u64::from_be_bytes(body[20..28].try_into().unwrap());
    assert_eq!(meta_id, m.meta.id());

    m.changelog_line("100000|CREATE(1)".to_string());
    assert!(next_ml_frame(m, sid).is_none());
}

#[test]
fn ring_trims_under_size_pressure_but_keeps_recent_entries() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    m.changelog.preserve_seconds = 60;
    m.changelog.max_size = 1024 * 1024;
    let payload = "p".repeat(180);
    // entries arrive at 1 kHz for several block lengths
    for i in 0..(4 * OLD_CHANGES_BLOCK_SIZE as u32) {
        if i % 1000 == 0 {
            m.clock.advance(1);
        }
        m.changelog_line(format!("{}|{}", m.clock.wall(), payload));
    }
    // bounded by the byte budget plus at most one block of slack
    assert!(m.changelog.total_size() <= 1024 * 1024 + OLD_CHANGES_BLOCK_SIZE as u64 * 256);
    // whatever is kept is younger than the retention window
    let oldest = m.changelog.oldest_timestamp().unwrap();
    assert!(oldest + 60 >= m.clock.wall());
}
