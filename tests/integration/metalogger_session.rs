use chunkmaster::matocs::Outbox;
use chunkmaster::matoml::{self, LogState};
use chunkmaster::proto;
use chunkmaster::testkit::{master_for_tests, next_ml_frame};

fn register_simple(version: u32, timeout: u16) -> Vec<u8> {
    let mut p = vec![1u8];
    p.extend_from_slice(&version.to_be_bytes());
    p.extend_from_slice(&timeout.to_be_bytes());
    p
}

#[test]
fn simple_register_acks_and_syncs() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000060, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_simple(proto::version2int(4, 44, 0), 30),
    );
    let s = m.ml.session(sid).unwrap();
    assert_eq!(s.logstate, LogState::Sync);
    assert_eq!(s.timeout, 30);
    let (ptype, ack) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ptype, proto::MATOAN_MASTER_ACK);
    assert_eq!(ack.len(), 5);
    assert_eq!(ack[0], 1);
    assert_eq!(u32::from_be_bytes(ack[1..5].try_into().unwrap()), proto::VERSHEX);
}

#[test]
fn double_register_is_fatal() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000060, Outbox::queue());
    let reg = register_simple(proto::version2int(4, 44, 0), 10);
    matoml::handle_frame(m, sid, proto::ANTOMA_REGISTER, &reg);
    matoml::handle_frame(m, sid, proto::ANTOMA_REGISTER, &reg);
    assert!(m.ml.session(sid).unwrap().kill);
}

#[test]
fn tiny_timeout_is_floored() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000060, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_simple(proto::version2int(4, 44, 0), 1),
    );
    assert_eq!(m.ml.session(sid).unwrap().timeout, 3);
}

#[test]
fn download_serves_ranged_reads_with_crc() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let dir = m.cfg.data_path.clone();
    let image: Vec<u8> = (0..100_000u32).flat_map(|v| v.to_be_bytes()).collect();
    std::fs::write(dir.join("metadata.mfs.back"), &image).unwrap();
    std::fs::write(dir.join("changelog.0.mfs"), b"1: x\n").unwrap();

    let sid = matoml::accept(m, 0x0A000061, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_simple(proto::version2int(4, 44, 0), 10),
    );
    let _ = next_ml_frame(m, sid);

    // DOWNLOAD_START(1): metadata image plus the changelog chains
    matoml::handle_frame(m, sid, proto::ANTOMA_DOWNLOAD_START, &[1u8]);
    let (ptype, info) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ptype, proto::MATOAN_DOWNLOAD_INFO);
    assert_eq!(u64::from_be_bytes(info.try_into().unwrap()), image.len() as u64);

    // ranged request in the middle of the file
    let mut req = Vec::new();
    req.extend_from_slice(&1000u64.to_be_bytes());
    req.extend_from_slice(&512u32.to_be_bytes());
    matoml::handle_frame(m, sid, proto::ANTOMA_DOWNLOAD_REQUEST, &req);
    let (ptype, data) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ptype, proto::MATOAN_DOWNLOAD_DATA);
    assert_eq!(u64::from_be_bytes(data[0..8].try_into().unwrap()), 1000);
    assert_eq!(u32::from_be_bytes(data[8..12].try_into().unwrap()), 512);
    let crc = u32::from_be_bytes(data[12..16].try_into().unwrap());
    assert_eq!(&data[16..], &image[1000..1512]);
    assert_eq!(crc, crc32fast::hash(&image[1000..1512]));

    // switch to the first changelog chain
    matoml::handle_frame(m, sid, proto::ANTOMA_DOWNLOAD_START, &[11u8]);
    let (_, info) = next_ml_frame(m, sid).unwrap();
    assert_eq!(u64::from_be_bytes(info.try_into().unwrap()), 5);

    // the second chain is missing: reported as empty, not as an error
    matoml::handle_frame(m, sid, proto::ANTOMA_DOWNLOAD_START, &[12u8]);
    let (_, info) = next_ml_frame(m, sid).unwrap();
    assert_eq!(u64::from_be_bytes(info.try_into().unwrap()), 0);

    matoml::handle_frame(m, sid, proto::ANTOMA_DOWNLOAD_END, &[]);
    assert!(!m.ml.session(sid).unwrap().kill);
}

#[test]
fn download_of_missing_image_is_an_error() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000062, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_simple(proto::version2int(4, 44, 0), 10),
    );
    let _ = next_ml_frame(m, sid);
    matoml::handle_frame(m, sid, proto::ANTOMA_DOWNLOAD_START, &[2u8]);
    let (ptype, info) = next_ml_frame(m, sid).unwrap();
    assert_eq!(ptype, proto::MATOAN_DOWNLOAD_INFO);
    assert_eq!(info, vec![0xFF]);
}

#[test]
fn request_without_open_file_kills_session() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000063, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_simple(proto::version2int(4, 44, 0), 10),
    );
    let _ = next_ml_frame(m, sid);
    let mut req = Vec::new();
    req.extend_from_slice(&0u64.to_be_bytes());
    req.extend_from_slice(&16u32.to_be_bytes());
    matoml::handle_frame(m, sid, proto::ANTOMA_DOWNLOAD_REQUEST, &req);
    assert!(m.ml.session(sid).unwrap().kill);
}

#[test]
fn store_metadata_requires_a_supervisor() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000064, Outbox::queue());
    matoml::handle_frame(
        m,
        sid,
        proto::ANTOMA_REGISTER,
        &register_simple(proto::version2int(4, 44, 0), 10),
    );
    let _ = next_ml_frame(m, sid);
    matoml::handle_frame(m, sid, proto::ANTOMA_STORE_METADATA, &[]);
    assert!(m.ml.session(sid).unwrap().kill);
}

#[test]
fn unknown_command_kills_session() {
    let mut tm = master_for_tests();
    let m = &mut tm.master;
    let sid = matoml::accept(m, 0x0A000065, Outbox::queue());
    matoml::handle_frame(m, sid, 0xDEAD, &[]);
    assert!(m.ml.session(sid).unwrap().kill);
}
