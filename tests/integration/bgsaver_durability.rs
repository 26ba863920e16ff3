use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chunkmaster::bgsaver::{SaverEvent, SaverMonitor, CHANGELOG_FILE, DOWNLOAD_TMP_FILE};

fn wait_done(mon: &mut SaverMonitor) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "saver did not answer in time");
        if let Some(SaverEvent::Done(st)) = mon.next_event(Duration::from_millis(50)) {
            return st as i32;
        }
    }
}

#[test]
fn streamed_image_matches_write_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = SaverMonitor::spawn(dir.path(), 2).unwrap();

    mon.open(0, Box::new(|_| {}));
    assert_eq!(wait_done(&mut mon), 1);

    // out-of-order positional writes, as the image streamer produces them
    let mut expected = vec![0u8; 3 * 8192];
    let chunks: Vec<(u64, Vec<u8>)> = vec![
        (8192, vec![0xBB; 8192]),
        (0, vec![0xAA; 8192]),
        (16384, vec![0xCC; 8192]),
    ];
    for (offset, data) in &chunks {
        expected[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
        mon.store(*offset, data.clone(), crc32fast::hash(data), Box::new(|_| {}));
        assert_eq!(wait_done(&mut mon), 1);
    }
    let finished = Arc::new(AtomicI32::new(-2));
    let f2 = finished.clone();
    mon.close_file(Box::new(move |st| f2.store(st, Ordering::SeqCst)));
    assert_eq!(wait_done(&mut mon), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    let content = std::fs::read(dir.path().join(DOWNLOAD_TMP_FILE)).unwrap();
    assert_eq!(content, expected);
}

#[test]
fn corrupted_write_reports_failure_and_removes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = SaverMonitor::spawn(dir.path(), 2).unwrap();
    mon.open(0, Box::new(|_| {}));
    assert_eq!(wait_done(&mut mon), 1);
    mon.store(0, vec![1, 2, 3, 4], 0xDEAD_BEEF, Box::new(|_| {}));
    assert_eq!(wait_done(&mut mon), 0);
    assert!(!dir.path().join(DOWNLOAD_TMP_FILE).exists());
    // a follow-up write has no open file and fails too
    mon.store(4, vec![5, 6], crc32fast::hash(&[5, 6]), Box::new(|_| {}));
    assert_eq!(wait_done(&mut mon), 0);
}

#[test]
fn requests_without_a_worker_fail_immediately() {
    let mut mon = SaverMonitor::disabled();
    let status = Arc::new(AtomicI32::new(0));
    let s2 = status.clone();
    mon.open(0, Box::new(move |st| s2.store(st, Ordering::SeqCst)));
    assert_eq!(status.load(Ordering::SeqCst), -1);
    assert!(mon.handle().is_none());
    assert!(mon.can_exit());
}

#[test]
fn master_changelog_goes_through_the_saver() {
    let mut tm = chunkmaster::testkit::master_for_tests();
    let m = &mut tm.master;
    let dir = m.cfg.data_path.clone();
    m.changelog.save_mode = chunkmaster::changelog::SaveMode::Background;
    let saver = SaverMonitor::spawn(&dir, 2).unwrap();
    m.attach_saver(saver);

    m.changelog_line("100000|CREATE(7,1)".to_string());
    assert!(!m.exit_requested);

    // the worker appends asynchronously; poll for the line
    let path = dir.join(CHANGELOG_FILE);
    let deadline = Instant::now() + Duration::from_secs(10);
    let line = loop {
        if let Ok(text) = std::fs::read_to_string(&path) {
            if !text.is_empty() {
                break text;
            }
        }
        assert!(Instant::now() < deadline, "changelog line never reached disk");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(line, "1: 100000|CREATE(7,1)\n");

    // rotation through the saver renames the chain
    m.changelog.rotate(false, false, &mut chunkmaster::changelog::NoBroadcast);
    let rotated = dir.join("changelog.1.mfs");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !rotated.exists() {
        assert!(Instant::now() < deadline, "rotation never happened");
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(std::fs::read_to_string(rotated).unwrap(), "1: 100000|CREATE(7,1)\n");
}

#[test]
fn saver_loss_forces_master_termination() {
    let mut tm = chunkmaster::testkit::master_for_tests();
    let m = &mut tm.master;
    m.changelog.save_mode = chunkmaster::changelog::SaveMode::Background;
    // background mode with no saver attached: the line cannot be persisted
    m.changelog_line("100000|CREATE(8,1)".to_string());
    assert!(m.exit_requested);
}
