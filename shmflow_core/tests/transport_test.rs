// End-to-end writer/reader transport behavior over a real segment file.
use crossbeam::channel::{unbounded, Sender};
use shmflow_core::{
    BackpressurePolicy, Frame, ReaderConfig, ReaderState, ShmError, ShmReader, ShmWriter,
    WriterConfig,
};
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn segment_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

/// Reader whose callback forwards every frame into a channel.
fn channel_reader(path: &str) -> (ShmReader, crossbeam::channel::Receiver<Frame>) {
    let (tx, rx) = unbounded::<Frame>();
    let reader = ShmReader::attach(
        ReaderConfig::new(path),
        tx,
        |tx: &mut Sender<Frame>, frame: &Frame| {
            let _ = tx.send(frame.clone());
        },
    )
    .expect("reader attach");
    (reader, rx)
}

#[test]
fn in_order_gap_free_delivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "ordered");

    // blocking policy: the writer waits for the reader, so no frame can drop
    let mut writer = ShmWriter::create(
        WriterConfig::new(&path, "application/x-raw")
            .slot_count(8)
            .policy(BackpressurePolicy::Block {
                timeout: Duration::from_secs(5),
            }),
    )
    .expect("writer create");

    let (mut reader, rx) = channel_reader(&path);
    assert_eq!(reader.state(), ReaderState::Attached);

    for i in 0..50u32 {
        let payload = format!("frame-{i}");
        writer.push(payload.as_bytes()).expect("push");
    }

    for i in 0..50u64 {
        let frame = rx.recv_timeout(RECV_TIMEOUT).expect("frame");
        assert_eq!(frame.seq, i + 1);
        assert_eq!(frame.data, format!("frame-{i}").into_bytes());
    }

    reader.detach();
    assert_eq!(reader.state(), ReaderState::Detached);
}

#[test]
fn concrete_scenario_all_your_base() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "base");

    let mut writer =
        ShmWriter::with_defaults(&path, "application/x-raw,fun=yes").expect("writer create");
    let (_reader, rx) = channel_reader(&path);

    writer.push(b"are belong to us").expect("push");

    let frame = rx.recv_timeout(RECV_TIMEOUT).expect("frame");
    assert_eq!(frame.data, b"are belong to us");
    assert_eq!(frame.datatype, "application/x-raw,fun=yes");
    assert_eq!(frame.parsed.media_type(), "application");
    assert_eq!(frame.parsed.subtype(), "x-raw");
    assert_eq!(frame.parsed.param("fun"), Some("yes"));
}

#[test]
fn late_attach_sees_only_frames_past_its_baseline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "baseline");

    let mut writer = ShmWriter::with_defaults(&path, "application/x-raw").expect("writer create");
    for _ in 0..5 {
        writer.push(b"early").expect("push");
    }

    let (_reader, rx) = channel_reader(&path);
    for _ in 0..5 {
        writer.push(b"late").expect("push");
    }

    let mut seqs = Vec::new();
    for _ in 0..5 {
        let frame = rx.recv_timeout(RECV_TIMEOUT).expect("frame");
        assert_eq!(frame.data, b"late");
        seqs.push(frame.seq);
    }
    assert_eq!(seqs, vec![6, 7, 8, 9, 10]);
}

#[test]
fn second_writer_on_live_path_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "exclusive");

    let _writer = ShmWriter::with_defaults(&path, "application/x-raw").expect("writer create");
    let second = ShmWriter::with_defaults(&path, "application/x-raw");
    assert!(matches!(second, Err(ShmError::AlreadyExists { .. })));
}

#[test]
fn concurrent_creates_admit_exactly_one_writer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "race");

    let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                ShmWriter::with_defaults(&path, "application/x-raw")
            })
        })
        .collect();

    // hold every winner alive until all creates have resolved
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("create thread"))
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one create may own the path");
    assert!(results
        .iter()
        .filter(|r| r.is_err())
        .all(|r| matches!(r, Err(ShmError::AlreadyExists { .. }))));
}

#[test]
fn create_after_release_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "released");

    let writer = ShmWriter::with_defaults(&path, "application/x-raw").expect("writer create");
    drop(writer);
    let _again = ShmWriter::with_defaults(&path, "application/x-raw").expect("recreate");
}

#[test]
fn nonblocking_attach_without_writer_fails_immediately() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "nowriter");

    let started = std::time::Instant::now();
    let result = ShmReader::attach(ReaderConfig::new(&path), (), |_, _: &Frame| {});
    assert!(matches!(result, Err(ShmError::NotFound { .. })));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn blocking_attach_waits_for_writer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "latewriter");

    let (hold_tx, hold_rx) = unbounded::<()>();
    let writer_path = path.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        let writer =
            ShmWriter::with_defaults(&writer_path, "application/x-raw").expect("writer create");
        // keep the segment alive until the main thread is done attaching
        let _ = hold_rx.recv_timeout(Duration::from_secs(10));
        drop(writer);
    });

    let reader = ShmReader::attach(
        ReaderConfig::new(&path).attach_timeout(Duration::from_secs(5)),
        (),
        |_, _: &Frame| {},
    )
    .expect("blocking attach");
    assert_eq!(reader.state(), ReaderState::Attached);

    hold_tx.send(()).expect("release writer");
    handle.join().expect("writer thread");
}

#[test]
fn blocking_attach_times_out_without_writer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "never");

    let result = ShmReader::attach(
        ReaderConfig::new(&path).attach_timeout(Duration::from_millis(100)),
        (),
        |_, _: &Frame| {},
    );
    assert!(matches!(result, Err(ShmError::AttachFailed { .. })));
}

#[test]
fn oversized_push_resizes_and_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "resize");

    let mut writer = ShmWriter::create(
        WriterConfig::new(&path, "application/x-raw").slot_capacity(64),
    )
    .expect("writer create");
    let (_reader, rx) = channel_reader(&path);

    let big: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    writer.push(&big).expect("oversized push");
    assert_eq!(writer.stats().resizes, 1);

    let frame = rx.recv_timeout(RECV_TIMEOUT).expect("big frame");
    assert_eq!(frame.data, big);

    // the ring keeps working at the new geometry
    writer.push(b"small again").expect("push after resize");
    let frame = rx.recv_timeout(RECV_TIMEOUT).expect("small frame");
    assert_eq!(frame.data, b"small again");
}

#[test]
fn per_frame_datatype_override() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "override");

    let mut writer =
        ShmWriter::with_defaults(&path, "application/x-raw,fun=yes").expect("writer create");
    let (_reader, rx) = channel_reader(&path);

    writer
        .push_with_datatype(b"pcm bytes", "audio/x-wav,rate=8000")
        .expect("push with override");
    writer.push(b"raw bytes").expect("push default");

    let first = rx.recv_timeout(RECV_TIMEOUT).expect("override frame");
    assert_eq!(first.datatype, "audio/x-wav,rate=8000");
    assert_eq!(first.parsed.subtype(), "x-wav");
    assert_eq!(first.parsed.param("rate"), Some("8000"));

    let second = rx.recv_timeout(RECV_TIMEOUT).expect("default frame");
    assert_eq!(second.datatype, "application/x-raw,fun=yes");
    assert_eq!(second.parsed.param("fun"), Some("yes"));
}

#[test]
fn writer_reports_attached_readers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = segment_path(&dir, "census");

    let writer = ShmWriter::with_defaults(&path, "application/x-raw").expect("writer create");
    assert_eq!(writer.reader_count(), 0);

    let (mut r1, _rx1) = channel_reader(&path);
    let (r2, _rx2) = channel_reader(&path);
    assert_eq!(writer.reader_count(), 2);

    r1.detach();
    assert_eq!(writer.reader_count(), 1);
    drop(r2);
    assert_eq!(writer.reader_count(), 0);
}
