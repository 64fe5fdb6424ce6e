//! Startup recovery behavior of the overflow engine: clean restarts,
//! corrupted headers, and malformed or stale index files.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use qmq_error::QmqError;
use qmq_overflow::OverflowEngine;
use qmq_types::{RecordHeader, DATA_FILE_NAME, INDEX_FILE_NAME};
use tempfile::tempdir;

fn open(dir: &Path) -> OverflowEngine {
    OverflowEngine::open(dir).expect("open engine")
}

fn push(engine: &mut OverflowEngine, name: &str, payload: &[u8]) {
    engine.get_or_create(name).expect("create");
    engine.push(name, payload).expect("push");
}

fn pop(engine: &mut OverflowEngine, name: &str) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    engine.pop(name, &mut buf).expect("pop").then_some(buf)
}

#[test]
fn basic_recovery() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"hello");
        push(&mut engine, "ch", b"world");
        engine.flush().expect("flush");
        engine.close();
    }
    let mut engine = open(dir.path());
    assert_eq!(pop(&mut engine, "ch").as_deref(), Some(b"hello".as_slice()));
    assert_eq!(pop(&mut engine, "ch").as_deref(), Some(b"world".as_slice()));
    assert_eq!(pop(&mut engine, "ch"), None);
}

#[test]
fn recovery_restores_counts_offsets_and_order() {
    let dir = tempdir().expect("tempdir");
    let stats_before;
    {
        let mut engine = open(dir.path());
        for i in 0..20u8 {
            push(&mut engine, "a", &[b'a', i]);
            push(&mut engine, "b", &[b'b', i, i]);
        }
        for _ in 0..5 {
            pop(&mut engine, "a");
        }
        engine.flush().expect("flush");
        stats_before = (
            engine.channel_stats("a").expect("a"),
            engine.channel_stats("b").expect("b"),
            engine.total_records(),
            engine.total_bytes(),
        );
        engine.close();
    }

    let mut engine = open(dir.path());
    assert_eq!(engine.channel_stats("a").expect("a"), stats_before.0);
    assert_eq!(engine.channel_stats("b").expect("b"), stats_before.1);
    assert_eq!(engine.total_records(), stats_before.2);
    assert_eq!(engine.total_bytes(), stats_before.3);
    for i in 5..20u8 {
        assert_eq!(pop(&mut engine, "a").as_deref(), Some([b'a', i].as_slice()));
    }
    for i in 0..20u8 {
        assert_eq!(
            pop(&mut engine, "b").as_deref(),
            Some([b'b', i, i].as_slice())
        );
    }
}

#[test]
fn close_reopen_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"stable");
        engine.close();
    }
    for _ in 0..3 {
        let mut engine = open(dir.path());
        assert_eq!(engine.num_records("ch"), 1);
        engine.close();
    }
    let mut engine = open(dir.path());
    assert_eq!(pop(&mut engine, "ch").as_deref(), Some(b"stable".as_slice()));
}

#[test]
fn corrupted_header_parity_fails_the_pop() {
    let dir = tempdir().expect("tempdir");
    let mut engine = open(dir.path());
    push(&mut engine, "ch", b"payload");
    engine.flush().expect("flush");

    // Flip one byte inside the first record header (it starts right after
    // the 8-byte magic).
    let path = dir.path().join(DATA_FILE_NAME);
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .expect("reopen data file");
    file.seek(SeekFrom::Start(12)).expect("seek");
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).expect("read");
    byte[0] ^= 0x40;
    file.seek(SeekFrom::Start(12)).expect("seek");
    file.write_all(&byte).expect("write");
    file.sync_all().expect("sync");

    let mut buf = Vec::new();
    let err = engine.pop("ch", &mut buf).unwrap_err();
    match err {
        QmqError::Corrupt { ref file, .. } => assert_eq!(file, DATA_FILE_NAME),
        other => panic!("expected corruption error, got {other}"),
    }
}

#[test]
fn corrupted_header_is_fatal_at_startup() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"payload");
        engine.close();
    }
    let path = dir.path().join(DATA_FILE_NAME);
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("reopen data file");
    file.seek(SeekFrom::Start(9)).expect("seek");
    file.write_all(&[0xFF]).expect("write");
    file.sync_all().expect("sync");

    let err = OverflowEngine::open(dir.path()).unwrap_err();
    assert!(err.is_fatal_at_startup(), "unexpected error: {err}");
}

#[test]
fn bad_magic_rejected() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join(DATA_FILE_NAME), b"NOTMAGIC-and-more").expect("write");
    let err = OverflowEngine::open(dir.path()).unwrap_err();
    assert!(matches!(err, QmqError::BadMagic { .. }), "{err}");
}

#[test]
fn duplicate_index_line_rejected() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"12345");
        engine.close();
    }
    let index_path = dir.path().join(INDEX_FILE_NAME);
    let line = std::fs::read_to_string(&index_path).expect("read index");
    std::fs::write(&index_path, format!("{line}{line}")).expect("write index");

    let err = OverflowEngine::open(dir.path()).unwrap_err();
    assert!(err.to_string().contains("duplicate"), "{err}");
}

#[test]
fn empty_channel_in_index_rejected() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"12345");
        engine.close();
    }
    let index_path = dir.path().join(INDEX_FILE_NAME);
    let mut content = std::fs::read_to_string(&index_path).expect("read index");
    content.push_str("ghost 0 0 0 0\n");
    std::fs::write(&index_path, content).expect("write index");

    let err = OverflowEngine::open(dir.path()).unwrap_err();
    assert!(err.to_string().contains("empty channel"), "{err}");
}

#[test]
fn index_offset_beyond_file_rejected() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"11111");
        push(&mut engine, "ch", b"22222");
        engine.close();
    }
    // Shrink the data file below the recorded last offset (the second
    // record's header starts at 8 + header + 5).
    let data_path = dir.path().join(DATA_FILE_NAME);
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&data_path)
        .expect("reopen");
    file.set_len(8 + RecordHeader::SIZE as u64 + 5).expect("truncate");

    let err = OverflowEngine::open(dir.path()).unwrap_err();
    assert!(err.is_fatal_at_startup(), "{err}");
    assert!(err.to_string().contains("beyond file size"), "{err}");
}

#[test]
fn data_file_smaller_than_totals_rejected() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "a", &vec![7u8; 4000]);
        push(&mut engine, "b", &vec![8u8; 4000]);
        engine.close();
    }
    // Cut off the tail record's payload but keep both headers readable.
    let header = RecordHeader::SIZE as u64;
    let data_path = dir.path().join(DATA_FILE_NAME);
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&data_path)
        .expect("reopen");
    file.set_len(8 + 2 * header + 4000 + 100).expect("truncate");

    let err = OverflowEngine::open(dir.path()).unwrap_err();
    assert!(err.is_fatal_at_startup(), "{err}");
}

#[test]
fn empty_directory_starts_empty() {
    let dir = tempdir().expect("tempdir");
    let engine = open(dir.path());
    assert_eq!(engine.total_records(), 0);
    assert_eq!(engine.total_bytes(), 0);
}

#[test]
fn close_without_records_unlinks_files() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"transient");
        assert_eq!(pop(&mut engine, "ch").as_deref(), Some(b"transient".as_slice()));
        engine.close();
    }
    assert!(!dir.path().join(DATA_FILE_NAME).exists());
    assert!(!dir.path().join(INDEX_FILE_NAME).exists());
}

#[test]
fn close_with_records_keeps_files() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"durable");
        engine.close();
    }
    assert!(dir.path().join(DATA_FILE_NAME).exists());
    assert!(dir.path().join(INDEX_FILE_NAME).exists());
}

#[test]
fn stale_empty_index_truncates_orphaned_data() {
    let dir = tempdir().expect("tempdir");
    {
        let mut engine = open(dir.path());
        push(&mut engine, "ch", b"will be lost");
        engine.close();
    }
    // Simulate an index lost before the crash: records exist in the data
    // file but no line names them.
    std::fs::write(dir.path().join(INDEX_FILE_NAME), "").expect("clear index");

    let engine = open(dir.path());
    assert_eq!(engine.total_records(), 0);
    assert_eq!(engine.data_file_size().expect("size"), 0);
}
