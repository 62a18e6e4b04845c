//! End-to-end tests: write path, crash recovery, extraction and parsing.

use std::{fs, path::Path, sync::Mutex, thread};

use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::DateTime;
use tempfile::tempdir;

use pinenut_log::{
    extract, gen_key_pair, parse, parse_to_file, Config, DefaultFormatter, Domain, Error, Level,
    Record, Rotation, SecretKey,
};

/// A minute-aligned base time: 2023-11-14 22:14:00 UTC.
const BASE_SECS: i64 = 1_700_000_040;

fn record_at(secs: i64, content: impl Into<String>) -> Record {
    Record::builder()
        .level(Level::Info)
        .datetime(DateTime::from_timestamp(secs, 0).unwrap())
        .content(content)
        .build()
}

fn pine_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "pine"))
        .collect();
    files.sort();
    files
}

/// Parses every `.pine` file of the directory, in bucket order.
fn collect_records(dir: &Path, secret_key: Option<SecretKey>) -> Vec<Record> {
    let mut records = Vec::new();
    for path in pine_files(dir) {
        parse(&path, secret_key, |record| {
            records.push(record.clone());
            Ok(())
        })
        .unwrap();
    }
    records
}

// ---------------------------------------------------------------
// Scenario A: round-trip, no crypto
// ---------------------------------------------------------------

#[test]
fn test_roundtrip_plain() {
    let dir = tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let logger = domain
        .clone()
        .logger(Config::new().use_mmap(false))
        .unwrap();

    logger.log(&record_at(BASE_SECS, "hello"));
    logger.log(
        &Record::builder()
            .level(Level::Error)
            .datetime(DateTime::from_timestamp(BASE_SECS + 1, 0).unwrap())
            .tag("net")
            .content("boom")
            .build(),
    );
    logger.flush();
    logger.shutdown();

    let files = pine_files(dir.path());
    assert_eq!(files.len(), 1);

    // Unencrypted segments carry a zero flags byte and parse without a key.
    let bytes = fs::read(&files[0]).unwrap();
    assert_eq!(&bytes[0..4], b"PNLG");
    assert_eq!(bytes[6], 0);

    let dest = dir.path().join("plain.log");
    parse_to_file(&files[0], &dest, None, DefaultFormatter).unwrap();
    let text = fs::read_to_string(&dest).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("hello"));
    assert!(lines[1].contains("boom"));
    assert!(lines[1].contains("[net]"));
    assert!(lines[1].contains("ERROR"));
}

// ---------------------------------------------------------------
// Invariant 1: field fidelity through the encrypted pipeline
// ---------------------------------------------------------------

#[test]
fn test_field_fidelity_encrypted() {
    let dir = tempdir().unwrap();
    let (secret_key, public_key) = gen_key_pair();

    let full = Record::builder()
        .level(Level::Verbose)
        .datetime(DateTime::from_timestamp(BASE_SECS, 123_456_789).unwrap())
        .tag("db")
        .file("query.rs")
        .func("run")
        .line(314)
        .thread_id(99)
        .content("SELECT 1")
        .build();
    let minimal = record_at(BASE_SECS + 1, "minimal");

    let logger = Domain::new("app", dir.path())
        .logger(
            Config::new()
                .use_mmap(false)
                .key_str(Some(BASE64_STANDARD.encode(public_key))),
        )
        .unwrap();
    logger.log(&full);
    logger.log(&minimal);
    logger.shutdown();

    let records = collect_records(dir.path(), Some(secret_key));
    assert_eq!(records, vec![full.clone(), minimal.clone()]);
    // Sentinels map back to None.
    assert!(records[1].line.is_none());
    assert!(records[1].thread_id.is_none());
    assert!(records[1].tag.is_none());
}

// ---------------------------------------------------------------
// Invariant 2: per-thread ordering
// ---------------------------------------------------------------

#[test]
fn test_single_thread_order_preserved() {
    let dir = tempdir().unwrap();
    let logger = Domain::new("app", dir.path())
        .logger(Config::new().use_mmap(false))
        .unwrap();

    for i in 0..300 {
        logger.log(&record_at(BASE_SECS, format!("record {i}")));
    }
    logger.shutdown();

    let records = collect_records(dir.path(), None);
    assert_eq!(records.len(), 300);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.content, format!("record {i}"));
    }
}

#[test]
fn test_concurrent_threads_keep_their_order() {
    let dir = tempdir().unwrap();
    let logger = Domain::new("app", dir.path())
        .logger(Config::new().use_mmap(false))
        .unwrap();

    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 200;

    thread::scope(|scope| {
        for thread_no in 0..THREADS {
            let logger = &logger;
            scope.spawn(move || {
                for i in 0..PER_THREAD {
                    let record = Record::builder()
                        .datetime(DateTime::from_timestamp(BASE_SECS, 0).unwrap())
                        .thread_id(thread_no)
                        .content(format!("{i}"))
                        .build();
                    logger.log(&record);
                }
            });
        }
    });
    logger.shutdown();

    let records = collect_records(dir.path(), None);
    assert_eq!(records.len(), (THREADS * PER_THREAD) as usize);

    let mut next: Vec<u64> = vec![0; THREADS as usize];
    for record in records {
        let thread_no = record.thread_id.unwrap() as usize;
        let i: u64 = record.content.parse().unwrap();
        assert_eq!(i, next[thread_no], "thread {thread_no} out of order");
        next[thread_no] += 1;
    }
    assert!(next.iter().all(|&n| n == PER_THREAD));
}

// ---------------------------------------------------------------
// Scenario B: rotation by minute
// ---------------------------------------------------------------

#[test]
fn test_minute_rotation_splits_files() {
    let dir = tempdir().unwrap();
    let logger = Domain::new("app", dir.path())
        .logger(Config::new().use_mmap(false).rotation(Rotation::Minute))
        .unwrap();

    logger.log(&record_at(BASE_SECS, "first"));
    logger.log(&record_at(BASE_SECS + 61, "second"));
    logger.shutdown();

    let files = pine_files(dir.path());
    assert_eq!(files.len(), 2);
    let stems: Vec<String> = files
        .iter()
        .map(|path| path.file_stem().unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(stems[0], "app_202311142214");
    assert_eq!(stems[1], "app_202311142215");

    let records = collect_records(dir.path(), None);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].content, "first");
    assert_eq!(records[1].content, "second");
}

// ---------------------------------------------------------------
// Scenario C: crash recovery through the mmap buffer
// ---------------------------------------------------------------

#[test]
fn test_crash_recovery_replays_buffered_records() {
    let dir = tempdir().unwrap();
    let domain = Domain::new("app", dir.path());

    let logger = domain.clone().logger(Config::new()).unwrap();
    for i in 0..1_000 {
        logger.log(&record_at(BASE_SECS, format!("buffered {i}")));
    }
    // Simulated crash: no flush, no shutdown. All records still sit in the
    // staging buffer; the mapped file holds them.
    drop(logger);

    assert!(dir.path().join("app.buffer").exists());
    assert!(pine_files(dir.path()).is_empty());

    // Reopening the domain replays the buffer into a segment.
    let logger = domain.logger(Config::new()).unwrap();
    logger.shutdown();

    let records = collect_records(dir.path(), None);
    assert_eq!(records.len(), 1_000);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.content, format!("buffered {i}"));
    }
}

#[test]
fn test_recovery_does_not_duplicate_on_second_open() {
    let dir = tempdir().unwrap();
    let domain = Domain::new("app", dir.path());

    let logger = domain.clone().logger(Config::new()).unwrap();
    logger.log(&record_at(BASE_SECS, "once"));
    drop(logger);

    let logger = domain.clone().logger(Config::new()).unwrap();
    logger.shutdown();
    let logger = domain.logger(Config::new()).unwrap();
    logger.shutdown();

    let records = collect_records(dir.path(), None);
    assert_eq!(records.len(), 1);
}

#[test]
fn test_buffer_length_change_discards_stale_halves() {
    let dir = tempdir().unwrap();
    let domain = Domain::new("app", dir.path());

    let logger = domain.clone().logger(Config::new()).unwrap();
    logger.log(&record_at(BASE_SECS, "from the old geometry"));
    drop(logger);

    // A different buffer length invalidates the previous halves; reopening
    // must not replay garbage.
    let logger = domain
        .clone()
        .logger(Config::new().buffer_len(64 * 1024))
        .unwrap();
    logger.log(&record_at(BASE_SECS, "fresh"));
    logger.shutdown();

    let records = collect_records(dir.path(), None);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "fresh");
}

// ---------------------------------------------------------------
// Scenario D: extract a time slice (bucket granularity)
// ---------------------------------------------------------------

#[test]
fn test_extract_time_slice() {
    let dir = tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let logger = domain
        .clone()
        .logger(Config::new().use_mmap(false).rotation(Rotation::Minute))
        .unwrap();

    // One record per minute bucket.
    for i in 0..100 {
        logger.log(&record_at(BASE_SECS + i * 60, format!("minute {i}")));
    }
    logger.shutdown();
    assert_eq!(pine_files(dir.path()).len(), 100);

    let dest = dir.path().join("slice.pine");
    extract(
        &domain,
        BASE_SECS + 20 * 60,
        BASE_SECS + 40 * 60,
        &dest,
    )
    .unwrap();

    let mut contents = Vec::new();
    parse(&dest, None, |record| {
        contents.push(record.content.clone());
        Ok(())
    })
    .unwrap();

    let expected: Vec<String> = (20..=40).map(|i| format!("minute {i}")).collect();
    assert_eq!(contents, expected);
}

#[test]
fn test_extract_empty_range_is_not_found() {
    let dir = tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let logger = domain
        .clone()
        .logger(Config::new().use_mmap(false))
        .unwrap();
    logger.log(&record_at(BASE_SECS, "x"));
    logger.shutdown();

    let dest = dir.path().join("none.pine");
    assert!(matches!(
        extract(&domain, 0, 1_000, &dest),
        Err(Error::NotFound)
    ));
    assert!(!dest.exists());
}

// ---------------------------------------------------------------
// Scenario E: wrong key
// ---------------------------------------------------------------

#[test]
fn test_wrong_secret_key_fails_closed() {
    let dir = tempdir().unwrap();
    let (secret_key, public_key) = gen_key_pair();
    let (unrelated_secret, _) = gen_key_pair();

    let logger = Domain::new("app", dir.path())
        .logger(
            Config::new()
                .use_mmap(false)
                .key_str(Some(BASE64_STANDARD.encode(public_key))),
        )
        .unwrap();
    logger.log(&record_at(BASE_SECS, "classified"));
    logger.shutdown();

    let files = pine_files(dir.path());
    assert_eq!(files.len(), 1);

    // Wrong key: a crypto error, and no records reach the output.
    let dest = dir.path().join("wrong.log");
    let seen = Mutex::new(0u32);
    let err = parse(&files[0], Some(unrelated_secret), |_| {
        *seen.lock().unwrap() += 1;
        Ok(())
    })
    .unwrap_err();
    match err {
        Error::Segments(failures) => {
            assert!(!failures.is_empty());
            assert!(matches!(*failures[0].source, Error::Decrypt));
        }
        other => panic!("expected segment failures, got {other}"),
    }
    assert_eq!(*seen.lock().unwrap(), 0);
    assert!(parse_to_file(&files[0], &dest, Some(unrelated_secret), DefaultFormatter).is_err());

    // No key at all on an encrypted file fails too.
    assert!(parse(&files[0], None, |_| Ok(())).is_err());

    // The right key still works.
    let records = collect_records(dir.path(), Some(secret_key));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "classified");
}

// ---------------------------------------------------------------
// Scenario F: half overflow
// ---------------------------------------------------------------

#[test]
fn test_half_overflow_drains_and_keeps_all_records() {
    let dir = tempdir().unwrap();
    let logger = Domain::new("app", dir.path())
        .logger(Config::new().use_mmap(false).buffer_len(4096))
        .unwrap();

    for i in 0..5 {
        let content = format!("{i}").repeat(1_800);
        logger.log(&record_at(BASE_SECS, &content[..1_800]));
    }
    logger.shutdown();

    let records = collect_records(dir.path(), None);
    assert_eq!(records.len(), 5);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.content.len(), 1_800);
        assert!(record.content.starts_with(&i.to_string()));
    }
}

// ---------------------------------------------------------------
// Invariant 6: trim
// ---------------------------------------------------------------

#[test]
fn test_trim_deletes_expired_segments_only() {
    let dir = tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let logger = domain
        .clone()
        .logger(Config::new().use_mmap(false))
        .unwrap();

    // An old bucket, then a current one.
    logger.log(&record_at(BASE_SECS, "ancient"));
    logger.flush();
    let now = chrono::Utc::now();
    logger.log(
        &Record::builder()
            .datetime(now)
            .content("current")
            .build(),
    );
    logger.flush();
    logger.trim(3_600);
    logger.shutdown();

    let records = collect_records(dir.path(), None);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "current");
}

// ---------------------------------------------------------------
// Extraction output is a valid log file (invariant on extract)
// ---------------------------------------------------------------

#[test]
fn test_extracted_file_parses_with_same_key() {
    let dir = tempdir().unwrap();
    let (secret_key, public_key) = gen_key_pair();
    let domain = Domain::new("app", dir.path());

    let logger = domain
        .clone()
        .logger(
            Config::new()
                .use_mmap(false)
                .key_str(Some(BASE64_STANDARD.encode(public_key))),
        )
        .unwrap();
    logger.log(&record_at(BASE_SECS, "one"));
    logger.log(&record_at(BASE_SECS + 60, "two"));
    logger.log(&record_at(BASE_SECS + 120, "three"));
    logger.shutdown();

    let dest = dir.path().join("combined.pine");
    extract(&domain, BASE_SECS, BASE_SECS + 120, &dest).unwrap();

    let mut contents = Vec::new();
    parse(&dest, Some(secret_key), |record| {
        contents.push(record.content.clone());
        Ok(())
    })
    .unwrap();
    assert_eq!(contents, ["one", "two", "three"]);
}

// ---------------------------------------------------------------
// Config validation
// ---------------------------------------------------------------

#[test]
fn test_invalid_public_key_rejected_at_construction() {
    let dir = tempdir().unwrap();
    let result = Domain::new("app", dir.path()).logger(
        Config::new()
            .use_mmap(false)
            .key_str(Some("not-a-key")),
    );
    assert!(matches!(result, Err(Error::InvalidKey)));
}

#[test]
fn test_impossible_buffer_size_rejected() {
    let dir = tempdir().unwrap();
    let result = Domain::new("app", dir.path())
        .logger(Config::new().use_mmap(false).buffer_len(32));
    assert!(matches!(result, Err(Error::Config(_))));
}
