use bytes::Bytes;
use geodex::journal::{JournalEntry, JournalWriter, ALIGNMENT, DOT_NS_SUFFIX};
use geodex::{recover, DurOptions, GeodexError};
use std::fs;
use std::path::Path;

/// Create a data file full of a marker byte.
fn seed_file(dir: &Path, name: &str, len: usize, fill: u8) {
    fs::write(dir.join(name), vec![fill; len]).unwrap();
}

fn dirs() -> (tempfile::TempDir, tempfile::TempDir) {
    (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap())
}

fn journal_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("j._")
        })
        .count()
}

#[test]
fn replay_restores_written_bytes_and_cleans_up() {
    let (base, jdir) = dirs();
    seed_file(base.path(), "places.0", 4096, 0);
    seed_file(base.path(), "places.ns", 1024, 0);

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[
        JournalEntry::Write {
            db: "places".into(),
            file_no: 0,
            ofs: 100,
            data: Bytes::from_static(b"hello journal!!!"),
        },
        JournalEntry::Write {
            db: "places".into(),
            file_no: DOT_NS_SUFFIX,
            ofs: 0,
            data: Bytes::from_static(b"namespace"),
        },
    ])
    .unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "places".into(),
        file_no: 0,
        ofs: 200,
        data: Bytes::from_static(b"second section!!"),
    }])
    .unwrap();
    w.flush().unwrap();
    drop(w);

    recover(base.path(), jdir.path(), DurOptions::default()).unwrap();

    let data = fs::read(base.path().join("places.0")).unwrap();
    assert_eq!(&data[100..116], b"hello journal!!!");
    assert_eq!(&data[200..216], b"second section!!");
    assert_eq!(data[0], 0);
    let ns = fs::read(base.path().join("places.ns")).unwrap();
    assert_eq!(&ns[..9], b"namespace");

    // Journal files are removed after a successful replay.
    assert_eq!(journal_count(jdir.path()), 0);
}

#[test]
fn obj_append_stamps_framing_bytes() {
    let (base, jdir) = dirs();
    seed_file(base.path(), "src.0", 1024, 0);
    seed_file(base.path(), "local.0", 1024, 0xaa);

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[
        JournalEntry::Write {
            db: "src".into(),
            file_no: 0,
            ofs: 16,
            data: Bytes::from_static(b"objectpayload"),
        },
        JournalEntry::ObjAppend {
            db: "src".into(),
            src_file_no: 0,
            src_ofs: 16,
            dst_file_no: 0,
            dst_ofs: 512,
            len: 13,
        },
    ])
    .unwrap();
    w.flush().unwrap();
    drop(w);

    recover(base.path(), jdir.path(), DurOptions::default()).unwrap();

    let local = fs::read(base.path().join("local.0")).unwrap();
    assert_eq!(&local[512..525], b"objectpayload");
    // Object-field preamble directly before, end-of-object directly after.
    assert_eq!(local[509], 3);
    assert_eq!(local[510], b'o');
    assert_eq!(local[511], 0);
    assert_eq!(local[525], 0);
    // Bytes around the stamped range are untouched.
    assert_eq!(local[508], 0xaa);
    assert_eq!(local[526], 0xaa);
}

#[test]
fn abrupt_end_tolerated_only_on_last_file() {
    let (base, jdir) = dirs();
    seed_file(base.path(), "db.0", 4096, 0);

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs: 0,
        data: Bytes::from_static(b"file zero sect 0"),
    }])
    .unwrap();
    w.advance_file().unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs: 32,
        data: Bytes::from_static(b"file one sect 00"),
    }])
    .unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs: 64,
        data: Bytes::from_static(b"file one sect 01"),
    }])
    .unwrap();
    w.flush().unwrap();
    drop(w);

    // Cut the last file mid-way through its second section.
    let f1 = jdir.path().join("j._1");
    let len = fs::metadata(&f1).unwrap().len();
    let f = fs::OpenOptions::new().write(true).open(&f1).unwrap();
    f.set_len(len - ALIGNMENT as u64 + 40).unwrap();
    drop(f);

    recover(base.path(), jdir.path(), DurOptions::default()).unwrap();

    // Every complete section applied, the truncated one discarded whole.
    let data = fs::read(base.path().join("db.0")).unwrap();
    assert_eq!(&data[0..16], b"file zero sect 0");
    assert_eq!(&data[32..48], b"file one sect 00");
    assert_eq!(&data[64..80], [0u8; 16]);
    assert_eq!(journal_count(jdir.path()), 0);
}

#[test]
fn abrupt_end_on_non_last_file_fails_recovery() {
    let (base, jdir) = dirs();
    seed_file(base.path(), "db.0", 4096, 0);

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs: 0,
        data: Bytes::from_static(b"0123456789abcdef"),
    }])
    .unwrap();
    w.advance_file().unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs: 32,
        data: Bytes::from_static(b"0123456789abcdef"),
    }])
    .unwrap();
    w.flush().unwrap();
    drop(w);

    // Truncate the FIRST file mid-section.
    let f0 = jdir.path().join("j._0");
    let len = fs::metadata(&f0).unwrap().len();
    let f = fs::OpenOptions::new().write(true).open(&f0).unwrap();
    f.set_len(len - 20).unwrap();
    drop(f);

    let err = recover(base.path(), jdir.path(), DurOptions::default());
    assert!(matches!(err, Err(GeodexError::JournalAbruptEnd)));
    // Nothing cleaned up, journal left for the operator.
    assert_eq!(journal_count(jdir.path()), 2);
}

#[test]
fn truncation_mid_section_equals_truncation_at_boundary() {
    // Replaying a journal truncated inside its last section must leave the
    // data file exactly as if the journal ended at the previous section
    // boundary.
    let write = |ofs: u32, text: &'static [u8]| JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs,
        data: Bytes::from_static(text),
    };

    let run = |truncate: Option<u64>| -> Vec<u8> {
        let (base, jdir) = dirs();
        seed_file(base.path(), "db.0", 2048, 0);

        let mut w = JournalWriter::new(jdir.path()).unwrap();
        w.write_section(&[write(0, b"first section!!!")]).unwrap();
        w.write_section(&[write(100, b"second section!!")]).unwrap();
        w.flush().unwrap();
        drop(w);

        if let Some(cut) = truncate {
            let f0 = jdir.path().join("j._0");
            let f = fs::OpenOptions::new().write(true).open(&f0).unwrap();
            f.set_len(cut).unwrap();
        }

        recover(base.path(), jdir.path(), DurOptions::default()).unwrap();
        fs::read(base.path().join("db.0")).unwrap()
    };

    // Header block + one full section = 2 * ALIGNMENT. Cutting 50 bytes
    // into the second section discards it entirely.
    let mid_section = run(Some(2 * ALIGNMENT as u64 + 50));
    let at_boundary = run(Some(2 * ALIGNMENT as u64));
    assert_eq!(mid_section, at_boundary);
    assert_eq!(&mid_section[0..16], b"first section!!!");
    assert_eq!(&mid_section[100..116], [0u8; 16]);

    let full = run(None);
    assert_eq!(&full[100..116], b"second section!!");
}

#[test]
fn corrupted_section_fails_checksum() {
    let (base, jdir) = dirs();
    seed_file(base.path(), "db.0", 2048, 0);

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs: 0,
        data: Bytes::from_static(b"0123456789abcdef"),
    }])
    .unwrap();
    w.flush().unwrap();
    drop(w);

    // Flip one payload byte inside the section.
    let f0 = jdir.path().join("j._0");
    let mut bytes = fs::read(&f0).unwrap();
    bytes[ALIGNMENT + 40] ^= 0xff;
    fs::write(&f0, &bytes).unwrap();

    let err = recover(base.path(), jdir.path(), DurOptions::default());
    assert!(matches!(err, Err(GeodexError::JournalChecksum { .. })));
    // The corrupt section was never applied.
    let data = fs::read(base.path().join("db.0")).unwrap();
    assert_eq!(&data[0..16], [0u8; 16]);
}

#[test]
fn missing_predecessor_file_fails_fast() {
    let (base, jdir) = dirs();

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[JournalEntry::DropDb { db: "db".into() }])
        .unwrap();
    w.flush().unwrap();
    drop(w);

    fs::rename(jdir.path().join("j._0"), jdir.path().join("j._2")).unwrap();

    let err = recover(base.path(), jdir.path(), DurOptions::default());
    assert!(matches!(err, Err(GeodexError::JournalFiles(_))));
}

#[test]
fn zero_length_destination_file_is_fatal() {
    let (base, jdir) = dirs();
    seed_file(base.path(), "db.0", 0, 0);

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs: 0,
        data: Bytes::from_static(b"0123456789abcdef"),
    }])
    .unwrap();
    w.flush().unwrap();
    drop(w);

    let err = recover(base.path(), jdir.path(), DurOptions::default());
    assert!(matches!(err, Err(GeodexError::ZeroLengthFile(_))));
}

#[test]
fn scan_only_verifies_without_applying() {
    let (base, jdir) = dirs();
    seed_file(base.path(), "db.0", 2048, 0);

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[JournalEntry::Write {
        db: "db".into(),
        file_no: 0,
        ofs: 0,
        data: Bytes::from_static(b"0123456789abcdef"),
    }])
    .unwrap();
    w.flush().unwrap();
    drop(w);

    let opts = DurOptions {
        scan_only: true,
        ..DurOptions::default()
    };
    let err = recover(base.path(), jdir.path(), opts);
    assert!(matches!(err, Err(GeodexError::ScanOnly)));

    // Nothing applied, journal left in place.
    let data = fs::read(base.path().join("db.0")).unwrap();
    assert_eq!(&data[0..16], [0u8; 16]);
    assert_eq!(journal_count(jdir.path()), 1);
}

#[test]
fn file_created_entries_materialize_files() {
    let (base, jdir) = dirs();

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[
        JournalEntry::FileCreated {
            path: "db.0".into(),
            len: 1024,
        },
        JournalEntry::Write {
            db: "db".into(),
            file_no: 0,
            ofs: 8,
            data: Bytes::from_static(b"created then written"),
        },
    ])
    .unwrap();
    w.flush().unwrap();
    drop(w);

    recover(base.path(), jdir.path(), DurOptions::default()).unwrap();

    let data = fs::read(base.path().join("db.0")).unwrap();
    assert_eq!(data.len(), 1024);
    assert_eq!(&data[8..28], b"created then written");
}

#[test]
fn drop_db_removes_database_files() {
    let (base, jdir) = dirs();
    seed_file(base.path(), "doomed.0", 512, 1);
    seed_file(base.path(), "doomed.ns", 512, 1);
    seed_file(base.path(), "survivor.0", 512, 1);

    let mut w = JournalWriter::new(jdir.path()).unwrap();
    w.write_section(&[JournalEntry::DropDb { db: "doomed".into() }])
        .unwrap();
    w.flush().unwrap();
    drop(w);

    recover(base.path(), jdir.path(), DurOptions::default()).unwrap();

    assert!(!base.path().join("doomed.0").exists());
    assert!(!base.path().join("doomed.ns").exists());
    assert!(base.path().join("survivor.0").exists());
}
