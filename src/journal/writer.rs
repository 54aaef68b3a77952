//! Journal section writer.
//!
//! Produces the durable files the recovery driver replays: one section per
//! group commit, checksummed and padded to the section alignment. The
//! writer owns file numbering (`j._0`, `j._1`, ...) and emits the sticky
//! `DbContext` entries basic writes rely on.

use super::{
    align_up, ALIGNMENT, HEADER_LEN, JOURNAL_MAGIC, JOURNAL_VERSION, MAX_DB_NAME, MIN_WRITE_LEN,
    OP_DB_CONTEXT, OP_DROP_DB, OP_FILE_CREATED, OP_FOOTER, OP_OBJ_APPEND, SECT_FOOTER_LEN,
    SECT_HEADER_LEN,
};
use crate::error::{GeodexError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One durable operation, as handed to [`JournalWriter::write_section`].
#[derive(Debug, Clone)]
pub enum JournalEntry {
    /// Copy `data` into `<db>.<file_no>` at `ofs`. The payload must be at
    /// least [`MIN_WRITE_LEN`] bytes so its length never collides with an
    /// opcode.
    Write {
        db: String,
        file_no: i32,
        ofs: u32,
        data: Bytes,
    },
    /// Copy `len` bytes between data files and stamp object framing around
    /// the destination.
    ObjAppend {
        db: String,
        src_file_no: i32,
        src_ofs: u32,
        dst_file_no: i32,
        dst_ofs: u32,
        len: u32,
    },
    /// Record that a data file of the given length was created.
    FileCreated { path: String, len: u64 },
    /// Record that a database's files were dropped.
    DropDb { db: String },
}

/// Appends checksummed sections to `j._<n>` files in a journal directory.
pub struct JournalWriter {
    dir: PathBuf,
    file: Option<BufWriter<File>>,
    pos: usize,
    next_file_no: u32,
    seq: u64,
}

impl JournalWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(JournalWriter {
            dir,
            file: None,
            pos: 0,
            next_file_no: 0,
            seq: 0,
        })
    }

    /// Path the next section will land in.
    pub fn current_path(&self) -> PathBuf {
        let n = if self.file.is_some() {
            self.next_file_no - 1
        } else {
            self.next_file_no
        };
        self.dir.join(format!("j._{n}"))
    }

    fn open_next(&mut self) -> Result<()> {
        let path = self.dir.join(format!("j._{}", self.next_file_no));
        self.next_file_no += 1;

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);

        // Header block, padded to the section alignment.
        let mut header = BytesMut::with_capacity(ALIGNMENT);
        header.put_slice(&JOURNAL_MAGIC);
        header.put_u32_ne(JOURNAL_VERSION);
        header.put_u32_ne(0);
        debug_assert_eq!(header.len(), HEADER_LEN);
        header.resize(ALIGNMENT, 0);
        writer.write_all(&header)?;

        self.file = Some(writer);
        self.pos = ALIGNMENT;
        Ok(())
    }

    fn check_db_name(db: &str) -> Result<()> {
        if db.is_empty() || db.len() > MAX_DB_NAME || db.as_bytes().contains(&0) {
            return Err(GeodexError::BadValue(format!("bad database name: {db:?}")));
        }
        Ok(())
    }

    fn put_cstr(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    /// Append one group commit as a single atomic section.
    pub fn write_section(&mut self, entries: &[JournalEntry]) -> Result<()> {
        if self.file.is_none() {
            self.open_next()?;
        }

        let mut body = BytesMut::new();
        // Sticky context is scoped to the section, so the first write of
        // each section re-establishes it.
        let mut context: Option<&str> = None;
        for entry in entries {
            match entry {
                JournalEntry::Write {
                    db,
                    file_no,
                    ofs,
                    data,
                } => {
                    Self::check_db_name(db)?;
                    if (data.len() as u32) < MIN_WRITE_LEN {
                        return Err(GeodexError::BadValue(format!(
                            "journal write of {} bytes is below the minimum of {}",
                            data.len(),
                            MIN_WRITE_LEN
                        )));
                    }
                    if context != Some(db.as_str()) {
                        body.put_u32_ne(OP_DB_CONTEXT);
                        Self::put_cstr(&mut body, db);
                        context = Some(db);
                    }
                    body.put_u32_ne(data.len() as u32);
                    body.put_i32_ne(*file_no);
                    body.put_u32_ne(*ofs);
                    body.put_slice(data);
                }
                JournalEntry::ObjAppend {
                    db,
                    src_file_no,
                    src_ofs,
                    dst_file_no,
                    dst_ofs,
                    len,
                } => {
                    Self::check_db_name(db)?;
                    if context != Some(db.as_str()) {
                        body.put_u32_ne(OP_DB_CONTEXT);
                        Self::put_cstr(&mut body, db);
                        context = Some(db);
                    }
                    body.put_u32_ne(OP_OBJ_APPEND);
                    body.put_i32_ne(*src_file_no);
                    body.put_u32_ne(*src_ofs);
                    body.put_i32_ne(*dst_file_no);
                    body.put_u32_ne(*dst_ofs);
                    body.put_u32_ne(*len);
                }
                JournalEntry::FileCreated { path, len } => {
                    body.put_u32_ne(OP_FILE_CREATED);
                    body.put_u64_ne(*len);
                    Self::put_cstr(&mut body, path);
                }
                JournalEntry::DropDb { db } => {
                    Self::check_db_name(db)?;
                    body.put_u32_ne(OP_DROP_DB);
                    Self::put_cstr(&mut body, db);
                }
            }
        }

        let sect_len = SECT_HEADER_LEN + body.len() + SECT_FOOTER_LEN;
        let mut section = BytesMut::with_capacity(align_up(sect_len));
        section.put_u32_ne(sect_len as u32);
        section.put_u32_ne(0);
        section.put_u64_ne(self.seq);
        self.seq += 1;
        section.put_slice(&body);

        // The footer hash covers the section from header start up to the
        // footer itself.
        let digest = Md5::digest(&section[..]);
        section.put_u32_ne(OP_FOOTER);
        section.put_slice(digest.as_slice());
        section.resize(align_up(self.pos + section.len()) - self.pos, 0);

        let writer = self.file.as_mut().expect("file opened above");
        writer.write_all(&section)?;
        self.pos += section.len();
        Ok(())
    }

    /// Close the current file; the next section starts `j._<n+1>`.
    pub fn advance_file(&mut self) -> Result<()> {
        self.flush()?;
        self.file = None;
        Ok(())
    }

    /// Flush buffered sections and fsync the current file.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.file.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        // Best effort flush on drop, ignore errors.
        if let Some(writer) = self.file.as_mut() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn files_are_numbered_and_aligned() {
        let dir = tempdir().unwrap();
        let mut w = JournalWriter::new(dir.path()).unwrap();

        w.write_section(&[JournalEntry::Write {
            db: "places".into(),
            file_no: 0,
            ofs: 0,
            data: Bytes::from_static(b"0123456789abcdef"),
        }])
        .unwrap();
        w.advance_file().unwrap();
        w.write_section(&[JournalEntry::DropDb { db: "places".into() }])
            .unwrap();
        w.flush().unwrap();

        let f0 = dir.path().join("j._0");
        let f1 = dir.path().join("j._1");
        assert!(f0.exists());
        assert!(f1.exists());
        assert_eq!(std::fs::metadata(&f0).unwrap().len() as usize % ALIGNMENT, 0);
        assert_eq!(std::fs::metadata(&f1).unwrap().len() as usize % ALIGNMENT, 0);
    }

    #[test]
    fn short_writes_are_rejected() {
        let dir = tempdir().unwrap();
        let mut w = JournalWriter::new(dir.path()).unwrap();
        let err = w.write_section(&[JournalEntry::Write {
            db: "places".into(),
            file_no: 0,
            ofs: 0,
            data: Bytes::from_static(b"abc"),
        }]);
        assert!(err.is_err());
    }

    #[test]
    fn bad_database_names_are_rejected() {
        let dir = tempdir().unwrap();
        let mut w = JournalWriter::new(dir.path()).unwrap();
        assert!(w
            .write_section(&[JournalEntry::DropDb { db: "".into() }])
            .is_err());
        assert!(w
            .write_section(&[JournalEntry::DropDb {
                db: "x".repeat(MAX_DB_NAME + 1)
            }])
            .is_err());
    }
}
