//! Journal iteration and crash recovery.
//!
//! Recovery enumerates the `j._<n>` files in sequence order, streams each
//! through [`JournalIterator`], collects the entries of one section at a
//! time, and applies each verified section atomically to the memory-mapped
//! data files. A file that ends mid-section was cut off by the crash; that
//! is tolerated only on the last file, anywhere else it is corruption.

use super::{
    align_up, data_file_name, END_OF_OBJECT, HEADER_LEN, JOURNAL_MAGIC, JOURNAL_VERSION,
    MAX_DB_NAME, MIN_WRITE_LEN, OBJ_FIELD_NAME, OBJ_FIELD_PAD, OBJ_FIELD_TYPE, OP_DB_CONTEXT,
    OP_DROP_DB, OP_FILE_CREATED, OP_FOOTER, OP_OBJ_APPEND, SECT_HEADER_LEN,
};
use crate::error::{GeodexError, Result};
use crate::types::DurOptions;
use md5::{Digest, Md5};
use memmap2::{Mmap, MmapMut};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Destination database of object appends.
const LOCAL_DB: &str = "local";

/// Bounded reader over the mapped journal bytes. Every accessor fails with
/// [`GeodexError::JournalEof`] instead of running past the end, which is
/// how an abrupt file end surfaces.
struct SectReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SectReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        SectReader { buf, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn at_eof(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(GeodexError::JournalEof);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_ne_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    /// NUL-terminated UTF-8 string, NUL within `limit` bytes.
    fn read_cstr(&mut self, limit: usize) -> Result<&'a str> {
        let window = &self.buf[self.pos..];
        let Some(nul) = window
            .iter()
            .take(limit.saturating_add(1).min(window.len()))
            .position(|&b| b == 0)
        else {
            if window.len() <= limit {
                return Err(GeodexError::JournalEof);
            }
            return Err(GeodexError::JournalFormat(
                "unterminated name in journal entry".into(),
            ));
        };
        let s = std::str::from_utf8(&window[..nul])
            .map_err(|_| GeodexError::JournalFormat("non-utf8 name in journal entry".into()))?;
        self.pos += nul + 1;
        Ok(s)
    }

    /// Jump to the next alignment boundary (file-relative).
    fn align(&mut self) {
        self.pos = align_up(self.pos).min(self.buf.len());
    }

    fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        &self.buf[start..end]
    }
}

/// One parsed journal entry, borrowing names and payloads from the mapped
/// file.
#[derive(Debug, Clone, Copy)]
pub enum ParsedEntry<'a> {
    Write {
        db: &'a str,
        file_no: i32,
        ofs: u32,
        data: &'a [u8],
    },
    ObjAppend {
        db: &'a str,
        src_file_no: i32,
        src_ofs: u32,
        dst_file_no: i32,
        dst_ofs: u32,
        len: u32,
    },
    FileCreated {
        path: &'a str,
        len: u64,
    },
    DropDb {
        db: &'a str,
    },
}

impl ParsedEntry<'_> {
    /// Whether replaying this entry requires the data-file cache flushed
    /// and dropped first (create/drop semantics).
    fn needs_files_closed(&self) -> bool {
        matches!(
            self,
            ParsedEntry::FileCreated { .. } | ParsedEntry::DropDb { .. }
        )
    }
}

/// Streaming parser for one mapped journal file.
///
/// [`JournalIterator::next`] yields entries; `Ok(None)` marks the end of a
/// verified section. The sticky database context is a field here, reset at
/// each section boundary.
pub struct JournalIterator<'a> {
    r: SectReader<'a>,
    sect_start: Option<usize>,
    last_db: Option<&'a str>,
}

impl<'a> JournalIterator<'a> {
    /// Validate the file header and position at the first section.
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let mut r = SectReader::new(buf);
        let magic = r.take(JOURNAL_MAGIC.len())?;
        if magic != JOURNAL_MAGIC {
            return Err(GeodexError::JournalFormat("journal header invalid".into()));
        }
        let version = r.read_u32()?;
        if version != JOURNAL_VERSION {
            return Err(GeodexError::JournalVersion(version));
        }
        r.skip(HEADER_LEN - JOURNAL_MAGIC.len() - 4)?;
        r.align();
        Ok(JournalIterator {
            r,
            sect_start: None,
            last_db: None,
        })
    }

    pub fn at_eof(&self) -> bool {
        self.r.at_eof()
    }

    /// Next entry, `Ok(None)` at the verified end of a section.
    pub fn next(&mut self) -> Result<Option<ParsedEntry<'a>>> {
        if self.sect_start.is_none() {
            self.sect_start = Some(self.r.pos());
            self.r.skip(SECT_HEADER_LEN)?;
            self.last_db = None;
        }

        let mut word = self.r.read_u32()?;

        if word == OP_FOOTER {
            let footer_start = self.r.pos() - 4;
            let sect_start = self.sect_start.expect("inside a section");
            let recorded = self.r.take(16)?;
            let actual = Md5::digest(self.r.slice(sect_start, footer_start));
            if actual.as_slice() != recorded {
                return Err(GeodexError::JournalChecksum {
                    recorded: hex(recorded),
                    actual: hex(actual.as_slice()),
                });
            }
            self.r.align();
            self.sect_start = None;
            return Ok(None);
        }

        if word == OP_FILE_CREATED {
            let len = self.r.read_u64()?;
            let path = self.r.read_cstr(usize::MAX)?;
            return Ok(Some(ParsedEntry::FileCreated { path, len }));
        }

        if word == OP_DROP_DB {
            let db = self.r.read_cstr(MAX_DB_NAME)?;
            return Ok(Some(ParsedEntry::DropDb { db }));
        }

        // A context entry carries no operation itself; the write it
        // prefixes follows immediately.
        while word == OP_DB_CONTEXT {
            self.last_db = Some(self.r.read_cstr(MAX_DB_NAME)?);
            word = self.r.read_u32()?;
        }

        if word == OP_OBJ_APPEND {
            let db = self.current_db()?;
            let src_file_no = self.r.read_i32()?;
            let src_ofs = self.r.read_u32()?;
            let dst_file_no = self.r.read_i32()?;
            let dst_ofs = self.r.read_u32()?;
            let len = self.r.read_u32()?;
            return Ok(Some(ParsedEntry::ObjAppend {
                db,
                src_file_no,
                src_ofs,
                dst_file_no,
                dst_ofs,
                len,
            }));
        }

        if word >= MIN_WRITE_LEN {
            let db = self.current_db()?;
            let file_no = self.r.read_i32()?;
            let ofs = self.r.read_u32()?;
            let data = self.r.take(word as usize)?;
            return Ok(Some(ParsedEntry::Write {
                db,
                file_no,
                ofs,
                data,
            }));
        }

        Err(GeodexError::JournalFormat(format!(
            "bad journal entry tag {word}"
        )))
    }

    fn current_db(&self) -> Result<&'a str> {
        self.last_db.ok_or_else(|| {
            GeodexError::JournalFormat("write entry before any database context".into())
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Journal files in sequence order. The sequence must start at 0 and be
/// gap-free; anything else in `j._` namespace is corruption.
pub fn journal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut by_number = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix("j._") else {
            continue;
        };
        let Ok(n) = rest.parse::<u32>() else {
            return Err(GeodexError::JournalFiles(format!(
                "{} : {name}",
                dir.display()
            )));
        };
        if by_number.insert(n, entry.path()).is_some() {
            return Err(GeodexError::JournalFiles(format!(
                "{} : duplicate journal number in {name}",
                dir.display()
            )));
        }
    }
    for (expected, n) in by_number.keys().enumerate() {
        if *n != expected as u32 {
            return Err(GeodexError::JournalFiles(format!(
                "{} : j._{n} : can't find its preceding file",
                dir.display()
            )));
        }
    }
    Ok(by_number.into_values().collect())
}

/// Replays journal files into the memory-mapped data files under one base
/// directory. Owns every mapping it opens for the duration of the run and
/// flushes them all before release.
pub struct RecoveryJob {
    basedir: PathBuf,
    opts: DurOptions,
    files: FxHashMap<(i32, String), MmapMut>,
    ok_to_clean_up: bool,
}

impl RecoveryJob {
    pub fn new<P: AsRef<Path>>(basedir: P, opts: DurOptions) -> Self {
        RecoveryJob {
            basedir: basedir.as_ref().to_path_buf(),
            opts,
            files: FxHashMap::default(),
            ok_to_clean_up: false,
        }
    }

    /// Whether recovery finished and the journal directory was cleaned.
    pub fn ok_to_clean_up(&self) -> bool {
        self.ok_to_clean_up
    }

    /// Replay `files` (in sequence order) to completion.
    pub fn go(&mut self, files: &[PathBuf]) -> Result<()> {
        tracing::info!("recover begin");

        for (i, path) in files.iter().enumerate() {
            let abrupt = self.process_file(path)?;
            if abrupt && i + 1 < files.len() {
                tracing::error!(
                    file = %path.display(),
                    "abrupt end to journal file, yet it isn't the last one"
                );
                self.close_files()?;
                return Err(GeodexError::JournalAbruptEnd);
            }
        }

        self.close_files()?;

        if self.opts.scan_only {
            return Err(GeodexError::ScanOnly);
        }

        tracing::info!("recover cleaning up");
        for path in files {
            fs::remove_file(path)?;
        }
        tracing::info!("recover done");
        self.ok_to_clean_up = true;
        Ok(())
    }

    /// Replay one mapped journal file. True means the file ended abruptly.
    fn process_file(&mut self, path: &Path) -> Result<bool> {
        tracing::info!(file = %path.display(), "recover");
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        self.process_buffer(&map)
    }

    fn process_buffer(&mut self, buf: &[u8]) -> Result<bool> {
        let mut iter = JournalIterator::new(buf)?;
        loop {
            let mut entries = Vec::new();
            loop {
                match iter.next() {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => break,
                    Err(GeodexError::JournalEof) => {
                        // Mid-section cutoff: the unfinished section is
                        // discarded, nothing from it was applied.
                        tracing::warn!("abrupt journal file end");
                        return Ok(true);
                    }
                    Err(e) => return Err(e),
                }
            }

            // The section parsed and its checksum held; apply it whole.
            self.apply_entries(&entries)?;

            if iter.at_eof() {
                return Ok(false);
            }
        }
    }

    fn apply_entries(&mut self, entries: &[ParsedEntry]) -> Result<()> {
        let apply = !self.opts.scan_only;
        if self.opts.dump_journal {
            tracing::info!(entries = entries.len(), "begin section");
        }
        for entry in entries {
            self.apply_entry(entry, apply)?;
        }
        if self.opts.dump_journal {
            tracing::info!("end section");
        }
        Ok(())
    }

    fn apply_entry(&mut self, entry: &ParsedEntry, apply: bool) -> Result<()> {
        if self.opts.dump_journal {
            tracing::info!(?entry, "journal entry");
        }
        if !apply {
            return Ok(());
        }

        if entry.needs_files_closed() {
            self.close_files()?;
        }

        match entry {
            ParsedEntry::Write {
                db,
                file_no,
                ofs,
                data,
            } => {
                let map = self.map_for(db, *file_no)?;
                let start = *ofs as usize;
                let end = start
                    .checked_add(data.len())
                    .filter(|&e| e <= map.len())
                    .ok_or_else(|| {
                        GeodexError::JournalFormat(format!(
                            "basic write past end of {}",
                            data_file_name(db, *file_no)
                        ))
                    })?;
                map[start..end].copy_from_slice(data);
            }
            ParsedEntry::ObjAppend {
                db,
                src_file_no,
                src_ofs,
                dst_file_no,
                dst_ofs,
                len,
            } => {
                let len = *len as usize;

                // The source may live in the same mapping as the
                // destination; stage it.
                let src = {
                    let map = self.map_for(db, *src_file_no)?;
                    let start = *src_ofs as usize;
                    let end = start
                        .checked_add(len)
                        .filter(|&e| e <= map.len())
                        .ok_or_else(|| {
                            GeodexError::JournalFormat(format!(
                                "obj-append source past end of {}",
                                data_file_name(db, *src_file_no)
                            ))
                        })?;
                    map[start..end].to_vec()
                };

                let map = self.map_for(LOCAL_DB, *dst_file_no)?;
                let dst = *dst_ofs as usize;
                // The destination must have reserved the three preamble
                // bytes before the object and one terminator after it.
                if dst < 3 || dst + len + 1 > map.len() {
                    return Err(GeodexError::JournalFormat(format!(
                        "obj-append destination out of range in {}",
                        data_file_name(LOCAL_DB, *dst_file_no)
                    )));
                }
                map[dst..dst + len].copy_from_slice(&src);
                map[dst - 3] = OBJ_FIELD_TYPE;
                map[dst - 2] = OBJ_FIELD_NAME;
                map[dst - 1] = OBJ_FIELD_PAD;
                map[dst + len] = END_OF_OBJECT;
            }
            ParsedEntry::FileCreated { path, len } => {
                let full = self.basedir.join(path);
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(&full)?;
                file.set_len(*len)?;
                tracing::info!(file = %full.display(), len, "recover created file");
            }
            ParsedEntry::DropDb { db } => {
                let prefix = format!("{db}.");
                for entry in fs::read_dir(&self.basedir)? {
                    let entry = entry?;
                    if entry
                        .file_name()
                        .to_str()
                        .map(|n| n.starts_with(&prefix))
                        .unwrap_or(false)
                    {
                        fs::remove_file(entry.path())?;
                    }
                }
                tracing::info!(db = %db, "recover dropped database files");
            }
        }
        Ok(())
    }

    /// The mapping for `(db, file_no)`, opened lazily and cached for the
    /// rest of the run. A present-but-empty destination file is fatal.
    fn map_for(&mut self, db: &str, file_no: i32) -> Result<&mut MmapMut> {
        let key = (file_no, db.to_string());
        if !self.files.contains_key(&key) {
            let name = data_file_name(db, file_no);
            let full = self.basedir.join(&name);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&full)
                .map_err(|e| {
                    tracing::error!(file = %full.display(), error = %e, "recover error opening file");
                    e
                })?;
            if file.metadata()?.len() == 0 {
                return Err(GeodexError::ZeroLengthFile(name));
            }
            let map = unsafe { MmapMut::map_mut(&file)? };
            tracing::debug!(file = %full.display(), len = map.len(), "recover opened");
            self.files.insert(key.clone(), map);
        }
        Ok(self.files.get_mut(&key).expect("inserted above"))
    }

    /// Flush every cached mapping synchronously and drop the cache.
    fn close_files(&mut self) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        tracing::info!("recover flush");
        for map in self.files.values() {
            map.flush()?;
        }
        self.files.clear();
        Ok(())
    }
}

impl Drop for RecoveryJob {
    fn drop(&mut self) {
        let _ = self.close_files();
    }
}

/// Run crash recovery: replay every journal file under `journal_dir` into
/// the data files under `basedir`, then remove the journal. A missing or
/// empty journal directory means a clean shutdown and is not an error.
pub fn recover<P: AsRef<Path>, Q: AsRef<Path>>(
    basedir: P,
    journal_dir: Q,
    opts: DurOptions,
) -> Result<()> {
    let journal_dir = journal_dir.as_ref();
    if !journal_dir.exists() {
        tracing::info!(
            dir = %journal_dir.display(),
            "journal directory does not exist, no recovery needed"
        );
        return Ok(());
    }

    let files = journal_files(journal_dir)?;
    if files.is_empty() {
        tracing::info!("no journal files present, no recovery needed");
        return Ok(());
    }

    RecoveryJob::new(basedir, opts).go(&files)
}
