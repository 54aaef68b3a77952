//! Write-ahead journal: on-disk format, section writer, and crash
//! recovery.
//!
//! A journal file `j._<n>` is a fixed header followed by a run of
//! sections, each one group commit: a section header, a sequence of
//! entries, and a footer whose MD5 covers everything from the start of the
//! section header up to the footer itself. Sections are padded to a fixed
//! alignment. All integers are host-endian; journals do not cross endian
//! boundaries.
//!
//! Entry framing is a single leading word: values below
//! [`MIN_WRITE_LEN`] are reserved opcodes, anything at or above it is the
//! payload length of a basic write.

mod recover;
mod writer;

pub use recover::{recover, JournalIterator, ParsedEntry, RecoveryJob};
pub use writer::{JournalEntry, JournalWriter};

/// Magic bytes opening every journal file.
pub const JOURNAL_MAGIC: [u8; 8] = *b"gdxjrnl\0";

/// Current journal format version.
pub const JOURNAL_VERSION: u32 = 1;

/// Sections are padded so each starts on this boundary. The file header
/// block is padded to the same size.
pub const ALIGNMENT: usize = 8192;

/// Longest database name a `DbContext` entry may carry, including nothing
/// beyond the name itself (the NUL terminator is extra).
pub const MAX_DB_NAME: usize = 128;

/// File-number sentinel denoting the namespace-metadata file (`<db>.ns`).
pub const DOT_NS_SUFFIX: i32 = -1;

/// End of section; followed by the 16-byte section hash.
pub const OP_FOOTER: u32 = 1;
/// A file-creation record: length then NUL-terminated relative path.
pub const OP_FILE_CREATED: u32 = 2;
/// Drop a database: NUL-terminated name.
pub const OP_DROP_DB: u32 = 3;
/// Sticky database context for the basic writes that follow, reset at each
/// section boundary: NUL-terminated name.
pub const OP_DB_CONTEXT: u32 = 4;
/// Copy bytes between data files and stamp the object-field framing.
pub const OP_OBJ_APPEND: u32 = 5;

/// Entry words at or above this value are basic-write payload lengths;
/// everything below is reserved for opcodes. The writer refuses shorter
/// payloads so the two ranges cannot collide.
pub const MIN_WRITE_LEN: u32 = 8;

/// Size of the file header fields (the block is padded to [`ALIGNMENT`]).
pub const HEADER_LEN: usize = 16;

/// Section header: section length, reserved word, sequence number.
pub const SECT_HEADER_LEN: usize = 16;

/// Section footer: the [`OP_FOOTER`] word plus the MD5 digest.
pub const SECT_FOOTER_LEN: usize = 4 + 16;

/// Object-append destination framing: the three bytes stamped immediately
/// before the copied object and the terminator stamped after it.
pub const OBJ_FIELD_TYPE: u8 = 3;
pub const OBJ_FIELD_NAME: u8 = b'o';
pub const OBJ_FIELD_PAD: u8 = 0;
pub const END_OF_OBJECT: u8 = 0;

/// Data-file name for `(db, file_no)`: `<db>.ns` for the namespace file,
/// `<db>.<n>` otherwise.
pub fn data_file_name(db: &str, file_no: i32) -> String {
    if file_no == DOT_NS_SUFFIX {
        format!("{db}.ns")
    } else {
        format!("{db}.{file_no}")
    }
}

/// Round `pos` up to the next alignment boundary.
pub(crate) fn align_up(pos: usize) -> usize {
    pos.div_ceil(ALIGNMENT) * ALIGNMENT
}
