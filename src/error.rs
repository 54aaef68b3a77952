//! Error types for geodex.

use thiserror::Error;

/// Result type alias for geodex operations.
pub type Result<T> = std::result::Result<T, GeodexError>;

/// All errors surfaced by the index engine and the recovery driver.
///
/// User errors (`BadIndexSpec`, `BadValue`, `BadQuery`, `EmptyPolygon`) leave
/// all state untouched. Journal errors are fatal to the recovery run; a
/// failed section is never partially applied.
#[derive(Error, Debug)]
pub enum GeodexError {
    /// Malformed index specification (missing geo field, duplicate geo
    /// fields, geo field not first, bits out of range).
    #[error("bad index spec: {0}")]
    BadIndexSpec(String),

    /// A coordinate or parameter outside its legal domain.
    #[error("{0}")]
    BadValue(String),

    /// Malformed query document (unknown operator, missing operand).
    #[error("bad query: {0}")]
    BadQuery(String),

    /// Polygon queries need at least three vertices.
    #[error("polygon must be defined by three points or more")]
    EmptyPolygon,

    /// Journal file version does not match this build.
    #[error("journal version number mismatch {0}")]
    JournalVersion(u32),

    /// Structural problem in a journal file.
    #[error("journal format error: {0}")]
    JournalFormat(String),

    /// Section checksum did not match its recorded footer hash.
    #[error("journal checksum doesn't match, recorded: {recorded} actual: {actual}")]
    JournalChecksum { recorded: String, actual: String },

    /// A journal file other than the last one ended mid-section.
    #[error("recover abrupt journal file end")]
    JournalAbruptEnd,

    /// Ran past the end of the mapped journal bytes. Converted to
    /// [`GeodexError::JournalAbruptEnd`] by the recovery driver when it
    /// happens on a non-final file; tolerated on the last one.
    #[error("unexpected end of journal data")]
    JournalEof,

    /// Journal directory contents are not a contiguous `j._<n>` sequence.
    #[error("unexpected files in journal directory: {0}")]
    JournalFiles(String),

    /// A replay destination file existed but was empty.
    #[error("recovery error file has length zero: {0}")]
    ZeroLengthFile(String),

    /// Recovery ran in scan-only mode; the scan succeeded and the run stops
    /// here without applying anything.
    #[error("journal scan-only mode specified, not applying entries")]
    ScanOnly,

    /// The process-global interrupt flag was raised during a long scan.
    #[error("operation interrupted")]
    Interrupted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
