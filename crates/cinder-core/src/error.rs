//! Error types for the command surface.
//!
//! `Display` bodies are the exact wire error strings; the reply encoder
//! forwards them verbatim.

use thiserror::Error;

/// Errors surfaced to the caller by keyspace commands.
///
/// Internal invariant violations (removing an expiry with no index entry,
/// overwriting a missing key, a mismatched snapshot release) are not
/// represented here: those are programmer errors and abort via assertion,
/// because the alternative is silent corruption.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unknown option or malformed argument list.
    #[error("syntax error")]
    Syntax,

    /// Wrong number of arguments for a known command.
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    /// Database index outside `[0, dbnum)` in SELECT, MOVE or SWAPDB.
    #[error("DB index is out of range")]
    DbIndexOutOfRange,

    /// A value that should have been an integer was not.
    #[error("value is not an integer or out of range")]
    NotAnInteger,

    /// Source key missing in RENAME.
    #[error("no such key")]
    NoSuchKey,

    /// MOVE with identical source and destination database.
    #[error("source and destination objects are the same")]
    SameObject,

    /// Command rejected because cluster mode is enabled.
    #[error("{0} is not allowed in cluster mode")]
    ClusterForbidden(&'static str),

    /// Non-numeric or overflowing SCAN cursor.
    #[error("invalid cursor")]
    InvalidCursor,

    /// Operation against a key holding the wrong kind of value.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
}
