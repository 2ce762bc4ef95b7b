//! Error taxonomy for the shmflow transport.
//!
//! Transport and OS errors surface to the caller of `push`, `attach` and
//! construction. Callback-local failures are never propagated into the
//! transport.

use std::path::PathBuf;

pub type ShmResult<T> = Result<T, ShmError>;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// A live writer already owns this segment path.
    #[error("segment '{path}' already has a live writer")]
    AlreadyExists { path: PathBuf },

    /// No segment exists at this path.
    #[error("no segment found at '{path}'")]
    NotFound { path: PathBuf },

    /// Reader could not bind to the segment.
    #[error("attach to '{path}' failed: {reason}")]
    AttachFailed { path: PathBuf, reason: String },

    /// Nothing available in non-blocking mode, or a blocking wait timed out.
    #[error("operation would block")]
    WouldBlock,

    /// Underlying OS primitive failure while publishing.
    #[error("write failed: {reason}")]
    WriteFailed { reason: String },

    /// Generation or sequence invariants violated in the shared segment.
    #[error("segment corrupted: {detail}")]
    Corrupted { detail: String },

    /// Malformed datatype descriptor.
    #[error("invalid datatype: {detail}")]
    InvalidDatatype { detail: String },

    /// Rejected writer/reader configuration.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
