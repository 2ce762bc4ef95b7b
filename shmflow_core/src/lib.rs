//! # shmflow core
//!
//! The core transport for shmflow: typed byte frames over named shared
//! memory, one writer to many readers, local-machine only.
//!
//! - **Writer**: owns a segment path, publishes frames atomically
//! - **Reader**: attaches to a segment, delivers frames to a callback
//! - **Datatype**: MIME-like descriptor carried alongside every frame
//! - **Memory**: mapped segment files and the lock-free slot ring
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shmflow_core::{ShmWriter, ShmReader, ReaderConfig};
//!
//! let mut writer = ShmWriter::with_defaults(
//!     "/tmp/some_segment",
//!     "application/x-raw,fun=yes",
//! )?;
//!
//! let reader = ShmReader::attach(
//!     ReaderConfig::new("/tmp/some_segment"),
//!     Vec::<u64>::new(),
//!     |seen, frame| seen.push(frame.seq),
//! )?;
//!
//! writer.push(b"are belong to us")?;
//! # drop(reader);
//! # Ok::<(), shmflow_core::ShmError>(())
//! ```
//!
//! ## Guarantees
//!
//! Frames are delivered to each reader in publish order; a reader that
//! falls behind under the overwrite policy sees a monotonically increasing
//! sequence with gaps, never duplicates or reordering. A push is either
//! fully visible as one atomic frame or fails with nothing observable.

pub mod datatype;
pub mod error;
pub mod memory;
pub mod reader;
pub mod writer;

mod sync;

// Re-export commonly used types for easy access
pub use datatype::Datatype;
pub use error::{ShmError, ShmResult};
pub use reader::{Frame, ReaderConfig, ReaderState, ShmReader};
pub use writer::{BackpressurePolicy, ShmWriter, WriterConfig, WriterStats};
