//! # shmflow - shared-memory frame transport
//!
//! shmflow moves typed byte frames between local processes through named
//! shared-memory segments: one writer per segment, any number of readers,
//! callback-driven delivery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shmflow::prelude::*;
//!
//! let mut writer = ShmWriter::with_defaults(
//!     "/tmp/some_segment",
//!     "application/x-raw,fun=yes",
//! )?;
//!
//! let _reader = ShmReader::attach(
//!     ReaderConfig::new("/tmp/some_segment"),
//!     (),
//!     |_, frame| println!("seq {}: {} bytes", frame.seq, frame.data.len()),
//! )?;
//!
//! writer.push(b"are belong to us")?;
//! # Ok::<(), ShmError>(())
//! ```

// Re-export core components
pub use shmflow_core::{self, *};

/// The shmflow prelude - everything you need to get started
pub mod prelude {
    pub use shmflow_core::datatype::Datatype;
    pub use shmflow_core::error::{ShmError, ShmResult};
    pub use shmflow_core::reader::{Frame, ReaderConfig, ReaderState, ShmReader};
    pub use shmflow_core::writer::{BackpressurePolicy, ShmWriter, WriterConfig, WriterStats};

    pub type Result<T> = ShmResult<T>;
}
