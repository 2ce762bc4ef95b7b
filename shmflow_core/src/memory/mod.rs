//! # Shared memory internals for shmflow
//!
//! - **platform**: where segment files live on each OS
//! - **segment**: memory-mapped segment files with owner semantics
//! - **ring**: the slot ring and its cross-process control block
//!
//! All cross-process mutable state lives in the control block and is only
//! touched through atomic operations; payload copies are validated with a
//! per-slot seqlock plus the segment generation counter.

pub mod platform;
pub(crate) mod ring;
pub(crate) mod segment;

pub use platform::{resolve_segment_path, segment_base_dir};
pub use ring::{MAX_DATATYPE_LEN, MAX_READERS, MAX_SLOT_CAPACITY, MAX_SLOT_COUNT};
