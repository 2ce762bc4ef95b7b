//! The publishing side of a segment.
//!
//! A `ShmWriter` owns the segment for its path: it creates the file, sizes
//! the ring, and publishes frames. Either a push is fully visible to every
//! current and future reader as one atomic frame, or it fails and nothing
//! is observable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::datatype::Datatype;
use crate::error::{ShmError, ShmResult};
use crate::memory::platform::resolve_segment_path;
use crate::memory::ring::{Ring, RingOptions};
use crate::sync::{wait_until, Deadline, WaitOutcome};

pub const DEFAULT_SLOT_COUNT: u32 = 8;
pub const DEFAULT_SLOT_CAPACITY: usize = 4096;

/// What the writer does when a slot it needs is still unread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Never block; the oldest frame is overwritten and lagging readers
    /// observe a gap.
    #[default]
    Overwrite,
    /// Wait until every live reader has consumed the frame being evicted,
    /// up to the timeout. On timeout the push fails with `WouldBlock` and
    /// nothing is published.
    Block { timeout: Duration },
}

/// Writer construction parameters.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    path: PathBuf,
    datatype: String,
    slot_count: u32,
    slot_capacity: usize,
    policy: BackpressurePolicy,
}

impl WriterConfig {
    pub fn new(path: impl AsRef<str>, datatype: impl Into<String>) -> Self {
        Self {
            path: resolve_segment_path(path.as_ref()),
            datatype: datatype.into(),
            slot_count: DEFAULT_SLOT_COUNT,
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            policy: BackpressurePolicy::default(),
        }
    }

    /// Number of ring slots (how far readers may lag before frames drop).
    pub fn slot_count(mut self, slot_count: u32) -> Self {
        self.slot_count = slot_count;
        self
    }

    /// Initial per-frame capacity in bytes; grows on demand.
    pub fn slot_capacity(mut self, slot_capacity: usize) -> Self {
        self.slot_capacity = slot_capacity;
        self
    }

    pub fn policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Publish-side counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub frames_pushed: u64,
    pub bytes_pushed: u64,
    pub resizes: u64,
}

/// The single writer attached to a segment path.
pub struct ShmWriter {
    ring: Ring,
    datatype: Datatype,
    policy: BackpressurePolicy,
    stats: WriterStats,
}

impl ShmWriter {
    /// Create the segment and become its writer.
    ///
    /// Fails with `AlreadyExists` when a live writer already owns the path.
    pub fn create(config: WriterConfig) -> ShmResult<Self> {
        let datatype = Datatype::parse(&config.datatype)?;
        let ring = Ring::create(
            &config.path,
            &RingOptions {
                slot_count: config.slot_count,
                slot_capacity: config.slot_capacity,
                datatype: datatype.raw().to_string(),
            },
        )?;
        Ok(Self {
            ring,
            datatype,
            policy: config.policy,
            stats: WriterStats::default(),
        })
    }

    /// Create a writer with default geometry and policy.
    pub fn with_defaults(path: impl AsRef<str>, datatype: impl Into<String>) -> ShmResult<Self> {
        Self::create(WriterConfig::new(path, datatype))
    }

    /// Publish one frame carrying the writer's default datatype. Returns the
    /// frame's sequence number.
    pub fn push(&mut self, data: &[u8]) -> ShmResult<u64> {
        self.push_frame(data, None)
    }

    /// Publish one frame with a per-frame datatype override.
    pub fn push_with_datatype(&mut self, data: &[u8], datatype: &str) -> ShmResult<u64> {
        let parsed = Datatype::parse(datatype)?;
        self.push_frame(data, Some(parsed.raw()))
    }

    fn push_frame(&mut self, data: &[u8], datatype_override: Option<&str>) -> ShmResult<u64> {
        let needed = data.len() + datatype_override.map_or(0, str::len);
        if self.ring.ensure_capacity(needed)? {
            self.stats.resizes += 1;
        }

        if let BackpressurePolicy::Block { timeout } = self.policy {
            self.wait_for_slot(self.ring.published() + 1, timeout)?;
        }

        let seq = self.ring.publish(data, datatype_override)?;
        self.stats.frames_pushed += 1;
        self.stats.bytes_pushed += data.len() as u64;
        Ok(seq)
    }

    /// Block until the slot for `seq` is free of unread data, i.e. every
    /// live reader has consumed the frame about to be evicted.
    fn wait_for_slot(&self, seq: u64, timeout: Duration) -> ShmResult<()> {
        let slot_count = self.ring.slot_count() as u64;
        if seq <= slot_count {
            return Ok(()); // slot never held a frame
        }
        let evicted = seq - slot_count;
        let outcome = wait_until(Deadline::after(timeout), || {
            self.ring
                .min_live_consumed()
                .map_or(true, |min| min >= evicted)
        });
        match outcome {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::TimedOut => {
                log::debug!(
                    "push of seq {seq} timed out waiting for readers to reach seq {evicted}"
                );
                Err(ShmError::WouldBlock)
            }
        }
    }

    /// The writer's default datatype, parsed.
    pub fn datatype(&self) -> &Datatype {
        &self.datatype
    }

    pub fn path(&self) -> &Path {
        self.ring.path()
    }

    /// Last published sequence number.
    pub fn published(&self) -> u64 {
        self.ring.published()
    }

    /// Readers currently attached with live processes.
    pub fn reader_count(&self) -> usize {
        self.ring.reader_count()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }
}

impl std::fmt::Debug for ShmWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmWriter")
            .field("path", &self.ring.path())
            .field("datatype", &self.datatype.raw())
            .field("published", &self.ring.published())
            .finish_non_exhaustive()
    }
}
