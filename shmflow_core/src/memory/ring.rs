//! Slot ring inside a mapped segment.
//!
//! The segment starts with a cache-line aligned control block holding every
//! piece of cross-process mutable state: the monotonic publish sequence, the
//! generation counter bumped around resizes, the writer's identity, and a
//! table of reader leases. Frames live in a fixed ring of slots after it.
//!
//! Slot `i` carries the frames whose sequence `s` satisfies
//! `(s - 1) % slot_count == i`. Each slot is a seqlock: the writer stamps
//! `begin_seq` before the payload and `done_seq` after it, so a reader that
//! copies the payload and then revalidates `begin_seq` (and the segment
//! generation) can reject torn reads without ever blocking the writer.

use crossbeam::utils::Backoff;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::segment::{PathLock, SegmentFile};
use crate::error::{ShmError, ShmResult};
use crate::sync::{Deadline, PARK_INTERVAL};

const SEGMENT_MAGIC: u64 = 0x53484d_464c4f57; // "SHMFLOW"
const LAYOUT_VERSION: u32 = 1;

// Safety bounds on segment geometry
pub const MAX_READERS: usize = 32;
pub const MAX_DATATYPE_LEN: usize = 256;
pub const MAX_SLOT_COUNT: usize = 1024;
pub const MAX_SLOT_CAPACITY: usize = 256 * 1024 * 1024;

const SLOT_ALIGN: usize = 64;

/// How long a reader tolerates an in-flight resize before declaring the
/// segment corrupted (writer died mid-resize).
const RESIZE_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// One reader lease in the control block.
#[repr(C, align(64))]
pub(crate) struct ReaderLease {
    pub active: AtomicU32,
    pub pid: AtomicU32,
    pub consumed: AtomicU64,
}

/// Control metadata at the head of every segment. Cache-line aligned; all
/// fields mutated after creation are atomics.
#[repr(C, align(64))]
pub(crate) struct ControlBlock {
    magic: u64,
    layout_version: u32,
    slot_count: u32,
    /// Even while stable, odd while a resize is in flight.
    pub generation: AtomicU64,
    pub slot_capacity: AtomicU64,
    /// Last published sequence; frames are numbered from 1.
    pub published: AtomicU64,
    pub writer_pid: AtomicU32,
    pub writer_attached: AtomicU32,
    datatype_len: AtomicU32,
    _pad: u32,
    datatype: [u8; MAX_DATATYPE_LEN],
    pub readers: [ReaderLease; MAX_READERS],
}

/// Per-slot seqlock header, followed by the payload bytes.
#[repr(C, align(64))]
struct SlotHeader {
    begin_seq: AtomicU64,
    done_seq: AtomicU64,
    len: AtomicU64,
    datatype_len: AtomicU32,
    _pad: u32,
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

fn ctrl_size() -> usize {
    mem::size_of::<ControlBlock>()
}

fn slot_stride(slot_capacity: usize) -> usize {
    mem::size_of::<SlotHeader>() + align_up(slot_capacity, SLOT_ALIGN)
}

fn segment_size(slot_count: u32, slot_capacity: usize) -> usize {
    ctrl_size() + slot_count as usize * slot_stride(slot_capacity)
}

pub(crate) fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but is not ours
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Geometry and metadata for a new segment.
pub(crate) struct RingOptions {
    pub slot_count: u32,
    pub slot_capacity: usize,
    pub datatype: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Writer,
    Reader { lease: usize },
    /// Attach in progress; holds no shared state yet.
    Probe,
}

/// One frame copied out of the ring.
#[derive(Debug)]
pub(crate) struct RawFrame {
    pub seq: u64,
    pub datatype: Option<String>,
    pub data: Vec<u8>,
}

enum SlotRead {
    Frame(RawFrame),
    /// Overwritten, reset, or torn; the sequence is gone for this reader.
    Skipped,
    /// The segment moved under us; remap and retry.
    Remapped,
}

/// A party's view of the ring: the mapping plus cached geometry for the
/// generation it was made at.
pub(crate) struct Ring {
    seg: SegmentFile,
    role: Role,
    slot_count: u32,
    slot_capacity: usize,
    generation: u64,
}

impl Ring {
    /// Create a segment at `path` and take writer ownership of it.
    ///
    /// Fails with `AlreadyExists` when a live writer owns the path. A stale
    /// segment left by a dead writer is reclaimed; a pre-existing file that
    /// is not a segment is left untouched and fails the create.
    pub fn create(path: &Path, opts: &RingOptions) -> ShmResult<Ring> {
        if opts.slot_count == 0 || opts.slot_count as usize > MAX_SLOT_COUNT {
            return Err(ShmError::InvalidConfig {
                detail: format!("slot count {} out of range 1..={MAX_SLOT_COUNT}", opts.slot_count),
            });
        }
        if opts.slot_capacity == 0 || opts.slot_capacity > MAX_SLOT_CAPACITY {
            return Err(ShmError::InvalidConfig {
                detail: format!(
                    "slot capacity {} out of range 1..={MAX_SLOT_CAPACITY}",
                    opts.slot_capacity
                ),
            });
        }
        if opts.datatype.len() > MAX_DATATYPE_LEN {
            return Err(ShmError::InvalidDatatype {
                detail: format!("descriptor longer than {MAX_DATATYPE_LEN} bytes"),
            });
        }

        let _create_lock = PathLock::acquire(path)?;

        if path.exists() {
            match classify_existing(path) {
                Existing::LiveWriter => {
                    return Err(ShmError::AlreadyExists {
                        path: path.to_path_buf(),
                    });
                }
                Existing::Foreign => {
                    return Err(ShmError::InvalidConfig {
                        detail: format!(
                            "'{}' exists and is not a segment file",
                            path.display()
                        ),
                    });
                }
                Existing::Stale => {
                    log::warn!("reclaiming stale segment at '{}'", path.display());
                    match std::fs::remove_file(path) {
                        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                        _ => {}
                    }
                }
            }
        }

        let slot_capacity = align_up(opts.slot_capacity, SLOT_ALIGN);
        let len = segment_size(opts.slot_count, slot_capacity);
        let mut seg = SegmentFile::create(path, len)?;

        // Plain fields are written exactly once, before finalize makes the
        // segment visible to readers.
        unsafe {
            let p = seg.as_ptr() as *mut ControlBlock;
            ptr::addr_of_mut!((*p).magic).write(SEGMENT_MAGIC);
            ptr::addr_of_mut!((*p).layout_version).write(LAYOUT_VERSION);
            ptr::addr_of_mut!((*p).slot_count).write(opts.slot_count);
            let dt_dst = ptr::addr_of_mut!((*p).datatype) as *mut u8;
            ptr::copy_nonoverlapping(opts.datatype.as_ptr(), dt_dst, opts.datatype.len());
        }
        {
            let ctrl = unsafe { &*(seg.as_ptr() as *const ControlBlock) };
            ctrl.slot_capacity.store(slot_capacity as u64, Ordering::Release);
            ctrl.datatype_len.store(opts.datatype.len() as u32, Ordering::Release);
            ctrl.writer_pid.store(std::process::id(), Ordering::Release);
            ctrl.writer_attached.store(1, Ordering::Release);
        }

        seg.finalize()?;
        log::info!(
            "created segment '{}' ({} slots x {} bytes, datatype '{}')",
            path.display(),
            opts.slot_count,
            slot_capacity,
            opts.datatype
        );

        Ok(Ring {
            seg,
            role: Role::Writer,
            slot_count: opts.slot_count,
            slot_capacity,
            generation: 0,
        })
    }

    /// Attach to an existing segment and claim a reader lease.
    ///
    /// The lease baseline is the publish sequence at attach time; the reader
    /// only ever sees frames past it.
    pub fn attach_reader(path: &Path) -> ShmResult<Ring> {
        let seg = SegmentFile::attach(path)?;
        if seg.len() < ctrl_size() {
            return Err(ShmError::AttachFailed {
                path: path.to_path_buf(),
                reason: "segment shorter than its control block".into(),
            });
        }

        let (magic, version, slot_count) = unsafe {
            let p = seg.as_ptr() as *const ControlBlock;
            ((*p).magic, (*p).layout_version, (*p).slot_count)
        };
        if magic != SEGMENT_MAGIC {
            return Err(ShmError::AttachFailed {
                path: path.to_path_buf(),
                reason: "not a shmflow segment (bad magic)".into(),
            });
        }
        if version != LAYOUT_VERSION {
            return Err(ShmError::AttachFailed {
                path: path.to_path_buf(),
                reason: format!("unsupported layout version {version}"),
            });
        }
        if slot_count == 0 || slot_count as usize > MAX_SLOT_COUNT {
            return Err(ShmError::Corrupted {
                detail: format!("slot count {slot_count} out of range"),
            });
        }

        let mut ring = Ring {
            seg,
            role: Role::Probe,
            slot_count,
            slot_capacity: 0,
            // sentinel; forces the first refresh to sync geometry
            generation: u64::MAX,
        };
        ring.refresh()?;

        let baseline = ring.ctrl().published.load(Ordering::Acquire);
        let lease = ring.claim_lease(baseline)?;
        ring.role = Role::Reader { lease };
        log::debug!(
            "attached reader lease {lease} at '{}' (baseline seq {baseline})",
            path.display()
        );
        Ok(ring)
    }

    fn ctrl(&self) -> &ControlBlock {
        unsafe { &*(self.seg.as_ptr() as *const ControlBlock) }
    }

    fn slot_base(&self, idx: usize) -> *mut u8 {
        unsafe {
            self.seg
                .as_ptr()
                .add(ctrl_size() + idx * slot_stride(self.slot_capacity))
        }
    }

    fn slot(&self, idx: usize) -> &SlotHeader {
        unsafe { &*(self.slot_base(idx) as *const SlotHeader) }
    }

    fn payload_ptr(&self, idx: usize) -> *mut u8 {
        unsafe { self.slot_base(idx).add(mem::size_of::<SlotHeader>()) }
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn path(&self) -> &Path {
        self.seg.path()
    }

    /// Last published sequence.
    pub fn published(&self) -> u64 {
        self.ctrl().published.load(Ordering::Acquire)
    }

    /// This reader's delivery baseline (its lease's consumed mark).
    pub fn last_consumed(&self) -> u64 {
        match self.role {
            Role::Reader { lease } => self.ctrl().readers[lease].consumed.load(Ordering::Acquire),
            _ => 0,
        }
    }

    /// The writer's default datatype descriptor.
    pub fn default_datatype(&self) -> ShmResult<String> {
        let ctrl = self.ctrl();
        let len = ctrl.datatype_len.load(Ordering::Acquire) as usize;
        if len > MAX_DATATYPE_LEN {
            return Err(ShmError::Corrupted {
                detail: format!("datatype length {len} exceeds the segment limit"),
            });
        }
        let mut buf = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(ctrl.datatype.as_ptr(), buf.as_mut_ptr(), len);
        }
        String::from_utf8(buf).map_err(|_| ShmError::Corrupted {
            detail: "segment datatype is not valid UTF-8".into(),
        })
    }

    /// Number of attached readers with live processes.
    pub fn reader_count(&self) -> usize {
        self.ctrl()
            .readers
            .iter()
            .filter(|r| r.active.load(Ordering::Acquire) == 1 && pid_alive(r.pid.load(Ordering::Acquire)))
            .count()
    }

    /// Smallest consumed sequence among live readers, `None` when no reader
    /// is attached. Leases held by dead processes are reclaimed on the way
    /// so one crashed reader can never hold the ring back.
    pub fn min_live_consumed(&self) -> Option<u64> {
        let mut min: Option<u64> = None;
        for (i, r) in self.ctrl().readers.iter().enumerate() {
            if r.active.load(Ordering::Acquire) != 1 {
                continue;
            }
            let pid = r.pid.load(Ordering::Acquire);
            if pid == 0 {
                continue;
            }
            if !pid_alive(pid) {
                // an attaching reader may CAS this same dead pid to its own;
                // only the party whose CAS lands gets to touch the lease
                if r
                    .pid
                    .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    r.active.store(0, Ordering::Release);
                    log::warn!("reclaimed reader lease {i} held by dead pid {pid}");
                }
                continue;
            }
            let c = r.consumed.load(Ordering::Acquire);
            min = Some(min.map_or(c, |m| m.min(c)));
        }
        min
    }

    /// Grow slot capacity so a frame of `needed` bytes fits. Returns whether
    /// a resize happened. Readers observe the generation go odd, the file
    /// grow, then the generation go even again; frames published before the
    /// resize are not replayed.
    pub fn ensure_capacity(&mut self, needed: usize) -> ShmResult<bool> {
        if needed <= self.slot_capacity {
            return Ok(false);
        }
        if needed > MAX_SLOT_CAPACITY {
            return Err(ShmError::WriteFailed {
                reason: format!("frame of {needed} bytes exceeds the {MAX_SLOT_CAPACITY} byte slot limit"),
            });
        }
        debug_assert_eq!(self.role, Role::Writer);

        let doubled = self.slot_capacity.saturating_mul(2).min(MAX_SLOT_CAPACITY);
        let new_capacity = align_up(needed.max(doubled), SLOT_ALIGN).min(MAX_SLOT_CAPACITY);
        let new_len = segment_size(self.slot_count, new_capacity);

        self.ctrl().generation.fetch_add(1, Ordering::AcqRel); // odd: resize in flight
        if let Err(e) = self.seg.grow(new_len) {
            // roll the generation back to even with the layout unchanged
            self.ctrl().generation.fetch_add(1, Ordering::Release);
            return Err(ShmError::WriteFailed {
                reason: format!("segment grow to {new_len} bytes failed: {e}"),
            });
        }
        self.slot_capacity = new_capacity;

        // Clear every slot at the new geometry so stale bytes can never
        // masquerade as frames.
        for idx in 0..self.slot_count as usize {
            let slot = self.slot(idx);
            slot.begin_seq.store(0, Ordering::Relaxed);
            slot.done_seq.store(0, Ordering::Relaxed);
            slot.len.store(0, Ordering::Relaxed);
            slot.datatype_len.store(0, Ordering::Relaxed);
        }

        self.ctrl()
            .slot_capacity
            .store(new_capacity as u64, Ordering::Release);
        let generation = self.ctrl().generation.fetch_add(1, Ordering::Release) + 1;
        log::info!(
            "segment '{}' resized to {} byte slots (generation {generation})",
            self.seg.path().display(),
            new_capacity
        );
        Ok(true)
    }

    /// Publish one frame. Writer-only; the caller has already sized the ring
    /// and applied its backpressure policy.
    pub fn publish(&mut self, data: &[u8], datatype_override: Option<&str>) -> ShmResult<u64> {
        debug_assert_eq!(self.role, Role::Writer);
        let dt = datatype_override.unwrap_or("");
        let needed = data.len() + dt.len();
        if needed > self.slot_capacity {
            return Err(ShmError::WriteFailed {
                reason: format!(
                    "frame of {needed} bytes exceeds slot capacity {}",
                    self.slot_capacity
                ),
            });
        }

        let seq = self.ctrl().published.load(Ordering::Relaxed) + 1;
        let idx = ((seq - 1) % self.slot_count as u64) as usize;
        let slot = self.slot(idx);

        // Seqlock write side: stamp begin, fence, payload, stamp done.
        slot.begin_seq.store(seq, Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe {
            let payload = self.payload_ptr(idx);
            ptr::copy_nonoverlapping(dt.as_ptr(), payload, dt.len());
            ptr::copy_nonoverlapping(data.as_ptr(), payload.add(dt.len()), data.len());
        }
        slot.datatype_len.store(dt.len() as u32, Ordering::Relaxed);
        slot.len.store(data.len() as u64, Ordering::Relaxed);
        slot.done_seq.store(seq, Ordering::Release);

        self.ctrl().published.store(seq, Ordering::Release);
        Ok(seq)
    }

    /// Return the next frame with sequence past `last_seen`.
    ///
    /// A reader that fell behind skips overwritten frames and sees a
    /// monotonically increasing sequence with gaps; it never sees the same
    /// sequence twice or out of order. `WouldBlock` when nothing newer is
    /// deliverable yet.
    pub fn consume(&mut self, last_seen: u64) -> ShmResult<RawFrame> {
        loop {
            self.refresh()?;
            let published = self.ctrl().published.load(Ordering::Acquire);
            if published < last_seen {
                return Err(ShmError::Corrupted {
                    detail: format!("publish sequence regressed from {last_seen} to {published}"),
                });
            }
            if published == last_seen {
                return Err(ShmError::WouldBlock);
            }

            let oldest = published.saturating_sub(self.slot_count as u64 - 1).max(1);
            let mut next = (last_seen + 1).max(oldest);
            let mut remapped = false;
            while next <= published {
                match self.try_read_slot(next)? {
                    SlotRead::Frame(frame) => {
                        self.note_consumed(frame.seq);
                        return Ok(frame);
                    }
                    SlotRead::Skipped => next += 1,
                    SlotRead::Remapped => {
                        remapped = true;
                        break;
                    }
                }
            }
            if remapped {
                continue;
            }
            // Every candidate was overwritten or reset under us; those
            // sequences are gone for this reader.
            self.note_consumed(published);
            return Err(ShmError::WouldBlock);
        }
    }

    fn try_read_slot(&self, seq: u64) -> ShmResult<SlotRead> {
        let idx = ((seq - 1) % self.slot_count as u64) as usize;
        let slot = self.slot(idx);
        if slot.done_seq.load(Ordering::Acquire) != seq {
            return Ok(SlotRead::Skipped);
        }
        let len = slot.len.load(Ordering::Relaxed);
        let dt_len = u64::from(slot.datatype_len.load(Ordering::Relaxed));
        let total = match len.checked_add(dt_len) {
            Some(total) if total <= self.slot_capacity as u64 => total as usize,
            // the capacity only ever grows, so out-of-bounds metadata under
            // an unchanged generation cannot be a writer race
            _ => {
                return if self.ctrl().generation.load(Ordering::Acquire) != self.generation {
                    Ok(SlotRead::Remapped)
                } else {
                    Err(ShmError::Corrupted {
                        detail: format!(
                            "slot {idx} metadata out of bounds (len {len}, datatype len {dt_len})"
                        ),
                    })
                };
            }
        };
        let dt_len = dt_len as usize;

        let mut buf = vec![0u8; total];
        unsafe {
            ptr::copy_nonoverlapping(self.payload_ptr(idx) as *const u8, buf.as_mut_ptr(), total);
        }
        fence(Ordering::Acquire);
        if slot.begin_seq.load(Ordering::Relaxed) != seq {
            return Ok(SlotRead::Skipped);
        }
        if self.ctrl().generation.load(Ordering::Relaxed) != self.generation {
            return Ok(SlotRead::Remapped);
        }

        let data = buf.split_off(dt_len);
        let datatype = if dt_len == 0 {
            None
        } else {
            Some(String::from_utf8(buf).map_err(|_| ShmError::Corrupted {
                detail: "frame datatype is not valid UTF-8".into(),
            })?)
        };
        Ok(SlotRead::Frame(RawFrame { seq, datatype, data }))
    }

    /// Re-sync the mapping after a resize. No-op while the generation is
    /// unchanged; waits out an in-flight resize, bounded by a stall timeout.
    fn refresh(&mut self) -> ShmResult<()> {
        if self.ctrl().generation.load(Ordering::Acquire) == self.generation {
            return Ok(());
        }
        let deadline = Deadline::after(RESIZE_STALL_TIMEOUT);
        let backoff = Backoff::new();
        loop {
            let generation = self.ctrl().generation.load(Ordering::Acquire);
            if generation % 2 == 1 {
                if deadline.expired() {
                    return Err(ShmError::Corrupted {
                        detail: "resize stalled (generation stuck odd)".into(),
                    });
                }
                if backoff.is_completed() {
                    std::thread::sleep(PARK_INTERVAL);
                } else {
                    backoff.snooze();
                }
                continue;
            }
            self.seg.remap()?;
            let capacity = self.ctrl().slot_capacity.load(Ordering::Acquire) as usize;
            if self.ctrl().generation.load(Ordering::Acquire) != generation {
                continue; // moved again under us
            }
            let need = segment_size(self.slot_count, capacity);
            if self.seg.len() < need {
                return Err(ShmError::Corrupted {
                    detail: format!("segment shorter than its layout ({} < {need})", self.seg.len()),
                });
            }
            self.slot_capacity = capacity;
            self.generation = generation;
            return Ok(());
        }
    }

    fn note_consumed(&self, seq: u64) {
        if let Role::Reader { lease } = self.role {
            self.ctrl().readers[lease].consumed.store(seq, Ordering::Release);
        }
    }

    fn claim_lease(&self, baseline: u64) -> ShmResult<usize> {
        let my_pid = std::process::id();
        for (i, r) in self.ctrl().readers.iter().enumerate() {
            if r
                .active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                r.consumed.store(baseline, Ordering::Release);
                r.pid.store(my_pid, Ordering::Release);
                return Ok(i);
            }
            let pid = r.pid.load(Ordering::Acquire);
            if pid != 0 && pid != my_pid && !pid_alive(pid) {
                if r
                    .pid
                    .compare_exchange(pid, my_pid, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    r.consumed.store(baseline, Ordering::Release);
                    r.active.store(1, Ordering::Release);
                    log::warn!("reader lease {i} reclaimed from dead pid {pid}");
                    return Ok(i);
                }
            }
        }
        Err(ShmError::AttachFailed {
            path: self.seg.path().to_path_buf(),
            reason: format!("reader table full ({MAX_READERS} leases)"),
        })
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        match self.role {
            Role::Writer => {
                self.ctrl().writer_attached.store(0, Ordering::Release);
            }
            Role::Reader { lease } => {
                let r = &self.ctrl().readers[lease];
                r.pid.store(0, Ordering::Release);
                r.active.store(0, Ordering::Release);
            }
            Role::Probe => {}
        }
    }
}

/// What a pre-existing file at a segment path turns out to be.
enum Existing {
    /// A segment whose writer process is still alive.
    LiveWriter,
    /// A segment abandoned by a dead writer; safe to reclaim.
    Stale,
    /// Not a segment at all; never deleted.
    Foreign,
}

fn classify_existing(path: &Path) -> Existing {
    let seg = match SegmentFile::attach(path) {
        Ok(seg) => seg,
        Err(_) => return Existing::Foreign,
    };
    if seg.len() < ctrl_size() {
        return Existing::Foreign;
    }
    let ctrl = unsafe { &*(seg.as_ptr() as *const ControlBlock) };
    if ctrl.magic != SEGMENT_MAGIC {
        return Existing::Foreign;
    }
    if ctrl.writer_attached.load(Ordering::Acquire) == 1
        && pid_alive(ctrl.writer_pid.load(Ordering::Acquire))
    {
        Existing::LiveWriter
    } else {
        Existing::Stale
    }
}
