//! The consuming side of a segment.
//!
//! A `ShmReader` attaches to an existing segment, claims a reader lease, and
//! runs a dispatch thread that delivers every new frame to a user callback.
//! The payload is copied out of the segment and validated before the
//! callback sees it, so a callback can never observe a torn frame and never
//! holds a pointer into shared memory: a callback that crashes takes down
//! its own process only.

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::datatype::Datatype;
use crate::error::{ShmError, ShmResult};
use crate::memory::platform::resolve_segment_path;
use crate::memory::ring::{RawFrame, Ring};
use crate::sync::{Deadline, PARK_INTERVAL};

/// How often a blocking attach re-checks for the writer's segment.
const ATTACH_POLL: Duration = Duration::from_millis(30);

/// One delivered frame: the payload plus its datatype in raw and parsed form.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub data: Vec<u8>,
    pub datatype: String,
    pub parsed: Datatype,
}

/// Reader lifecycle. `Detached -> Attaching -> Attached -> Detached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Detached,
    Attaching,
    Attached,
}

impl ReaderState {
    fn into_u8(self) -> u8 {
        match self {
            ReaderState::Detached => 0,
            ReaderState::Attaching => 1,
            ReaderState::Attached => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReaderState::Attaching,
            2 => ReaderState::Attached,
            _ => ReaderState::Detached,
        }
    }
}

/// Reader construction parameters.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    path: PathBuf,
    attach_timeout: Duration,
}

impl ReaderConfig {
    /// Non-blocking by default: attach fails with `NotFound` immediately
    /// when no segment exists.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: resolve_segment_path(path.as_ref()),
            attach_timeout: Duration::ZERO,
        }
    }

    /// Wait up to `timeout` for a writer to appear, polling with backoff.
    pub fn attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }
}

/// A reader attached to a segment, delivering frames to its callback from a
/// dedicated dispatch thread.
///
/// Detach (explicit or on drop) is mutually exclusive with callback
/// invocation: once `detach` begins, the callback is never invoked again,
/// even for a frame already in flight. Do not call `detach` from inside the
/// callback itself.
pub struct ShmReader {
    path: PathBuf,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    /// Liveness gate; callbacks run only while it holds `true`.
    gate: Arc<Mutex<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl ShmReader {
    /// Attach to the segment at `config.path` and start dispatching frames
    /// to `callback` with `user_data`.
    pub fn attach<U, F>(config: ReaderConfig, user_data: U, callback: F) -> ShmResult<Self>
    where
        U: Send + 'static,
        F: FnMut(&mut U, &Frame) + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ReaderState::Attaching.into_u8()));
        let ring = attach_ring(&config)?;

        let default_raw = ring.default_datatype()?;
        let default_parsed = Datatype::parse(&default_raw)?;
        let baseline = ring.last_consumed();

        let stop = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(Mutex::new(true));
        state.store(ReaderState::Attached.into_u8(), Ordering::Release);

        let handle = {
            let state = state.clone();
            let stop = stop.clone();
            let gate = gate.clone();
            let path = config.path.clone();
            std::thread::Builder::new()
                .name("shmflow-reader".into())
                .spawn(move || {
                    dispatch(
                        ring,
                        user_data,
                        callback,
                        baseline,
                        default_raw,
                        default_parsed,
                        &stop,
                        &gate,
                    );
                    state.store(ReaderState::Detached.into_u8(), Ordering::Release);
                    log::debug!("reader dispatch for '{}' ended", path.display());
                })?
        };

        Ok(Self {
            path: config.path,
            state,
            stop,
            gate,
            handle: Some(handle),
        })
    }

    /// Stop delivery and release the segment. Idempotent; blocks until any
    /// in-flight callback returns, after which the callback is guaranteed
    /// never to run again.
    pub fn detach(&mut self) {
        {
            let mut live = self.gate.lock();
            *live = false;
        }
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.state
            .store(ReaderState::Detached.into_u8(), Ordering::Release);
    }

    pub fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ShmReader {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for ShmReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmReader")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Bind to the segment, honoring the attach policy: fail fast with
/// `NotFound` when non-blocking, otherwise poll until the writer's segment
/// appears or the timeout elapses.
fn attach_ring(config: &ReaderConfig) -> ShmResult<Ring> {
    let deadline = Deadline::after(config.attach_timeout);
    loop {
        match Ring::attach_reader(&config.path) {
            Ok(ring) => return Ok(ring),
            Err(ShmError::NotFound { path }) => {
                if config.attach_timeout.is_zero() {
                    return Err(ShmError::NotFound { path });
                }
                if deadline.expired() {
                    return Err(ShmError::AttachFailed {
                        path,
                        reason: format!(
                            "no writer appeared within {:?}",
                            config.attach_timeout
                        ),
                    });
                }
                std::thread::sleep(ATTACH_POLL);
            }
            Err(e) => return Err(e),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch<U, F>(
    mut ring: Ring,
    mut user_data: U,
    mut callback: F,
    baseline: u64,
    default_raw: String,
    default_parsed: Datatype,
    stop: &AtomicBool,
    gate: &Mutex<bool>,
) where
    F: FnMut(&mut U, &Frame),
{
    let mut last_seen = baseline;
    let backoff = Backoff::new();
    while !stop.load(Ordering::Acquire) {
        match ring.consume(last_seen) {
            Ok(raw) => {
                last_seen = raw.seq;
                let frame = match build_frame(raw, &default_raw, &default_parsed) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("reader on '{}' stopping: {e}", ring.path().display());
                        break;
                    }
                };
                let live = gate.lock();
                if !*live {
                    break;
                }
                callback(&mut user_data, &frame);
                drop(live);
                backoff.reset();
            }
            Err(ShmError::WouldBlock) => {
                if backoff.is_completed() {
                    std::thread::sleep(PARK_INTERVAL);
                } else {
                    backoff.snooze();
                }
            }
            Err(e) => {
                log::error!("reader on '{}' stopping: {e}", ring.path().display());
                break;
            }
        }
    }
}

fn build_frame(raw: RawFrame, default_raw: &str, default_parsed: &Datatype) -> ShmResult<Frame> {
    let (datatype, parsed) = match raw.datatype {
        Some(dt) => {
            let parsed = Datatype::parse(&dt)?;
            (dt, parsed)
        }
        None => (default_raw.to_string(), default_parsed.clone()),
    };
    Ok(Frame {
        seq: raw.seq,
        data: raw.data,
        datatype,
        parsed,
    })
}
