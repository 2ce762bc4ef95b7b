//! Memory-mapped segment files.
//!
//! A segment is a plain file in a tmpfs-backed directory, mapped read-write
//! by every attached party. The owner (the writer) creates it exclusively
//! and unlinks it on release; readers only ever open what already exists.

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{ShmError, ShmResult};

/// Advisory lock serializing segment creation for one path.
///
/// Two processes creating the same path would otherwise race the
/// exists/probe/reclaim sequence and both end up believing they own the
/// segment. The lock file stays behind after release; the kernel drops the
/// flock itself when the holder exits, so a crashed creator never wedges
/// the path.
pub(crate) struct PathLock {
    _file: File,
}

impl PathLock {
    pub fn acquire(path: &Path) -> ShmResult<Self> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(ShmError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        Ok(Self { _file: file })
    }
}

/// A mapped segment file.
///
/// Creation is two-phase: the owner writes the control block into a hidden
/// temp file, then `finalize` renames it into place so attaching readers
/// never observe a half-initialized header.
#[derive(Debug)]
pub struct SegmentFile {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    tmp_path: Option<PathBuf>,
    len: usize,
    owner: bool,
}

impl SegmentFile {
    /// Create a new segment file of `len` bytes, not yet visible at `path`.
    pub fn create(path: &Path, len: usize) -> ShmResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = PathBuf::from(format!(
            "{}.{}.tmp",
            path.display(),
            std::process::id()
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.set_len(len as u64)?;

        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            tmp_path: Some(tmp_path),
            len,
            owner: true,
        })
    }

    /// Publish a freshly created segment at its final path.
    pub fn finalize(&mut self) -> ShmResult<()> {
        if let Some(tmp) = self.tmp_path.take() {
            std::fs::rename(&tmp, &self.path)?;
            log::debug!("segment published at {}", self.path.display());
        }
        Ok(())
    }

    /// Map an existing segment file.
    pub fn attach(path: &Path) -> ShmResult<Self> {
        if !path.exists() {
            return Err(ShmError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            tmp_path: None,
            len,
            owner: false,
        })
    }

    /// Grow the file and remap. Owner-only; callers bracket this with the
    /// generation counter so readers can detect the move.
    pub fn grow(&mut self, new_len: usize) -> ShmResult<()> {
        self.file.set_len(new_len as u64)?;
        self.mmap = unsafe { MmapOptions::new().len(new_len).map_mut(&self.file)? };
        self.len = new_len;
        Ok(())
    }

    /// Re-open and remap the file at its current on-disk size.
    ///
    /// Reader-side only: the previous mapping is dropped without unlinking.
    pub fn remap(&mut self) -> ShmResult<()> {
        debug_assert!(!self.owner);
        let fresh = SegmentFile::attach(&self.path)?;
        *self = fresh;
        Ok(())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        if let Some(tmp) = self.tmp_path.take() {
            // never finalized; leave no debris behind
            let _ = std::fs::remove_file(tmp);
        } else if self.owner {
            log::debug!("segment unlinked at {}", self.path.display());
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
