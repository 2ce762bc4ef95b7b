// Cross-platform shared memory path abstraction
//
// Linux: /dev/shm/shmflow (tmpfs - RAM-backed, fastest)
// macOS: /tmp/shmflow (regular filesystem, but still fast for IPC)

use std::path::{Path, PathBuf};

/// Get the base directory for shmflow segments
///
/// - Linux: `/dev/shm/shmflow` (tmpfs for maximum performance)
/// - macOS: `/tmp/shmflow` (no /dev/shm, but /tmp is still fast)
/// - elsewhere: `/tmp/shmflow`
pub fn segment_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/shmflow")
    }

    #[cfg(not(target_os = "linux"))]
    {
        PathBuf::from("/tmp/shmflow")
    }
}

/// Resolve a segment name to a filesystem path.
///
/// Absolute paths are used verbatim (callers may place segments anywhere,
/// e.g. `/tmp/some_segment`). Bare names land in the base directory with
/// unsafe characters replaced.
pub fn resolve_segment_path(name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let safe_name = name.replace(['/', ':'], "_");
    segment_base_dir().join(safe_name)
}
