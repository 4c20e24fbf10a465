//! Free-space checks for the archive volume

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

/// Space figures for one filesystem, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSpace {
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl DiskSpace {
    /// True iff a download of `size` still leaves `buffer` bytes free
    pub fn has_room_for(&self, size: u64, buffer: u64) -> bool {
        self.available_bytes >= size.saturating_add(buffer)
    }
}

/// Reports free space on the filesystem backing the archive directory
#[derive(Debug, Clone)]
pub struct DiskGuard {
    path: PathBuf,
}

impl DiskGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn check_available(&self) -> io::Result<DiskSpace> {
        // The directory may not exist yet; its nearest ancestor shares the mount.
        let existing = self
            .path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("/"));
        query(existing)
    }
}

#[cfg(unix)]
fn query(path: &Path) -> io::Result<DiskSpace> {
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(path).map_err(io::Error::from)?;
    let fragment = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * fragment;
    let free = stat.blocks_free() as u64 * fragment;

    Ok(DiskSpace {
        available_bytes: stat.blocks_available() as u64 * fragment,
        total_bytes: total,
        used_bytes: total.saturating_sub(free),
    })
}

#[cfg(not(unix))]
fn query(_path: &Path) -> io::Result<DiskSpace> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "disk space queries are only supported on unix",
    ))
}
