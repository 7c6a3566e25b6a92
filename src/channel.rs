//! Named pipe provisioning
//!
//! Every entry gets exactly one FIFO at its resolved workspace path. All FIFOs
//! are created before the archiver or any feeder starts: a pipe that appears
//! after the archiver tried to open it would leave the archiver waiting forever.

use crate::error::{PipeZipError, Result};
use crate::registry::Entry;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::debug;

/// Create parent directories and one named pipe per entry
///
/// Stops at the first failure; the caller aborts the build in that case.
pub fn provision(entries: &[Entry]) -> Result<()> {
    for entry in entries {
        if let Some(parent) = entry.pipe.parent() {
            fs::create_dir_all(parent).map_err(|source| PipeZipError::Provisioning {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        make_fifo(&entry.pipe).map_err(|source| PipeZipError::Provisioning {
            path: entry.pipe.clone(),
            source,
        })?;
    }

    debug!(count = entries.len(), "provisioned named pipes");
    Ok(())
}

/// Whether the platform can create named pipes at all
pub fn fifos_supported() -> bool {
    cfg!(unix)
}

#[cfg(unix)]
pub(crate) fn make_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub(crate) fn make_fifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are not supported on this platform",
    ))
}

/// Open the write end of a FIFO without blocking
///
/// Returns `Ok(None)` while no reader has the pipe open. The returned file is
/// in non-blocking mode, so writes report `WouldBlock` when the pipe is full.
#[cfg(unix)]
pub(crate) fn try_open_writer(path: &Path) -> io::Result<Option<File>> {
    use nix::errno::Errno;
    use nix::fcntl::OFlag;
    use std::os::unix::fs::OpenOptionsExt;

    match fs::OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
    {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
pub(crate) fn try_open_writer(_path: &Path) -> io::Result<Option<File>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are not supported on this platform",
    ))
}

/// Whether `path` is a named pipe
#[cfg(unix)]
pub fn is_fifo(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_fifo(_path: &Path) -> bool {
    false
}
