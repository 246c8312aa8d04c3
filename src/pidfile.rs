//! Pid files marking which serve process supervises a server
//!
//! The supervising process keeps an exclusive `flock` on the file for as long
//! as it owns the Caddy process, so other invocations can tell a live owner
//! from a file left behind by a crash.

use crate::error::{Result, ServeError};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Who holds a pid file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    /// No live process holds the lock
    Nobody,
    /// A live process holds the lock; the pid is unknown until its child is spawned
    Process(Option<u32>),
}

/// Exclusively locked pid file, removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Create and lock `path`, or `None` if another live process holds it
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| ServeError::io(dir, e))?;
        }

        // The previous owner may unlink the file between our open and lock
        for _ in 0..3 {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| ServeError::io(path, e))?;

            if !try_lock(&file, true).map_err(|e| ServeError::io(path, e))? {
                debug!(path = %path.display(), "Pid file is held by another process");
                return Ok(None);
            }

            if is_linked(&file, path) {
                file.set_len(0).map_err(|e| ServeError::io(path, e))?;
                return Ok(Some(Self {
                    path: path.to_path_buf(),
                    file,
                }));
            }
        }

        Err(ServeError::io(
            path,
            std::io::Error::new(ErrorKind::Other, "pid file keeps being replaced"),
        ))
    }

    /// Record the supervised process id
    pub fn record(&mut self, pid: u32) -> Result<()> {
        writeln!(self.file, "{}", pid).map_err(|e| ServeError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
}

/// Inspect a pid file without taking ownership of it
pub fn holder(path: &Path) -> Result<Holder> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Nobody),
        Err(e) => return Err(ServeError::io(path, e)),
    };

    if try_lock(&file, false).map_err(|e| ServeError::io(path, e))? {
        debug!(path = %path.display(), "Stale pid file");
        return Ok(Holder::Nobody);
    }

    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| ServeError::io(path, e))?;
    Ok(Holder::Process(text.trim().parse().ok()))
}

/// Non-blocking `flock`; `false` if another open file holds a conflicting lock
#[cfg(unix)]
fn try_lock(file: &File, exclusive: bool) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let operation = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    let result = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.kind() == ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File, _exclusive: bool) -> std::io::Result<bool> {
    Ok(true)
}

/// Whether `path` still names the open `file`
#[cfg(unix)]
fn is_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}
