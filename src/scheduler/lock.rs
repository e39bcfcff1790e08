//! Advisory PID lock file.
//!
//! Exactly one scheduler may run against a job store. `start` publishes a
//! file holding its PID by hard-linking it into place; the file is removed
//! when the lock is dropped. A lock left behind by a dead process is reclaimed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from acquiring or inspecting the lock file.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process holds the lock.
    #[error("scheduler already running (pid {pid}, lock file {path})")]
    Held { pid: u32, path: PathBuf },

    /// The lock file could not be read or written.
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Signalling the lock holder failed.
    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A held scheduler lock. Released on drop.
#[derive(Debug)]
pub struct SchedulerLock {
    path: PathBuf,
    pid: u32,
}

impl SchedulerLock {
    /// Acquire the lock at `path`, reclaiming it if the recorded PID is dead.
    ///
    /// The PID is written to a staging file first and hard-linked into place,
    /// so the lock file never exists without its PID.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;
        }
        let pid = std::process::id();

        let mut staging = path.as_os_str().to_owned();
        staging.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let staging = PathBuf::from(staging);
        fs::write(&staging, format!("{}\n", pid)).map_err(|e| LockError::io(&staging, e))?;

        let result = Self::link_into_place(path, &staging, pid);
        if let Err(e) = fs::remove_file(&staging) {
            tracing::debug!(path = %staging.display(), error = %e, "Failed to remove staging lock file");
        }
        result
    }

    fn link_into_place(path: &Path, staging: &Path, pid: u32) -> Result<Self, LockError> {
        if let Some(lock) = Self::try_link(path, staging, pid)? {
            return Ok(lock);
        }
        Self::check_holder(path)?;

        // Reclaimers take turns, and re-check the holder once they have the
        // turn, so a fresh lock published by another reclaimer is never removed.
        let mut guard_path = path.as_os_str().to_owned();
        guard_path.push(".reclaim");
        let guard_path = PathBuf::from(guard_path);
        let _guard = lock_exclusive(&guard_path).map_err(|e| LockError::io(&guard_path, e))?;

        let stale = Self::check_holder(path)?;
        tracing::warn!(
            path = %path.display(),
            stale_pid = ?stale,
            "Reclaiming stale scheduler lock"
        );
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::io(path, e)),
        }

        match Self::try_link(path, staging, pid)? {
            Some(lock) => Ok(lock),
            None => {
                Self::check_holder(path)?;
                Err(LockError::io(
                    path,
                    io::Error::new(io::ErrorKind::AlreadyExists, "lock file contended"),
                ))
            }
        }
    }

    /// Publish the staging file at `path`. `None` if something is already there.
    fn try_link(path: &Path, staging: &Path, pid: u32) -> Result<Option<Self>, LockError> {
        match fs::hard_link(staging, path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), pid, "Acquired scheduler lock");
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    pid,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(LockError::io(path, e)),
        }
    }

    /// `Held` if a live process owns `path`, otherwise the stale PID (if any).
    fn check_holder(path: &Path) -> Result<Option<u32>, LockError> {
        match read_pid(path)? {
            Some(holder) if process_alive(holder) => Err(LockError::Held {
                pid: holder,
                path: path.to_path_buf(),
            }),
            stale => Ok(stale),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Release the lock explicitly.
    pub fn release(self) {}
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        if matches!(read_pid(&self.path), Ok(Some(pid)) if pid == self.pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
            } else {
                tracing::debug!(path = %self.path.display(), "Released scheduler lock");
            }
        }
    }
}

/// Block until this process holds an exclusive `flock` on `path`. The lock
/// is released when the returned file is closed.
#[cfg(unix)]
pub(crate) fn lock_exclusive(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::io::AsRawFd;

    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    // SAFETY: flock(2) on a descriptor owned by `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

/// Without `flock`, callers within one process must serialize themselves.
#[cfg(not(unix))]
pub(crate) fn lock_exclusive(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
}

/// Read the PID recorded in a lock file.
///
/// Returns `None` if the file is missing or does not hold a PID.
pub fn read_pid(path: impl AsRef<Path>) -> Result<Option<u32>, LockError> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockError::io(path, e)),
    }
}

/// PID of a live lock holder, if any.
pub fn running_pid(path: impl AsRef<Path>) -> Result<Option<u32>, LockError> {
    Ok(read_pid(path)?.filter(|pid| process_alive(*pid)))
}

/// Whether a process with this PID exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// Ask the process to terminate (SIGTERM).
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<(), LockError> {
    send_signal(pid, libc::SIGTERM)
}

/// Kill the process (SIGKILL).
#[cfg(unix)]
pub fn kill(pid: u32) -> Result<(), LockError> {
    send_signal(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), LockError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| LockError::Signal {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    // SAFETY: plain kill(2) on a PID read from the lock file.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(LockError::Signal {
            pid,
            reason: io::Error::last_os_error().to_string(),
        })
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<(), LockError> {
    Err(LockError::Signal {
        pid,
        reason: "signals are not supported on this platform".to_string(),
    })
}

#[cfg(not(unix))]
pub fn kill(pid: u32) -> Result<(), LockError> {
    terminate(pid)
}
