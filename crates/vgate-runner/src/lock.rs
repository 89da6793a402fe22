use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use vgate_core::{ensure_dir, Result, VerifyError};

/// Identity of the run holding the full-mode lock, stored in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub story_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub host: String,
    pub cwd: PathBuf,
}

impl LockHolder {
    pub fn current(story_id: &str) -> Self {
        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let cwd = std::env::current_dir().unwrap_or_default();
        Self {
            story_id: story_id.to_string(),
            pid: std::process::id(),
            started_at: Utc::now(),
            host,
            cwd,
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "story {} (pid {} on {}, since {}, cwd {})",
            self.story_id,
            self.pid,
            self.host,
            self.started_at.to_rfc3339(),
            self.cwd.display()
        )
    }
}

/// A held run-scoped lock. The kernel drops the `flock` when the descriptor
/// closes, including on abnormal process exit.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
    holder: LockHolder,
}

#[derive(Debug)]
pub enum LockAttempt {
    Acquired(RunLock),
    Blocked(Option<LockHolder>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held(LockHolder),
    /// Metadata left by a process that no longer exists.
    Stale(LockHolder),
}

impl RunLock {
    pub fn try_acquire(path: &Path, holder: LockHolder) -> Result<LockAttempt> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| VerifyError::io(path, e))?;
        if !try_flock_exclusive(&file).map_err(|e| VerifyError::io(path, e))? {
            let current = read_holder_from(&mut file);
            tracing::info!(path = %path.display(), holder = ?current, "run lock is held elsewhere");
            return Ok(LockAttempt::Blocked(current));
        }

        let payload = serde_json::to_vec(&holder).map_err(|e| VerifyError::MalformedArtifact {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let write = |file: &mut File| -> io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&payload)?;
            file.write_all(b"\n")?;
            file.sync_all()
        };
        write(&mut file).map_err(|e| VerifyError::io(path, e))?;
        tracing::info!(path = %path.display(), story_id = %holder.story_id, "run lock acquired");
        Ok(LockAttempt::Acquired(RunLock {
            file,
            path: path.to_path_buf(),
            holder,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            tracing::warn!(path = %self.path.display(), "failed to clear lock metadata: {}", e);
        }
        tracing::info!(path = %self.path.display(), "run lock released");
    }
}

/// Holder recorded in the lock file, if any. Does not take the lock.
pub fn read_holder(path: &Path) -> Result<Option<LockHolder>> {
    match File::open(path) {
        Ok(mut file) => Ok(read_holder_from(&mut file)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VerifyError::io(path, e)),
    }
}

/// Reports who holds the lock by checking whether the recorded pid is alive.
/// Probing with `flock` would make a concurrent acquirer see contention.
pub fn lock_status(path: &Path) -> Result<LockStatus> {
    Ok(match read_holder(path)? {
        None => LockStatus::Free,
        Some(holder) if pid_alive(holder.pid) => LockStatus::Held(holder),
        Some(holder) => LockStatus::Stale(holder),
    })
}

fn read_holder_from(file: &mut File) -> Option<LockHolder> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

#[allow(unsafe_code)]
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` comes from an open `std::fs::File` that outlives this call,
    // and `LOCK_EX | LOCK_NB` is a valid `flock` operation.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // EPERM: the process exists under another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
