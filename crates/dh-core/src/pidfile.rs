//! Single-daemon guard and pid liveness
//!
//! The daemon records its pid in `{data_dir}/devhost.pid`. A second daemon
//! pointed at the same data directory refuses to start while that pid is
//! alive; a file left behind by a dead process is taken over.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Whether `pid` names a live process
///
/// `kill(pid, 0)` failing with EPERM means the process exists but belongs to
/// another user, which still counts as alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Pid recorded in `path`, if the file exists
fn recorded_pid(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Holds the pid file for as long as the daemon runs
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
    pid: u32,
}

impl PidFileGuard {
    /// Record this process in `path` unless another live process holds it
    pub fn acquire(path: PathBuf) -> io::Result<Self> {
        let pid = std::process::id();
        match recorded_pid(&path) {
            Ok(Some(holder)) if holder != pid && is_process_alive(holder) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("another daemon is running with pid {}", holder),
                ));
            }
            Ok(Some(holder)) if holder != pid => {
                tracing::info!("Taking over PID file left by dead pid {}", holder);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Overwriting unreadable PID file {:?}: {}", path, e),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", pid))?;
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        // A newer daemon may have taken the file over
        if !matches!(recorded_pid(&self.path), Ok(Some(pid)) if pid == self.pid) {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove PID file {:?}: {}", self.path, e);
        }
    }
}
