//! On-disk PID records for crash recovery across manager restarts

use server_process::pid_alive;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Plain-text PID file in an instance's runtime directory
///
/// Written when Running is confirmed, removed when Stopped is confirmed.
/// When the manager restarts it reads the file to decide whether a previous
/// process is still alive and can be re-attached.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// The PID file path inside an instance runtime directory
    pub fn new(instance_dir: &Path) -> Self {
        Self {
            path: instance_dir.join("instance.pid"),
        }
    }

    /// The file's path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a pid
    pub fn write(&self, pid: u32) -> io::Result<()> {
        std::fs::write(&self.path, format!("{}\n", pid))
    }

    /// Read the recorded pid, if the file exists and parses
    pub fn read(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match contents.trim().parse() {
            Ok(pid) => Some(pid),
            Err(_) => {
                warn!(path = %self.path.display(), "ignoring malformed PID file");
                None
            }
        }
    }

    /// Remove the file; missing files are not an error
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove PID file: {}", e);
            }
        }
    }

    /// Validate the record against the live process table
    ///
    /// Returns the pid when the recorded process still exists. A stale or
    /// malformed record is cleared so later operations start clean.
    pub fn recover(&self) -> Option<u32> {
        let pid = match self.read() {
            Some(pid) => pid,
            None => {
                if self.path.exists() {
                    self.remove();
                }
                return None;
            }
        };

        if pid_alive(pid) {
            debug!(path = %self.path.display(), pid, "PID file refers to a live process");
            Some(pid)
        } else {
            debug!(path = %self.path.display(), pid, "clearing stale PID file");
            self.remove();
            None
        }
    }
}
