//! Process handles, spawning and liveness probing

use async_process::Stdio;
use tracing::debug;

use crate::command::LaunchCommand;
use crate::error::{Error, Result};
use crate::event::OutputStream;

/// A handle to control a running server process
///
/// Implemented both by handles to child processes this manager spawned and
/// by handles adopted from a PID file after a manager restart. Liveness is
/// probed, not awaited, so the same interface works for both.
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> Option<u32>;

    /// Check whether the process is still running without blocking
    fn is_alive(&mut self) -> bool;

    /// Exit status observed by a previous `is_alive` call, if the process
    /// has terminated
    fn last_exit(&self) -> Option<ExitStatus>;

    /// Send SIGTERM (or equivalent) for graceful shutdown
    fn terminate(&mut self) -> Result<()>;

    /// Send SIGKILL (or equivalent) to forcefully stop the process
    fn kill(&mut self) -> Result<()>;
}

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    #[cfg(unix)]
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        #[cfg(unix)]
        {
            self.signal.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
        }
    }
}

/// Everything produced by a successful spawn
pub struct Spawned {
    /// Handle for controlling the child
    pub handle: ChildHandle,
    /// Stream of stdout/stderr output
    pub output: OutputStream,
    /// The child's stdin writer, present when stdin was piped
    pub stdin: Option<async_process::ChildStdin>,
}

/// Spawn a server process from a launch command
///
/// stdout and stderr are always piped so the caller can drain them; stdin is
/// piped only when `pipe_stdin` is set (stdin-console instances), otherwise
/// the child inherits a null stdin.
pub fn spawn(instance: &str, command: &LaunchCommand, pipe_stdin: bool) -> Result<Spawned> {
    debug!(instance, command = %command, "spawning server process");

    let mut cmd = command.prepare();
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(if pipe_stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::spawn_failed(format!("{}: {}", command, e)))?;

    let child_id = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();

    let output = OutputStream::new(instance.to_string(), child_id, stdout, stderr);
    let handle = ChildHandle {
        child,
        exit: None,
        kill_on_drop: true,
    };

    Ok(Spawned {
        handle,
        output,
        stdin,
    })
}

/// A handle to a child process spawned by this manager
pub struct ChildHandle {
    child: async_process::Child,
    exit: Option<ExitStatus>,
    kill_on_drop: bool,
}

impl ChildHandle {
    /// Disarm the kill-on-drop safety net
    ///
    /// Called once ownership of the process is recorded elsewhere (PID file
    /// written, supervisor state updated) so dropping the handle during a
    /// deliberate detach does not take the server down.
    pub fn detach_on_drop(&mut self) {
        self.kill_on_drop = false;
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_status() {
            Ok(Some(status)) => {
                self.exit = Some(status.into());
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    fn last_exit(&self) -> Option<ExitStatus> {
        self.exit
    }

    fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            signal::kill(pid, Signal::SIGTERM)
                .map_err(|e| Error::signal_failed(15, e.to_string()))?;
        }

        #[cfg(not(unix))]
        {
            self.child
                .kill()
                .map_err(|e| Error::signal_failed(-1, e.to_string()))?;
        }

        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            signal::kill(pid, Signal::SIGKILL).map_err(|e| Error::signal_failed(9, e.to_string()))?;
        }

        #[cfg(not(unix))]
        {
            self.child
                .kill()
                .map_err(|e| Error::signal_failed(-1, e.to_string()))?;
        }

        Ok(())
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if self.kill_on_drop && self.exit.is_none() {
            // Synchronous kill, not the trait method: the handle may be
            // dropped outside any async context.
            let _ = self.child.kill();
        }
    }
}

/// A handle to a process adopted from a PID file
///
/// The process is not our child, so liveness is probed with signal 0 and no
/// exit status is ever observable.
#[cfg(unix)]
pub struct AdoptedHandle {
    pid: u32,
    seen_dead: bool,
}

#[cfg(unix)]
impl AdoptedHandle {
    /// Create a handle for an existing process id
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            seen_dead: false,
        }
    }
}

#[cfg(unix)]
impl ProcessHandle for AdoptedHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        if self.seen_dead {
            return false;
        }
        if pid_alive(self.pid) {
            true
        } else {
            self.seen_dead = true;
            false
        }
    }

    fn last_exit(&self) -> Option<ExitStatus> {
        // Exit status of a non-child is not observable
        None
    }

    fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM)
            .map_err(|e| Error::signal_failed(15, e.to_string()))
    }

    fn kill(&mut self) -> Result<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL)
            .map_err(|e| Error::signal_failed(9, e.to_string()))
    }
}

/// Probe whether a process with the given pid exists
///
/// Uses signal 0, which performs permission and existence checks without
/// delivering anything.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Probe whether a process with the given pid exists
#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
