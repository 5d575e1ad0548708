//! Console command channels for running instances
//!
//! A console channel delivers text commands to a server's command reader.
//! Two variants exist: writing to the child's stdin stream, and writing to a
//! manager-owned named pipe the server attaches to. Both bound every write
//! with a timeout so a stalled reader can never wedge the manager, and
//! neither supports reconnection: a broken channel stays broken until the
//! next start.

use async_io::Timer;
use async_trait::async_trait;
use futures_lite::future;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Which console mechanism an instance uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleKind {
    /// Write commands to the child's stdin stream
    #[default]
    Stdin,
    /// Write commands to a named pipe the server attaches to
    Fifo,
}

/// A channel for sending text commands to a running instance
#[async_trait]
pub trait ConsoleChannel: Send {
    /// Deliver one command line, bounded by `timeout`
    ///
    /// Returns once the write has been handed to the OS, not when the server
    /// has executed the command.
    async fn send(&mut self, line: &str, timeout: Duration) -> Result<()>;

    /// Close the channel
    ///
    /// For stdin-backed consoles this sends EOF, which most servers treat as
    /// a shutdown signal, so it must only be called on a deliberate stop.
    fn close(&mut self);
}

/// Deterministic console pipe path for an instance runtime directory
///
/// Stable across restarts and collision-free across instances because each
/// instance owns its runtime directory. External tooling can attach to it
/// directly.
pub fn console_pipe_path(instance_dir: &Path) -> PathBuf {
    instance_dir.join("console.pipe")
}

/// Console channel writing to a child's stdin
pub struct StdinConsole {
    stdin: Option<async_process::ChildStdin>,
    broken: bool,
}

impl StdinConsole {
    /// Create a console around a piped child stdin
    pub fn new(stdin: async_process::ChildStdin) -> Self {
        Self {
            stdin: Some(stdin),
            broken: false,
        }
    }
}

#[async_trait]
impl ConsoleChannel for StdinConsole {
    async fn send(&mut self, line: &str, timeout: Duration) -> Result<()> {
        use futures::io::AsyncWriteExt;

        if self.broken {
            return Err(Error::channel_closed("stdin console is broken"));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::channel_closed("stdin already closed"))?;

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok::<(), Error>(())
        };
        let deadline = async {
            Timer::after(timeout).await;
            Err(Error::ChannelTimeout { timeout })
        };

        match future::or(write, deadline).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The writer may be mid-line now; refuse further sends. The
                // stdin handle itself stays open: dropping it would deliver
                // EOF, which many servers treat as a shutdown request, and
                // only a deliberate stop may do that.
                warn!("stdin console write failed: {}", e);
                self.broken = true;
                match e {
                    Error::ChannelTimeout { .. } => Err(e),
                    other => Err(Error::channel_closed(other.to_string())),
                }
            }
        }
    }

    fn close(&mut self) {
        // Dropping the writer closes the pipe and signals EOF
        self.stdin.take();
    }
}

/// Console channel writing to a manager-owned named pipe
///
/// The FIFO is created before the server starts; the server's command reader
/// opens it for reading. The write end is opened non-blocking per send so a
/// server that is not reading yet results in a bounded retry loop instead of
/// a blocked manager task.
#[cfg(unix)]
pub struct FifoConsole {
    path: PathBuf,
    broken: bool,
}

#[cfg(unix)]
impl FifoConsole {
    /// Interval between attempts to reach a not-yet-attached reader
    const RETRY_INTERVAL: Duration = Duration::from_millis(50);

    /// Create the FIFO at `path` if missing and return a console bound to it
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        use nix::sys::stat::Mode;

        let path = path.into();
        if !path.exists() {
            nix::unistd::mkfifo(&path, Mode::S_IRWXU)?;
            debug!(path = %path.display(), "created console pipe");
        }
        Ok(Self {
            path,
            broken: false,
        })
    }

    /// The pipe's filesystem path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_write(&self, line: &str) -> std::io::Result<Option<()>> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        // O_NONBLOCK makes the open fail with ENXIO while no reader is
        // attached, and short writes fail with EAGAIN instead of blocking.
        let open = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path);

        let mut pipe = match open {
            Ok(pipe) => pipe,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');

        match pipe.write_all(&framed) {
            Ok(()) => Ok(Some(())),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl ConsoleChannel for FifoConsole {
    async fn send(&mut self, line: &str, timeout: Duration) -> Result<()> {
        if self.broken {
            return Err(Error::channel_closed("console pipe is broken"));
        }

        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.try_write(line) {
                Ok(Some(())) => return Ok(()),
                Ok(None) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::ChannelTimeout { timeout });
                    }
                    Timer::after(Self::RETRY_INTERVAL).await;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), "console pipe write failed: {}", e);
                    self.broken = true;
                    return Err(Error::channel_closed(e.to_string()));
                }
            }
        }
    }

    fn close(&mut self) {
        self.broken = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove console pipe: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessHandle;

    #[test]
    fn test_console_pipe_path_is_deterministic() {
        let a = console_pipe_path(Path::new("/var/lib/manager/survival"));
        let b = console_pipe_path(Path::new("/var/lib/manager/survival"));
        assert_eq!(a, b);
        assert_eq!(a.file_name().unwrap(), "console.pipe");
    }

    #[cfg(unix)]
    #[smol_potat::test]
    async fn test_fifo_send_times_out_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = console_pipe_path(dir.path());
        let mut console = FifoConsole::create(&path).unwrap();

        let result = console
            .send("say hi", Duration::from_millis(150))
            .await;
        assert!(matches!(result, Err(Error::ChannelTimeout { .. })));
    }

    #[cfg(unix)]
    #[smol_potat::test]
    async fn test_fifo_send_reaches_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = console_pipe_path(dir.path());
        let mut console = FifoConsole::create(&path).unwrap();

        // A reader that drains one line from the pipe
        let reader_path = path.clone();
        let reader = std::thread::spawn(move || {
            use std::io::BufRead;
            let file = std::fs::File::open(reader_path).unwrap();
            let mut line = String::new();
            std::io::BufReader::new(file).read_line(&mut line).unwrap();
            line
        });

        console
            .send("say hello", Duration::from_secs(5))
            .await
            .unwrap();

        let line = reader.join().unwrap();
        assert_eq!(line, "say hello\n");
    }

    #[cfg(unix)]
    #[smol_potat::test]
    async fn test_fifo_close_removes_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = console_pipe_path(dir.path());
        let mut console = FifoConsole::create(&path).unwrap();
        assert!(path.exists());

        console.close();
        assert!(!path.exists());

        let result = console.send("say hi", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::ChannelClosed { .. })));
    }

    #[smol_potat::test]
    async fn test_stdin_console_delivers_line() {
        use futures::stream::StreamExt;

        let mut cmd = crate::command::LaunchCommand::new("cat");
        cmd.arg("-");
        let spawned = crate::process::spawn("cat-test", &cmd, true).unwrap();
        let mut handle = spawned.handle;
        let mut output = spawned.output;
        let mut console = StdinConsole::new(spawned.stdin.unwrap());

        console
            .send("say hello", Duration::from_secs(5))
            .await
            .unwrap();

        // cat echoes the line back on stdout
        let mut echoed = None;
        while let Some(event) = output.next().await {
            if event.event_type == crate::event::ProcessEventType::Stdout {
                echoed = event.data;
                break;
            }
        }
        assert_eq!(echoed.as_deref(), Some("say hello"));

        // EOF on stdin ends cat
        console.close();
        for _ in 0..100 {
            if !handle.is_alive() {
                break;
            }
            smol::Timer::after(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_alive());
    }

    #[smol_potat::test]
    async fn test_stdin_console_timeout_keeps_stdin_open() {
        let mut cmd = crate::command::LaunchCommand::new("sh");
        cmd.arg("-c").arg("sleep 1; exec cat");
        let spawned = crate::process::spawn("slow-reader", &cmd, true).unwrap();
        let mut handle = spawned.handle;
        smol::spawn(spawned.output.drain_to_log()).detach();
        let mut console = StdinConsole::new(spawned.stdin.unwrap());

        // The child is not reading yet; a line bigger than the pipe buffer
        // cannot complete and the send must time out
        let big = "a".repeat(1 << 20);
        let result = console.send(&big, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Error::ChannelTimeout { .. })));

        // The console is broken from here on
        let result = console.send("more", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::ChannelClosed { .. })));

        // But the child never saw EOF: once cat takes over it keeps running
        smol::Timer::after(Duration::from_millis(1_500)).await;
        assert!(handle.is_alive());

        // A deliberate close delivers the EOF and ends cat
        console.close();
        for _ in 0..200 {
            if !handle.is_alive() {
                break;
            }
            smol::Timer::after(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_alive());
    }

    #[smol_potat::test]
    async fn test_stdin_console_closed_send_fails() {
        let mut cmd = crate::command::LaunchCommand::new("cat");
        cmd.arg("-");
        let spawned = crate::process::spawn("cat-test", &cmd, true).unwrap();
        let mut console = StdinConsole::new(spawned.stdin.unwrap());

        console.close();
        let result = console.send("say hi", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::ChannelClosed { .. })));
    }
}
