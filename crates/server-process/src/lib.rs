//! # server-process
//!
//! Process-level primitives for managing externally-built game servers:
//! spawning and signalling server processes, probing liveness, draining
//! their output, and delivering console commands over a stdin stream or a
//! manager-owned named pipe.
//!
//! This crate knows nothing about instance lifecycles or state machines;
//! that lives in `instance-supervisor`.
//!
//! ## Example
//!
//! ```no_run
//! use server_process::{LaunchCommand, spawn};
//!
//! # fn example() -> server_process::Result<()> {
//! let mut command = LaunchCommand::new("java");
//! command.args(["-jar", "server.jar", "nogui"]).current_dir("/srv/survival");
//!
//! let spawned = spawn("survival", &command, true)?;
//! # Ok(())
//! # }
//! ```

mod command;
mod console;
mod error;
mod event;
mod process;

pub use command::LaunchCommand;
#[cfg(unix)]
pub use console::FifoConsole;
pub use console::{console_pipe_path, ConsoleChannel, ConsoleKind, StdinConsole};
pub use error::{Error, Result};
pub use event::{OutputStream, ProcessEvent, ProcessEventType};
#[cfg(unix)]
pub use process::AdoptedHandle;
pub use process::{pid_alive, spawn, ChildHandle, ExitStatus, ProcessHandle, Spawned};
