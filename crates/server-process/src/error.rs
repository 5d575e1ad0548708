//! Error types for process control and console channels

use std::time::Duration;
use thiserror::Error;

/// Unified error type for process control
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Failed to send signal to process
    #[error("failed to send signal {signal}: {reason}")]
    SignalFailed {
        /// The signal number that failed to send
        signal: i32,
        /// The reason for the signal failure
        reason: String,
    },

    /// The console channel is closed or its remote end is gone
    #[error("console channel closed: {reason}")]
    ChannelClosed {
        /// Why the channel is unusable
        reason: String,
    },

    /// A console write did not complete within its timeout
    #[error("console write timed out after {timeout:?}")]
    ChannelTimeout {
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Nix error (Unix signal handling)
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

// For convenience, re-export specific error constructors
impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create a signal failed error
    pub fn signal_failed(signal: i32, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            signal,
            reason: reason.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            reason: reason.into(),
        }
    }

    /// Returns true for channel-level failures (closed or timed out)
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed { .. } | Error::ChannelTimeout { .. }
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
