//! Raw output events from a server process

use chrono::{DateTime, Utc};
use futures::stream::Stream;
use futures_lite::io::{AsyncBufReadExt, BufReader, Lines};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

/// A raw event from a server process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The type of event
    pub event_type: ProcessEventType,
    /// Optional data associated with the event
    pub data: Option<String>,
}

impl ProcessEvent {
    /// Create a new process event
    pub fn new(event_type: ProcessEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            data: None,
        }
    }

    /// Create a new process event with data
    pub fn new_with_data(event_type: ProcessEventType, data: String) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            data: Some(data),
        }
    }
}

/// Types of raw process events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessEventType {
    /// Process has started
    Started {
        /// OS process id of the started process
        pid: u32,
    },
    /// Log line from stdout
    Stdout,
    /// Log line from stderr
    Stderr,
}

/// Stream of output events from a spawned server process
///
/// Yields a `Started` event first, then one event per stdout/stderr line.
/// The stream ends once both pipes are closed, which happens when the
/// process exits.
pub struct OutputStream {
    instance: String,
    stdout: Option<Lines<BufReader<async_process::ChildStdout>>>,
    stderr: Option<Lines<BufReader<async_process::ChildStderr>>>,
    started_sent: bool,
    child_id: u32,
}

impl OutputStream {
    pub(crate) fn new(
        instance: String,
        child_id: u32,
        stdout: Option<async_process::ChildStdout>,
        stderr: Option<async_process::ChildStderr>,
    ) -> Self {
        Self {
            instance,
            stdout: stdout.map(|s| BufReader::new(s).lines()),
            stderr: stderr.map(|s| BufReader::new(s).lines()),
            started_sent: false,
            child_id,
        }
    }

    /// The instance name this stream belongs to
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Drain the stream to completion, logging each line under the
    /// instance's name
    ///
    /// Keeps the child from blocking on a full pipe when nobody else is
    /// consuming its output.
    pub async fn drain_to_log(mut self) {
        use futures::stream::StreamExt;
        while let Some(event) = self.next().await {
            match event.event_type {
                ProcessEventType::Stdout => {
                    debug!(instance = %self.instance, "[stdout] {}", event.data.as_deref().unwrap_or(""));
                }
                ProcessEventType::Stderr => {
                    debug!(instance = %self.instance, "[stderr] {}", event.data.as_deref().unwrap_or(""));
                }
                ProcessEventType::Started { pid } => {
                    debug!(instance = %self.instance, pid, "process output stream attached");
                }
            }
        }
        debug!(instance = %self.instance, "process output stream closed");
    }
}

impl Stream for OutputStream {
    type Item = ProcessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Send Started event first
        if !self.started_sent {
            self.started_sent = true;
            let event = ProcessEvent::new(ProcessEventType::Started { pid: self.child_id });
            return Poll::Ready(Some(event));
        }

        // Try to read from stdout
        if let Some(stdout) = &mut self.stdout {
            match Pin::new(stdout).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    let event = ProcessEvent::new_with_data(ProcessEventType::Stdout, line);
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    self.stdout = None;
                }
                Poll::Pending => {}
            }
        }

        // Try to read from stderr
        if let Some(stderr) = &mut self.stderr {
            match Pin::new(stderr).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    let event = ProcessEvent::new_with_data(ProcessEventType::Stderr, line);
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    self.stderr = None;
                }
                Poll::Pending => {}
            }
        }

        // If both streams are closed, the stream is exhausted
        if self.stdout.is_none() && self.stderr.is_none() {
            return Poll::Ready(None);
        }

        // One or both streams are still pending
        Poll::Pending
    }
}
