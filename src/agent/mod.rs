//! Agent subprocess integration.
//!
//! An [`AgentClient`] is a bidirectional conduit to one long-lived `claude`
//! CLI process: send a prompt, consume the resulting event stream, close.
//! [`AgentRuntime`] is the spawning seam; the production implementation is
//! [`process::ClaudeRuntime`], tests substitute a scripted stub.

mod events;
mod options;
mod process;
pub mod rss;

pub use events::{AgentErrorKind, AgentEvent};
pub use options::AgentOptions;
pub use process::ClaudeRuntime;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Events for one chat turn, terminated by [`AgentEvent::Done`].
pub type EventStream = mpsc::Receiver<AgentEvent>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("agent io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent process is closed")]
    Closed,
}

/// One live agent subprocess bound to a session.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Send a prompt and receive the event stream for the turn. The stream
    /// always ends with [`AgentEvent::Done`].
    async fn ask(&self, prompt: &str) -> Result<EventStream, AgentError>;

    /// Cooperative close: signal the subprocess, wait a bounded grace
    /// period, then force-terminate. Never leaks the process.
    async fn close(&self);

    /// Monotonic stamp of the last prompt sent through this client.
    fn last_used(&self) -> Instant;

    /// Coarse RSS estimate of the subprocess and its descendants, in bytes.
    fn rss_bytes(&self) -> u64;
}

/// Spawning seam for agent subprocesses.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn spawn(&self, options: AgentOptions) -> Result<Arc<dyn AgentClient>, AgentError>;
}
