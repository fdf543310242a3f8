//! Sandboxes: materialized service workspaces and their supervised
//! processes.

mod command;
pub mod manager;
pub mod probe;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

pub use command::prepare_run_command;
pub use manager::{RunResult, SandboxManager};
pub use probe::ProbeOutcome;

use crate::cache::CacheError;
use crate::lock;

/// Unique identifier for one sandbox instance. A new start after `dead`
/// creates a fresh sandbox record (same name, new id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sandbox lifecycle state machine.
///
/// Transitions are monotonic per sandbox instance:
/// `created -> materialized -> starting -> running -> stopping -> dead`,
/// with `dead` also reachable directly whenever the process exit is
/// observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Sandbox record exists but nothing is on disk yet.
    Created,

    /// Files and environment are on disk; no process.
    Materialized,

    /// Process launched, health not yet observed.
    Starting,

    /// Health observed; process supervised.
    Running,

    /// Graceful stop in progress.
    Stopping,

    /// Process exit observed.
    Dead {
        /// Raw exit status; negative values encode the terminating signal.
        status: Option<i32>,
    },
}

impl SandboxState {
    /// Whether a process may currently be alive for this sandbox.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether a new start must be refused for this sandbox.
    #[must_use]
    pub const fn blocks_restart(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Materialized => write!(f, "materialized"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Dead { status: Some(code) } => write!(f, "dead (status: {code})"),
            Self::Dead { status: None } => write!(f, "dead"),
        }
    }
}

/// Human name for the signal encoded in a negative raw exit status.
#[must_use]
pub fn signal_name(raw_status: i32) -> Option<&'static str> {
    match raw_status {
        -15 => Some("SIGTERM"),
        -9 => Some("SIGKILL"),
        -2 => Some("SIGINT"),
        -11 => Some("SIGSEGV"),
        -6 => Some("SIGABRT"),
        _ => None,
    }
}

/// Bounded byte buffer keeping the most recent output of a stream.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl RingBuffer {
    /// Create a buffer bounded at `cap` bytes.
    #[must_use]
    pub const fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            cap,
        }
    }

    /// Append a chunk, discarding the oldest bytes past capacity.
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&chunk[chunk.len() - self.cap..]);
            return;
        }
        self.buf.extend(chunk);
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    /// The last `n` bytes.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).copied().collect()
    }

    /// Bytes currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Shared handle to a ring buffer written by a supervision task.
pub type SharedRing = Arc<Mutex<RingBuffer>>;

/// Handle to a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// OS process ID.
    pub pid: u32,

    /// Launch time.
    pub started_at: DateTime<Utc>,

    stdout: SharedRing,
    stderr: SharedRing,
    exit: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: u32,
        stdout: SharedRing,
        stderr: SharedRing,
        exit: watch::Receiver<Option<i32>>,
    ) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            stdout,
            stderr,
            exit,
        }
    }

    /// Last observed raw exit status, if the process has exited.
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Subscribe to exit notifications.
    #[must_use]
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    /// Tail of captured stdout.
    #[must_use]
    pub fn stdout_tail(&self, n: usize) -> Vec<u8> {
        lock(&self.stdout).tail(n)
    }

    /// Tail of captured stderr.
    #[must_use]
    pub fn stderr_tail(&self, n: usize) -> Vec<u8> {
        lock(&self.stderr).tail(n)
    }
}

/// One materialized service workspace.
#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Identifier of this sandbox instance.
    pub id: SandboxId,

    /// Service name.
    pub name: String,

    /// Sandbox directory; every write stays under it.
    pub path: PathBuf,

    /// Relative paths of materialized files.
    pub files: Vec<PathBuf>,

    /// Run command taken from the artifact.
    pub run: String,

    /// Hash of the linked cached environment, if any.
    pub env_hash: Option<String>,

    /// Port assigned at start.
    pub port: Option<u16>,

    /// Environment composed at start.
    pub env: BTreeMap<String, String>,

    /// Last observed lifecycle state.
    pub state: SandboxState,

    /// Process handle once started.
    pub handle: Option<ProcessHandle>,
}

/// Event posted by a supervision task when a child exits.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    /// Service name.
    pub name: String,

    /// Raw exit status; negative values encode the terminating signal.
    pub status: i32,
}

/// Sandbox errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A start was attempted while the service is starting or running.
    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    /// The named sandbox does not exist.
    #[error("no sandbox for service '{0}'")]
    NotFound(String),

    /// The sandbox is not in a startable state.
    #[error("sandbox '{name}' cannot start from state '{state}'")]
    InvalidState {
        /// Service name.
        name: String,
        /// Observed state.
        state: SandboxState,
    },

    /// The child process could not be spawned.
    #[error("failed to spawn process for '{name}': {message}")]
    SpawnFailed {
        /// Service name.
        name: String,
        /// Spawn failure detail.
        message: String,
    },

    /// The child survived SIGKILL within the stop wait.
    #[error("service '{0}' did not exit after SIGKILL")]
    StopTimeout(String),

    /// Dependency cache failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(SandboxState::Starting.is_active());
        assert!(SandboxState::Running.blocks_restart());
        assert!(SandboxState::Stopping.is_active());
        assert!(!SandboxState::Stopping.blocks_restart());
        assert!(!SandboxState::Dead { status: Some(0) }.is_active());
        assert!(!SandboxState::Materialized.is_active());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SandboxState::Running.to_string(), "running");
        assert_eq!(
            SandboxState::Dead { status: Some(-15) }.to_string(),
            "dead (status: -15)"
        );
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(-15), Some("SIGTERM"));
        assert_eq!(signal_name(-9), Some("SIGKILL"));
        assert_eq!(signal_name(-2), Some("SIGINT"));
        assert_eq!(signal_name(3), None);
    }

    #[test]
    fn test_ring_buffer_bounds() {
        let mut ring = RingBuffer::new(8);
        ring.push_chunk(b"abcd");
        assert_eq!(ring.tail(100), b"abcd");

        ring.push_chunk(b"efghij");
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.tail(100), b"cdefghij");
        assert_eq!(ring.tail(2), b"ij");
    }

    #[test]
    fn test_ring_buffer_oversized_chunk() {
        let mut ring = RingBuffer::new(4);
        ring.push_chunk(b"0123456789");
        assert_eq!(ring.tail(100), b"6789");
    }
}
