//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When an [`ImageStream`](crate::stream::ImageStream) spawns its process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    /// Spawn on the first read, write or close.
    #[default]
    OnFirstUse,
    /// Spawn only when output is read (or on an explicit start). Writes
    /// before that are queued.
    OnRead,
    /// Spawn while constructing the stream.
    Eager,
}

/// What to do with a failure nobody observed before the stream was dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnhandledErrorPolicy {
    /// Panic in `Drop`.
    #[default]
    Panic,
    /// Log at error level.
    Log,
}

/// Configuration for an image stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Executable to run.
    pub binary: String,
    /// Spawn trigger.
    pub start: StartPolicy,
    /// Spawn the process when input is closed before anything was written.
    pub spawn_on_empty_close: bool,
    /// Number of chunks the write queue holds before writers wait.
    pub write_queue_capacity: usize,
    /// Largest chunk accepted by a single write.
    pub max_chunk_size: usize,
    /// How long a dropped stream waits after SIGTERM before killing.
    pub terminate_timeout_ms: u64,
    /// Escalation for unobserved failures.
    pub unhandled_error: UnhandledErrorPolicy,
    /// Working directory for the process.
    pub working_dir: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            binary: "convert".to_string(),
            start: StartPolicy::OnFirstUse,
            spawn_on_empty_close: true,
            write_queue_capacity: 16,
            max_chunk_size: 64 * 1024,
            terminate_timeout_ms: 2000,
            unhandled_error: UnhandledErrorPolicy::Panic,
            working_dir: None,
        }
    }
}

impl StreamConfig {
    /// Use a different executable.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Use a different start policy.
    #[must_use]
    pub fn with_start(mut self, start: StartPolicy) -> Self {
        self.start = start;
        self
    }

    /// Use a different unhandled error policy.
    #[must_use]
    pub fn with_unhandled_error(mut self, policy: UnhandledErrorPolicy) -> Self {
        self.unhandled_error = policy;
        self
    }

    #[must_use]
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}
