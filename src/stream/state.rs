//! Stream lifecycle state.

use serde::{Deserialize, Serialize};

/// Observable state of an [`ImageStream`](super::ImageStream).
///
/// `Idle → Spawning → Running → Finished | Failed`. Both terminal states
/// are final; a stream runs at most one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    #[default]
    Idle,
    Spawning,
    Running,
    Finished,
    Failed,
}

impl StreamState {
    /// Returns true for `Finished` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}
