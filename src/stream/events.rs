//! Notifications published to stream subscribers.

use super::ConvertError;

/// Default capacity for the event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle events of an [`ImageStream`](super::ImageStream).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The process was spawned.
    Started {
        /// Process identifier.
        pid: Option<u32>,
        /// Full argument vector passed to the binary.
        args: Vec<String>,
    },
    /// The stream failed. Sent at most once per stream.
    Failed(ConvertError),
    /// The process exited.
    Exited {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
}

impl StreamEvent {
    /// Returns the error if this is a `Failed` event.
    #[must_use]
    pub fn error(&self) -> Option<&ConvertError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}
