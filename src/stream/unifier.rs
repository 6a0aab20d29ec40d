//! Funnel for every failure source of a stream.
//!
//! The input pump, the output reader, the diagnostic reader and the process
//! supervisor all report here. The first report is kept, published once to
//! subscribers and handed once to the caller's next I/O call; everything
//! after it is dropped.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::Waker;

use futures_util::task::AtomicWaker;
use tokio::sync::broadcast;

use super::{ConvertError, StreamEvent, DEFAULT_EVENT_CHANNEL_CAPACITY};

/// A failure as reported by one of the sources.
#[derive(Debug, Clone)]
pub enum FailureSignal {
    /// Already an error value.
    Error(ConvertError),
    /// Raw bytes from the diagnostic stream.
    Diagnostic(Vec<u8>),
}

impl FailureSignal {
    /// Turn the signal into a uniform error value.
    #[must_use]
    pub fn normalize(self) -> ConvertError {
        match self {
            Self::Error(err) => err,
            Self::Diagnostic(bytes) => ConvertError::diagnostic(&bytes),
        }
    }
}

impl From<ConvertError> for FailureSignal {
    fn from(err: ConvertError) -> Self {
        Self::Error(err)
    }
}

impl From<Vec<u8>> for FailureSignal {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Diagnostic(bytes)
    }
}

impl From<&[u8]> for FailureSignal {
    fn from(bytes: &[u8]) -> Self {
        Self::Diagnostic(bytes.to_vec())
    }
}

/// How a stored failure is handed to an I/O call.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// First hand-off of the failure.
    First(ConvertError),
    /// The failure was already returned by an earlier call.
    Repeat(ConvertError),
}

#[derive(Debug, Default)]
struct ErrorSlot {
    error: Option<ConvertError>,
    /// Some subscriber or I/O call has seen the error.
    observed: bool,
    /// An I/O call has returned the error.
    returned: bool,
    /// The owning stream is gone; further reports are ignored.
    closed: bool,
}

/// First-wins error slot shared by a stream and its background tasks.
#[derive(Debug)]
pub struct ErrorUnifier {
    slot: Mutex<ErrorSlot>,
    events: broadcast::Sender<StreamEvent>,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl Default for ErrorUnifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorUnifier {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
        Self {
            slot: Mutex::new(ErrorSlot::default()),
            events,
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ErrorSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to stream events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Whether anyone is subscribed to events right now.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.events.receiver_count() > 0
    }

    /// Publish a non-failure event. Having no subscribers is fine.
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Report a failure.
    ///
    /// Returns true if this report became the stream's error; false if an
    /// earlier report won or the stream is gone.
    pub fn raise(&self, signal: impl Into<FailureSignal>) -> bool {
        let error = signal.into().normalize();
        let mut slot = self.lock();

        if slot.closed {
            tracing::trace!(error = %error, "Ignoring failure after stream was dropped");
            return false;
        }
        if let Some(first) = &slot.error {
            tracing::debug!(error = %error, first = %first, "Suppressing later failure");
            return false;
        }

        tracing::warn!(error = %error, "Image stream failed");
        if self.events.send(StreamEvent::Failed(error.clone())).is_ok() {
            slot.observed = true;
        }
        slot.error = Some(error);
        drop(slot);

        self.read_waker.wake();
        self.write_waker.wake();
        true
    }

    /// Report a failure and take the stream's error for the caller.
    ///
    /// The returned error is the first one reported, which may be an
    /// earlier failure than `signal`.
    pub fn fail(&self, signal: impl Into<FailureSignal>) -> ConvertError {
        let error = signal.into().normalize();
        self.raise(error.clone());
        match self.deliver() {
            Some(Delivery::First(first) | Delivery::Repeat(first)) => first,
            None => error,
        }
    }

    /// The stored failure, without marking it delivered.
    #[must_use]
    pub fn error(&self) -> Option<ConvertError> {
        self.lock().error.clone()
    }

    /// Returns true once a failure has been stored.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.lock().error.is_some()
    }

    /// Hand the stored failure to an I/O call.
    #[must_use]
    pub fn deliver(&self) -> Option<Delivery> {
        let mut slot = self.lock();
        let error = slot.error.clone()?;
        slot.observed = true;
        if slot.returned {
            Some(Delivery::Repeat(error))
        } else {
            slot.returned = true;
            Some(Delivery::First(error))
        }
    }

    /// Mark the slot closed and return a failure nobody observed.
    pub fn close(&self) -> Option<ConvertError> {
        let mut slot = self.lock();
        slot.closed = true;
        if slot.observed {
            None
        } else {
            slot.error.clone()
        }
    }

    pub(crate) fn register_read(&self, waker: &Waker) {
        self.read_waker.register(waker);
    }

    pub(crate) fn register_write(&self, waker: &Waker) {
        self.write_waker.register(waker);
    }
}
