//! Unified stream error type.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::process::SpawnError;

/// Every way an [`ImageStream`](super::ImageStream) can fail.
///
/// Cheap to clone: I/O sources are shared, so a single failure can be handed
/// to event subscribers and to the caller's next I/O call alike.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConvertError {
    /// The process could not be started.
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: Arc<SpawnError>,
    },

    /// The process wrote to its diagnostic stream. The message is the
    /// tool's own text.
    #[error("{0}")]
    Diagnostic(String),

    /// The process exited unsuccessfully.
    #[error("{}", exit_message(.binary, .code, .diagnostics))]
    Exit {
        binary: String,
        code: Option<i32>,
        diagnostics: String,
    },

    /// Writing to the process input failed.
    #[error("failed writing process input: {0}")]
    Input(#[source] Arc<io::Error>),

    /// Reading the process output failed.
    #[error("failed reading process output: {0}")]
    Output(#[source] Arc<io::Error>),

    /// Reading the diagnostic stream failed.
    #[error("failed reading process diagnostics: {0}")]
    DiagnosticPipe(#[source] Arc<io::Error>),

    /// Waiting for the process failed.
    #[error("failed waiting for process: {0}")]
    Wait(#[source] Arc<io::Error>),

    /// The spawned process did not expose its pipes.
    #[error("process pipes unavailable")]
    PipesUnavailable,

    /// Reading a source file failed.
    #[error("failed to read {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// Writing a sink file failed.
    #[error("failed to write {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// An operation was attempted after the stream failed.
    #[error("stream already failed: {0}")]
    AlreadyFailed(Box<ConvertError>),

    /// A write was attempted after the stream finished.
    #[error("stream already finished")]
    Finished,

    /// A write was attempted after input was closed.
    #[error("write after input was closed")]
    InputClosed,
}

fn exit_message(binary: &str, code: &Option<i32>, diagnostics: &str) -> String {
    let status = code.map_or_else(|| "a signal".to_string(), |code| format!("status {code}"));
    if diagnostics.is_empty() {
        format!("{binary} exited with {status}")
    } else {
        format!("{binary} exited with {status}: {diagnostics}")
    }
}

impl ConvertError {
    pub(crate) fn spawn(binary: &str, err: SpawnError) -> Self {
        Self::Spawn {
            binary: binary.to_string(),
            source: Arc::new(err),
        }
    }

    /// Normalize raw diagnostic output into an error.
    #[must_use]
    pub fn diagnostic(bytes: &[u8]) -> Self {
        Self::Diagnostic(String::from_utf8_lossy(bytes).trim().to_string())
    }

    /// The `io::ErrorKind` this error travels as through `AsyncRead`/`AsyncWrite`.
    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::Input(e) | Self::Output(e) | Self::DiagnosticPipe(e) | Self::Wait(e) => e.kind(),
            Self::Source { source, .. } | Self::Sink { source, .. } => source.kind(),
            Self::Spawn { source, .. } => match source.as_ref() {
                SpawnError::NotFound => io::ErrorKind::NotFound,
                SpawnError::PermissionDenied => io::ErrorKind::PermissionDenied,
                SpawnError::Io(e) => e.kind(),
            },
            Self::InputClosed => io::ErrorKind::BrokenPipe,
            Self::AlreadyFailed(cause) => cause.kind(),
            Self::Diagnostic(_)
            | Self::Exit { .. }
            | Self::PipesUnavailable
            | Self::Finished => io::ErrorKind::Other,
        }
    }

    /// Wrap this error for the `AsyncRead`/`AsyncWrite` boundary.
    #[must_use]
    pub fn into_io(self) -> io::Error {
        io::Error::new(self.kind(), self)
    }

    /// Recover the stream error carried by an `io::Error`, if any.
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<&Self> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Self>())
    }

    /// Convert an `io::Error` into a stream error, unwrapping one that
    /// already carries a `ConvertError`.
    #[must_use]
    pub fn unwrap_io(err: io::Error, wrap: impl FnOnce(Arc<io::Error>) -> Self) -> Self {
        match Self::from_io(&err) {
            Some(inner) => inner.clone(),
            None => wrap(Arc::new(err)),
        }
    }

    /// The first failure behind any `AlreadyFailed` wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::AlreadyFailed(cause) => cause.root(),
            other => other,
        }
    }
}

impl From<ConvertError> for io::Error {
    fn from(err: ConvertError) -> Self {
        err.into_io()
    }
}
