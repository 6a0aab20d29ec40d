//! File sources and sinks for image streams.
//!
//! [`from_path`] feeds a file into a stream's input and hands back the output
//! side; [`to_path`] writes a stream's output into a file and hands back the
//! input side. File errors are reported through the stream's
//! [`ErrorUnifier`], so they surface exactly like process failures.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio_util::task::AbortOnDropHandle;

use crate::stream::{ConvertError, ErrorUnifier, ImageStream};

/// Collapse `AlreadyFailed` into its cause.
///
/// The glue drives both halves of one stream, so whichever half sees the
/// failure second still reports the original error to its caller.
fn surface(err: io::Error) -> io::Error {
    match ConvertError::from_io(&err) {
        Some(ConvertError::AlreadyFailed(cause)) => cause.root().clone().into_io(),
        _ => err,
    }
}

/// Output side of a stream whose input is fed from a file.
pub struct ImageSource {
    reader: ReadHalf<ImageStream>,
    _feeder: AbortOnDropHandle<()>,
}

impl AsyncRead for ImageSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf).map_err(surface)
    }
}

/// Feed the file at `path` into the stream.
///
/// Must be called within a Tokio runtime.
pub fn from_path(stream: ImageStream, path: impl Into<PathBuf>) -> ImageSource {
    let unifier = stream.error_unifier();
    let (reader, writer) = tokio::io::split(stream);
    let feeder = tokio::spawn(feed(path.into(), writer, unifier));
    ImageSource {
        reader,
        _feeder: AbortOnDropHandle::new(feeder),
    }
}

async fn feed(path: PathBuf, mut writer: WriteHalf<ImageStream>, unifier: Arc<ErrorUnifier>) {
    let source_error = |source| ConvertError::Source {
        path: path.clone(),
        source,
    };

    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            unifier.raise(source_error(Arc::new(err)));
            return;
        }
    };

    match tokio::io::copy(&mut file, &mut writer).await {
        Ok(bytes) => tracing::debug!(path = %path.display(), bytes, "Fed source file"),
        Err(err) => {
            unifier.raise(ConvertError::unwrap_io(err, source_error));
            return;
        }
    }

    if let Err(err) = writer.shutdown().await {
        unifier.raise(ConvertError::unwrap_io(err, source_error));
    }
}

/// Input side of a stream whose output is written to a file.
pub struct ImageSink {
    writer: WriteHalf<ImageStream>,
    drain: AbortOnDropHandle<Result<u64, ConvertError>>,
}

impl ImageSink {
    /// Close the input and wait until the output file is complete.
    ///
    /// Returns the number of bytes written to the file.
    ///
    /// # Errors
    ///
    /// Returns the stream's error if the process or either file failed.
    pub async fn finish(self) -> Result<u64, ConvertError> {
        let Self { mut writer, drain } = self;
        let closed = writer.shutdown().await;

        let drained = match drain.await {
            Ok(result) => result,
            Err(err) => Err(ConvertError::Output(Arc::new(err.into()))),
        };
        match (closed, drained) {
            (_, Err(err)) => Err(err),
            (Err(err), Ok(_)) => Err(ConvertError::unwrap_io(surface(err), ConvertError::Input)),
            (Ok(()), Ok(bytes)) => Ok(bytes),
        }
    }
}

impl AsyncWrite for ImageSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf).map_err(surface)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx).map_err(surface)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx).map_err(surface)
    }
}

/// Write the stream's output into the file at `path`.
///
/// Must be called within a Tokio runtime.
pub fn to_path(stream: ImageStream, path: impl Into<PathBuf>) -> ImageSink {
    let unifier = stream.error_unifier();
    let (reader, writer) = tokio::io::split(stream);
    let path = path.into();
    let drain = tokio::spawn(async move { write_file(reader, &path, &unifier).await });
    ImageSink {
        writer,
        drain: AbortOnDropHandle::new(drain),
    }
}

/// Copy `reader` into a new file at `path`.
async fn write_file<R>(mut reader: R, path: &Path, unifier: &ErrorUnifier) -> Result<u64, ConvertError>
where
    R: AsyncRead + Unpin,
{
    let sink_error = |source| ConvertError::Sink {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::create(path)
        .await
        .map_err(|err| unifier.fail(sink_error(Arc::new(err))))?;

    let bytes = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|err| unifier.fail(ConvertError::unwrap_io(surface(err), sink_error)))?;
    file.flush()
        .await
        .map_err(|err| unifier.fail(sink_error(Arc::new(err))))?;

    tracing::debug!(path = %path.display(), bytes, "Wrote output file");
    Ok(bytes)
}

/// Convert the file at `input` into the file at `output`.
///
/// # Errors
///
/// Returns the stream's error if the process or either file failed.
pub async fn convert_file(
    stream: ImageStream,
    input: impl Into<PathBuf>,
    output: impl AsRef<Path>,
) -> Result<u64, ConvertError> {
    let unifier = stream.error_unifier();
    let source = from_path(stream, input);
    write_file(source, output.as_ref(), &unifier).await
}
