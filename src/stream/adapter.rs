//! The duplex stream over a `convert` process.
//!
//! [`ImageStream`] is one object that implements both [`AsyncWrite`] and
//! [`AsyncRead`]. Bytes written to it go to the process's stdin, bytes read
//! from it come from the process's stdout, and anything the process prints
//! on stderr turns into a stream error.
//!
//! Writes land in a bounded queue that exists from construction on, so the
//! stream can accept input before the process is spawned. Once spawned, an
//! input pump drains the queue into stdin in order. Closing the write side
//! drops the queue's sender: the pump forwards what is left, then closes
//! stdin.
//!
//! ```no_run
//! use magick_stream::args::ConvertArgs;
//! use magick_stream::config::StreamConfig;
//! use magick_stream::stream::ImageStream;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn run(jpeg: &[u8]) -> std::io::Result<Vec<u8>> {
//! let args = ConvertArgs::new().resize("200x200").output_format("png");
//! let (mut reader, mut writer) = tokio::io::split(ImageStream::new(args, StreamConfig::default()));
//!
//! let input = jpeg.to_vec();
//! let feed = tokio::spawn(async move {
//!     writer.write_all(&input).await?;
//!     writer.shutdown().await
//! });
//!
//! let mut png = Vec::new();
//! reader.read_to_end(&mut png).await?;
//! feed.await??;
//! # Ok(png)
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::ChildStdout;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::Stream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, PollSender};

use super::pump::{pump_input, supervise};
use super::{ConvertError, Delivery, ErrorUnifier, StreamEvent, StreamState};
use crate::args::ConvertArgs;
use crate::config::{StartPolicy, StreamConfig, UnhandledErrorPolicy};
use crate::process::ConvertProcess;

/// A completion notice that may be polled again after it fired.
struct Completion {
    rx: oneshot::Receiver<()>,
    fired: bool,
}

impl Completion {
    fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx, fired: false }
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.fired {
            // A dropped sender means the task is gone, which is completion too.
            let _ = ready!(Pin::new(&mut self.rx).poll(cx));
            self.fired = true;
        }
        Poll::Ready(())
    }
}

struct Running {
    stdout: ChildStdout,
    exit: Completion,
    input_done: Completion,
    /// Bytes the pump has handed to stdin, as last seen by a flush.
    forwarded: u64,
    progress: WatchStream<u64>,
}

enum Phase {
    Idle { queue: mpsc::Receiver<Vec<u8>> },
    Spawning,
    Running(Running),
    Finished,
    Failed,
}

impl Phase {
    fn state(&self) -> StreamState {
        match self {
            Self::Idle { .. } => StreamState::Idle,
            Self::Spawning => StreamState::Spawning,
            Self::Running(_) => StreamState::Running,
            Self::Finished => StreamState::Finished,
            Self::Failed => StreamState::Failed,
        }
    }
}

/// Duplex byte stream backed by a lazily spawned `convert` process.
///
/// A stream runs at most one process. Dropping it terminates a process that
/// is still running.
///
/// Flushing waits until every written byte has been handed to the process.
/// Under [`StartPolicy::OnRead`] a flush before the first read returns at
/// once: queued bytes stay queued until reading spawns the process.
///
/// # Panics
///
/// With [`UnhandledErrorPolicy::Panic`] (the default), dropping a stream that
/// failed without the failure being returned by an I/O call or received by
/// an event subscriber panics.
#[must_use = "an image stream does nothing unless read from or written to"]
pub struct ImageStream {
    args: ConvertArgs,
    config: StreamConfig,
    phase: Phase,
    input: Option<PollSender<Vec<u8>>>,
    bytes_written: u64,
    pid: Option<u32>,
    unifier: Arc<ErrorUnifier>,
    cancel: CancellationToken,
}

impl ImageStream {
    /// Create a stream for the given arguments.
    ///
    /// With [`StartPolicy::Eager`] the process is spawned here, provided a
    /// Tokio runtime is running; otherwise spawning waits for first use.
    pub fn new(args: ConvertArgs, config: StreamConfig) -> Self {
        let mut stream = Self::idle(args, config);
        stream.start_if_eager();
        stream
    }

    /// Create a stream and subscribe to its events before anything can
    /// happen, so an eager spawn's `Started` event is not missed.
    pub fn with_subscriber(
        args: ConvertArgs,
        config: StreamConfig,
    ) -> (Self, broadcast::Receiver<StreamEvent>) {
        let mut stream = Self::idle(args, config);
        let events = stream.subscribe();
        stream.start_if_eager();
        (stream, events)
    }

    fn idle(args: ConvertArgs, config: StreamConfig) -> Self {
        let (tx, queue) = mpsc::channel(config.write_queue_capacity.max(1));
        Self {
            args,
            config,
            phase: Phase::Idle { queue },
            input: Some(PollSender::new(tx)),
            bytes_written: 0,
            pid: None,
            unifier: Arc::new(ErrorUnifier::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn start_if_eager(&mut self) {
        if self.config.start != StartPolicy::Eager {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("No Tokio runtime for eager start, spawning on first use");
            return;
        }
        self.start();
    }

    fn spawns_on_write(&self) -> bool {
        matches!(
            self.config.start,
            StartPolicy::OnFirstUse | StartPolicy::Eager
        )
    }

    /// Spawn the process now if it has not been spawned yet.
    ///
    /// Has no effect after the first spawn attempt. A spawn failure is
    /// reported through the stream's error channel.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(&mut self) -> StreamState {
        let phase = std::mem::replace(&mut self.phase, Phase::Spawning);
        let Phase::Idle { queue } = phase else {
            self.phase = phase;
            return self.state();
        };

        let next = self.spawn(queue);
        self.transition(next);
        self.state()
    }

    fn spawn(&mut self, queue: mpsc::Receiver<Vec<u8>>) -> Phase {
        let binary = self.config.binary.as_str();
        let mut process = match ConvertProcess::spawn_with_binary(
            binary,
            &self.args,
            self.config.working_dir.as_deref(),
        ) {
            Ok(process) => process,
            Err(err) => {
                self.unifier.raise(ConvertError::spawn(binary, err));
                return Phase::Failed;
            }
        };

        let Some(pipes) = process.take_pipes() else {
            self.unifier.raise(ConvertError::PipesUnavailable);
            return Phase::Failed;
        };

        let pid = process.id();
        let exited = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (forwarded_tx, forwarded_rx) = watch::channel(0);

        tokio::spawn(pump_input(
            queue,
            pipes.stdin,
            forwarded_tx,
            Arc::clone(&self.unifier),
            self.cancel.clone(),
            exited.clone(),
            done_tx,
        ));
        tokio::spawn(supervise(
            process,
            pipes.stderr,
            Arc::clone(&self.unifier),
            self.cancel.clone(),
            exited,
            exit_tx,
            self.config.terminate_timeout(),
        ));

        self.pid = pid;
        tracing::info!(pid = ?pid, binary, "Image stream started");
        self.unifier.publish(StreamEvent::Started {
            pid,
            args: self.args.build_args(),
        });

        Phase::Running(Running {
            stdout: pipes.stdout,
            exit: Completion::new(exit_rx),
            input_done: Completion::new(done_rx),
            forwarded: 0,
            progress: WatchStream::new(forwarded_rx),
        })
    }

    fn transition(&mut self, next: Phase) {
        tracing::debug!(from = ?self.phase.state(), to = ?next.state(), "State transition");
        self.phase = next;
    }

    fn enter_failed(&mut self) {
        if !matches!(self.phase, Phase::Failed) {
            self.transition(Phase::Failed);
        }
    }

    /// The error a read or write returns once the stream has failed.
    fn io_failure(&mut self) -> Option<io::Error> {
        let delivery = self.unifier.deliver()?;
        self.enter_failed();
        Some(match delivery {
            Delivery::First(err) => err.into_io(),
            Delivery::Repeat(err) => ConvertError::AlreadyFailed(Box::new(err)).into_io(),
        })
    }

    /// Like `io_failure`, but repeats are silent.
    fn first_failure(&mut self) -> Option<io::Error> {
        let delivery = self.unifier.deliver()?;
        self.enter_failed();
        match delivery {
            Delivery::First(err) => Some(err.into_io()),
            Delivery::Repeat(_) => None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        if self.unifier.has_failed() {
            StreamState::Failed
        } else {
            self.phase.state()
        }
    }

    /// Process ID of the spawned process, once spawned.
    #[must_use]
    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// The arguments the process is (or will be) started with.
    #[must_use]
    pub fn args(&self) -> &ConvertArgs {
        &self.args
    }

    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Number of bytes accepted by writes so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Set the input format tag. No effect on an already spawned process.
    pub fn set_input_format(&mut self, format: &str) {
        self.warn_if_spawned("input format");
        self.args.set_input_format(format);
    }

    /// Set the output format tag. No effect on an already spawned process.
    pub fn set_output_format(&mut self, format: &str) {
        self.warn_if_spawned("output format");
        self.args.set_output_format(format);
    }

    fn warn_if_spawned(&self, what: &str) {
        if !matches!(self.phase, Phase::Idle { .. }) {
            tracing::warn!(what, state = ?self.state(), "Change ignored by running process");
        }
    }

    /// Subscribe to lifecycle events.
    ///
    /// Subscribing counts as handling errors: a subscriber that is alive when
    /// the stream fails receives the `Failed` event, and the stream will not
    /// escalate the failure on drop.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.unifier.subscribe()
    }

    /// Lifecycle events as a `Stream`.
    #[must_use]
    pub fn events(&self) -> BroadcastStream<StreamEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// The error funnel, for glue code that wants its own failures to
    /// surface through this stream.
    #[must_use]
    pub fn error_unifier(&self) -> Arc<ErrorUnifier> {
        Arc::clone(&self.unifier)
    }

    /// Read the transformed output as a `Stream` of byte chunks.
    ///
    /// Closes the input first; bytes already written still reach the
    /// process.
    pub fn into_chunks(mut self) -> ReaderStream<Self> {
        self.close_input();
        ReaderStream::new(self)
    }

    /// Drop the queue's sender so the pump drains it and closes stdin.
    fn close_input(&mut self) {
        if self.input.take().is_none() {
            return;
        }
        tracing::trace!(bytes = self.bytes_written, "Input closed");

        if matches!(self.phase, Phase::Idle { .. })
            && self.bytes_written == 0
            && !self.config.spawn_on_empty_close
        {
            tracing::debug!("Input closed before any write, not spawning");
            self.transition(Phase::Finished);
        }
    }
}

impl AsyncRead for ImageStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.unifier.register_read(cx.waker());

        if let Some(err) = this.io_failure() {
            return Poll::Ready(Err(err));
        }
        this.start();
        if let Some(err) = this.io_failure() {
            return Poll::Ready(Err(err));
        }

        let Phase::Running(running) = &mut this.phase else {
            // Finished, or input closed without ever spawning.
            return Poll::Ready(Ok(()));
        };
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match ready!(Pin::new(&mut running.stdout).poll_read(cx, buf)) {
            Ok(()) if buf.filled().len() > before => return Poll::Ready(Ok(())),
            // End of output counts only once the process has been reaped.
            Ok(()) => ready!(running.exit.poll(cx)),
            Err(err) => {
                this.unifier.raise(ConvertError::Output(Arc::new(err)));
            }
        }

        if let Some(err) = this.io_failure() {
            return Poll::Ready(Err(err));
        }
        this.transition(Phase::Finished);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ImageStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.unifier.register_write(cx.waker());

        if let Some(err) = this.io_failure() {
            return Poll::Ready(Err(err));
        }
        if matches!(this.phase, Phase::Finished) {
            return Poll::Ready(Err(ConvertError::Finished.into_io()));
        }
        if this.input.is_none() {
            return Poll::Ready(Err(ConvertError::InputClosed.into_io()));
        }
        if this.spawns_on_write() {
            this.start();
            if let Some(err) = this.io_failure() {
                return Poll::Ready(Err(err));
            }
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let Some(input) = this.input.as_mut() else {
            return Poll::Ready(Err(ConvertError::InputClosed.into_io()));
        };
        if ready!(input.poll_reserve(cx)).is_err() {
            // The pump only lets go of the queue after reporting why.
            let err = this.io_failure();
            return Poll::Ready(Err(
                err.unwrap_or_else(|| ConvertError::InputClosed.into_io())
            ));
        }

        let len = buf.len().min(this.config.max_chunk_size.max(1));
        if input.send_item(buf[..len].to_vec()).is_err() {
            let err = this.io_failure();
            return Poll::Ready(Err(
                err.unwrap_or_else(|| ConvertError::InputClosed.into_io())
            ));
        }

        this.bytes_written = this.bytes_written.saturating_add(len as u64);
        Poll::Ready(Ok(len))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.unifier.register_write(cx.waker());

        if let Some(err) = this.io_failure() {
            return Poll::Ready(Err(err));
        }
        if this.bytes_written > 0 && this.spawns_on_write() {
            this.start();
        }

        if let Phase::Running(running) = &mut this.phase {
            while running.forwarded < this.bytes_written {
                match ready!(Pin::new(&mut running.progress).poll_next(cx)) {
                    Some(total) => running.forwarded = total,
                    // Pump is gone; a failure it hit is reported below.
                    None => break,
                }
            }
        }

        Poll::Ready(this.io_failure().map_or(Ok(()), Err))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.unifier.register_write(cx.waker());

        if this.input.is_some() {
            this.close_input();
            if matches!(this.phase, Phase::Idle { .. }) && this.spawns_on_write() {
                this.start();
            }
        }

        if let Phase::Running(running) = &mut this.phase {
            if !this.unifier.has_failed() {
                ready!(running.input_done.poll(cx));
            }
        }

        Poll::Ready(this.first_failure().map_or(Ok(()), Err))
    }
}

impl fmt::Debug for ImageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageStream")
            .field("binary", &self.config.binary)
            .field("args", &self.args)
            .field("state", &self.state())
            .field("pid", &self.pid)
            .field("bytes_written", &self.bytes_written)
            .finish_non_exhaustive()
    }
}

impl Drop for ImageStream {
    fn drop(&mut self) {
        let unobserved = self.unifier.close();
        self.cancel.cancel();

        let Some(err) = unobserved else {
            return;
        };
        match self.config.unhandled_error {
            UnhandledErrorPolicy::Panic if !std::thread::panicking() => {
                panic!("unhandled image stream error: {err}");
            }
            _ => tracing::error!(error = %err, "Unhandled image stream error"),
        }
    }
}
