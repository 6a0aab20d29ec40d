//! Background tasks that drive a spawned process.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{ConvertError, ErrorUnifier, StreamEvent};
use crate::process::ConvertProcess;

/// Upper bound on diagnostic text kept for the exit error.
const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// Longest piece of a single diagnostic line read at once.
const MAX_LINE_BYTES: u64 = 16 * 1024;

/// Forward queued chunks into the process input, then close it.
///
/// The queue ends when the stream's sender is dropped, so every chunk
/// written before close reaches the process before its stdin is closed.
/// `forwarded` carries the running total of bytes handed to stdin.
pub(crate) async fn pump_input(
    mut queue: mpsc::Receiver<Vec<u8>>,
    mut stdin: ChildStdin,
    forwarded: watch::Sender<u64>,
    unifier: Arc<ErrorUnifier>,
    cancel: CancellationToken,
    exited: CancellationToken,
    done: oneshot::Sender<()>,
) {
    let result = tokio::select! {
        () = cancel.cancelled() => Ok(0),
        result = forward(&mut queue, &mut stdin, &forwarded) => result,
    };

    match result {
        Ok(bytes) => tracing::trace!(bytes, "Process input closed"),
        Err(err) => {
            if err.kind() == io::ErrorKind::BrokenPipe {
                // The process stopped reading; its own diagnostics say why.
                exited.cancelled().await;
            }
            unifier.raise(ConvertError::Input(Arc::new(err)));
        }
    }

    drop(stdin);
    drop(queue);
    let _ = done.send(());
}

async fn forward(
    queue: &mut mpsc::Receiver<Vec<u8>>,
    stdin: &mut ChildStdin,
    forwarded: &watch::Sender<u64>,
) -> io::Result<u64> {
    let mut total = 0u64;
    while let Some(chunk) = queue.recv().await {
        stdin.write_all(&chunk).await?;
        total = total.saturating_add(chunk.len() as u64);
        forwarded.send_replace(total);
    }
    stdin.flush().await?;
    stdin.shutdown().await?;
    Ok(total)
}

/// Read the diagnostic stream to its end.
///
/// The first non-blank line is reported as a failure right away. The full
/// text (bounded) is returned for the exit error. Lines longer than
/// `MAX_LINE_BYTES` are read in pieces.
pub(crate) async fn collect_diagnostics(stderr: ChildStderr, unifier: &ErrorUnifier) -> String {
    let mut reader = BufReader::new(stderr);
    let mut collected = Vec::new();
    let mut line = Vec::new();
    let mut reported = false;

    loop {
        line.clear();
        match (&mut reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut line)
            .await
        {
            Ok(0) => break,
            Ok(_) => {
                if !reported && !line.trim_ascii().is_empty() {
                    reported = true;
                    unifier.raise(line.clone());
                }
                let room = MAX_DIAGNOSTIC_BYTES.saturating_sub(collected.len());
                collected.extend_from_slice(&line[..line.len().min(room)]);
            }
            Err(err) => {
                unifier.raise(ConvertError::DiagnosticPipe(Arc::new(err)));
                break;
            }
        }
    }

    String::from_utf8_lossy(&collected).trim().to_string()
}

/// Own the process until it exits or the stream is dropped.
pub(crate) async fn supervise(
    mut process: ConvertProcess,
    stderr: ChildStderr,
    unifier: Arc<ErrorUnifier>,
    cancel: CancellationToken,
    exited: CancellationToken,
    exit_tx: oneshot::Sender<()>,
    terminate_timeout: Duration,
) {
    let outcome = tokio::select! {
        () = cancel.cancelled() => None,
        code = watch(&mut process, stderr, &unifier) => Some(code),
    };

    match outcome {
        Some(code) => {
            tracing::debug!(pid = ?process.id(), ?code, "Process exited");
            unifier.publish(StreamEvent::Exited { code });
        }
        None => {
            tracing::debug!(pid = ?process.id(), "Stream dropped, terminating process");
            if let Err(err) = process.graceful_terminate(terminate_timeout).await {
                tracing::warn!(error = %err, "Failed to terminate process");
            }
        }
    }

    exited.cancel();
    let _ = exit_tx.send(());
}

async fn watch(
    process: &mut ConvertProcess,
    stderr: ChildStderr,
    unifier: &ErrorUnifier,
) -> Option<i32> {
    let diagnostics = collect_diagnostics(stderr, unifier).await;

    match process.wait().await {
        Ok(status) => {
            if !status.success() {
                unifier.raise(ConvertError::Exit {
                    binary: process.binary().to_string(),
                    code: status.code(),
                    diagnostics,
                });
            }
            status.code()
        }
        Err(err) => {
            unifier.raise(ConvertError::Wait(Arc::new(err)));
            None
        }
    }
}
