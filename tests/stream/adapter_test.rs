//! Tests for the duplex stream over a stand-in process.

use std::io;
use std::time::Duration;

use magick_stream::args::ConvertArgs;
use magick_stream::config::{StartPolicy, StreamConfig, UnhandledErrorPolicy};
use magick_stream::stream::{ConvertError, ImageStream, StreamState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::StreamExt;

use super::{root_error, shell, shell_config, shell_stream, MISSING_BINARY};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn round_trip_through_cat() {
    let mut stream = shell_stream("cat");
    assert_eq!(stream.state(), StreamState::Idle);
    assert!(stream.process_id().is_none());

    stream.write_all(b"hello image").await.unwrap();
    assert_eq!(stream.state(), StreamState::Running);
    assert!(stream.process_id().is_some());

    stream.shutdown().await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();

    assert_eq!(out, b"hello image");
    assert_eq!(stream.bytes_written(), 11);
    assert_eq!(stream.state(), StreamState::Finished);
}

#[tokio::test]
async fn large_input_keeps_order_under_backpressure() {
    let config = StreamConfig {
        write_queue_capacity: 2,
        max_chunk_size: 1024,
        ..shell_config()
    };
    let data = pattern(1 << 20);
    let stream = ImageStream::new(shell("cat"), config);
    let (mut reader, mut writer) = tokio::io::split(stream);

    let input = data.clone();
    let feed = tokio::spawn(async move {
        writer.write_all(&input).await?;
        writer.shutdown().await?;
        Ok::<_, io::Error>(writer)
    });

    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let writer = feed.await.unwrap().unwrap();
    let stream = reader.unsplit(writer);

    assert_eq!(out.len(), data.len());
    assert!(out == data, "Output bytes differ from input");
    assert_eq!(stream.bytes_written(), data.len() as u64);
    assert_eq!(stream.state(), StreamState::Finished);
}

#[tokio::test]
async fn full_queue_blocks_writes() {
    let config = StreamConfig {
        start: StartPolicy::OnRead,
        write_queue_capacity: 2,
        max_chunk_size: 4,
        ..shell_config()
    };
    let mut stream = ImageStream::new(shell("cat"), config);

    assert_eq!(stream.write(b"aaaa").await.unwrap(), 4);
    assert_eq!(stream.write(b"bbbbbb").await.unwrap(), 4);
    let blocked = tokio::time::timeout(Duration::from_millis(100), stream.write(b"cccc")).await;
    assert!(blocked.is_err(), "Third write should wait for queue space");
    assert_eq!(stream.state(), StreamState::Idle);

    stream.shutdown().await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"aaaabbbb");
}

#[tokio::test]
async fn on_read_queues_writes_until_first_read() {
    let config = shell_config().with_start(StartPolicy::OnRead);
    let mut stream = ImageStream::new(shell("cat"), config);

    stream.write_all(b"queued ").await.unwrap();
    stream.write_all(b"bytes").await.unwrap();
    stream.shutdown().await.unwrap();
    assert_eq!(stream.state(), StreamState::Idle);
    assert!(stream.process_id().is_none());

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"queued bytes");
    assert_eq!(stream.state(), StreamState::Finished);
}

#[tokio::test]
async fn explicit_start_spawns_once() {
    let config = shell_config().with_start(StartPolicy::OnRead);
    let mut stream = ImageStream::new(shell("cat"), config);

    assert_eq!(stream.start(), StreamState::Running);
    let pid = stream.process_id();
    assert!(pid.is_some());
    assert_eq!(stream.start(), StreamState::Running);
    assert_eq!(stream.process_id(), pid);

    stream.write_all(b"x").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"x");
}

#[tokio::test]
async fn eager_start_spawns_on_construction() {
    let config = shell_config().with_start(StartPolicy::Eager);
    let mut stream = ImageStream::new(shell("cat"), config);
    assert_eq!(stream.state(), StreamState::Running);

    stream.write_all(b"eager").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"eager");
}

#[test]
fn eager_start_without_runtime_waits_for_first_use() {
    let config = shell_config().with_start(StartPolicy::Eager);
    let stream = ImageStream::new(shell("cat"), config);
    assert_eq!(stream.state(), StreamState::Idle);
    assert!(stream.process_id().is_none());
}

#[tokio::test]
async fn empty_close_spawns_by_default() {
    let mut stream = shell_stream("printf out");
    stream.shutdown().await.unwrap();
    assert!(stream.process_id().is_some());

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"out");
}

#[tokio::test]
async fn empty_close_without_spawn_finishes_quietly() {
    let config = StreamConfig {
        spawn_on_empty_close: false,
        ..shell_config()
    };
    let mut stream = ImageStream::new(shell("printf unexpected"), config);

    stream.shutdown().await.unwrap();
    assert_eq!(stream.state(), StreamState::Finished);
    assert!(stream.process_id().is_none());

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn empty_close_without_spawn_applies_to_on_read() {
    let config = StreamConfig {
        start: StartPolicy::OnRead,
        spawn_on_empty_close: false,
        ..shell_config()
    };
    let mut stream = ImageStream::new(shell("printf unexpected"), config);

    stream.shutdown().await.unwrap();
    assert_eq!(stream.state(), StreamState::Finished);

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty());
    assert!(stream.process_id().is_none());
}

#[tokio::test]
async fn flush_waits_for_process_to_take_input() {
    let config = StreamConfig {
        write_queue_capacity: 64,
        ..shell_config()
    };
    let mut stream = ImageStream::new(shell("sleep 2; cat >/dev/null"), config);
    stream.write_all(&pattern(1 << 20)).await.unwrap();

    let early = tokio::time::timeout(Duration::from_millis(200), stream.flush()).await;
    assert!(early.is_err(), "Flush returned while input was still queued");

    tokio::time::timeout(Duration::from_secs(10), stream.flush())
        .await
        .expect("Flush should finish once the process reads")
        .unwrap();
    stream.shutdown().await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn flush_reports_failure_of_queued_input() {
    let mut stream = shell_stream("exec 0<&-; echo 'convert: no input wanted' >&2; sleep 1");
    stream.write_all(&pattern(256 * 1024)).await.unwrap();

    let err = stream.flush().await.unwrap_err();
    assert!(matches!(
        root_error(&err),
        ConvertError::Diagnostic(text) if text == "convert: no input wanted"
    ));
}

#[tokio::test]
async fn shutdown_twice_is_a_no_op() {
    let mut stream = shell_stream("cat");
    stream.write_all(b"once").await.unwrap();
    stream.shutdown().await.unwrap();
    stream.shutdown().await.unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"once");
}

#[tokio::test]
async fn write_after_shutdown_is_rejected() {
    let mut stream = shell_stream("cat");
    stream.write_all(b"a").await.unwrap();
    stream.shutdown().await.unwrap();

    let err = stream.write_all(b"b").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    assert!(matches!(root_error(&err), ConvertError::InputClosed));

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"a");
}

#[tokio::test]
async fn diagnostic_output_fails_the_stream() {
    let mut stream = shell_stream("echo 'convert: improper image header' >&2; exit 1");

    let mut out = Vec::new();
    let err = stream.read_to_end(&mut out).await.unwrap_err();
    assert_eq!(err.to_string(), "convert: improper image header");
    assert!(matches!(root_error(&err), ConvertError::Diagnostic(_)));
    assert_eq!(stream.state(), StreamState::Failed);

    let err = stream.read(&mut [0u8; 16]).await.unwrap_err();
    assert!(matches!(
        ConvertError::from_io(&err),
        Some(ConvertError::AlreadyFailed(_))
    ));
}

#[tokio::test]
async fn diagnostic_output_fails_even_on_clean_exit() {
    let mut stream = shell_stream("printf data; echo 'convert: warning' >&2");

    let mut out = Vec::new();
    let err = stream.read_to_end(&mut out).await.unwrap_err();
    assert!(matches!(
        root_error(&err),
        ConvertError::Diagnostic(text) if text == "convert: warning"
    ));
}

#[tokio::test]
async fn silent_failure_reports_exit_status() {
    let mut stream = shell_stream("exit 3");

    let mut out = Vec::new();
    let err = stream.read_to_end(&mut out).await.unwrap_err();
    assert!(matches!(
        root_error(&err),
        ConvertError::Exit { code: Some(3), .. }
    ));
    assert_eq!(err.to_string(), "sh exited with status 3");
}

#[tokio::test]
async fn closed_process_input_reports_process_diagnostics() {
    let mut stream = shell_stream("exec 0<&-; echo 'convert: no input expected' >&2; exit 1");
    let data = vec![0u8; 2 << 20];

    let result = async {
        stream.write_all(&data).await?;
        stream.shutdown().await
    }
    .await;

    let err = result.unwrap_err();
    assert!(matches!(
        root_error(&err),
        ConvertError::Diagnostic(text) if text == "convert: no input expected"
    ));
}

#[tokio::test]
async fn missing_binary_fails_first_write() {
    let config = StreamConfig::default().with_binary(MISSING_BINARY);
    let mut stream = ImageStream::new(ConvertArgs::new(), config);

    let err = stream.write_all(b"x").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
    assert!(matches!(root_error(&err), ConvertError::Spawn { .. }));
    assert_eq!(stream.state(), StreamState::Failed);

    let err = stream.write_all(b"y").await.unwrap_err();
    assert!(matches!(
        ConvertError::from_io(&err),
        Some(ConvertError::AlreadyFailed(_))
    ));
    // The failure was already returned; closing does not repeat it.
    stream.shutdown().await.unwrap();
}

#[tokio::test]
#[should_panic(expected = "unhandled image stream error")]
async fn dropping_unobserved_failure_panics() {
    let config = StreamConfig::default()
        .with_binary(MISSING_BINARY)
        .with_start(StartPolicy::Eager);
    let stream = ImageStream::new(ConvertArgs::new(), config);
    assert_eq!(stream.state(), StreamState::Failed);
    drop(stream);
}

#[tokio::test]
async fn dropping_unobserved_failure_can_log_instead() {
    let config = StreamConfig::default()
        .with_binary(MISSING_BINARY)
        .with_start(StartPolicy::Eager)
        .with_unhandled_error(UnhandledErrorPolicy::Log);
    let stream = ImageStream::new(ConvertArgs::new(), config);
    assert_eq!(stream.state(), StreamState::Failed);
    drop(stream);
}

#[tokio::test]
async fn unused_stream_never_spawns() {
    let config = StreamConfig::default().with_binary(MISSING_BINARY);
    let stream = ImageStream::new(ConvertArgs::new(), config);
    assert_eq!(stream.state(), StreamState::Idle);
    drop(stream);
}

#[tokio::test]
async fn format_changes_apply_before_spawn() {
    let mut stream = shell_stream(r#"printf '%s ' "$@""#);
    stream.set_output_format("png");
    assert_eq!(stream.args().output_spec(), "png:-");

    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "png:- ");
}

#[tokio::test]
async fn chunk_stream_closes_input() {
    let mut stream = shell_stream("cat");
    stream.write_all(b"written before").await.unwrap();

    let mut chunks = stream.into_chunks();
    let mut out = Vec::new();
    let collect = async {
        while let Some(chunk) = chunks.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("Chunk stream should end once input is drained");
    assert_eq!(out, b"written before");
}

#[tokio::test]
async fn output_as_chunk_stream() {
    let stream = shell_stream("printf abc; printf def");
    let mut chunks = stream.into_chunks();

    let mut out = Vec::new();
    while let Some(chunk) = chunks.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(out, b"abcdef");
}

#[cfg(unix)]
#[tokio::test]
async fn dropping_stream_terminates_process() {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let config = shell_config().with_start(StartPolicy::Eager);
    let stream = ImageStream::new(shell("sleep 30"), config);
    let pid = stream.process_id().expect("Eager stream should be spawned");
    drop(stream);

    let pid = Pid::from_raw(i32::try_from(pid).unwrap());
    let gone = async {
        while kill(pid, None).is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), gone)
        .await
        .expect("Process should be terminated after drop");
}
