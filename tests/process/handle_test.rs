//! Tests for spawning and controlling the external process.

use std::time::Duration;

use magick_stream::args::ConvertArgs;
use magick_stream::process::{ConvertProcess, SpawnError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn shell(script: &str) -> ConvertArgs {
    ConvertArgs::new().set("c", script)
}

#[tokio::test]
async fn spawn_pipes_all_three_streams() {
    let mut process = ConvertProcess::spawn_with_binary("sh", &shell("cat; echo done >&2"), None)
        .expect("Failed to spawn sh");
    assert!(process.id().is_some());
    assert_eq!(process.binary(), "sh");

    let mut pipes = process.take_pipes().expect("Pipes should be available");
    assert!(process.take_pipes().is_none(), "Pipes can only be taken once");

    pipes.stdin.write_all(b"image bytes").await.unwrap();
    drop(pipes.stdin);

    let mut stdout = Vec::new();
    pipes.stdout.read_to_end(&mut stdout).await.unwrap();
    let mut stderr = String::new();
    pipes.stderr.read_to_string(&mut stderr).await.unwrap();

    let status = process.wait().await.unwrap();
    assert!(status.success());
    assert_eq!(stdout, b"image bytes");
    assert_eq!(stderr.trim(), "done");
}

#[tokio::test]
async fn spawn_passes_rendered_arguments() {
    let args = shell(r#"printf '%s|' "$0" "$@""#).op("resize", "10x10");
    let mut process = ConvertProcess::spawn_with_binary("sh", &args, None).unwrap();
    let mut pipes = process.take_pipes().unwrap();

    let mut stdout = String::new();
    pipes.stdout.read_to_string(&mut stdout).await.unwrap();
    process.wait().await.unwrap();

    assert_eq!(stdout, "-|-resize|10x10|-|");
}

#[tokio::test]
async fn spawn_uses_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut process = ConvertProcess::spawn_with_binary("sh", &shell("pwd"), Some(dir.path())).unwrap();
    let mut pipes = process.take_pipes().unwrap();

    let mut stdout = String::new();
    pipes.stdout.read_to_string(&mut stdout).await.unwrap();
    process.wait().await.unwrap();

    let expected = dir.path().canonicalize().unwrap();
    let actual = std::path::Path::new(stdout.trim()).canonicalize().unwrap();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn spawn_missing_binary_is_not_found() {
    let result =
        ConvertProcess::spawn_with_binary("magick-stream-no-such-binary", &ConvertArgs::new(), None);
    assert!(matches!(result, Err(SpawnError::NotFound)));
}

#[tokio::test]
async fn try_wait_reports_running_then_exited() {
    let mut process = ConvertProcess::spawn_with_binary("sh", &shell("exit 4"), None).unwrap();
    let status = process.wait().await.unwrap();
    assert_eq!(status.code(), Some(4));
    assert!(process.try_wait().unwrap().is_some());
}

#[tokio::test]
async fn kill_stops_process() {
    let mut process = ConvertProcess::spawn_with_binary("sh", &shell("sleep 30"), None).unwrap();
    assert!(process.try_wait().unwrap().is_none());

    process.kill().await.unwrap();
    assert!(process.try_wait().unwrap().is_some());
}

#[tokio::test]
async fn graceful_terminate_stops_process() {
    let mut process = ConvertProcess::spawn_with_binary("sh", &shell("sleep 30"), None).unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        process.graceful_terminate(Duration::from_secs(2)),
    )
    .await
    .expect("Termination should not hang")
    .unwrap();

    assert!(process.try_wait().unwrap().is_some());
}

#[tokio::test]
async fn graceful_terminate_kills_after_timeout() {
    let mut process =
        ConvertProcess::spawn_with_binary("sh", &shell("trap '' TERM; sleep 30"), None).unwrap();
    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(
        Duration::from_secs(5),
        process.graceful_terminate(Duration::from_millis(100)),
    )
    .await
    .expect("Termination should not hang")
    .unwrap();

    assert!(process.try_wait().unwrap().is_some());
}
