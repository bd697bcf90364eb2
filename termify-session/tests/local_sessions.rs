//! End-to-end runs against `/bin/sh` on a real PTY.

mod common;

use common::{output_until_closed, wait_for_buffer};
use std::collections::BTreeMap;
use std::time::Duration;
use termify_session::{
    Backing, CreateSession, Engine, EngineConfig, ExecuteOptions, Geometry, LocalSpawn,
    SessionEvent, SessionStatus, StopOptions, WriteOptions,
};

fn sh_engine() -> Engine {
    let mut config = EngineConfig::default();
    config.local.shell = "/bin/sh".to_string();
    Engine::new(config).expect("valid config")
}

async fn start_sh(engine: &Engine, id: &str, cwd: Option<std::path::PathBuf>) {
    let spawn = LocalSpawn {
        cwd,
        env: BTreeMap::from([("PS1".to_string(), "$ ".to_string())]),
        ..Default::default()
    };
    engine
        .create(CreateSession {
            id: id.to_string(),
            owner_id: "tester".to_string(),
            backing: Backing::Local(spawn),
            geometry: Geometry::default(),
        })
        .await
        .expect("shell should start");
    wait_for_buffer(engine, id, "$ ").await;
}

fn opts(timeout_ms: u64) -> ExecuteOptions {
    ExecuteOptions {
        timeout: Some(Duration::from_millis(timeout_ms)),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_returns_at_prompt() {
    let engine = sh_engine();
    start_sh(&engine, "sh", None).await;

    let out = engine.execute("sh", "echo hi", opts(2000)).await.unwrap();
    assert!(!out.timed_out, "output: {:?}", out.text());
    assert!(out.plain_text().contains("hi"));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_long_command_times_out() {
    let engine = sh_engine();
    start_sh(&engine, "sh", None).await;

    let out = engine.execute("sh", "sleep 5", opts(200)).await.unwrap();
    assert!(out.timed_out);
    assert!(!out.plain_text().trim_end().ends_with('$'));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_captures_are_disjoint() {
    let engine = sh_engine();
    start_sh(&engine, "sh", None).await;

    let first = engine
        .execute("sh", "echo first-marker", opts(2000))
        .await
        .unwrap();
    let second = engine
        .execute("sh", "echo second-marker", opts(2000))
        .await
        .unwrap();

    assert!(first.plain_text().contains("first-marker"));
    assert!(second.plain_text().contains("second-marker"));
    assert!(!second.plain_text().contains("first-marker"));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runs_in_requested_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("needle.txt"), "").unwrap();

    let engine = sh_engine();
    start_sh(&engine, "sh", Some(dir.path().to_path_buf())).await;

    let out = engine.execute("sh", "ls", opts(2000)).await.unwrap();
    assert!(out.plain_text().contains("needle.txt"));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_closes_shell_and_keeps_buffer() {
    let engine = sh_engine();
    start_sh(&engine, "sh", None).await;
    engine
        .execute("sh", "echo still-here", opts(2000))
        .await
        .unwrap();

    let flushed = engine.stop("sh", StopOptions::default()).await.unwrap();
    assert!(String::from_utf8_lossy(&flushed).contains("still-here"));
    assert_eq!(engine.info("sh").await.unwrap().status, SessionStatus::Stopped);
    assert!(String::from_utf8_lossy(&engine.get_buffer("sh").await.unwrap()).contains("still-here"));

    let err = engine
        .write("sh", b"echo nope\n", WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), termify_session::ErrorKind::SessionNotRunning);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shell_exit_is_a_crash() {
    let engine = sh_engine();
    start_sh(&engine, "sh", None).await;
    let mut viewer = engine.subscribe("sh").await.unwrap();

    engine
        .write("sh", b"exit 4\n", WriteOptions::default())
        .await
        .unwrap();
    let (_, closed) = output_until_closed(&mut viewer).await;
    assert_eq!(
        closed,
        SessionEvent::Closed {
            status: SessionStatus::Crashed,
            exit_code: Some(4)
        }
    );
    assert_eq!(engine.info("sh").await.unwrap().status, SessionStatus::Crashed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resize_is_visible_to_the_shell() {
    let engine = sh_engine();
    start_sh(&engine, "sh", None).await;

    engine
        .resize("sh", Geometry::new(132, 43).unwrap())
        .await
        .unwrap();
    let out = engine.execute("sh", "stty size", opts(2000)).await.unwrap();
    assert!(out.plain_text().contains("43 132"), "{:?}", out.text());

    engine.shutdown().await;
}
