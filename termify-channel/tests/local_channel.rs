use std::collections::BTreeMap;
use std::time::Duration;
use termify_channel::{
    Backing, ChannelError, ChannelKind, ChannelOpener, ChannelOutput, Geometry, LocalChannel,
    LocalOptions, LocalSpawn, NativeOpener, OutputStream,
};
use tokio::time::timeout;

fn sh_spawn(args: &[&str]) -> LocalSpawn {
    LocalSpawn {
        shell: Some("/bin/sh".to_string()),
        args: args.iter().map(|s| s.to_string()).collect(),
        env: BTreeMap::from([("PS1".to_string(), "$ ".to_string())]),
        ..Default::default()
    }
}

/// Collect output until `needle` shows up or the stream closes.
async fn read_until(output: &mut OutputStream, needle: &str) -> (String, Option<ChannelOutput>) {
    let mut seen = Vec::new();
    let deadline = Duration::from_secs(5);
    let result = timeout(deadline, async {
        while let Some(chunk) = output.next().await {
            match chunk {
                ChannelOutput::Data(data) => {
                    seen.extend_from_slice(&data);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        return None;
                    }
                }
                closed @ ChannelOutput::Closed(_) => return Some(closed),
            }
        }
        None
    })
    .await
    .unwrap_or(None);
    (String::from_utf8_lossy(&seen).into_owned(), result)
}

#[tokio::test]
async fn test_interactive_shell_echoes_commands() {
    let mut opened = LocalChannel::open(
        &sh_spawn(&[]),
        &LocalOptions::default(),
        Geometry::default(),
    )
    .expect("should spawn");
    assert_eq!(opened.channel.kind(), ChannelKind::Local);

    opened
        .channel
        .write(b"echo termify-$((40 + 2))\n")
        .await
        .expect("write should succeed");
    let (text, closed) = read_until(&mut opened.output, "termify-42").await;
    assert!(closed.is_none(), "shell closed early: {text}");
    assert!(text.contains("termify-42"), "got: {text}");

    opened.channel.close().await.expect("close");
}

#[tokio::test]
async fn test_exit_code_reported_on_close() {
    let mut opened = LocalChannel::open(
        &sh_spawn(&["-c", "echo bye; exit 7"]),
        &LocalOptions::default(),
        Geometry::default(),
    )
    .expect("should spawn");

    let (text, closed) = read_until(&mut opened.output, "never-printed").await;
    assert!(text.contains("bye"), "got: {text}");
    match closed {
        Some(ChannelOutput::Closed(exit)) => assert_eq!(exit.exit_code, Some(7)),
        other => panic!("expected close, got {other:?}"),
    }
    assert_eq!(opened.output.next().await, None);
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let opened = LocalChannel::open(
        &sh_spawn(&[]),
        &LocalOptions::default(),
        Geometry::default(),
    )
    .expect("should spawn");

    opened.channel.close().await.expect("close");
    opened.channel.close().await.expect("second close is a no-op");
    let err = opened.channel.write(b"echo late\n").await.unwrap_err();
    assert!(matches!(err, ChannelError::Closed), "got {err:?}");
    assert!(matches!(
        opened.channel.resize(Geometry::default()).await,
        Err(ChannelError::Closed)
    ));
}

#[tokio::test]
async fn test_resize_reaches_the_shell() {
    let mut opened = LocalChannel::open(
        &sh_spawn(&[]),
        &LocalOptions::default(),
        Geometry::default(),
    )
    .expect("should spawn");

    opened
        .channel
        .resize(Geometry::new(132, 43).unwrap())
        .await
        .expect("resize");
    opened
        .channel
        .write(b"stty size\n")
        .await
        .expect("write");
    let (text, _) = read_until(&mut opened.output, "43 132").await;
    assert!(text.contains("43 132"), "got: {text}");

    opened.channel.close().await.expect("close");
}

#[tokio::test]
async fn test_cwd_is_honored() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let marker = dir.path().join("marker-file");
    std::fs::write(&marker, "").expect("write marker");

    let mut spawn = sh_spawn(&["-c", "ls"]);
    spawn.cwd = Some(dir.path().to_path_buf());
    let mut opened = LocalChannel::open(&spawn, &LocalOptions::default(), Geometry::default())
        .expect("should spawn");

    let (text, _) = read_until(&mut opened.output, "marker-file").await;
    assert!(text.contains("marker-file"), "got: {text}");
}

#[tokio::test]
async fn test_missing_cwd_is_spawn_failure() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let mut spawn = sh_spawn(&[]);
    spawn.cwd = Some(dir.path().join("does-not-exist"));

    let err = LocalChannel::open(&spawn, &LocalOptions::default(), Geometry::default())
        .err()
        .expect("open should fail");
    assert!(matches!(err, ChannelError::SpawnFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn test_missing_program_is_spawn_failure() {
    let spawn = LocalSpawn {
        shell: Some("/nonexistent/termify-shell".to_string()),
        ..Default::default()
    };
    let err = LocalChannel::open(&spawn, &LocalOptions::default(), Geometry::default())
        .err()
        .expect("open should fail");
    assert!(matches!(err, ChannelError::SpawnFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn test_native_opener_spawns_local_shell() {
    let opener = NativeOpener::default();
    let mut opened = opener
        .open(
            &Backing::Local(sh_spawn(&["-c", "echo opened-$((1 + 1))"])),
            Geometry::default(),
        )
        .await
        .expect("should spawn");
    assert_eq!(opened.channel.kind(), ChannelKind::Local);

    let (text, _) = read_until(&mut opened.output, "opened-2").await;
    assert!(text.contains("opened-2"), "got: {text}");
}

#[tokio::test]
async fn test_native_opener_reports_missing_cwd() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let mut spawn = sh_spawn(&[]);
    spawn.cwd = Some(dir.path().join("does-not-exist"));

    let err = NativeOpener::default()
        .open(&Backing::Local(spawn), Geometry::default())
        .await
        .err()
        .expect("open should fail");
    assert!(matches!(err, ChannelError::SpawnFailed(_)), "got {err:?}");
}
