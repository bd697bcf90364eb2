use crate::terminal::{self, RawModeGuard};
use miette::{IntoDiagnostic, Result, WrapErr, bail};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use termify_channel::{Backing, Geometry, LocalSpawn, SshAuth, SshTarget};
use termify_session::{
    CreateSession, Engine, ExecuteOptions, SessionEvent, Subscription, WriteOptions,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EXEC_SESSION: &str = "exec";
const SHELL_SESSION: &str = "shell";

/// How long a fresh shell gets to print its first prompt before `exec`
/// sends the command anyway.
const STARTUP_GRACE: Duration = Duration::from_secs(5);

fn local_session(id: &str, cwd: Option<PathBuf>, geometry: Geometry) -> CreateSession {
    CreateSession {
        id: id.to_string(),
        owner_id: whoami(),
        backing: Backing::Local(LocalSpawn {
            cwd,
            env: BTreeMap::new(),
            ..Default::default()
        }),
        geometry,
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

/// Wait until the shell has printed something and then gone quiet, so the
/// command is not typed over the startup banner.
async fn wait_until_settled(subscription: &mut Subscription, quiet: Duration) {
    let deadline = Instant::now() + STARTUP_GRACE;
    let mut seen_output = !subscription.snapshot.is_empty();
    loop {
        let until = if seen_output {
            deadline.min(Instant::now() + quiet)
        } else {
            deadline
        };
        match tokio::time::timeout_at(until, subscription.recv()).await {
            Ok(Some(SessionEvent::Output(_))) => seen_output = true,
            Ok(Some(SessionEvent::Status(_))) => {}
            Ok(Some(SessionEvent::Closed { .. }) | None) | Err(_) => return,
        }
    }
}

pub async fn exec(
    engine: &Engine,
    cwd: Option<PathBuf>,
    timeout_ms: Option<u64>,
    no_prompt: bool,
    command: Vec<String>,
) -> Result<ExitCode> {
    let geometry = terminal::current_geometry().unwrap_or_default();
    engine
        .create(local_session(EXEC_SESSION, cwd, geometry))
        .await
        .into_diagnostic()
        .wrap_err("failed to start a local shell")?;

    let mut startup = engine.subscribe(EXEC_SESSION).await.into_diagnostic()?;
    wait_until_settled(&mut startup, engine.config().execute.quiescence()).await;
    drop(startup);

    let options = ExecuteOptions {
        timeout: timeout_ms.map(Duration::from_millis),
        wait_for_prompt: !no_prompt,
        auto_start: false,
    };
    let line = command.join(" ");
    debug!("executing {:?}", line);
    let output = engine
        .execute(EXEC_SESSION, &line, options)
        .await
        .into_diagnostic()?;

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output.plain_text().as_bytes())
        .into_diagnostic()?;
    stdout.flush().into_diagnostic()?;

    if output.timed_out {
        warn!("command did not finish in time");
        return Ok(ExitCode::from(124));
    }
    Ok(ExitCode::SUCCESS)
}

/// Forward stdin to the session from a plain thread; stdin reads block.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("stdin read error: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

pub async fn shell(
    engine: &Engine,
    cwd: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let geometry = terminal::current_geometry().unwrap_or_default();
    engine
        .create(local_session(SHELL_SESSION, cwd, geometry))
        .await
        .into_diagnostic()
        .wrap_err("failed to start a local shell")?;

    let mut subscription = engine.subscribe(SHELL_SESSION).await.into_diagnostic()?;
    let mut window_changes = signal(SignalKind::window_change()).into_diagnostic()?;
    let _raw = RawModeGuard::new().into_diagnostic()?;
    let mut stdin = spawn_stdin_reader();
    let mut stdout = std::io::stdout();

    stdout.write_all(&subscription.snapshot).into_diagnostic()?;
    stdout.flush().into_diagnostic()?;

    let mut stdin_open = true;
    let exit_code = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            input = stdin.recv(), if stdin_open => match input {
                Some(bytes) => {
                    engine
                        .write(SHELL_SESSION, &bytes, WriteOptions::default())
                        .await
                        .into_diagnostic()?;
                }
                None => stdin_open = false,
            },
            _ = window_changes.recv() => {
                if let Some(geometry) = terminal::current_geometry()
                    && let Err(e) = engine.resize(SHELL_SESSION, geometry).await
                {
                    debug!("resize failed: {}", e);
                }
            }
            event = subscription.recv() => match event {
                Some(SessionEvent::Output(bytes)) => {
                    stdout.write_all(&bytes).into_diagnostic()?;
                    stdout.flush().into_diagnostic()?;
                }
                Some(SessionEvent::Status(_)) => {}
                Some(SessionEvent::Closed { exit_code, .. }) => break exit_code,
                None => bail!("lost the session output stream"),
            },
        }
    };

    Ok(match exit_code {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)),
        None => ExitCode::SUCCESS,
    })
}

fn read_env(var: &str) -> Result<String> {
    std::env::var(var)
        .into_diagnostic()
        .wrap_err_with(|| format!("environment variable {var} is not set"))
}

pub struct ProbeArgs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password_env: Option<String>,
    pub key: Option<PathBuf>,
    pub passphrase_env: Option<String>,
    pub fingerprint: Option<String>,
}

pub async fn probe(engine: &Engine, args: ProbeArgs) -> Result<ExitCode> {
    let password = args.password_env.as_deref().map(read_env).transpose()?;
    let private_key = match &args.key {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to read {}", path.display()))?,
        ),
        None => None,
    };
    let passphrase = args.passphrase_env.as_deref().map(read_env).transpose()?;
    let auth = SshAuth::from_parts(password, private_key, passphrase).into_diagnostic()?;

    let target = SshTarget {
        host: args.host,
        port: args.port,
        username: args.user,
        auth,
        host_fingerprint: args.fingerprint,
    };
    let report = engine.test_connection(&target).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).into_diagnostic()?
    );

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
