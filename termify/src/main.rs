mod cli;
mod command;
mod log;
mod terminal;

use clap::Parser;
use cli::{Cli, Commands};
use command::ProbeArgs;
use miette::{IntoDiagnostic, Result, WrapErr};
use std::process::ExitCode;
use termify_session::{Engine, EngineConfig};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    match &cli.global_options.config {
        Some(path) => {
            debug!("loading configuration from {}", path.display());
            EngineConfig::load_from(path).into_diagnostic()
        }
        None => Ok(EngineConfig::default()),
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn cancel_on_signals(token: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).into_diagnostic()?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
            _ = terminate.recv() => info!("terminated, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}

async fn run(cli: Cli, engine: &Engine, cancel: CancellationToken) -> Result<ExitCode> {
    match cli.command {
        Commands::Exec {
            cwd,
            timeout_ms,
            no_prompt,
            command,
        } => {
            tokio::select! {
                result = command::exec(engine, cwd, timeout_ms, no_prompt, command) => result,
                _ = cancel.cancelled() => Ok(ExitCode::from(130)),
            }
        }
        Commands::Shell { cwd } => command::shell(engine, cwd, cancel).await,
        Commands::Probe {
            host,
            port,
            user,
            password_env,
            key,
            passphrase_env,
            fingerprint,
        } => {
            let args = ProbeArgs {
                host,
                port,
                user,
                password_env,
                key,
                passphrase_env,
                fingerprint,
            };
            tokio::select! {
                result = command::probe(engine, args) => result,
                _ = cancel.cancelled() => Ok(ExitCode::from(130)),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = log::Level::from_flags(cli.global_options.verbose, cli.global_options.quiet);
    log::init_tracing(level, cli.global_options.log_format);

    let config = load_config(&cli)?;
    let engine = Engine::new(config)
        .into_diagnostic()
        .wrap_err("invalid configuration")?;

    let cancel = CancellationToken::new();
    cancel_on_signals(cancel.clone())?;

    let result = run(cli, &engine, cancel).await;
    engine.shutdown().await;
    result
}
