//! Shells spawned on a local pseudo-terminal.

use crate::channel::{
    Channel, ChannelExit, ChannelKind, ChannelOutput, OUTPUT_QUEUE, OpenedChannel, OutputStream,
};
use crate::error::ChannelError;
use crate::geometry::Geometry;
use crate::pty::Pty;
use async_trait::async_trait;
use portable_pty::CommandBuilder;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Defaults applied to every local spawn.
#[derive(Debug, Clone)]
pub struct LocalOptions {
    /// Shell used when the spawn does not name one.
    pub shell: String,
    /// Value exported as `TERM`.
    pub term: String,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            term: "xterm-256color".to_string(),
        }
    }
}

/// What to run for a local session.
#[derive(Debug, Clone, Default)]
pub struct LocalSpawn {
    /// Working directory; the shell inherits ours when unset.
    pub cwd: Option<PathBuf>,
    /// Program to run instead of [`LocalOptions::shell`].
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// A shell process attached to a local PTY.
pub struct LocalChannel {
    pty: Arc<Pty>,
    closed: AtomicBool,
}

impl LocalChannel {
    /// Spawn the shell and start its reader thread.
    pub fn open(
        spawn: &LocalSpawn,
        options: &LocalOptions,
        geometry: Geometry,
    ) -> Result<OpenedChannel, ChannelError> {
        let program = spawn.shell.as_deref().unwrap_or(&options.shell);
        let mut cmd = CommandBuilder::new(program);
        cmd.args(&spawn.args);

        // portable_pty silently falls back to $HOME for a missing cwd
        match &spawn.cwd {
            Some(dir) if !dir.is_dir() => {
                return Err(ChannelError::SpawnFailed(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
            Some(dir) => cmd.cwd(dir),
            None => {
                if let Ok(current) = std::env::current_dir() {
                    cmd.cwd(current);
                }
            }
        }

        cmd.env("TERM", &options.term);
        for (key, value) in &spawn.env {
            cmd.env(key, value);
        }

        let pty = Arc::new(Pty::spawn(cmd, geometry.to_pty_size())?);
        debug!(
            "Spawned local shell {} (pid {:?}) at {}x{}",
            program,
            pty.process_id(),
            geometry.cols,
            geometry.rows
        );

        let channel = Self {
            pty: Arc::clone(&pty),
            closed: AtomicBool::new(false),
        };

        let Some(reader) = pty.take_reader() else {
            channel.shutdown();
            return Err(ChannelError::SpawnFailed("PTY reader unavailable".to_string()));
        };

        let (tx, output) = OutputStream::channel(OUTPUT_QUEUE);
        let spawned = std::thread::Builder::new()
            .name("termify-pty-reader".to_string())
            .spawn(move || pump(pty, reader, tx));
        if let Err(e) = spawned {
            channel.shutdown();
            return Err(ChannelError::SpawnFailed(format!(
                "failed to start PTY reader: {e}"
            )));
        }

        Ok(OpenedChannel {
            channel: Arc::new(channel),
            output,
        })
    }

    /// Kill the child and close the PTY. Runs at most once.
    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            release(&self.pty);
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Local
    }

    async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let pty = Arc::clone(&self.pty);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || pty.write_all(&data))
            .await
            .map_err(ChannelError::io)??;
        Ok(())
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.pty
            .resize(geometry.to_pty_size())
            .map_err(ChannelError::io)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Killing waits out a grace period, keep it off the runtime
        let pty = Arc::clone(&self.pty);
        tokio::task::spawn_blocking(move || release(&pty))
            .await
            .map_err(ChannelError::io)
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn release(pty: &Pty) {
    if let Err(e) = pty.kill() {
        // Usually the shell already exited
        debug!("kill on local shell: {}", e);
    }
    let _ = pty.try_wait();
    pty.release();
}

/// Drain the PTY into the output queue until EOF, then report the exit code.
fn pump(pty: Arc<Pty>, mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<ChannelOutput>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                trace!("pty read {} bytes", n);
                if tx.blocking_send(ChannelOutput::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone
            Err(e) => {
                trace!("pty read ended: {}", e);
                break;
            }
        }
    }

    let exit_code = wait_for_exit(&pty);
    debug!("local shell exited with code {:?}", exit_code);
    let _ = tx.blocking_send(ChannelOutput::Closed(ChannelExit { exit_code }));
}

fn wait_for_exit(pty: &Pty) -> Option<u32> {
    // EOF can arrive slightly before the child is reapable
    for _ in 0..20 {
        match pty.try_wait() {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                warn!("failed to reap local shell: {}", e);
                return None;
            }
        }
    }
    None
}
