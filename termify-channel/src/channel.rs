//! The channel contract shared by local and remote shells.

use crate::error::ChannelError;
use crate::geometry::Geometry;
use crate::local::{LocalChannel, LocalOptions, LocalSpawn};
use crate::ssh::{SshChannel, SshOptions, SshTarget};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Depth of the queue between a channel's reader and its consumer, in chunks.
pub(crate) const OUTPUT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Local,
    Remote,
}

/// How a channel ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelExit {
    /// Exit code of the shell, when the OS or the SSH server reported one.
    pub exit_code: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    Data(Vec<u8>),
    Closed(ChannelExit),
}

/// Output of an open channel, in production order.
///
/// Yields `Data` chunks followed by exactly one `Closed`, then `None`. If the
/// producer goes away without saying goodbye a `Closed` with no exit code is
/// synthesized, so consumers always observe the end.
pub struct OutputStream {
    rx: mpsc::Receiver<ChannelOutput>,
    finished: bool,
}

impl OutputStream {
    pub fn new(rx: mpsc::Receiver<ChannelOutput>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }

    /// Create a producer handle and the stream it feeds.
    pub fn channel(capacity: usize) -> (mpsc::Sender<ChannelOutput>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    pub async fn next(&mut self) -> Option<ChannelOutput> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(ChannelOutput::Closed(exit)) => {
                self.finished = true;
                Some(ChannelOutput::Closed(exit))
            }
            Some(data) => Some(data),
            None => {
                self.finished = true;
                Some(ChannelOutput::Closed(ChannelExit::default()))
            }
        }
    }
}

/// A live byte stream to a shell.
///
/// Resources behind a channel are released by the first call to
/// [`Channel::close`]; later calls are no-ops and writes fail with
/// [`ChannelError::Closed`].
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn write(&self, data: &[u8]) -> Result<(), ChannelError>;

    async fn resize(&self, geometry: Geometry) -> Result<(), ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

pub struct OpenedChannel {
    pub channel: Arc<dyn Channel>,
    pub output: OutputStream,
}

/// What a session's shell runs on.
#[derive(Debug)]
pub enum Backing {
    Local(LocalSpawn),
    Remote(SshTarget),
}

impl Backing {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Backing::Local(_) => ChannelKind::Local,
            Backing::Remote(_) => ChannelKind::Remote,
        }
    }

    /// Human-readable target, free of credentials.
    pub fn target(&self) -> String {
        match self {
            Backing::Local(spawn) => match &spawn.cwd {
                Some(cwd) => format!("local:{}", cwd.display()),
                None => "local".to_string(),
            },
            Backing::Remote(target) => {
                format!("{}@{}:{}", target.username, target.host, target.port)
            }
        }
    }
}

/// Turns a [`Backing`] into an open channel.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(
        &self,
        backing: &Backing,
        geometry: Geometry,
    ) -> Result<OpenedChannel, ChannelError>;
}

/// Opener backed by real PTYs and SSH connections.
#[derive(Debug, Clone, Default)]
pub struct NativeOpener {
    pub local: LocalOptions,
    pub ssh: SshOptions,
}

#[async_trait]
impl ChannelOpener for NativeOpener {
    async fn open(
        &self,
        backing: &Backing,
        geometry: Geometry,
    ) -> Result<OpenedChannel, ChannelError> {
        match backing {
            Backing::Local(spawn) => {
                // openpty and fork/exec block
                let spawn = spawn.clone();
                let options = self.local.clone();
                tokio::task::spawn_blocking(move || {
                    LocalChannel::open(&spawn, &options, geometry)
                })
                .await
                .map_err(ChannelError::io)?
            }
            Backing::Remote(target) => SshChannel::open(target, &self.ssh, geometry).await,
        }
    }
}
