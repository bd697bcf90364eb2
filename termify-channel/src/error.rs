use crate::pty::PtyError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("SSH protocol error: {0}")]
    ProtocolError(String),
    #[error("channel is closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<PtyError> for ChannelError {
    fn from(err: PtyError) -> Self {
        match err {
            PtyError::Io(e) => ChannelError::Io(e),
            other => ChannelError::SpawnFailed(other.to_string()),
        }
    }
}

impl ChannelError {
    pub(crate) fn io(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ChannelError::Io(io::Error::other(err))
    }
}
