use crate::status::SessionStatus;
use strum::Display;
use termify_channel::{ChannelError, GeometryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("session {id} is not running (status: {status})")]
    SessionNotRunning { id: String, status: SessionStatus },
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    GeometryInvalid(#[from] GeometryError),
    #[error("session {0} is already running")]
    SessionExists(String),
    #[error("channel I/O failed: {0}")]
    ChannelIo(String),
}

/// Fieldless mirror of [`EngineError`] for mapping onto transport codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SpawnFailed,
    Unreachable,
    AuthFailed,
    ProtocolError,
    SessionNotRunning,
    SessionNotFound,
    GeometryInvalid,
    SessionExists,
    ChannelIo,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::SpawnFailed(_) => ErrorKind::SpawnFailed,
            EngineError::Unreachable(_) => ErrorKind::Unreachable,
            EngineError::AuthFailed(_) => ErrorKind::AuthFailed,
            EngineError::ProtocolError(_) => ErrorKind::ProtocolError,
            EngineError::SessionNotRunning { .. } => ErrorKind::SessionNotRunning,
            EngineError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            EngineError::GeometryInvalid(_) => ErrorKind::GeometryInvalid,
            EngineError::SessionExists(_) => ErrorKind::SessionExists,
            EngineError::ChannelIo(_) => ErrorKind::ChannelIo,
        }
    }

    /// Map an error raised while opening a channel.
    ///
    /// Nothing is open yet, so I/O trouble counts as a spawn failure.
    pub(crate) fn from_open(err: ChannelError) -> Self {
        match err {
            ChannelError::Unreachable(msg) => EngineError::Unreachable(msg),
            ChannelError::AuthFailed(msg) => EngineError::AuthFailed(msg),
            ChannelError::ProtocolError(msg) => EngineError::ProtocolError(msg),
            ChannelError::SpawnFailed(msg) => EngineError::SpawnFailed(msg),
            other => EngineError::SpawnFailed(other.to_string()),
        }
    }

    /// Map an error raised by a write or resize on an open channel.
    ///
    /// `status` is where the session stands now that the channel failed.
    pub(crate) fn from_io(id: &str, status: SessionStatus, err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => EngineError::SessionNotRunning {
                id: id.to_string(),
                status,
            },
            other => EngineError::ChannelIo(other.to_string()),
        }
    }
}
