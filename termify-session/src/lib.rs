//! Terminal session engine.
//!
//! An [`Engine`] owns a registry of [`Session`]s. Each session pairs one
//! channel (a local PTY or an SSH shell) with a bounded replay buffer, a
//! fan-out to live viewers and a lifecycle state machine. On top of the raw
//! byte stream, [`Engine::execute`] runs a command and decides heuristically
//! when its output is complete.

mod config;
mod engine;
mod error;
mod executor;
mod hub;
mod prompt;
mod registry;
mod ring;
mod session;
mod status;

pub use config::{
    BufferConfig, ConfigError, DEFAULT_PROMPT_PATTERN, EngineConfig, ExecuteConfig, LocalConfig,
    SshConfig,
};
pub use engine::{
    ConnectionFailure, ConnectionReport, CreateSession, Engine, StopOptions, WriteOptions,
};
pub use error::{EngineError, ErrorKind};
pub use executor::{ExecuteOptions, ExecuteOutput};
pub use hub::{OutputHub, SessionEvent, SubscriberId, Subscription};
pub use prompt::{PromptDetector, PromptMatcher};
pub use registry::SessionRegistry;
pub use ring::{BufferRead, OutputRing};
pub use session::{Session, SessionInfo};
pub use status::SessionStatus;

// Channel types callers need to describe a session
pub use termify_channel::{
    Backing, ChannelKind, Geometry, LocalSpawn, ServerInfo, SshAuth, SshTarget,
};
