//! Byte-stream channels for termify sessions.
//!
//! A [`Channel`] is either a shell spawned on a local pseudo-terminal or an
//! interactive shell on an authenticated SSH connection. Both expose the same
//! write / resize / close surface and deliver their output as an
//! [`OutputStream`] of chunks that ends with a single
//! [`ChannelOutput::Closed`].

mod channel;
mod error;
mod geometry;
mod local;
mod pty;
mod ssh;

// Channel contract
pub use channel::{
    Backing, Channel, ChannelExit, ChannelKind, ChannelOpener, ChannelOutput, NativeOpener,
    OpenedChannel, OutputStream,
};

// Errors
pub use error::ChannelError;
pub use pty::PtyError;

// Terminal size
pub use geometry::{COLS_RANGE, Geometry, GeometryError, ROWS_RANGE};

// Local PTY shells
pub use local::{LocalChannel, LocalOptions, LocalSpawn};

// SSH transport
pub use ssh::{ServerInfo, SshAuth, SshChannel, SshOptions, SshTarget, probe};
