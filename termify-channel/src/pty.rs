//! PTY (pseudo-terminal) handle for local shells.
//!
//! The master, child, reader and writer sit behind separate locks so a
//! blocking read on the pump thread never stalls writes, resizes or kills.
//! The reader is handed out once to the pump thread; the writer and master are
//! dropped on [`Pty::release`], which closes the device.

use portable_pty::{CommandBuilder, ExitStatus, MasterPty, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to create PTY: {0}")]
    Create(String),
    #[error("failed to spawn command: {0}")]
    Spawn(String),
    #[error("failed to clone reader: {0}")]
    CloneReader(String),
    #[error("failed to get writer: {0}")]
    Writer(String),
    #[error("failed to resize PTY: {0}")]
    Resize(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Pty {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl Pty {
    /// Open a PTY of the given size and spawn `cmd` on its slave side.
    pub(crate) fn spawn(cmd: CommandBuilder, size: PtySize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| PtyError::Create(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The master only sees EOF once every slave handle is gone.
        drop(pair.slave);

        let halves = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::CloneReader(e.to_string()))
            .and_then(|reader| {
                let writer = pair
                    .master
                    .take_writer()
                    .map_err(|e| PtyError::Writer(e.to_string()))?;
                Ok((reader, writer))
            });
        let (reader, writer) = match halves {
            Ok(halves) => halves,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Hand the reader to the pump. Returns `None` on every call after the first.
    pub(crate) fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        lock(&self.reader).take()
    }

    /// Write and flush `data`. Fails with `BrokenPipe` once released.
    pub(crate) fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        let writer = writer
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        writer.write_all(data)?;
        writer.flush()
    }

    pub(crate) fn resize(&self, size: PtySize) -> Result<(), PtyError> {
        let master = lock(&self.master);
        match master.as_ref() {
            Some(master) => master
                .resize(size)
                .map_err(|e| PtyError::Resize(e.to_string())),
            None => Err(PtyError::Resize("PTY already released".to_string())),
        }
    }

    pub(crate) fn process_id(&self) -> Option<u32> {
        lock(&self.child).process_id()
    }

    /// Try to reap the child without blocking.
    pub(crate) fn try_wait(&self) -> Result<Option<ExitStatus>, PtyError> {
        lock(&self.child)
            .try_wait()
            .map_err(|e| PtyError::Io(io::Error::other(e.to_string())))
    }

    pub(crate) fn kill(&self) -> Result<(), PtyError> {
        lock(&self.child)
            .kill()
            .map_err(|e| PtyError::Io(io::Error::other(e.to_string())))
    }

    /// Drop the writer and the master, closing the PTY device.
    pub(crate) fn release(&self) {
        lock(&self.writer).take();
        lock(&self.master).take();
    }
}
