//! Local terminal state for `termify shell`.

use crossterm::terminal;
use std::io::{self, IsTerminal};
use termify_channel::Geometry;

/// Puts the controlling terminal into raw mode until dropped.
///
/// A no-op when stdin is not a terminal.
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    pub fn new() -> io::Result<Self> {
        if !io::stdin().is_terminal() {
            return Ok(Self { enabled: false });
        }
        terminal::enable_raw_mode()?;
        Ok(Self { enabled: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled
            && let Err(e) = terminal::disable_raw_mode()
        {
            tracing::warn!("failed to restore terminal mode: {}", e);
        }
    }
}

/// Size of the controlling terminal, if there is one and it is usable.
pub fn current_geometry() -> Option<Geometry> {
    let (cols, rows) = terminal::size().ok()?;
    Geometry::new(cols, rows).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_mode_guard_without_tty() {
        // cargo test runs without a terminal on stdin
        if io::stdin().is_terminal() {
            return;
        }
        let guard = RawModeGuard::new().unwrap();
        assert!(!guard.enabled);
    }
}
