//! Run one command on a running session and decide when it is done.
//!
//! The session's write lock is held for the whole call, so the capture holds
//! exactly the output that followed this command. Completion is a race
//! between the timeout and the [`PromptDetector`] heuristic.

use crate::error::EngineError;
use crate::hub::SessionEvent;
use crate::prompt::PromptDetector;
use crate::session::Session;
use crate::status::SessionStatus;
use std::time::Duration;
use strip_ansi_escapes::strip_str;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Overall bound, counted from the moment the command is written.
    /// Falls back to the engine's configured timeout.
    pub timeout: Option<Duration>,
    /// Require a prompt on the last line, not just a quiet period.
    pub wait_for_prompt: bool,
    /// Start the session first if it is stopped or crashed.
    pub auto_start: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            wait_for_prompt: true,
            auto_start: false,
        }
    }
}

/// Output captured for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOutput {
    /// Raw bytes, including the shell's echo and escape sequences.
    pub output: Vec<u8>,
    pub timed_out: bool,
}

impl ExecuteOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Text with ANSI escape sequences removed.
    pub fn plain_text(&self) -> String {
        strip_str(self.text())
    }
}

pub(crate) struct Executor<'a> {
    pub detector: &'a PromptDetector,
    pub line_terminator: &'a str,
    pub default_timeout: Duration,
}

impl Executor<'_> {
    pub async fn run(
        &self,
        session: &Session,
        command: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecuteOutput, EngineError> {
        self.run_inner(session, command, options)
            .instrument(session.span().clone())
            .await
    }

    async fn run_inner(
        &self,
        session: &Session,
        command: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecuteOutput, EngineError> {
        let _guard = session.write_lock().lock().await;

        let mut subscription = session.subscribe_live();
        if session.status() != SessionStatus::Running {
            return Err(session.not_running());
        }
        let mut cursor = subscription.offset;
        debug!("executing {:?} at offset {}", command, cursor);

        let mut line = String::with_capacity(command.len() + self.line_terminator.len());
        line.push_str(command);
        line.push_str(self.line_terminator);
        session.write_locked(line.as_bytes()).await?;

        let quiescence = self.detector.quiescence();
        let deadline = sleep(options.timeout.unwrap_or(self.default_timeout));
        let quiet = sleep(quiescence);
        tokio::pin!(deadline, quiet);
        let mut quiet_armed = true;
        let mut captured = Vec::new();

        let timed_out = loop {
            tokio::select! {
                biased;

                _ = &mut deadline => break true,

                event = subscription.recv() => match event {
                    Some(SessionEvent::Output(data)) => {
                        cursor += data.len() as u64;
                        captured.extend_from_slice(&data);
                        quiet.as_mut().reset(Instant::now() + quiescence);
                        quiet_armed = true;
                    }
                    Some(SessionEvent::Status(SessionStatus::Running)) => {}
                    Some(SessionEvent::Status(status)) | Some(SessionEvent::Closed { status, .. }) => {
                        debug!("session left running ({}) during execute", status);
                        catch_up(session, &mut cursor, &mut captured);
                        break false;
                    }
                    None => {
                        if session.status() != SessionStatus::Running {
                            catch_up(session, &mut cursor, &mut captured);
                            break false;
                        }
                        // Fell behind and was disconnected; resume from the buffer
                        subscription = session.subscribe(Some(cursor));
                        if subscription.truncated {
                            warn!("execute capture lost output evicted from the buffer");
                        }
                        captured.extend_from_slice(&subscription.snapshot);
                        cursor = subscription.offset;
                        quiet.as_mut().reset(Instant::now() + quiescence);
                        quiet_armed = true;
                    }
                },

                _ = &mut quiet, if quiet_armed => {
                    if !options.wait_for_prompt || self.detector.prompt_visible(&captured) {
                        break false;
                    }
                    // Wait for more output before checking again
                    quiet_armed = false;
                }
            }
        };

        if timed_out {
            debug!("execute timed out after {} bytes", captured.len());
        }
        Ok(ExecuteOutput {
            output: captured,
            timed_out,
        })
    }
}

/// Append whatever the buffer holds past `cursor`. The pump has stopped by
/// the time a session leaves running, so this is the rest of the output.
fn catch_up(session: &Session, cursor: &mut u64, captured: &mut Vec<u8>) {
    let read = session.read_buffer(*cursor);
    if read.truncated {
        warn!("execute capture lost output evicted from the buffer");
    }
    captured.extend_from_slice(&read.data);
    *cursor = read.next_offset;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_strips_escapes() {
        let out = ExecuteOutput {
            output: b"\x1b[32mok\x1b[0m\n".to_vec(),
            timed_out: false,
        };
        assert_eq!(out.text(), "\x1b[32mok\x1b[0m\n");
        assert_eq!(out.plain_text(), "ok\n");
    }

    #[test]
    fn test_default_options_wait_for_prompt() {
        let options = ExecuteOptions::default();
        assert!(options.wait_for_prompt);
        assert!(!options.auto_start);
        assert_eq!(options.timeout, None);
    }
}
