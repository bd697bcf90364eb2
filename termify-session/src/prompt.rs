//! Completion heuristics for the command executor.
//!
//! A shell gives no signal when a command is done. The executor treats a
//! command as finished when output has been quiet for the quiescence window
//! and, when asked to, the last visible line looks like a prompt. Both are
//! guesses about the remote shell and can be wrong for unusual prompts.

use crate::config::{ConfigError, ExecuteConfig};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// Only the tail of the capture is inspected for a prompt.
const PROMPT_SCAN_BYTES: usize = 4096;

/// Decides whether a line of terminal output is a shell prompt.
pub trait PromptMatcher: Send + Sync {
    fn is_prompt(&self, line: &str) -> bool;
}

impl PromptMatcher for Regex {
    fn is_prompt(&self, line: &str) -> bool {
        self.is_match(line)
    }
}

/// Prompt matcher plus the silence window that must precede a decision.
#[derive(Clone)]
pub struct PromptDetector {
    matcher: Arc<dyn PromptMatcher>,
    quiescence: Duration,
}

impl PromptDetector {
    pub fn new(matcher: impl PromptMatcher + 'static, quiescence: Duration) -> Self {
        Self {
            matcher: Arc::new(matcher),
            quiescence,
        }
    }

    pub fn from_config(config: &ExecuteConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            Regex::new(&config.prompt_pattern)?,
            config.quiescence(),
        ))
    }

    pub fn quiescence(&self) -> Duration {
        self.quiescence
    }

    /// Whether the last line of `captured` looks like a prompt.
    pub fn prompt_visible(&self, captured: &[u8]) -> bool {
        let tail = &captured[captured.len().saturating_sub(PROMPT_SCAN_BYTES)..];
        let plain = strip_ansi_escapes::strip(tail);
        let text = String::from_utf8_lossy(&plain);
        let line: String = last_line(&text).chars().filter(|c| *c != '\r').collect();
        !line.trim().is_empty() && self.matcher.is_prompt(&line)
    }
}

impl std::fmt::Debug for PromptDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptDetector")
            .field("quiescence", &self.quiescence)
            .finish_non_exhaustive()
    }
}

fn last_line(text: &str) -> &str {
    text.rsplit('\n').next().unwrap_or(text)
}
