//! Engine configuration, loadable from `termify.yaml`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use termify_channel::{LocalOptions, NativeOpener, SshOptions};
use thiserror::Error;

pub const DEFAULT_PROMPT_PATTERN: &str = r"[$#%>❯]\s*$";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid prompt pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub execute: ExecuteConfig,
    pub local: LocalConfig,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BufferConfig {
    /// Replay buffer cap in bytes.
    pub capacity: usize,
    /// Per-viewer queue depth in chunks.
    pub subscriber_queue: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            subscriber_queue: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ExecuteConfig {
    pub timeout_ms: u64,
    pub quiescence_ms: u64,
    pub prompt_pattern: String,
    pub line_terminator: String,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            quiescence_ms: 200,
            prompt_pattern: DEFAULT_PROMPT_PATTERN.to_string(),
            line_terminator: "\n".to_string(),
        }
    }
}

impl ExecuteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LocalConfig {
    pub shell: String,
    pub term: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        let defaults = LocalOptions::default();
        Self {
            shell: defaults.shell,
            term: defaults.term,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SshConfig {
    pub connect_timeout_ms: u64,
    /// Zero disables keepalives.
    pub keepalive_secs: u64,
    pub term: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            keepalive_secs: 30,
            term: "xterm-256color".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML config file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer.capacity must be greater than zero".to_string(),
            ));
        }
        if self.buffer.subscriber_queue == 0 {
            return Err(ConfigError::Invalid(
                "buffer.subscriberQueue must be greater than zero".to_string(),
            ));
        }
        if self.execute.quiescence_ms == 0 {
            return Err(ConfigError::Invalid(
                "execute.quiescenceMs must be greater than zero".to_string(),
            ));
        }
        if self.ssh.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ssh.connectTimeoutMs must be greater than zero".to_string(),
            ));
        }
        Regex::new(&self.execute.prompt_pattern)?;
        Ok(())
    }

    /// Opener for real local PTYs and SSH connections under this config.
    pub fn native_opener(&self) -> NativeOpener {
        NativeOpener {
            local: LocalOptions {
                shell: self.local.shell.clone(),
                term: self.local.term.clone(),
            },
            ssh: self.ssh_options(),
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout: Duration::from_millis(self.ssh.connect_timeout_ms),
            keepalive: (self.ssh.keepalive_secs > 0)
                .then(|| Duration::from_secs(self.ssh.keepalive_secs)),
            term: self.ssh.term.clone(),
        }
    }
}
