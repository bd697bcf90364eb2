//! The entry point for everything outside the engine.

use crate::config::{ConfigError, EngineConfig};
use crate::error::{EngineError, ErrorKind};
use crate::executor::{ExecuteOptions, ExecuteOutput, Executor};
use crate::hub::{OutputHub, SubscriberId, Subscription};
use crate::prompt::PromptDetector;
use crate::registry::SessionRegistry;
use crate::ring::BufferRead;
use crate::session::{Session, SessionInfo};
use crate::status::SessionStatus;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use termify_channel::{Backing, ChannelOpener, Geometry, ServerInfo, SshTarget};
use tracing::{debug, info, warn};

/// Arguments for [`Engine::create`].
#[derive(Debug)]
pub struct CreateSession {
    pub id: String,
    pub owner_id: String,
    pub backing: Backing,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Drop the registry entry instead of keeping it as `Stopped`.
    pub remove: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Start the session first if it is stopped or crashed.
    pub auto_start: bool,
}

/// Outcome of [`Engine::test_connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ConnectionFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

pub struct Engine {
    config: EngineConfig,
    opener: Arc<dyn ChannelOpener>,
    detector: PromptDetector,
    registry: SessionRegistry,
}

impl Engine {
    /// Engine backed by real PTYs and SSH connections.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let opener = Arc::new(config.native_opener());
        Self::with_opener(config, opener)
    }

    pub fn with_opener(
        config: EngineConfig,
        opener: Arc<dyn ChannelOpener>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let detector = PromptDetector::from_config(&config.execute)?;
        Ok(Self {
            config,
            opener,
            detector,
            registry: SessionRegistry::new(),
        })
    }

    /// Replace the configured prompt heuristic.
    pub fn with_prompt_detector(mut self, detector: PromptDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn session(&self, id: &str) -> Result<Arc<Session>, EngineError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))
    }

    /// Register a session and start it.
    ///
    /// A stopped or crashed entry with the same id is reused with the new
    /// backing, keeping its buffer. A brand new entry that fails to start is
    /// removed again.
    pub async fn create(&self, request: CreateSession) -> Result<SessionInfo, EngineError> {
        let CreateSession {
            id,
            owner_id,
            backing,
            geometry,
        } = request;
        let geometry = geometry.validate()?;

        let Some(existing) = self.registry.get(&id).await else {
            let hub = OutputHub::new(
                self.config.buffer.capacity,
                self.config.buffer.subscriber_queue,
            );
            let session = Session::new(id.as_str(), owner_id, backing, geometry, hub)?;
            if self.registry.insert(Arc::clone(&session)).await.is_err() {
                return Err(EngineError::SessionExists(id));
            }
            match session.start_exclusive(self.opener.as_ref()).await {
                Ok(()) => {}
                // Another create reused the entry first; it owns it now
                Err(e @ EngineError::SessionExists(_)) => return Err(e),
                Err(e) => {
                    self.registry.remove_if_same(&id, &session).await;
                    return Err(e);
                }
            }
            info!("created session {}", id);
            return Ok(session.info());
        };

        existing
            .restart_with(owner_id, backing, geometry, self.opener.as_ref())
            .await?;
        info!("restarted session {}", id);
        Ok(existing.info())
    }

    /// Start an existing session. A running session is left alone.
    pub async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.session(id).await?.start(self.opener.as_ref()).await
    }

    /// Stop a session and return its final buffer.
    pub async fn stop(&self, id: &str, options: StopOptions) -> Result<Vec<u8>, EngineError> {
        let session = self.session(id).await?;
        let snapshot = session.stop().await;
        if options.remove {
            self.registry.remove_if_same(id, &session).await;
            debug!("removed session {}", id);
        }
        Ok(snapshot)
    }

    /// Stop a session and forget it.
    pub async fn kill(&self, id: &str) -> Result<Vec<u8>, EngineError> {
        self.stop(id, StopOptions { remove: true }).await
    }

    async fn running_session(&self, id: &str, auto_start: bool) -> Result<Arc<Session>, EngineError> {
        let session = self.session(id).await?;
        if auto_start && session.status() != SessionStatus::Running {
            debug!("auto-starting session {}", id);
            session.start(self.opener.as_ref()).await?;
        }
        Ok(session)
    }

    /// Send raw input to the shell.
    pub async fn write(
        &self,
        id: &str,
        data: &[u8],
        options: WriteOptions,
    ) -> Result<(), EngineError> {
        self.running_session(id, options.auto_start)
            .await?
            .write(data)
            .await
    }

    /// Run a command and wait for its output.
    pub async fn execute(
        &self,
        id: &str,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<ExecuteOutput, EngineError> {
        let session = self.running_session(id, options.auto_start).await?;
        let executor = Executor {
            detector: &self.detector,
            line_terminator: &self.config.execute.line_terminator,
            default_timeout: self.config.execute.timeout(),
        };
        executor.run(&session, command, &options).await
    }

    pub async fn resize(&self, id: &str, geometry: Geometry) -> Result<(), EngineError> {
        self.session(id).await?.resize(geometry).await
    }

    /// Everything currently buffered for a session.
    pub async fn get_buffer(&self, id: &str) -> Result<Vec<u8>, EngineError> {
        Ok(self.session(id).await?.snapshot())
    }

    /// Buffered bytes after `since`.
    pub async fn read_buffer(&self, id: &str, since: u64) -> Result<BufferRead, EngineError> {
        Ok(self.session(id).await?.read_buffer(since))
    }

    /// Attach a viewer: the current buffer, then live events.
    pub async fn subscribe(&self, id: &str) -> Result<Subscription, EngineError> {
        Ok(self.session(id).await?.subscribe(None))
    }

    pub async fn unsubscribe(&self, id: &str, subscriber: SubscriberId) -> Result<bool, EngineError> {
        Ok(self.session(id).await?.unsubscribe(subscriber))
    }

    pub async fn info(&self, id: &str) -> Result<SessionInfo, EngineError> {
        Ok(self.session(id).await?.info())
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.registry.list().await.iter().map(|s| s.info()).collect()
    }

    /// Authenticate against an SSH server without creating a session.
    pub async fn test_connection(&self, target: &SshTarget) -> ConnectionReport {
        match termify_channel::probe(target, &self.config.ssh_options()).await {
            Ok(server_info) => ConnectionReport {
                success: true,
                server_info: Some(server_info),
                error: None,
            },
            Err(e) => {
                let err = EngineError::from_open(e);
                debug!("connection test to {} failed: {}", target.host, err);
                ConnectionReport {
                    success: false,
                    server_info: None,
                    error: Some(ConnectionFailure {
                        kind: err.kind(),
                        message: err.to_string(),
                    }),
                }
            }
        }
    }

    /// Stop every session and empty the registry.
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain().await;
        if sessions.is_empty() {
            return;
        }
        info!("shutting down {} session(s)", sessions.len());
        join_all(sessions.iter().map(|s| s.stop())).await;
        for session in &sessions {
            if session.status() != SessionStatus::Stopped {
                warn!("session {} did not stop cleanly", session.id());
            }
        }
    }
}
