//! One shell, its replay buffer, its viewers and its lifecycle.
//!
//! Locks, in the order they may be taken:
//! - `write_lock` serializes everything sent to the channel, so keystrokes,
//!   resizes and executed commands never interleave. Held across a whole
//!   `execute`.
//! - `lifecycle` serializes start and stop. `stop` never takes `write_lock`,
//!   which is what lets it interrupt an in-flight `execute`.
//! - The std mutexes guard plain data and are never held across an await.
//!
//! The pump task is the only writer to the buffer.

use crate::error::EngineError;
use crate::hub::{OutputHub, SessionEvent, SubscriberId, Subscription};
use crate::ring::BufferRead;
use crate::status::{self, SessionStatus, Transition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use termify_channel::{
    Backing, Channel, ChannelError, ChannelKind, ChannelOpener, ChannelOutput, Geometry,
    OutputStream,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

/// How long `stop` lets the pump drain output after closing the channel.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A serializable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub owner_id: String,
    pub kind: ChannelKind,
    pub target: String,
    pub geometry: Geometry,
    pub status: SessionStatus,
    pub last_active_at: DateTime<Utc>,
    pub buffered_bytes: usize,
    /// Total bytes of output ever produced.
    pub output_offset: u64,
    pub subscribers: usize,
}

struct Live {
    channel: Arc<dyn Channel>,
    pump: JoinHandle<()>,
    stop_requested: CancellationToken,
}

pub struct Session {
    id: String,
    owner_id: Mutex<String>,
    backing: Mutex<Arc<Backing>>,
    geometry: Mutex<Geometry>,
    status: watch::Sender<SessionStatus>,
    hub: Arc<OutputHub>,
    /// Channel of the current run, present only while `Running`.
    channel: Mutex<Option<Arc<dyn Channel>>>,
    write_lock: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<Option<Live>>,
    last_active: Mutex<DateTime<Utc>>,
    span: tracing::Span,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        backing: Backing,
        geometry: Geometry,
        hub: Arc<OutputHub>,
    ) -> Result<Arc<Self>, EngineError> {
        let geometry = geometry.validate()?;
        let id = id.into();
        let (status, _) = watch::channel(SessionStatus::Stopped);
        Ok(Arc::new(Self {
            span: info_span!("session", id = %id),
            id,
            owner_id: Mutex::new(owner_id.into()),
            backing: Mutex::new(Arc::new(backing)),
            geometry: Mutex::new(geometry),
            status,
            hub,
            channel: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            lifecycle: tokio::sync::Mutex::new(None),
            last_active: Mutex::new(Utc::now()),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> String {
        lock(&self.owner_id).clone()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn geometry(&self) -> Geometry {
        *lock(&self.geometry)
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        *lock(&self.last_active)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.hub.snapshot()
    }

    pub fn read_buffer(&self, since: u64) -> BufferRead {
        self.hub.read_since(since)
    }

    pub fn subscribe(&self, since: Option<u64>) -> Subscription {
        self.hub.subscribe(since)
    }

    /// Subscribe to output produced from now on, with no replay.
    pub(crate) fn subscribe_live(&self) -> Subscription {
        self.hub.subscribe(Some(u64::MAX))
    }

    pub fn unsubscribe(&self, subscriber: SubscriberId) -> bool {
        self.hub.unsubscribe(subscriber)
    }

    pub fn info(&self) -> SessionInfo {
        let backing = Arc::clone(&lock(&self.backing));
        SessionInfo {
            id: self.id.clone(),
            owner_id: self.owner_id(),
            kind: backing.kind(),
            target: backing.target(),
            geometry: self.geometry(),
            status: self.status(),
            last_active_at: self.last_active_at(),
            buffered_bytes: self.hub.buffered_bytes(),
            output_offset: self.hub.end_offset(),
            subscribers: self.hub.subscriber_count(),
        }
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub(crate) fn write_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.write_lock
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_active) = Utc::now();
    }

    pub(crate) fn not_running(&self) -> EngineError {
        EngineError::SessionNotRunning {
            id: self.id.clone(),
            status: self.status(),
        }
    }

    /// Apply a lifecycle transition and tell viewers about it.
    fn transition(&self, transition: Transition) -> Option<SessionStatus> {
        let mut applied = None;
        self.status.send_if_modified(|current| {
            let Some(next) = status::next(*current, transition) else {
                return false;
            };
            debug!("{} -> {} on {:?}", current, next, transition);
            *current = next;
            applied = Some(next);
            // Inside the watch lock so viewers see transitions in order
            self.hub.broadcast(SessionEvent::Status(next));
            true
        });
        applied
    }

    /// Open the channel and start pumping. A running session is left alone.
    pub async fn start(self: &Arc<Self>, opener: &dyn ChannelOpener) -> Result<(), EngineError> {
        async {
            let mut live = self.lifecycle.lock().await;
            if self.status() == SessionStatus::Running {
                return Ok(());
            }
            self.start_locked(&mut live, opener).await
        }
        .instrument(self.span.clone())
        .await
    }

    /// Start a session nobody else has claimed yet.
    ///
    /// Unlike [`start`](Self::start), a session that is already live is an
    /// error, so the caller knows its request is the one that took effect.
    pub(crate) async fn start_exclusive(
        self: &Arc<Self>,
        opener: &dyn ChannelOpener,
    ) -> Result<(), EngineError> {
        async {
            let mut live = self.lifecycle.lock().await;
            if self.status().is_live() {
                return Err(EngineError::SessionExists(self.id.clone()));
            }
            self.start_locked(&mut live, opener).await
        }
        .instrument(self.span.clone())
        .await
    }

    /// Point a stopped or crashed session at a new shell and start it. The
    /// buffer is kept.
    ///
    /// The liveness check, the new settings and the start all happen under
    /// the lifecycle lock, so of two racing callers exactly one wins and the
    /// other gets `SessionExists`.
    pub(crate) async fn restart_with(
        self: &Arc<Self>,
        owner_id: String,
        backing: Backing,
        geometry: Geometry,
        opener: &dyn ChannelOpener,
    ) -> Result<(), EngineError> {
        let geometry = geometry.validate()?;
        async {
            let mut live = self.lifecycle.lock().await;
            if self.status().is_live() {
                return Err(EngineError::SessionExists(self.id.clone()));
            }
            *lock(&self.owner_id) = owner_id;
            *lock(&self.backing) = Arc::new(backing);
            *lock(&self.geometry) = geometry;
            self.start_locked(&mut live, opener).await
        }
        .instrument(self.span.clone())
        .await
    }

    async fn start_locked(
        self: &Arc<Self>,
        live: &mut Option<Live>,
        opener: &dyn ChannelOpener,
    ) -> Result<(), EngineError> {
        // A crashed run's pump has already closed its channel
        if let Some(previous) = live.take() {
            previous.stop_requested.cancel();
            let _ = previous.pump.await;
        }

        if self.transition(Transition::Start).is_none() {
            return Err(self.not_running());
        }
        let backing = Arc::clone(&lock(&self.backing));
        let geometry = self.geometry();
        debug!("opening {:?} channel to {}", backing.kind(), backing.target());

        let opened = match opener.open(&backing, geometry).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("failed to open channel: {}", e);
                self.transition(Transition::OpenFailed);
                self.hub.broadcast(SessionEvent::Closed {
                    status: SessionStatus::Crashed,
                    exit_code: None,
                });
                return Err(EngineError::from_open(e));
            }
        };

        // Running before the pump exists, so an instant exit still crashes
        *lock(&self.channel) = Some(Arc::clone(&opened.channel));
        self.transition(Transition::Opened);
        self.touch();

        let stop_requested = CancellationToken::new();
        let pump = tokio::spawn(
            Arc::clone(self)
                .pump(opened.output, Arc::clone(&opened.channel), stop_requested.clone())
                .instrument(self.span.clone()),
        );
        *live = Some(Live {
            channel: opened.channel,
            pump,
            stop_requested,
        });
        info!("session started on {}", backing.target());
        Ok(())
    }

    async fn pump(
        self: Arc<Self>,
        mut output: OutputStream,
        channel: Arc<dyn Channel>,
        stop_requested: CancellationToken,
    ) {
        let exit = loop {
            match output.next().await {
                Some(ChannelOutput::Data(data)) => {
                    trace!("pump {} bytes", data.len());
                    self.hub.append(&data);
                    self.touch();
                }
                Some(ChannelOutput::Closed(exit)) => break exit,
                None => break Default::default(),
            }
        };

        if stop_requested.is_cancelled() {
            return;
        }

        warn!("channel closed unexpectedly (exit code {:?})", exit.exit_code);
        lock(&self.channel).take();
        if let Err(e) = channel.close().await {
            debug!("closing crashed channel: {}", e);
        }
        if self.transition(Transition::ChannelClosed).is_some() {
            self.hub.broadcast(SessionEvent::Closed {
                status: SessionStatus::Crashed,
                exit_code: exit.exit_code,
            });
        }
    }

    /// Close the channel, end the pump and return the final buffer.
    pub async fn stop(&self) -> Vec<u8> {
        self.stop_inner().instrument(self.span.clone()).await
    }

    async fn stop_inner(&self) -> Vec<u8> {
        let mut live = self.lifecycle.lock().await;
        let was_running = self.status() == SessionStatus::Running;

        if let Some(Live {
            channel,
            mut pump,
            stop_requested,
        }) = live.take()
        {
            stop_requested.cancel();
            lock(&self.channel).take();
            if let Err(e) = channel.close().await {
                warn!("failed to close channel: {}", e);
            }
            // Let the pump take in what the shell printed on its way out
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump).await.is_err() {
                debug!("pump did not drain in time, aborting it");
                pump.abort();
            }
        }

        if self.transition(Transition::Stop).is_some() {
            info!("session stopped");
            if was_running {
                self.hub.broadcast(SessionEvent::Closed {
                    status: SessionStatus::Stopped,
                    exit_code: None,
                });
            }
        }
        self.hub.snapshot()
    }

    /// Send bytes to the shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;
        self.write_locked(data).await
    }

    /// Write while the caller already holds `write_lock`.
    pub(crate) async fn write_locked(&self, data: &[u8]) -> Result<(), EngineError> {
        let channel = lock(&self.channel).as_ref().map(Arc::clone);
        // Taken by stop or the pump; report where the session ends up
        let Some(channel) = channel else {
            return Err(self.io_error(ChannelError::Closed).await);
        };
        if let Err(e) = channel.write(data).await {
            return Err(self.io_error(e).await);
        }
        self.touch();
        Ok(())
    }

    /// Change the terminal size. A session that is not running keeps the
    /// new size for its next start.
    ///
    /// Waits behind an in-flight `execute`, like any other write.
    pub async fn resize(&self, geometry: Geometry) -> Result<(), EngineError> {
        let geometry = geometry.validate()?;
        let _guard = self.write_lock.lock().await;
        *lock(&self.geometry) = geometry;
        let channel = lock(&self.channel).as_ref().map(Arc::clone);
        if let Some(channel) = channel
            && let Err(e) = channel.resize(geometry).await
        {
            return Err(self.io_error(e).await);
        }
        Ok(())
    }

    /// Map a failed write or resize. A closed channel is reported with the
    /// status the session lands in once the pump or `stop` has seen it.
    async fn io_error(&self, err: ChannelError) -> EngineError {
        let status = match err {
            ChannelError::Closed => self.status_after_close().await,
            _ => self.status(),
        };
        EngineError::from_io(&self.id, status, err)
    }

    async fn status_after_close(&self) -> SessionStatus {
        let mut status = self.status.subscribe();
        let settled = tokio::time::timeout(
            PUMP_DRAIN_TIMEOUT,
            status.wait_for(|s| *s != SessionStatus::Running),
        )
        .await;
        match settled {
            Ok(Ok(settled)) => *settled,
            _ => SessionStatus::Crashed,
        }
    }
}
