//! Replay buffer plus fan-out to live viewers.
//!
//! Appends and fan-out happen under one lock, so every viewer observes the
//! same order the buffer does. Viewer queues are bounded; a viewer that falls
//! a full queue behind is disconnected instead of being shown a gap. It can
//! re-attach from its last offset and learn from
//! [`Subscription::truncated`] whether anything was lost.

use crate::ring::{BufferRead, OutputRing};
use crate::status::SessionStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

pub type SubscriberId = u64;

/// What a viewer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Vec<u8>),
    Status(SessionStatus),
    /// The channel went away. `status` is `Stopped` or `Crashed`.
    Closed {
        status: SessionStatus,
        exit_code: Option<u32>,
    },
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<SessionEvent>,
}

struct HubState {
    ring: OutputRing,
    subscribers: Vec<Subscriber>,
    next_id: SubscriberId,
}

pub struct OutputHub {
    state: Mutex<HubState>,
    queue: usize,
}

impl OutputHub {
    pub fn new(capacity: usize, queue: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                ring: OutputRing::new(capacity),
                subscribers: Vec::new(),
                next_id: 1,
            }),
            queue: queue.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record output and hand a copy to every viewer.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.ring.append(data);
        fan_out(&mut state.subscribers, SessionEvent::Output(data.to_vec()));
    }

    /// Send a non-output event to every viewer.
    pub fn broadcast(&self, event: SessionEvent) {
        let mut state = self.lock();
        fan_out(&mut state.subscribers, event);
    }

    /// Register a viewer.
    ///
    /// The replay starts at `since` (or the oldest retained byte) and ends at
    /// [`Subscription::offset`]; live events pick up exactly there.
    pub fn subscribe(self: &Arc<Self>, since: Option<u64>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue);
        let mut state = self.lock();
        let from = since.unwrap_or_else(|| state.ring.start_offset());
        let BufferRead {
            data,
            next_offset,
            truncated,
        } = state.ring.read_since(from);

        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber { id, tx });
        trace!("viewer {} attached at offset {}", id, next_offset);

        Subscription {
            id,
            snapshot: data,
            offset: next_offset,
            truncated,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a viewer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().ring.snapshot()
    }

    pub fn read_since(&self, offset: u64) -> BufferRead {
        self.lock().ring.read_since(offset)
    }

    pub fn end_offset(&self) -> u64 {
        self.lock().ring.end_offset()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }
}

fn fan_out(subscribers: &mut Vec<Subscriber>, event: SessionEvent) {
    subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("viewer {} fell behind, disconnecting it", sub.id);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    });
}

/// A registered viewer: the replay it attached with, then live events.
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    pub id: SubscriberId,
    /// Buffered bytes up to [`offset`](Self::offset).
    pub snapshot: Vec<u8>,
    /// Absolute offset where live output continues.
    pub offset: u64,
    /// Part of the requested replay had already been evicted.
    pub truncated: bool,
    rx: mpsc::Receiver<SessionEvent>,
    hub: Weak<OutputHub>,
}

impl Subscription {
    /// Next event, or `None` once the viewer was disconnected or the session
    /// dropped.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("snapshot_len", &self.snapshot.len())
            .field("truncated", &self.truncated)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain_output(sub: &mut Subscription) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let SessionEvent::Output(data) = event {
                out.extend(data);
            }
        }
        out
    }

    #[test]
    fn test_late_viewer_sees_replay_then_live() {
        let hub = OutputHub::new(1024, 16);
        hub.append(b"before ");
        let mut sub = hub.subscribe(None);
        hub.append(b"after");

        assert_eq!(sub.snapshot, b"before ".to_vec());
        assert_eq!(sub.offset, 7);
        assert_eq!(drain_output(&mut sub), b"after".to_vec());
    }

    #[test]
    fn test_every_viewer_gets_identical_stream() {
        let hub = OutputHub::new(1024, 64);
        let mut a = hub.subscribe(None);
        let mut b = hub.subscribe(None);
        for chunk in [b"one ".as_slice(), b"two ", b"three"] {
            hub.append(chunk);
        }
        assert_eq!(drain_output(&mut a), b"one two three".to_vec());
        assert_eq!(drain_output(&mut b), b"one two three".to_vec());
    }

    #[test]
    fn test_slow_viewer_is_disconnected_not_gapped() {
        let hub = OutputHub::new(1024, 2);
        let mut slow = hub.subscribe(None);
        hub.append(b"a");
        hub.append(b"b");
        hub.append(b"c");
        hub.append(b"d");

        // Kept what fit, then the queue closed
        assert_eq!(drain_output(&mut slow), b"ab".to_vec());
        assert_eq!(hub.subscriber_count(), 0);

        let resumed = hub.subscribe(Some(2));
        assert_eq!(resumed.snapshot, b"cd".to_vec());
        assert!(!resumed.truncated);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = OutputHub::new(16, 4);
        let sub = hub.subscribe(None);
        let id = sub.id;
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!hub.unsubscribe(id));
    }

    #[test]
    fn test_status_events_are_ordered_with_output() {
        let hub = OutputHub::new(16, 8);
        let mut sub = hub.subscribe(None);
        hub.append(b"x");
        hub.broadcast(SessionEvent::Closed {
            status: SessionStatus::Crashed,
            exit_code: Some(1),
        });

        assert_eq!(sub.try_recv(), Some(SessionEvent::Output(b"x".to_vec())));
        assert_eq!(
            sub.try_recv(),
            Some(SessionEvent::Closed {
                status: SessionStatus::Crashed,
                exit_code: Some(1)
            })
        );
    }
}
