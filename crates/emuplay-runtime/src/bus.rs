//! Synchronous publish/subscribe for lifecycle notifications.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr)]
pub enum NotificationEvent {
    Connected,
    Disconnected,
    StateLoaded,
    StateSaved,
    PlaybackFinished,
    PauseRejected,
    GameStarted,
    GameStopped,
    GamePaused,
    GameResumed,
    GameReset,
    ServerStarted,
    ServerStopped,
    PeerConnected,
    PeerDisconnected,
    InputDropped,
    RecordingStarted,
    RecordingStopped,
    PlaybackStarted,
    NetplayError,
}

impl NotificationEvent {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, event: NotificationEvent) -> Result<(), ListenerError>;
}

impl<F> NotificationListener for F
where
    F: Fn(NotificationEvent) + Send + Sync,
{
    fn on_notification(&self, event: NotificationEvent) -> Result<(), ListenerError> {
        self(event);
        Ok(())
    }
}

/// Opaque registration token returned by [`NotificationBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct ChannelListener {
    tx: Sender<NotificationEvent>,
}

impl NotificationListener for ChannelListener {
    fn on_notification(&self, event: NotificationEvent) -> Result<(), ListenerError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ListenerError(format!(
                "channel full, {} dropped",
                event.name()
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(ListenerError("receiver dropped".to_string()))
            }
        }
    }
}

type Entry = (ListenerHandle, Arc<dyn NotificationListener>);

// Handles are unique across buses so a foreign handle never matches.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct BusInner {
    listeners: Mutex<Vec<Entry>>,
}

/// Cloneable handle to one listener table. Delivery happens on the
/// publishing thread, in registration order.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl NotificationListener + 'static) -> ListenerHandle {
        let handle = ListenerHandle(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((handle, Arc::new(listener)));
        handle
    }

    /// Forward events into a bounded channel. When the consumer falls behind,
    /// events are dropped for this listener only.
    pub fn subscribe_channel(
        &self,
        capacity: usize,
    ) -> (ListenerHandle, Receiver<NotificationEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (self.subscribe(ChannelListener { tx }), rx)
    }

    /// Returns whether `handle` was registered.
    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn publish(&self, event: NotificationEvent) {
        // Listeners may (un)subscribe from inside the callback.
        let listeners: Vec<Entry> = self.inner.listeners.lock().clone();
        trace!(event = event.name(), listeners = listeners.len(), "publish");
        for (handle, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_notification(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = handle.0, event = event.name(), error = %e, "listener failed");
                }
                Err(_) => {
                    warn!(listener = handle.0, event = event.name(), "listener panicked");
                }
            }
        }
    }
}
