//! Keyed event listener registry with tracked asynchronous fan-out

use crate::constants::LISTEN_ALL;
use crate::event::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::trace;

/// Callback invoked for each matching event.
pub type EventListener = Arc<dyn Fn(Event) + Send + Sync>;

/// Handle returned by registration, used to remove the listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listeners grouped by correlation key.
///
/// A key is either [`LISTEN_ALL`] or a UUID matched against an event's
/// `Unique-ID`, `Application-UUID`, and `Job-UUID` headers. Each callback
/// runs on its own tracked task so a slow or panicking listener cannot
/// stall dispatch or its peers.
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, HashMap<ListenerId, EventListener>>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tracker: TaskTracker::new(),
        }
    }

    /// Register a callback under `key`, returning its removal handle.
    pub async fn register(&self, key: impl Into<String>, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().await.entry(key.into()).or_default().insert(id, listener);
        id
    }

    /// Remove one listener. Unknown ids are ignored; an emptied key is
    /// dropped from the table.
    pub async fn remove(&self, key: &str, id: ListenerId) {
        let mut listeners = self.listeners.write().await;
        if let Some(group) = listeners.get_mut(key) {
            group.remove(&id);
            if group.is_empty() {
                listeners.remove(key);
            }
        }
    }

    /// Fan an event out to every matching listener.
    ///
    /// The ALL group always matches; the event's `Unique-ID`,
    /// `Application-UUID`, and `Job-UUID` headers each match their own
    /// group. A listener registered under several matching keys runs once
    /// per match. Callbacks are spawned, not awaited.
    pub async fn dispatch(&self, event: &Event) {
        if self.tracker.is_closed() {
            return;
        }

        let mut keys: Vec<String> = vec![LISTEN_ALL.to_string()];
        for uuid in [
            event.unique_id(),
            event.application_uuid(),
            event.job_uuid(),
        ]
        .into_iter()
        .flatten() {
            keys.push(uuid);
        }

        let listeners = self.listeners.read().await;
        for key in keys {
            let Some(group) = listeners.get(&key) else {
                continue;
            };
            trace!(key = %key, count = group.len(), "dispatching event");
            for listener in group.values() {
                let listener = Arc::clone(listener);
                let event = event.clone();
                self.tracker
                    .spawn(async move {
                        listener(event);
                    });
            }
        }
    }

    /// Stop accepting new callbacks and wait for in-flight ones to finish.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
