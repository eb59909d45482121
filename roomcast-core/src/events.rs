//! Observable components
//!
//! Components hold an [`EventEmitter`] by composition. Listeners are either
//! callbacks, invoked synchronously in registration order inside `emit`, or
//! channel subscribers that receive a clone of every event.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle returned by [`EventEmitter::on`], used to unregister
pub type ListenerId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Listener<E> {
    Callback(Callback<E>),
    Channel(mpsc::UnboundedSender<E>),
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(f) => Self::Callback(Arc::clone(f)),
            Self::Channel(tx) => Self::Channel(tx.clone()),
        }
    }
}

pub struct EventEmitter<E> {
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl<E: Clone + Send + 'static> EventEmitter<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback listener
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.push(Listener::Callback(Arc::new(listener)))
    }

    /// Register a channel subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Listener::Channel(tx));
        rx
    }

    /// Remove a listener, returns false if it was not registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Dispatch an event to every listener in registration order
    ///
    /// The listener list is snapshotted first, so a callback may register or
    /// remove listeners without deadlocking; such changes apply to the next
    /// event.
    pub fn emit(&self, event: E) {
        let snapshot: Vec<(ListenerId, Listener<E>)> = self.listeners.read().clone();
        let mut dropped = Vec::new();

        for (id, listener) in snapshot {
            match listener {
                Listener::Callback(callback) => callback(&event),
                Listener::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        dropped.push(id);
                    }
                }
            }
        }

        if !dropped.is_empty() {
            self.listeners
                .write()
                .retain(|(id, _)| !dropped.contains(id));
        }
    }

    fn push(&self, listener: Listener<E>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let emitter = EventEmitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            emitter.on(move |value| seen.lock().push(format!("{tag}:{value}")));
        }

        emitter.emit(7);
        assert_eq!(*seen.lock(), vec!["first:7", "second:7", "third:7"]);
    }

    #[test]
    fn test_off_removes_listener() {
        let emitter = EventEmitter::<u32>::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let id = emitter.on(move |_| *counter.lock() += 1);

        emitter.emit(1);
        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        emitter.emit(2);

        assert_eq!(*count.lock(), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscribers_are_pruned_when_dropped() {
        let emitter = EventEmitter::<&'static str>::new();
        let mut rx = emitter.subscribe();
        let dropped = emitter.subscribe();
        drop(dropped);

        emitter.emit("hello");
        assert_eq!(rx.recv().await, Some("hello"));
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_listener_may_register_during_emit() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let inner = Arc::clone(&emitter);
        emitter.on(move |_| {
            inner.on(|_| {});
        });

        emitter.emit(1);
        assert_eq!(emitter.listener_count(), 2);
    }
}
