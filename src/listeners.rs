//! Listener registry: ordered observer sets per event kind and the pending
//! IQ correlation table.
//!
//! Listeners are identified by `Arc` pointer identity, so registering the same
//! `Arc` twice is a no-op. Dispatch iterates a snapshot taken under the lock
//! and never holds the lock while a callback runs, so callbacks may freely
//! register or remove listeners (changes apply from the next event on).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::jid::Jid;
use crate::stanza::{Iq, Message, Presence};

/// Notified when the connection dies. This is the only channel through which
/// fatal conditions are reported.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_failed(&self, message: &str);
}

pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &Message);
}

pub trait PresenceListener: Send + Sync {
    fn on_presence(&self, presence: &Presence);
}

/// Returns `true` when the listener handled the query. A query that no
/// listener handles is answered with an error.
pub trait IqListener: Send + Sync {
    fn on_iq(&self, iq: &Iq) -> bool;
}

/// Callbacks never run under these locks, so poisoning cannot leave the data
/// half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    // Data pointers only: vtables may be duplicated across codegen units.
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// An ordered set of listeners with snapshot iteration.
pub struct ListenerSet<T: ?Sized> {
    entries: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Appends `listener` unless it is already registered. Returns whether it
    /// was inserted.
    pub fn add(&self, listener: Arc<T>) -> bool {
        let mut entries = lock(&self.entries);
        if entries.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        entries.push(listener);
        true
    }

    /// Removes `listener`. Returns `false` if it was not registered.
    pub fn remove(&self, listener: &Arc<T>) -> bool {
        let mut entries = lock(&self.entries);
        match entries.iter().position(|l| same_listener(l, listener)) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, listener: &Arc<T>) -> bool {
        lock(&self.entries).iter().any(|l| same_listener(l, listener))
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registration-ordered copy of the current members.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        lock(&self.entries).clone()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Correlation key for a pending query: the responder's full address and
/// the request id, compared field by field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub from: String,
    pub id: String,
}

impl PendingKey {
    pub fn new(from: &Jid, id: impl Into<String>) -> Self {
        Self {
            from: from.to_string(),
            id: id.into(),
        }
    }
}

/// One-shot IQ response handlers keyed by `(responder, id)`.
#[derive(Default)]
pub struct PendingIqs {
    entries: Mutex<HashMap<PendingKey, Arc<dyn IqListener>>>,
}

impl PendingIqs {
    /// Registers `listener` for the response to `id` from `from`, replacing
    /// any listener already waiting on the same key.
    pub fn insert(&self, from: &Jid, id: impl Into<String>, listener: Arc<dyn IqListener>) {
        lock(&self.entries).insert(PendingKey::new(from, id), listener);
    }

    /// Removes and returns the listener for `key`, if any.
    pub fn take(&self, key: &PendingKey) -> Option<Arc<dyn IqListener>> {
        lock(&self.entries).remove(key)
    }

    pub fn contains(&self, key: &PendingKey) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// All listeners of one connection.
#[derive(Default)]
pub struct Listeners {
    pub connection: ListenerSet<dyn ConnectionListener>,
    pub message: ListenerSet<dyn MessageListener>,
    pub presence: ListenerSet<dyn PresenceListener>,
    pub iq: ListenerSet<dyn IqListener>,
    pub pending: PendingIqs,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch_connection_failed(&self, message: &str) {
        for listener in self.connection.snapshot() {
            listener.on_connection_failed(message);
        }
    }

    pub fn dispatch_message(&self, message: &Message) {
        for listener in self.message.snapshot() {
            listener.on_message(message);
        }
    }

    pub fn dispatch_presence(&self, presence: &Presence) {
        for listener in self.presence.snapshot() {
            listener.on_presence(presence);
        }
    }

    /// Routes `iq` to its pending listener if one is waiting on `(from, id)`,
    /// otherwise to every generic IQ listener. Returns whether anyone handled
    /// it.
    ///
    /// A pending entry is consumed on match even if its listener reports the
    /// response as unhandled; the generic listeners are not consulted then.
    pub fn dispatch_iq(&self, iq: &Iq) -> bool {
        if let Some(from) = &iq.from {
            let key = PendingKey::new(from, iq.id.as_str());
            if let Some(listener) = self.pending.take(&key) {
                debug!(from = %key.from, id = %key.id, "Dispatching IQ to pending listener");
                return listener.on_iq(iq);
            }
        }

        let mut handled = false;
        for listener in self.iq.snapshot() {
            handled |= listener.on_iq(iq);
        }
        handled
    }
}
