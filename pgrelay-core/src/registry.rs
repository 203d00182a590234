//! Registry of active subscriptions
//!
//! Every live relay owns one dedicated connection; the registry tracks the
//! relay's control handle under a listener id so shutdown (and explicit
//! unsubscribe) can reach it. Mutated only through `register`/`unregister`
//! under a short synchronous lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{DbError, DbResult};
use crate::relay::{ChannelName, RelayHandle};

/// Identifier of one subscription: `<channel>_<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(String);

impl ListenerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListenerId {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

/// A subscription withdrawn from normal query service.
#[derive(Debug, Clone)]
pub struct ActiveListener {
    pub id: ListenerId,
    pub channel: ChannelName,
    pub handle: RelayHandle,
}

#[derive(Default)]
struct Inner {
    listeners: HashMap<ListenerId, ActiveListener>,
    closed: bool,
}

/// Concurrent map of active listeners
#[derive(Default)]
pub struct ListenerRegistry {
    next_seq: AtomicU64,
    inner: Mutex<Inner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a relay that has just started listening.
    ///
    /// Fails with [`DbError::ShuttingDown`] once the registry is closed.
    pub fn register(&self, channel: &ChannelName, handle: RelayHandle) -> DbResult<ListenerId> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = ListenerId(format!("{channel}_{seq}"));

        let mut inner = self.lock();
        if inner.closed {
            return Err(DbError::ShuttingDown);
        }
        inner.listeners.insert(
            id.clone(),
            ActiveListener {
                id: id.clone(),
                channel: channel.clone(),
                handle,
            },
        );
        tracing::debug!(listener_id = %id, active = inner.listeners.len(), "listener registered");
        Ok(id)
    }

    /// Stop tracking a listener. Unknown ids are a no-op.
    pub fn unregister(&self, id: &ListenerId) -> Option<ActiveListener> {
        let removed = self.lock().listeners.remove(id);
        if removed.is_some() {
            tracing::debug!(listener_id = %id, "listener unregistered");
        }
        removed
    }

    pub fn get(&self, id: &ListenerId) -> Option<ActiveListener> {
        self.lock().listeners.get(id).cloned()
    }

    pub fn contains(&self, id: &ListenerId) -> bool {
        self.lock().listeners.contains_key(id)
    }

    /// Copy of every active listener, ordered by id.
    pub fn snapshot(&self) -> Vec<ActiveListener> {
        let mut listeners: Vec<_> = self.lock().listeners.values().cloned().collect();
        listeners.sort_by(|a, b| a.id.cmp(&b.id));
        listeners
    }

    /// Refuse further registrations. Existing entries stay until unregistered.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn orders() -> ChannelName {
        ChannelName::parse("orders").unwrap()
    }

    #[test]
    fn unregister_twice_is_a_no_op() {
        let registry = ListenerRegistry::new();
        let id = registry.register(&orders(), RelayHandle::new()).unwrap();

        assert!(registry.contains(&id));
        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_id_is_ignored() {
        let registry = ListenerRegistry::new();
        assert!(registry.unregister(&ListenerId::from("orders_42")).is_none());
    }

    #[test]
    fn ids_are_unique_under_concurrent_registration() {
        let registry = Arc::new(ListenerRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| registry.register(&orders(), RelayHandle::new()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<ListenerId> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        assert_eq!(ids.len(), 400);
        assert_eq!(registry.len(), 400);
        assert!(ids.iter().all(|id| id.as_str().starts_with("orders_")));
    }

    #[test]
    fn closed_registry_refuses_registration() {
        let registry = ListenerRegistry::new();
        let id = registry.register(&orders(), RelayHandle::new()).unwrap();

        registry.close();

        assert!(registry.is_closed());
        assert!(matches!(
            registry.register(&orders(), RelayHandle::new()),
            Err(DbError::ShuttingDown)
        ));
        // existing entries survive until their relay drains
        assert!(registry.contains(&id));
        assert_eq!(registry.snapshot().len(), 1);
    }
}
