//! Synchronous notification bus
//!
//! Handlers are keyed by event type and run on the publishing thread, in the
//! order they subscribed. A slow handler delays the publisher; handlers that
//! need to do real work should hand the event to their own task.

use crate::types::*;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A block became part of the active chain.
#[derive(Debug, Clone)]
pub struct BlockConnected(pub ChainedHeaderBlock);

/// A block left the active chain.
#[derive(Debug, Clone)]
pub struct BlockDisconnected(pub ChainedHeaderBlock);

/// A transaction was admitted to the mempool.
#[derive(Debug, Clone)]
pub struct TransactionReceived(pub Transaction);

/// Handle returned by [`Signals::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    event: TypeId,
    id: u64,
}

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

#[derive(Default)]
pub struct Signals {
    handlers: RwLock<HashMap<TypeId, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E, F>(&self, handler: F) -> SubscriptionToken
    where
        E: Any + Send + Sync,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = TypeId::of::<E>();
        let handler: Handler = Arc::new(move |payload: &dyn Any| {
            if let Some(payload) = payload.downcast_ref::<E>() {
                handler(payload);
            }
        });
        self.handlers.write().entry(event).or_default().push((id, handler));
        SubscriptionToken { event, id }
    }

    /// Remove a subscription; `false` if it was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get_mut(&token.event) {
            Some(list) => {
                let before = list.len();
                list.retain(|(id, _)| *id != token.id);
                list.len() != before
            }
            None => false,
        }
    }

    /// Deliver `event` to every current subscriber of its type.
    ///
    /// The subscriber list is copied first, so handlers may subscribe or
    /// unsubscribe without deadlocking; such changes apply from the next
    /// publish on.
    pub fn publish<E: Any + Send + Sync>(&self, event: &E) {
        let snapshot: Vec<Handler> = match self.handlers.read().get(&TypeId::of::<E>()) {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return,
        };
        trace!(subscribers = snapshot.len(), event = std::any::type_name::<E>(), "publishing");
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count<E: Any>(&self) -> usize {
        self.handlers.read().get(&TypeId::of::<E>()).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signals").field("event_types", &self.handlers.read().len()).finish()
    }
}
