use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use plaza_types::events::{ChannelEvent, EventKind};

type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Identifies one registration; returned by [`Dispatcher::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken {
    kind: EventKind,
    id: u64,
}

impl HandlerToken {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Multiplexes inbound channel events to the handlers registered per event type.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl DispatcherInner {
    fn remove(&self, token: HandlerToken) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&token.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != token.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&token.kind);
        }
        removed
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. The registration lives as long as the
    /// returned guard.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerGuard
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        trace!("Registered handler {} for {}", id, kind);
        HandlerGuard {
            dispatcher: Arc::downgrade(&self.inner),
            token: Some(HandlerToken { kind, id }),
        }
    }

    /// Deregister by token. Returns false if it was already gone.
    pub fn off(&self, token: HandlerToken) -> bool {
        self.inner.remove(token)
    }

    /// Deliver one event to every handler registered for its type, in
    /// registration order. Returns the number of handlers invoked.
    ///
    /// The handler list is snapshotted first, so handlers may register or
    /// deregister freely; changes apply from the next event on.
    pub fn dispatch(&self, event: &ChannelEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Handler> = match self.inner.handlers.lock().get(&kind) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => Vec::new(),
        };

        if snapshot.is_empty() {
            trace!("No handlers for {}", kind);
        }
        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    /// Consume the inbound queue until it closes, one event at a time.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(&event);
        }
        debug!("Event queue closed, dispatcher stopping");
    }

    /// Total live registrations across all event types.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().values().map(Vec::len).sum()
    }

    pub fn handlers_for(&self, kind: EventKind) -> usize {
        self.inner.handlers.lock().get(&kind).map_or(0, Vec::len)
    }
}

/// Disposable registration handle. Dropping it deregisters the handler.
#[must_use = "dropping the guard deregisters the handler immediately"]
pub struct HandlerGuard {
    dispatcher: Weak<DispatcherInner>,
    token: Option<HandlerToken>,
}

impl HandlerGuard {
    pub fn token(&self) -> Option<HandlerToken> {
        self.token
    }

    /// Deregister now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let (Some(token), Some(inner)) = (self.token.take(), self.dispatcher.upgrade()) {
            inner.remove(token);
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for HandlerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerGuard").field("token", &self.token).finish()
    }
}
