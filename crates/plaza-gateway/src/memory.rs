//! In-memory connector for tests and offline runs.
//!
//! Every successful `open` hands a [`MemoryServer`] to whoever holds the
//! [`MemoryServers`] receiver, which can then push events and read the
//! commands the client emitted.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::{sink, stream};
use tokio::sync::mpsc;
use uuid::Uuid;

use plaza_types::events::{ChannelCommand, ChannelEvent};

use crate::error::ChannelError;
use crate::transport::{ChannelLink, Connector};

pub struct MemoryConnector {
    accepted_tx: mpsc::UnboundedSender<MemoryServer>,
    user_id: Uuid,
    opens: AtomicUsize,
    refuse: AtomicUsize,
    live: Arc<AtomicUsize>,
}

/// Receiving side for the server half of every opened link.
pub struct MemoryServers {
    accepted_rx: mpsc::UnboundedReceiver<MemoryServer>,
}

impl MemoryServers {
    pub async fn accept(&mut self) -> Option<MemoryServer> {
        self.accepted_rx.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryServer> {
        self.accepted_rx.try_recv().ok()
    }
}

/// Server half of one link. Dropping it closes the link from the server side.
pub struct MemoryServer {
    pub token: String,
    events_tx: mpsc::UnboundedSender<Result<ChannelEvent, ChannelError>>,
    commands_rx: mpsc::UnboundedReceiver<ChannelCommand>,
}

impl MemoryServer {
    /// Returns false once the client side has gone away.
    pub fn push(&self, event: ChannelEvent) -> bool {
        self.events_tx.send(Ok(event)).is_ok()
    }

    pub fn push_error(&self, error: ChannelError) -> bool {
        self.events_tx.send(Err(error)).is_ok()
    }

    pub async fn next_command(&mut self) -> Option<ChannelCommand> {
        self.commands_rx.recv().await
    }

    pub fn try_command(&mut self) -> Option<ChannelCommand> {
        self.commands_rx.try_recv().ok()
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryConnector {
    pub fn new(user_id: Uuid) -> (Self, MemoryServers) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted_tx,
                user_id,
                opens: AtomicUsize::new(0),
                refuse: AtomicUsize::new(0),
                live: Arc::new(AtomicUsize::new(0)),
            },
            MemoryServers { accepted_rx },
        )
    }

    /// Refuse the next `n` open attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Number of successful opens so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of links whose client side is still alive.
    pub fn live_links(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, token: &str) -> Result<ChannelLink, ChannelError> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Connect("refused by memory connector".into()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        // Handshake acknowledgement is queued ahead of anything the test pushes
        let _ = events_tx.send(Ok(ChannelEvent::Ready {
            user_id: self.user_id,
        }));

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());

        let stream = stream::unfold((events_rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        });
        let sink = sink::unfold(commands_tx, |tx, cmd: ChannelCommand| async move {
            tx.send(cmd).map_err(|_| ChannelError::Closed)?;
            Ok::<_, ChannelError>(tx)
        });

        self.opens.fetch_add(1, Ordering::SeqCst);
        let _ = self.accepted_tx.send(MemoryServer {
            token: token.to_string(),
            events_tx,
            commands_rx,
        });

        Ok(ChannelLink::new(Box::pin(sink), Box::pin(stream)))
    }
}
