use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use plaza_types::events::{ChannelCommand, ChannelEvent};
use plaza_types::models::Session;

use crate::error::ChannelError;
use crate::transport::{ChannelLink, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on open + `ready` acknowledgement.
    pub handshake_timeout: Duration,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Maximum backoff cap.
    pub backoff_max: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Delay before reconnect attempt `attempt`: zero for the first, then doubling, capped.
pub fn compute_backoff(attempt: u32, config: &ConnectionConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = config.backoff_base.as_millis() as u64;
    let max_ms = config.backoff_max.as_millis() as u64;
    let multiplier = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);

    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}

/// Owns the one push-channel connection of the process.
///
/// Created at session start and torn down with [`ConnectionManager::disconnect`]
/// at logout. Cloning shares the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    worker: Mutex<Option<Worker>>,
}

/// Handle to the background task driving the link.
struct Worker {
    token: String,
    credentials_tx: watch::Sender<String>,
    outbound_tx: mpsc::UnboundedSender<ChannelCommand>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionManager {
    /// Returns the manager and the single inbound event queue, in channel arrival order.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ConnectionInner {
                connector,
                config,
                state_tx: Arc::new(state_tx),
                events_tx,
                worker: Mutex::new(None),
            }),
        };
        (manager, events_rx)
    }

    /// Establish the connection, or reuse it.
    ///
    /// Same token: no-op. New token: the live link is told to reconnect with the
    /// new credentials; no second connection is created. Must be called inside
    /// a tokio runtime.
    pub fn connect(&self, session: &Session) {
        let mut worker = self.inner.worker.lock();

        if let Some(w) = worker.as_mut() {
            if w.token == session.token {
                debug!("Reusing channel connection for {}", session.user_id);
                return;
            }
            info!(
                "Credentials changed for {}, forcing channel reconnect",
                session.user_id
            );
            w.token = session.token.clone();
            w.credentials_tx.send_replace(session.token.clone());
            return;
        }

        info!("Opening channel connection for {}", session.user_id);

        let (credentials_tx, credentials_rx) = watch::channel(session.token.clone());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = LinkDriver {
            connector: self.inner.connector.clone(),
            config: self.inner.config.clone(),
            state_tx: self.inner.state_tx.clone(),
            events_tx: self.inner.events_tx.clone(),
        };
        let handle = tokio::spawn(driver.run(credentials_rx, outbound_rx, cancel.clone()));

        *worker = Some(Worker {
            token: session.token.clone(),
            credentials_tx,
            outbound_tx,
            cancel,
            handle,
        });
    }

    /// Tear the connection down and wait for the link task to exit.
    pub async fn disconnect(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!("Channel task ended abnormally: {}", e);
            }
            info!("Channel connection closed");
        }
        publish_state(&self.inner.state_tx, ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe connection-state transitions, e.g. for presence indicators.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Send a command over the live link. While not connected the command is
    /// dropped with a warning and `false` is returned; nothing is queued.
    pub fn emit(&self, cmd: ChannelCommand) -> bool {
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!("Dropping {} command while {:?}", cmd.name(), state);
            return false;
        }

        let worker = self.inner.worker.lock();
        match worker.as_ref() {
            Some(w) => w.outbound_tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

fn publish_state(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state_tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        debug!("Channel state {:?} -> {:?}", current, next);
        *current = next;
        true
    });
}

enum LinkEnd {
    Cancelled,
    CredentialsChanged,
    Lost(ChannelError),
}

/// Everything the background task needs; holds no reference back to the manager.
struct LinkDriver {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl LinkDriver {
    async fn run(
        self,
        mut credentials: watch::Receiver<String>,
        mut outbound: mpsc::UnboundedReceiver<ChannelCommand>,
        cancel: CancellationToken,
    ) {
        let mut attempt: u32 = 0;

        loop {
            let token = credentials.borrow_and_update().clone();
            publish_state(&self.state_tx, ConnectionState::Connecting);

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.handshake(&token) => opened,
            };

            match opened {
                Ok(link) => {
                    attempt = 0;
                    discard_stale(&mut outbound);
                    publish_state(&self.state_tx, ConnectionState::Connected);
                    info!("Channel connected");

                    let end = self
                        .drive(link, &mut credentials, &mut outbound, &cancel)
                        .await;
                    publish_state(&self.state_tx, ConnectionState::Disconnected);

                    match end {
                        LinkEnd::Cancelled => break,
                        LinkEnd::CredentialsChanged => {
                            info!("Reconnecting channel with new credentials");
                            continue;
                        }
                        LinkEnd::Lost(e) => warn!("Channel lost: {}", e),
                    }
                }
                Err(e) => {
                    publish_state(&self.state_tx, ConnectionState::Disconnected);
                    warn!("Channel connect attempt {} failed: {}", attempt + 1, e);
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = compute_backoff(attempt, &self.config);
            debug!("Next channel connect attempt in {:?}", delay);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                changed = credentials.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    attempt = 0;
                }
            }
        }

        publish_state(&self.state_tx, ConnectionState::Disconnected);
    }

    /// Open a link and wait for the server's `ready` acknowledgement.
    async fn handshake(&self, token: &str) -> Result<ChannelLink, ChannelError> {
        let limit = self.config.handshake_timeout;

        let attempt = async {
            let mut link = self.connector.open(token).await?;
            loop {
                let item = link.stream.next().await;
                match item {
                    Some(Ok(ChannelEvent::Ready { user_id })) => {
                        debug!("Handshake acknowledged for {}", user_id);
                        return Ok(link);
                    }
                    Some(Ok(event)) => {
                        let _ = self.events_tx.send(event);
                    }
                    Some(Err(e)) if !e.is_fatal() => {
                        warn!("Skipping undecodable frame during handshake: {}", e);
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(ChannelError::HandshakeRejected(
                            "closed before ready".into(),
                        ));
                    }
                }
            }
        };

        tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| ChannelError::HandshakeTimeout(limit))?
    }

    async fn drive(
        &self,
        link: ChannelLink,
        credentials: &mut watch::Receiver<String>,
        outbound: &mut mpsc::UnboundedReceiver<ChannelCommand>,
        cancel: &CancellationToken,
    ) -> LinkEnd {
        let ChannelLink {
            mut sink,
            mut stream,
        } = link;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LinkEnd::Cancelled,

                changed = credentials.changed() => {
                    return match changed {
                        Ok(()) => LinkEnd::CredentialsChanged,
                        Err(_) => LinkEnd::Cancelled,
                    };
                }

                cmd = outbound.recv() => {
                    let Some(cmd) = cmd else {
                        return LinkEnd::Cancelled;
                    };
                    trace!("-> {}", cmd.name());
                    if let Err(e) = sink.send(cmd).await {
                        return LinkEnd::Lost(e);
                    }
                }

                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        trace!("<- {}", event.kind());
                        if self.events_tx.send(event).is_err() {
                            // Nobody is consuming events any more
                            return LinkEnd::Cancelled;
                        }
                    }
                    Some(Err(e)) if !e.is_fatal() => {
                        warn!("Skipping undecodable frame: {}", e);
                    }
                    Some(Err(e)) => return LinkEnd::Lost(e),
                    None => return LinkEnd::Lost(ChannelError::Closed),
                },
            }
        }
    }
}

/// Commands accepted for a link that has since died are not replayed.
fn discard_stale(outbound: &mut mpsc::UnboundedReceiver<ChannelCommand>) {
    while let Ok(cmd) = outbound.try_recv() {
        warn!("Discarding {} command issued before reconnect", cmd.name());
    }
}
