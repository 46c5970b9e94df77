use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use plaza_gateway::{
    ConnectionConfig, ConnectionManager, ConnectionState, Connector, Dispatcher, HandlerGuard,
    SubscriptionRegistry,
};
use plaza_types::events::ChannelEvent;
use plaza_types::models::Session;

use crate::api::{
    CommentApi, CommunityApi, ConversationApi, Credentials, FeedApi, FollowApi, NotificationApi,
};
use crate::comments::CommentSynchronizer;
use crate::communities::CommunitySynchronizer;
use crate::conversations::{ConversationConfig, ConversationSynchronizer};
use crate::feed::{FeedConfig, FeedSynchronizer};
use crate::follows::FollowSynchronizer;
use crate::http::HttpApi;
use crate::notifications::NotificationSynchronizer;

/// Pull-side collaborators, one per synchronizer, plus the handle that
/// switches their credentials when the session changes.
#[derive(Clone)]
pub struct Apis {
    pub credentials: Arc<dyn Credentials>,
    pub feed: Arc<dyn FeedApi>,
    pub conversations: Arc<dyn ConversationApi>,
    pub notifications: Arc<dyn NotificationApi>,
    pub follows: Arc<dyn FollowApi>,
    pub communities: Arc<dyn CommunityApi>,
    pub comments: Arc<dyn CommentApi>,
}

impl Apis {
    /// Back every synchronizer with the same REST client.
    pub fn http(api: Arc<HttpApi>) -> Self {
        Self {
            credentials: api.clone(),
            feed: api.clone(),
            conversations: api.clone(),
            notifications: api.clone(),
            follows: api.clone(),
            communities: api.clone(),
            comments: api,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RealtimeConfig {
    pub connection: ConnectionConfig,
    pub feed: FeedConfig,
    pub conversations: ConversationConfig,
    /// Re-pull conversations and notifications this often. `None` disables it.
    pub resync_interval: Option<Duration>,
}

/// Session-scoped synchronizers. Cheap to clone.
#[derive(Clone)]
pub struct Synchronizers {
    pub feed: FeedSynchronizer,
    pub conversations: ConversationSynchronizer,
    pub notifications: NotificationSynchronizer,
    pub follows: FollowSynchronizer,
    pub communities: CommunitySynchronizer,
    pub comments: CommentSynchronizer,
}

impl Synchronizers {
    fn attach(&self, dispatcher: &Dispatcher) -> Vec<HandlerGuard> {
        let mut guards = self.feed.attach(dispatcher);
        guards.extend(self.conversations.attach(dispatcher));
        guards.extend(self.notifications.attach(dispatcher));
        guards.extend(self.communities.attach(dispatcher));
        guards
    }

    fn clear(&self) {
        self.feed.clear();
        self.conversations.clear();
        self.notifications.clear();
        self.follows.clear();
        self.communities.clear();
        self.comments.clear();
    }

    /// Pull the initial snapshots. Failures are logged; the next pull or push heals them.
    async fn pull_all(&self) {
        let (feed, conversations, notifications) = tokio::join!(
            self.feed.refresh(),
            self.conversations.refresh(),
            self.notifications.refresh()
        );
        if let Err(e) = feed {
            warn!("Initial feed pull failed: {}", e);
        }
        if let Err(e) = conversations {
            warn!("Initial conversation pull failed: {}", e);
        }
        if let Err(e) = notifications {
            warn!("Initial notification pull failed: {}", e);
        }
    }
}

struct ActiveSession {
    session: Session,
    sync: Synchronizers,
    handlers: Vec<HandlerGuard>,
    resync: Option<JoinHandle<()>>,
}

/// The reconciliation engine: one connection, one dispatcher, one registry,
/// and the synchronizers of the current session.
pub struct Realtime {
    connection: ConnectionManager,
    dispatcher: Dispatcher,
    registry: SubscriptionRegistry,
    apis: Apis,
    config: RealtimeConfig,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    active: Mutex<Option<ActiveSession>>,
}

impl Realtime {
    pub fn new(connector: Arc<dyn Connector>, apis: Apis, config: RealtimeConfig) -> Self {
        let (connection, events) = ConnectionManager::new(connector, config.connection.clone());
        let registry = SubscriptionRegistry::new(connection.clone());
        Self {
            connection,
            dispatcher: Dispatcher::new(),
            registry,
            apis,
            config,
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Vec::new()),
            active: Mutex::new(None),
        }
    }

    /// Start (or keep) the engine for `session` and return its synchronizers.
    ///
    /// Calling again with the same session reuses everything. A different
    /// session tears the previous one down first; the connection itself is
    /// kept and reconnects with the new credentials, and the pull-side
    /// collaborators switch to them before the first pull.
    pub async fn start(&self, session: Session) -> Synchronizers {
        let previous = {
            let mut active = self.active.lock();
            if let Some(current) = active.as_ref().filter(|a| a.session == session) {
                return current.sync.clone();
            }
            active.take()
        };
        if let Some(previous) = previous {
            info!("Switching session from {}", previous.session.user_id);
            release(previous);
        }

        self.spawn_background();

        self.apis.credentials.set_session(&session);
        let sync = self.build(&session);
        let handlers = sync.attach(&self.dispatcher);
        self.connection.connect(&session);
        info!(
            "Engine started for {} with {} handlers",
            session.user_id,
            handlers.len()
        );

        let resync = self
            .config
            .resync_interval
            .map(|every| spawn_resync(sync.clone(), every));

        *self.active.lock() = Some(ActiveSession {
            session,
            sync: sync.clone(),
            handlers,
            resync,
        });

        sync.pull_all().await;
        sync
    }

    /// Logout: drop handlers and state, then close the connection.
    pub async fn stop(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            info!("Stopping engine for {}", active.session.user_id);
            release(active);
        }
        self.connection.disconnect().await;
    }

    pub fn synchronizers(&self) -> Option<Synchronizers> {
        self.active.lock().as_ref().map(|a| a.sync.clone())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    fn build(&self, session: &Session) -> Synchronizers {
        Synchronizers {
            feed: FeedSynchronizer::new(
                self.apis.feed.clone(),
                session.user_id,
                self.config.feed.clone(),
            ),
            conversations: ConversationSynchronizer::new(
                self.apis.conversations.clone(),
                self.registry.clone(),
                session.user_id,
                self.config.conversations.clone(),
            ),
            notifications: NotificationSynchronizer::new(self.apis.notifications.clone()),
            follows: FollowSynchronizer::new(self.apis.follows.clone()),
            communities: CommunitySynchronizer::new(
                self.apis.communities.clone(),
                self.registry.clone(),
            ),
            comments: CommentSynchronizer::new(self.apis.comments.clone()),
        }
    }

    /// Dispatch loop and rejoin watcher, spawned once for the engine's lifetime.
    fn spawn_background(&self) {
        let Some(events) = self.events.lock().take() else {
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(async move { dispatcher.run(events).await }));
        tasks.push(self.registry.spawn_rejoin());
    }
}

impl Drop for Realtime {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(active) = self.active.lock().take() {
            release(active);
        }
    }
}

fn release(active: ActiveSession) {
    if let Some(resync) = active.resync {
        resync.abort();
    }
    drop(active.handlers);
    active.sync.clear();
}

fn spawn_resync(sync: Synchronizers, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (conversations, notifications) =
                tokio::join!(sync.conversations.refresh(), sync.notifications.refresh());
            if let Err(e) = conversations {
                warn!("Conversation resync failed: {}", e);
            }
            if let Err(e) = notifications {
                warn!("Notification resync failed: {}", e);
            }
        }
    })
}
