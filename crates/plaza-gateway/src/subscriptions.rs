use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use plaza_types::events::ChannelCommand;
use plaza_types::models::Topic;

use crate::connection::{ConnectionManager, ConnectionState};

/// One consuming view's claim on topics. Mint with [`SubscriptionRegistry::holder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

#[derive(Default)]
struct TopicEntry {
    holders: HashSet<HolderId>,
    /// A join command went out on the current link.
    joined: bool,
}

/// Tracks which rooms the session is in, reference-counted by holder.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connection: ConnectionManager,
    topics: Mutex<HashMap<Topic, TopicEntry>>,
    next_holder: AtomicU64,
}

impl RegistryInner {
    /// Join every held topic on the fresh link. Server-side joins are idempotent.
    fn rejoin_all(&self) {
        let mut topics = self.topics.lock();
        let mut count = 0;
        for (topic, entry) in topics.iter_mut() {
            if entry.holders.is_empty() {
                continue;
            }
            entry.joined = self.connection.emit(ChannelCommand::join(*topic));
            count += 1;
        }
        if count > 0 {
            info!("Rejoined {} topics after connect", count);
        }
    }

    fn mark_unjoined(&self) {
        for entry in self.topics.lock().values_mut() {
            entry.joined = false;
        }
    }
}

impl SubscriptionRegistry {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connection,
                topics: Mutex::new(HashMap::new()),
                next_holder: AtomicU64::new(1),
            }),
        }
    }

    pub fn holder(&self) -> HolderId {
        HolderId(self.inner.next_holder.fetch_add(1, Ordering::Relaxed))
    }

    /// Add `holder` to `topic`. Joining again with the same holder is a no-op.
    /// Only the first holder causes a `join` command; if the channel is not
    /// connected yet the join is issued on the next connect.
    pub fn join(&self, topic: Topic, holder: HolderId) -> bool {
        let mut topics = self.inner.topics.lock();
        let entry = topics.entry(topic).or_default();

        if !entry.holders.insert(holder) {
            return false;
        }

        if !entry.joined {
            entry.joined = self.inner.connection.emit(ChannelCommand::join(topic));
            if !entry.joined {
                debug!("Join of {} deferred until connected", topic);
            }
        }
        true
    }

    /// Remove `holder` from `topic`. The `leave` command goes out only when the
    /// last holder leaves.
    pub fn leave(&self, topic: Topic, holder: HolderId) -> bool {
        let mut topics = self.inner.topics.lock();
        let Some(entry) = topics.get_mut(&topic) else {
            return false;
        };
        if !entry.holders.remove(&holder) {
            return false;
        }

        if entry.holders.is_empty() {
            let was_joined = entry.joined;
            topics.remove(&topic);
            if was_joined {
                self.inner.connection.emit(ChannelCommand::leave(topic));
            }
        }
        true
    }

    /// Release every topic held by `holder`, e.g. when its view closes.
    pub fn leave_all(&self, holder: HolderId) {
        let held: Vec<Topic> = self
            .inner
            .topics
            .lock()
            .iter()
            .filter(|(_, entry)| entry.holders.contains(&holder))
            .map(|(topic, _)| *topic)
            .collect();

        for topic in held {
            self.leave(topic, holder);
        }
    }

    pub fn holders(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .lock()
            .get(&topic)
            .map_or(0, |entry| entry.holders.len())
    }

    pub fn is_joined(&self, topic: Topic) -> bool {
        self.inner
            .topics
            .lock()
            .get(&topic)
            .is_some_and(|entry| entry.joined)
    }

    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.inner.topics.lock().keys().copied().collect();
        topics.sort();
        topics
    }

    /// Follow connection-state changes: on every transition to connected all
    /// held topics are joined again. The task exits once the registry is dropped.
    pub fn spawn_rejoin(&self) -> JoinHandle<()> {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let mut state_rx = self.inner.connection.watch_state();

        tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match state {
                    ConnectionState::Connected => inner.rejoin_all(),
                    _ => inner.mark_unjoined(),
                }
                drop(inner);

                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
