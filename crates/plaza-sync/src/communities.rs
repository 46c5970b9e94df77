use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use plaza_gateway::{Dispatcher, HandlerGuard, HolderId, SubscriptionRegistry};
use plaza_types::api::MembershipState;
use plaza_types::events::{ChannelEvent, EventKind};
use plaza_types::models::{CommunityMessage, Topic};

use crate::api::CommunityApi;
use crate::error::{SyncError, SyncResult};
use crate::optimistic::{Field, FieldKey, Revisions, Rollback, Snapshot};

const DEFAULT_PAGE_SIZE: u32 = 50;

fn membership_key(community_id: Uuid) -> FieldKey {
    FieldKey::new(community_id, Field::Membership)
}

/// Messages of one community room, oldest first.
#[derive(Debug, Default)]
pub struct CommunityStream {
    messages: Vec<CommunityMessage>,
    ids: HashSet<Uuid>,
}

impl CommunityStream {
    pub fn messages(&self) -> &[CommunityMessage] {
        &self.messages
    }

    pub fn insert(&mut self, message: CommunityMessage) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        if !self.ids.remove(&id) {
            return false;
        }
        self.messages.retain(|m| m.id != id);
        true
    }
}

#[derive(Debug, Default)]
pub struct CommunityState {
    memberships: HashMap<Uuid, MembershipState>,
    streams: HashMap<Uuid, CommunityStream>,
    revisions: Revisions,
}

impl CommunityState {
    pub fn membership(&self, community_id: Uuid) -> Option<MembershipState> {
        self.memberships.get(&community_id).copied()
    }

    pub fn stream(&self, community_id: Uuid) -> Option<&CommunityStream> {
        self.streams.get(&community_id)
    }

    pub fn seed(&mut self, state: MembershipState) {
        self.memberships.insert(state.community_id, state);
        self.revisions.bump(membership_key(state.community_id));
    }

    /// Store a confirmed write. Ignored once the entry is gone (logout).
    fn confirm(&mut self, state: MembershipState) -> bool {
        if !self.memberships.contains_key(&state.community_id) {
            return false;
        }
        self.seed(state);
        true
    }

    fn apply_optimistic(&mut self, community_id: Uuid, join: bool) -> SyncResult<Snapshot<MembershipState>> {
        let current = self
            .membership(community_id)
            .ok_or(SyncError::UnknownEntity(community_id))?;
        let snapshot = Snapshot::begin(&mut self.revisions, membership_key(community_id), current);

        let mut next = current;
        if current.joined != join {
            next.joined = join;
            next.member_count = if join {
                current.member_count + 1
            } else {
                current.member_count.saturating_sub(1)
            };
        }
        self.memberships.insert(community_id, next);
        Ok(snapshot)
    }

    pub fn merge(&mut self, community_id: Uuid, messages: Vec<CommunityMessage>) -> usize {
        let stream = self.streams.entry(community_id).or_default();
        messages
            .into_iter()
            .filter(|m| m.community_id == community_id)
            .map(|m| stream.insert(m))
            .filter(|inserted| *inserted)
            .count()
    }

    pub fn apply(&mut self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::CommunityMessage(message) => self
                .streams
                .entry(message.community_id)
                .or_default()
                .insert(message.clone()),
            ChannelEvent::CommunityMessageDeleted {
                community_id,
                message_id,
            } => {
                let removed = self
                    .streams
                    .get_mut(community_id)
                    .is_some_and(|s| s.remove(*message_id));
                if !removed {
                    debug!("Delete for unknown community message {}", message_id);
                }
                removed
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Community memberships and their message rooms.
#[derive(Clone)]
pub struct CommunitySynchronizer {
    inner: Arc<CommunityInner>,
}

struct CommunityInner {
    api: Arc<dyn CommunityApi>,
    registry: SubscriptionRegistry,
    holder: HolderId,
    state: Mutex<CommunityState>,
    changes: watch::Sender<u64>,
}

impl CommunitySynchronizer {
    pub fn new(api: Arc<dyn CommunityApi>, registry: SubscriptionRegistry) -> Self {
        let (changes, _) = watch::channel(0);
        let holder = registry.holder();
        Self {
            inner: Arc::new(CommunityInner {
                api,
                registry,
                holder,
                state: Mutex::new(CommunityState::default()),
                changes,
            }),
        }
    }

    pub fn attach(&self, dispatcher: &Dispatcher) -> Vec<HandlerGuard> {
        [EventKind::CommunityMessage, EventKind::CommunityMessageDeleted]
            .into_iter()
            .map(|kind| {
                let sync = self.clone();
                dispatcher.on(kind, move |event| sync.handle_event(event))
            })
            .collect()
    }

    pub fn handle_event(&self, event: &ChannelEvent) {
        let changed = self.inner.state.lock().apply(event);
        if changed {
            self.notify();
        }
    }

    /// Install a pulled membership and follow its room accordingly.
    pub fn seed(&self, state: MembershipState) {
        self.inner.state.lock().seed(state);
        self.sync_room(state);
        self.notify();
    }

    fn sync_room(&self, state: MembershipState) {
        let topic = Topic::community(state.community_id);
        if state.joined {
            self.inner.registry.join(topic, self.inner.holder);
        } else {
            self.inner.registry.leave(topic, self.inner.holder);
        }
    }

    /// Optimistically join or leave. The room is entered or left once the
    /// server confirms.
    pub async fn set_membership(&self, community_id: Uuid, join: bool) -> SyncResult<MembershipState> {
        let snapshot = self.inner.state.lock().apply_optimistic(community_id, join)?;
        self.notify();

        let result = self.inner.api.set_membership(community_id, join).await;

        let outcome = match result {
            Ok(state) => {
                let confirmed = self.inner.state.lock().confirm(state);
                if !confirmed {
                    debug!("Membership change for {} confirmed after logout", community_id);
                    return Ok(state);
                }
                self.sync_room(state);
                info!(
                    "{} community {}",
                    if state.joined { "Joined" } else { "Left" },
                    community_id
                );
                Ok(state)
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                match snapshot.rollback(&state.revisions) {
                    Rollback::Restore(before) => {
                        warn!("Membership change for {} rejected, rolled back: {}", community_id, e);
                        if let Some(entry) = state.memberships.get_mut(&community_id) {
                            *entry = before;
                        }
                    }
                    Rollback::Superseded => {
                        debug!("Membership change for {} rejected after a newer value", community_id);
                    }
                }
                Err(e.into())
            }
        };
        self.notify();
        outcome
    }

    /// Merge the latest messages of a community room.
    pub async fn load(&self, community_id: Uuid) -> SyncResult<usize> {
        let messages = self
            .inner
            .api
            .list_community_messages(community_id, DEFAULT_PAGE_SIZE)
            .await?;
        let added = self.inner.state.lock().merge(community_id, messages);
        if added > 0 {
            self.notify();
        }
        Ok(added)
    }

    pub fn membership(&self, community_id: Uuid) -> Option<MembershipState> {
        self.inner.state.lock().membership(community_id)
    }

    pub fn messages(&self, community_id: Uuid) -> Vec<CommunityMessage> {
        self.inner
            .state
            .lock()
            .stream(community_id)
            .map(|s| s.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn clear(&self) {
        self.inner.state.lock().clear();
        self.inner.registry.leave_all(self.inner.holder);
        self.notify();
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }
}
