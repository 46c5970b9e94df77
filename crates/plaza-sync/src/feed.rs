use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use plaza_gateway::{Dispatcher, HandlerGuard};
use plaza_types::api::{FeedPage, VoteTally};
use plaza_types::events::{ChannelEvent, EventKind};
use plaza_types::models::{FeedItem, FeedPatch, VoteDirection};

use crate::api::FeedApi;
use crate::error::{SyncError, SyncResult};
use crate::optimistic::{Field, FieldKey, Revisions, Rollback, Snapshot};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub page_size: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

/// Ordered, deduplicated feed. Index 0 is the newest item.
#[derive(Debug, Default)]
pub struct FeedState {
    items: Vec<FeedItem>,
    /// Last page merged; 0 before the first pull.
    cursor: u32,
    has_more: bool,
    /// Bumped by every wholesale replace so late pages can be discarded.
    epoch: u64,
    revisions: Revisions,
}

fn votes_key(id: Uuid) -> FieldKey {
    FieldKey::new(id, Field::Votes)
}

impl FeedState {
    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    pub fn get(&self, id: Uuid) -> Option<&FeedItem> {
        self.items.iter().find(|item| item.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut FeedItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Full refresh: replace everything and restart paging at page 1.
    pub fn replace(&mut self, page: FeedPage) {
        let mut seen = HashSet::with_capacity(page.items.len());
        self.items = page
            .items
            .into_iter()
            .filter(|item| seen.insert(item.id))
            .collect();
        for item in &self.items {
            self.revisions.bump(votes_key(item.id));
        }
        self.cursor = 1;
        self.has_more = page.has_more;
        self.epoch += 1;
    }

    /// Append an older page, skipping ids already present. Returns how many were added.
    pub fn append_page(&mut self, page_no: u32, page: FeedPage) -> usize {
        let before = self.items.len();
        for item in page.items {
            if !self.contains(item.id) {
                self.items.push(item);
            }
        }
        self.cursor = self.cursor.max(page_no);
        self.has_more = page.has_more;
        self.items.len() - before
    }

    /// `post:new`: insert at head unless already present.
    pub fn insert_new(&mut self, item: FeedItem) -> bool {
        if self.contains(item.id) {
            debug!("Ignoring duplicate post {}", item.id);
            return false;
        }
        self.items.insert(0, item);
        true
    }

    /// `post:update`: merge only the fields the patch carries.
    pub fn apply_patch(&mut self, id: Uuid, patch: &FeedPatch) -> bool {
        let Some(item) = self.get_mut(id) else {
            debug!("Ignoring patch for unknown post {}", id);
            return false;
        };

        if let Some(content) = &patch.content {
            item.content = content.clone();
        }
        if let Some(count) = patch.comment_count {
            item.comment_count = count;
        }
        if let Some(count) = patch.share_count {
            item.share_count = count;
        }
        if let Some(count) = patch.impression_count {
            item.impression_count = count;
        }
        if let Some(at) = patch.updated_at {
            item.updated_at = at;
        }

        match (&patch.upvoters, &patch.downvoters) {
            (Some(up), Some(down)) => {
                item.upvoters = up.clone();
                item.downvoters = down.difference(up).copied().collect();
                if item.downvoters.len() != down.len() {
                    warn!("Post {} patch listed voters in both sets", id);
                }
            }
            (Some(up), None) => {
                item.upvoters = up.clone();
                item.downvoters.retain(|u| !up.contains(u));
            }
            (None, Some(down)) => {
                item.downvoters = down.clone();
                item.upvoters.retain(|u| !down.contains(u));
            }
            (None, None) => {}
        }

        if patch.touches_votes() {
            self.revisions.bump(votes_key(id));
        }
        true
    }

    /// `post:delete`: remove if present.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        self.items.len() != before
    }

    /// Route one push event. Returns whether the collection changed.
    pub fn apply(&mut self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::PostNew(item) => self.insert_new(item.clone()),
            ChannelEvent::PostUpdate { id, patch } => self.apply_patch(*id, patch),
            ChannelEvent::PostDelete { id } => self.remove(*id),
            _ => false,
        }
    }

    fn set_votes(&mut self, id: Uuid, tally: VoteTally) -> bool {
        let Some(item) = self.get_mut(id) else {
            return false;
        };
        item.upvoters = tally.upvoters;
        item.downvoters = tally.downvoters;
        true
    }

    pub fn clear(&mut self) {
        *self = Self {
            epoch: self.epoch + 1,
            ..Self::default()
        };
    }
}

/// Voting the same way twice clears the vote.
pub fn vote_target(current: Option<VoteDirection>, requested: VoteDirection) -> Option<VoteDirection> {
    if current == Some(requested) {
        None
    } else {
        Some(requested)
    }
}

fn apply_vote(item: &mut FeedItem, user_id: Uuid, target: Option<VoteDirection>) {
    item.upvoters.remove(&user_id);
    item.downvoters.remove(&user_id);
    match target {
        Some(VoteDirection::Up) => {
            item.upvoters.insert(user_id);
        }
        Some(VoteDirection::Down) => {
            item.downvoters.insert(user_id);
        }
        None => {}
    }
}

fn tally_of(item: &FeedItem) -> VoteTally {
    VoteTally {
        upvoters: item.upvoters.clone(),
        downvoters: item.downvoters.clone(),
    }
}

/// Owns the feed collection and merges pulled pages with `post:*` events.
#[derive(Clone)]
pub struct FeedSynchronizer {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    api: Arc<dyn FeedApi>,
    viewer: Uuid,
    config: FeedConfig,
    state: Mutex<FeedState>,
    changes: watch::Sender<u64>,
}

impl FeedSynchronizer {
    pub fn new(api: Arc<dyn FeedApi>, viewer: Uuid, config: FeedConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(FeedInner {
                api,
                viewer,
                config,
                state: Mutex::new(FeedState::default()),
                changes,
            }),
        }
    }

    pub fn attach(&self, dispatcher: &Dispatcher) -> Vec<HandlerGuard> {
        [EventKind::PostNew, EventKind::PostUpdate, EventKind::PostDelete]
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

    /// Replace the feed with page 1.
    pub async fn refresh(&self) -> SyncResult<()> {
        let page = self.inner.api.list_feed(1, self.inner.config.page_size).await?;
        let count = page.items.len();
        self.inner.state.lock().replace(page);
        info!("Feed refreshed with {} items", count);
        self.notify();
        Ok(())
    }

    /// Fetch the page after the cursor. A page that lands after a refresh is dropped.
    pub async fn load_more(&self) -> SyncResult<usize> {
        let (next, epoch) = {
            let state = self.inner.state.lock();
            (state.cursor() + 1, state.epoch())
        };

        let page = self
            .inner
            .api
            .list_feed(next, self.inner.config.page_size)
            .await?;

        let added = {
            let mut state = self.inner.state.lock();
            if state.epoch() != epoch {
                debug!("Discarding feed page {} fetched before a refresh", next);
                return Ok(0);
            }
            state.append_page(next, page)
        };
        if added > 0 {
            self.notify();
        }
        Ok(added)
    }

    /// Optimistically vote on a post. On failure the previous vote sets come
    /// back unless a push delivered newer ones in the meantime.
    pub async fn vote(&self, post_id: Uuid, direction: VoteDirection) -> SyncResult<()> {
        let viewer = self.inner.viewer;
        let (snapshot, target) = {
            let mut state = self.inner.state.lock();
            let item = state.get(post_id).ok_or(SyncError::UnknownEntity(post_id))?;
            let target = vote_target(item.vote_of(viewer), direction);
            let before = tally_of(item);
            let snapshot = Snapshot::begin(&mut state.revisions, votes_key(post_id), before);
            if let Some(item) = state.get_mut(post_id) {
                apply_vote(item, viewer, target);
            }
            (snapshot, target)
        };
        self.notify();

        let result = self.inner.api.vote(post_id, target).await;

        let outcome = {
            let mut state = self.inner.state.lock();
            match result {
                Ok(tally) => {
                    state.set_votes(post_id, tally);
                    state.revisions.bump(votes_key(post_id));
                    Ok(())
                }
                Err(e) => {
                    match snapshot.rollback(&state.revisions) {
                        Rollback::Restore(tally) => {
                            if state.set_votes(post_id, tally) {
                                warn!("Vote on {} rejected, rolled back: {}", post_id, e);
                            }
                        }
                        Rollback::Superseded => {
                            warn!("Vote on {} rejected, keeping newer pushed votes: {}", post_id, e);
                        }
                    }
                    Err(e.into())
                }
            }
        };
        self.notify();
        outcome
    }

    pub fn items(&self) -> Vec<FeedItem> {
        self.inner.state.lock().items().to_vec()
    }

    pub fn get(&self, id: Uuid) -> Option<FeedItem> {
        self.inner.state.lock().get(id).cloned()
    }

    pub fn upvoters(&self, id: Uuid) -> Option<BTreeSet<Uuid>> {
        self.get(id).map(|item| item.upvoters)
    }

    pub fn cursor(&self) -> u32 {
        self.inner.state.lock().cursor()
    }

    pub fn has_more(&self) -> bool {
        self.inner.state.lock().has_more()
    }

    /// Version counter bumped on every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn clear(&self) {
        self.inner.state.lock().clear();
        self.notify();
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }
}
