use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use plaza_types::api::FollowState;

use crate::api::FollowApi;
use crate::error::{SyncError, SyncResult};
use crate::optimistic::{Field, FieldKey, Revisions, Rollback, Snapshot};

fn following_key(user_id: Uuid) -> FieldKey {
    FieldKey::new(user_id, Field::Following)
}

/// Follow relation of the viewer towards other users.
#[derive(Debug, Default)]
pub struct FollowBook {
    states: HashMap<Uuid, FollowState>,
    revisions: Revisions,
}

impl FollowBook {
    pub fn get(&self, user_id: Uuid) -> Option<FollowState> {
        self.states.get(&user_id).copied()
    }

    /// Install an authoritative value.
    pub fn seed(&mut self, state: FollowState) {
        self.states.insert(state.user_id, state);
        self.revisions.bump(following_key(state.user_id));
    }

    /// Store a confirmed write. Ignored once the entry is gone (logout).
    fn confirm(&mut self, state: FollowState) -> bool {
        if !self.states.contains_key(&state.user_id) {
            return false;
        }
        self.seed(state);
        true
    }

    fn apply_optimistic(&mut self, user_id: Uuid, follow: bool) -> SyncResult<Snapshot<FollowState>> {
        let current = self.get(user_id).ok_or(SyncError::UnknownEntity(user_id))?;
        let snapshot = Snapshot::begin(&mut self.revisions, following_key(user_id), current);

        let mut next = current;
        if current.following != follow {
            next.following = follow;
            next.follower_count = if follow {
                current.follower_count + 1
            } else {
                current.follower_count.saturating_sub(1)
            };
        }
        self.states.insert(user_id, next);
        Ok(snapshot)
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.revisions.clear();
    }
}

#[derive(Clone)]
pub struct FollowSynchronizer {
    inner: Arc<FollowInner>,
}

struct FollowInner {
    api: Arc<dyn FollowApi>,
    book: Mutex<FollowBook>,
    changes: watch::Sender<u64>,
}

impl FollowSynchronizer {
    pub fn new(api: Arc<dyn FollowApi>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(FollowInner {
                api,
                book: Mutex::new(FollowBook::default()),
                changes,
            }),
        }
    }

    pub fn seed(&self, state: FollowState) {
        self.inner.book.lock().seed(state);
        self.notify();
    }

    pub fn get(&self, user_id: Uuid) -> Option<FollowState> {
        self.inner.book.lock().get(user_id)
    }

    /// Optimistically follow or unfollow `user_id`.
    pub async fn set_following(&self, user_id: Uuid, follow: bool) -> SyncResult<FollowState> {
        let snapshot = self.inner.book.lock().apply_optimistic(user_id, follow)?;
        self.notify();

        let result = self.inner.api.set_following(user_id, follow).await;

        let outcome = {
            let mut book = self.inner.book.lock();
            match result {
                Ok(state) => {
                    if !book.confirm(state) {
                        debug!("Follow change for {} confirmed after logout", user_id);
                    }
                    Ok(state)
                }
                Err(e) => {
                    match snapshot.rollback(&book.revisions) {
                        Rollback::Restore(before) => {
                            warn!("Follow change for {} rejected, rolled back: {}", user_id, e);
                            if let Some(entry) = book.states.get_mut(&user_id) {
                                *entry = before;
                            }
                        }
                        Rollback::Superseded => {
                            debug!("Follow change for {} rejected after a newer value", user_id);
                        }
                    }
                    Err(e.into())
                }
            }
        };
        self.notify();
        outcome
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn clear(&self) {
        self.inner.book.lock().clear();
        self.notify();
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }
}
