use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use plaza_gateway::{Dispatcher, HandlerGuard};
use plaza_types::api::NotificationPage;
use plaza_types::events::{ChannelEvent, EventKind};
use plaza_types::models::Notification;

use crate::api::NotificationApi;
use crate::error::SyncResult;

/// Inbox, newest first, with an incrementally maintained unread counter.
#[derive(Debug, Default)]
pub struct NotificationState {
    items: Vec<Notification>,
    unread: u32,
}

impl NotificationState {
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    pub fn get(&self, id: Uuid) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    /// The server's count replaces the local one.
    pub fn replace(&mut self, page: NotificationPage) {
        let mut items: Vec<Notification> = Vec::with_capacity(page.items.len());
        for item in page.items {
            if !items.iter().any(|n| n.id == item.id) {
                items.push(item);
            }
        }
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.items = items;
        self.unread = page.unread_count;
    }

    pub fn insert(&mut self, notification: Notification) -> bool {
        if self.get(notification.id).is_some() {
            debug!("Ignoring duplicate notification {}", notification.id);
            return false;
        }
        if !notification.is_read {
            self.unread += 1;
        }
        let at = self
            .items
            .partition_point(|n| n.created_at > notification.created_at);
        self.items.insert(at, notification);
        true
    }

    /// Returns false when `id` is absent or already read.
    pub fn mark_read(&mut self, id: Uuid) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(n) if !n.is_read => {
                n.is_read = true;
                self.unread = self.unread.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_read(&mut self) -> bool {
        let had_unread = self.unread > 0 || self.items.iter().any(|n| !n.is_read);
        for n in &mut self.items {
            n.is_read = true;
        }
        self.unread = 0;
        had_unread
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone)]
pub struct NotificationSynchronizer {
    inner: Arc<NotificationInner>,
}

struct NotificationInner {
    api: Arc<dyn NotificationApi>,
    state: Mutex<NotificationState>,
    changes: watch::Sender<u64>,
}

impl NotificationSynchronizer {
    pub fn new(api: Arc<dyn NotificationApi>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(NotificationInner {
                api,
                state: Mutex::new(NotificationState::default()),
                changes,
            }),
        }
    }

    pub fn attach(&self, dispatcher: &Dispatcher) -> Vec<HandlerGuard> {
        let sync = self.clone();
        vec![dispatcher.on(EventKind::Notification, move |event| {
            sync.handle_event(event)
        })]
    }

    pub fn handle_event(&self, event: &ChannelEvent) {
        let ChannelEvent::Notification(notification) = event else {
            return;
        };
        let changed = self.inner.state.lock().insert(notification.clone());
        if changed {
            self.notify();
        }
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        let page = self.inner.api.list_notifications().await?;
        let (count, unread) = (page.items.len(), page.unread_count);
        self.inner.state.lock().replace(page);
        info!("Loaded {} notifications, {} unread", count, unread);
        self.notify();
        Ok(())
    }

    /// Best-effort: the local flag stays set even if the server rejects it.
    pub async fn mark_read(&self, id: Uuid) {
        if !self.inner.state.lock().mark_read(id) {
            return;
        }
        self.notify();
        if let Err(e) = self.inner.api.mark_notification_read(id).await {
            warn!("Failed to confirm read of notification {}: {}", id, e);
        }
    }

    pub async fn mark_all_read(&self) {
        if !self.inner.state.lock().mark_all_read() {
            return;
        }
        self.notify();
        if let Err(e) = self.inner.api.mark_all_notifications_read().await {
            warn!("Failed to confirm read of all notifications: {}", e);
        }
    }

    pub fn items(&self) -> Vec<Notification> {
        self.inner.state.lock().items().to_vec()
    }

    pub fn unread(&self) -> u32 {
        self.inner.state.lock().unread()
    }

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
