use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use plaza_gateway::{Dispatcher, HandlerGuard, HolderId, SubscriptionRegistry};
use plaza_types::events::{ChannelEvent, EventKind};
use plaza_types::models::{Conversation, Message, Topic};

use crate::api::ConversationApi;
use crate::error::{SyncError, SyncResult};

/// Settled sends remembered for [`ConversationState::delivery`].
const SETTLED_WINDOW: usize = 64;

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub page_size: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

/// Lifecycle of a locally-sent message, keyed by its temporary id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Messages of one conversation, oldest first, unique by id.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<Uuid>,
}

impl MessageLog {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|m| m.created_at)
    }

    /// Insert by creation time. Equal timestamps keep arrival order.
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Message> {
        if !self.ids.remove(&id) {
            return None;
        }
        let pos = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(pos))
    }

    /// Swap a temporary entry for the committed one, placed by the server's
    /// timestamp. If the committed id is already present the temporary entry
    /// is just dropped.
    pub fn remap(&mut self, temp_id: Uuid, committed: Message) {
        self.remove(temp_id);
        self.insert(committed);
    }

    pub fn mark_all_read(&mut self) {
        for message in &mut self.messages {
            message.is_read = true;
        }
    }
}

/// A send still waiting for the server.
#[derive(Debug)]
struct Outgoing {
    conversation_id: Uuid,
    previous_last: Option<Message>,
    previous_updated_at: DateTime<Utc>,
}

/// Conversation list (most recent first) plus one message log per conversation.
#[derive(Debug)]
pub struct ConversationState {
    viewer: Uuid,
    conversations: Vec<Conversation>,
    logs: HashMap<Uuid, MessageLog>,
    active: Option<Uuid>,
    outbox: HashMap<Uuid, Outgoing>,
    settled: VecDeque<(Uuid, DeliveryStatus)>,
}

impl ConversationState {
    pub fn new(viewer: Uuid) -> Self {
        Self {
            viewer,
            conversations: Vec::new(),
            logs: HashMap::new(),
            active: None,
            outbox: HashMap::new(),
            settled: VecDeque::new(),
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: Uuid) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    pub fn log(&self, id: Uuid) -> Option<&MessageLog> {
        self.logs.get(&id)
    }

    pub fn active(&self) -> Option<Uuid> {
        self.active
    }

    pub fn set_active(&mut self, id: Option<Uuid>) -> Option<Uuid> {
        std::mem::replace(&mut self.active, id)
    }

    /// Status of a send by temporary id. Only recent settled sends are remembered.
    pub fn delivery(&self, temp_id: Uuid) -> Option<DeliveryStatus> {
        if self.outbox.contains_key(&temp_id) {
            return Some(DeliveryStatus::Pending);
        }
        self.settled
            .iter()
            .rev()
            .find(|(id, _)| *id == temp_id)
            .map(|(_, status)| *status)
    }

    pub fn pending_sends(&self) -> usize {
        self.outbox.len()
    }

    fn settle(&mut self, temp_id: Uuid, status: DeliveryStatus) {
        if self.settled.len() == SETTLED_WINDOW {
            self.settled.pop_front();
        }
        self.settled.push_back((temp_id, status));
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    /// Replace the list with a pulled snapshot. The active conversation stays read.
    pub fn replace_conversations(&mut self, mut list: Vec<Conversation>) {
        let mut seen = HashSet::with_capacity(list.len());
        list.retain(|c| seen.insert(c.id));
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(active) = self.active {
            if let Some(conv) = list.iter_mut().find(|c| c.id == active) {
                conv.unread_count = 0;
            }
        }
        self.conversations = list;
    }

    /// Merge a pulled page of messages. Returns how many were new.
    pub fn merge_messages(&mut self, conversation_id: Uuid, messages: Vec<Message>) -> usize {
        let log = self.logs.entry(conversation_id).or_default();
        messages
            .into_iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| log.insert(m))
            .filter(|inserted| *inserted)
            .count()
    }

    /// Merge one pushed `message` event. Returns whether anything changed.
    pub fn apply_message(&mut self, message: Message) -> bool {
        let conversation_id = message.conversation_id;

        if let Some(temp_id) = message.client_id {
            if self.outbox.remove(&temp_id).is_some() {
                debug!("Echo committed pending message {} as {}", temp_id, message.id);
                self.logs
                    .entry(conversation_id)
                    .or_default()
                    .remap(temp_id, message.clone());
                self.settle(temp_id, DeliveryStatus::Sent);
                self.touch(&message, Some(temp_id));
                return true;
            }
        }

        let log = self.logs.entry(conversation_id).or_default();
        if log.contains(message.id) {
            debug!("Ignoring duplicate message {}", message.id);
            return false;
        }

        let inbound = message.sender_id != self.viewer;
        let viewing = self.active == Some(conversation_id);
        let mut message = message;
        if inbound && viewing {
            message.is_read = true;
        }
        log.insert(message.clone());
        self.touch(&message, None);

        if inbound && !viewing {
            if let Some(conv) = self.get_mut(conversation_id) {
                conv.unread_count += 1;
            }
        }
        true
    }

    /// Move the owning conversation to the head and point it at `message`,
    /// creating the entry if this is the first we hear of it.
    fn touch(&mut self, message: &Message, replaces: Option<Uuid>) {
        let pos = self
            .conversations
            .iter()
            .position(|c| c.id == message.conversation_id);

        let mut conv = match pos {
            Some(pos) => self.conversations.remove(pos),
            None => {
                info!("New conversation {}", message.conversation_id);
                Conversation {
                    id: message.conversation_id,
                    participants: vec![message.sender_id, message.receiver_id],
                    last_message: None,
                    unread_count: 0,
                    updated_at: message.created_at,
                }
            }
        };

        let newer = match &conv.last_message {
            None => true,
            Some(last) => Some(last.id) == replaces || last.created_at <= message.created_at,
        };
        if newer {
            conv.last_message = Some(message.clone());
            conv.updated_at = message.created_at;
        }
        self.conversations.insert(0, conv);
    }

    /// Phase one of a send: append a provisional message under a fresh temporary id.
    pub fn begin_send(&mut self, conversation_id: Uuid, content: &str) -> SyncResult<Message> {
        let viewer = self.viewer;
        let conv = self
            .get(conversation_id)
            .ok_or(SyncError::UnknownEntity(conversation_id))?;
        let receiver_id = conv
            .participants
            .iter()
            .copied()
            .find(|p| *p != viewer)
            .unwrap_or(viewer);
        let previous_last = conv.last_message.clone();
        let previous_updated_at = conv.updated_at;

        let temp_id = Uuid::new_v4();
        let provisional = Message {
            id: temp_id,
            conversation_id,
            sender_id: viewer,
            receiver_id,
            content: content.to_string(),
            created_at: Utc::now(),
            is_read: true,
            client_id: Some(temp_id),
        };

        self.outbox.insert(
            temp_id,
            Outgoing {
                conversation_id,
                previous_last,
                previous_updated_at,
            },
        );
        self.logs
            .entry(conversation_id)
            .or_default()
            .insert(provisional.clone());
        self.touch(&provisional, None);
        Ok(provisional)
    }

    /// Phase two, success: the server id replaces the temporary one.
    pub fn confirm_send(&mut self, temp_id: Uuid, committed: Message) {
        let Some(out) = self.outbox.remove(&temp_id) else {
            return;
        };
        self.settle(temp_id, DeliveryStatus::Sent);
        let conversation_id = out.conversation_id;

        self.logs
            .entry(conversation_id)
            .or_default()
            .remap(temp_id, committed.clone());

        if let Some(conv) = self.get_mut(conversation_id) {
            if conv.last_message.as_ref().is_some_and(|m| m.id == temp_id) {
                conv.updated_at = committed.created_at;
                conv.last_message = Some(committed);
            }
        }
    }

    /// Phase two, failure: drop the provisional message. The conversation
    /// preview is restored only while it still shows that message.
    pub fn fail_send(&mut self, temp_id: Uuid) {
        let Some(out) = self.outbox.remove(&temp_id) else {
            return;
        };
        self.settle(temp_id, DeliveryStatus::Failed);
        let conversation_id = out.conversation_id;
        let previous_last = out.previous_last;
        let previous_updated_at = out.previous_updated_at;

        if let Some(log) = self.logs.get_mut(&conversation_id) {
            log.remove(temp_id);
        }
        if let Some(conv) = self.get_mut(conversation_id) {
            if conv.last_message.as_ref().is_some_and(|m| m.id == temp_id) {
                conv.last_message = previous_last;
                conv.updated_at = previous_updated_at;
            }
        }
    }

    /// Zero the counter and flag every loaded message. Returns false for unknown ids.
    pub fn mark_read(&mut self, conversation_id: Uuid) -> bool {
        if let Some(log) = self.logs.get_mut(&conversation_id) {
            log.mark_all_read();
        }
        match self.get_mut(conversation_id) {
            Some(conv) => {
                conv.unread_count = 0;
                if let Some(last) = conv.last_message.as_mut() {
                    last.is_read = true;
                }
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.viewer);
    }
}

/// Owns the conversation list and per-conversation message logs.
#[derive(Clone)]
pub struct ConversationSynchronizer {
    inner: Arc<ConversationInner>,
}

struct ConversationInner {
    api: Arc<dyn ConversationApi>,
    registry: SubscriptionRegistry,
    holder: HolderId,
    config: ConversationConfig,
    state: Mutex<ConversationState>,
    changes: watch::Sender<u64>,
}

impl ConversationSynchronizer {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        registry: SubscriptionRegistry,
        viewer: Uuid,
        config: ConversationConfig,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        let holder = registry.holder();
        Self {
            inner: Arc::new(ConversationInner {
                api,
                registry,
                holder,
                config,
                state: Mutex::new(ConversationState::new(viewer)),
                changes,
            }),
        }
    }

    pub fn attach(&self, dispatcher: &Dispatcher) -> Vec<HandlerGuard> {
        let sync = self.clone();
        vec![dispatcher.on(EventKind::Message, move |event| sync.handle_event(event))]
    }

    pub fn handle_event(&self, event: &ChannelEvent) {
        let ChannelEvent::Message(message) = event else {
            return;
        };
        let changed = self.inner.state.lock().apply_message(message.clone());
        if changed {
            self.notify();
        }
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        let list = self.inner.api.list_conversations().await?;
        let count = list.len();
        self.inner.state.lock().replace_conversations(list);
        info!("Loaded {} conversations", count);
        self.notify();
        Ok(())
    }

    /// Make `id` the active view: join its room, pull the latest page and mark it read.
    pub async fn open(&self, id: Uuid) -> SyncResult<()> {
        let previous = self.inner.state.lock().set_active(Some(id));
        if let Some(previous) = previous.filter(|p| *p != id) {
            self.inner
                .registry
                .leave(Topic::conversation(previous), self.inner.holder);
        }
        self.inner
            .registry
            .join(Topic::conversation(id), self.inner.holder);
        self.notify();

        let messages = self
            .inner
            .api
            .list_messages(id, None, self.inner.config.page_size)
            .await?;

        // the page is kept either way; read state only follows the view still open
        let read = {
            let mut state = self.inner.state.lock();
            let added = state.merge_messages(id, messages);
            debug!("Opened conversation {} with {} new messages", id, added);
            state.active() == Some(id) && state.mark_read(id)
        };
        self.notify();

        if read {
            self.confirm_read(id).await;
        } else {
            debug!("Conversation {} closed or unknown, read state left as is", id);
        }
        Ok(())
    }

    pub fn close(&self) {
        let previous = self.inner.state.lock().set_active(None);
        if let Some(previous) = previous {
            self.inner
                .registry
                .leave(Topic::conversation(previous), self.inner.holder);
            self.notify();
        }
    }

    /// Page backwards from the oldest loaded message.
    pub async fn load_older(&self, id: Uuid) -> SyncResult<usize> {
        let before = self.inner.state.lock().log(id).and_then(MessageLog::oldest);
        let messages = self
            .inner
            .api
            .list_messages(id, before, self.inner.config.page_size)
            .await?;
        let added = self.inner.state.lock().merge_messages(id, messages);
        if added > 0 {
            self.notify();
        }
        Ok(added)
    }

    /// Local-first. A failed confirmation is logged and left for the next resync.
    pub async fn mark_read(&self, id: Uuid) {
        let known = self.inner.state.lock().mark_read(id);
        if !known {
            debug!("mark_read for unknown conversation {}", id);
            return;
        }
        self.notify();
        self.confirm_read(id).await;
    }

    async fn confirm_read(&self, id: Uuid) {
        if let Err(e) = self.inner.api.mark_conversation_read(id).await {
            warn!("Failed to confirm read of conversation {}: {}", id, e);
        }
    }

    /// Optimistic send. The provisional message is visible immediately and
    /// is replaced by the server's copy, or removed if the request fails.
    pub async fn send(&self, conversation_id: Uuid, content: &str) -> SyncResult<Message> {
        let provisional = self.inner.state.lock().begin_send(conversation_id, content)?;
        let temp_id = provisional.id;
        self.notify();

        let result = self
            .inner
            .api
            .send_message(conversation_id, content, temp_id)
            .await;

        let outcome = match result {
            Ok(committed) => {
                self.inner.state.lock().confirm_send(temp_id, committed.clone());
                Ok(committed)
            }
            Err(e) => {
                warn!("Send to conversation {} failed: {}", conversation_id, e);
                self.inner.state.lock().fail_send(temp_id);
                Err(e.into())
            }
        };
        self.notify();
        outcome
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.lock().conversations().to_vec()
    }

    pub fn conversation(&self, id: Uuid) -> Option<Conversation> {
        self.inner.state.lock().get(id).cloned()
    }

    pub fn messages(&self, id: Uuid) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .log(id)
            .map(|log| log.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn unread(&self, id: Uuid) -> u32 {
        self.inner.state.lock().get(id).map_or(0, |c| c.unread_count)
    }

    pub fn total_unread(&self) -> u32 {
        self.inner.state.lock().total_unread()
    }

    pub fn active(&self) -> Option<Uuid> {
        self.inner.state.lock().active()
    }

    pub fn delivery(&self, temp_id: Uuid) -> Option<DeliveryStatus> {
        self.inner.state.lock().delivery(temp_id)
    }

    pub fn pending_sends(&self) -> usize {
        self.inner.state.lock().pending_sends()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Drop all state and release the active room.
    pub fn clear(&self) {
        self.inner.state.lock().clear();
        self.inner.registry.leave_all(self.inner.holder);
        self.notify();
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }
}
