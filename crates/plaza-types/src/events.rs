use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CommunityMessage, FeedItem, FeedPatch, Message, Notification, Topic, TopicKind};

/// Events pushed by the server over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelEvent {
    /// Server accepted the handshake credentials
    #[serde(rename = "ready")]
    Ready { user_id: Uuid },

    /// A new post was published
    #[serde(rename = "post:new")]
    PostNew(FeedItem),

    /// Some fields of an existing post changed
    #[serde(rename = "post:update")]
    PostUpdate { id: Uuid, patch: FeedPatch },

    /// A post was removed
    #[serde(rename = "post:delete")]
    PostDelete { id: Uuid },

    /// A direct message, inbound or the echo of our own send
    #[serde(rename = "message")]
    Message(Message),

    #[serde(rename = "notification")]
    Notification(Notification),

    /// A message posted in a community room
    #[serde(rename = "community_message")]
    CommunityMessage(CommunityMessage),

    #[serde(rename = "community_message_deleted")]
    CommunityMessageDeleted { community_id: Uuid, message_id: Uuid },
}

/// Discriminant used to route events to registered handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    PostNew,
    PostUpdate,
    PostDelete,
    Message,
    Notification,
    CommunityMessage,
    CommunityMessageDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::PostNew => "post:new",
            Self::PostUpdate => "post:update",
            Self::PostDelete => "post:delete",
            Self::Message => "message",
            Self::Notification => "notification",
            Self::CommunityMessage => "community_message",
            Self::CommunityMessageDeleted => "community_message_deleted",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready { .. } => EventKind::Ready,
            Self::PostNew(_) => EventKind::PostNew,
            Self::PostUpdate { .. } => EventKind::PostUpdate,
            Self::PostDelete { .. } => EventKind::PostDelete,
            Self::Message(_) => EventKind::Message,
            Self::Notification(_) => EventKind::Notification,
            Self::CommunityMessage(_) => EventKind::CommunityMessage,
            Self::CommunityMessageDeleted { .. } => EventKind::CommunityMessageDeleted,
        }
    }

    /// Returns the room this event is scoped to.
    /// Events that return `None` are delivered to the session regardless of joined rooms.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::Message(m) => Some(Topic::conversation(m.conversation_id)),
            Self::CommunityMessage(m) => Some(Topic::community(m.community_id)),
            Self::CommunityMessageDeleted { community_id, .. } => Some(Topic::community(*community_id)),
            // Ready, post:* and notification are session-wide
            _ => None,
        }
    }
}

/// Room control commands sent FROM client TO server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelCommand {
    #[serde(rename = "join")]
    Join { topic_id: Uuid },

    #[serde(rename = "join_community")]
    JoinCommunity { topic_id: Uuid },

    #[serde(rename = "leave")]
    Leave { topic_id: Uuid },

    #[serde(rename = "leave_community")]
    LeaveCommunity { topic_id: Uuid },
}

impl ChannelCommand {
    pub fn join(topic: Topic) -> Self {
        match topic.kind {
            TopicKind::Conversation => Self::Join { topic_id: topic.id },
            TopicKind::Community => Self::JoinCommunity { topic_id: topic.id },
        }
    }

    pub fn leave(topic: Topic) -> Self {
        match topic.kind {
            TopicKind::Conversation => Self::Leave { topic_id: topic.id },
            TopicKind::Community => Self::LeaveCommunity { topic_id: topic.id },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::JoinCommunity { .. } => "join_community",
            Self::Leave { .. } => "leave",
            Self::LeaveCommunity { .. } => "leave_community",
        }
    }
}
