use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the logged-in user. Set at login, cleared at logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: Uuid,
}

impl Session {
    pub fn new(token: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            token: token.into(),
            user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: Uuid,
    pub author: UserRef,
    pub content: String,
    #[serde(default)]
    pub upvoters: BTreeSet<Uuid>,
    #[serde(default)]
    pub downvoters: BTreeSet<Uuid>,
    #[serde(default)]
    pub comment_count: u32,
    #[serde(default)]
    pub share_count: u32,
    #[serde(default)]
    pub impression_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeedItem {
    /// Which way `user_id` has voted, if at all.
    pub fn vote_of(&self, user_id: Uuid) -> Option<VoteDirection> {
        if self.upvoters.contains(&user_id) {
            Some(VoteDirection::Up)
        } else if self.downvoters.contains(&user_id) {
            Some(VoteDirection::Down)
        } else {
            None
        }
    }

    pub fn score(&self) -> i64 {
        self.upvoters.len() as i64 - self.downvoters.len() as i64
    }
}

/// Partial update carried by `post:update`. Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedPatch {
    pub content: Option<String>,
    pub upvoters: Option<BTreeSet<Uuid>>,
    pub downvoters: Option<BTreeSet<Uuid>>,
    pub comment_count: Option<u32>,
    pub share_count: Option<u32>,
    pub impression_count: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FeedPatch {
    pub fn touches_votes(&self) -> bool {
        self.upvoters.is_some() || self.downvoters.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    /// Temporary id chosen by the sending client, echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityMessage {
    pub id: Uuid,
    pub community_id: Uuid,
    pub author: UserRef,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub author: UserRef,
    pub content: String,
    #[serde(default)]
    pub reply_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Conversation,
    Community,
}

/// A server-side room the session must join to receive its scoped events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    pub id: Uuid,
    pub kind: TopicKind,
}

impl Topic {
    pub fn conversation(id: Uuid) -> Self {
        Self {
            id,
            kind: TopicKind::Conversation,
        }
    }

    pub fn community(id: Uuid) -> Self {
        Self {
            id,
            kind: TopicKind::Community,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TopicKind::Conversation => write!(f, "conversation:{}", self.id),
            TopicKind::Community => write!(f, "community:{}", self.id),
        }
    }
}
