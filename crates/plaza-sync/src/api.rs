//! Pull-side collaborator boundary. Response bodies arrive already shaped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use plaza_types::api::{FeedPage, FollowState, MembershipState, NotificationPage, VoteTally};
use plaza_types::models::{Comment, CommunityMessage, Conversation, Message, Session, VoteDirection};

use crate::error::ApiResult;

/// Collaborators that authenticate as the current session.
pub trait Credentials: Send + Sync {
    fn set_session(&self, session: &Session);
}

#[async_trait]
pub trait FeedApi: Send + Sync {
    /// `page` starts at 1.
    async fn list_feed(&self, page: u32, limit: u32) -> ApiResult<FeedPage>;

    /// `None` clears the vote.
    async fn vote(&self, post_id: Uuid, direction: Option<VoteDirection>) -> ApiResult<VoteTally>;
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self) -> ApiResult<Vec<Conversation>>;

    /// Newest `limit` messages older than `before`, any order.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> ApiResult<Vec<Message>>;

    async fn send_message(
        &self,
        conversation_id: Uuid,
        content: &str,
        client_id: Uuid,
    ) -> ApiResult<Message>;

    async fn mark_conversation_read(&self, conversation_id: Uuid) -> ApiResult<()>;
}

#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn list_notifications(&self) -> ApiResult<NotificationPage>;
    async fn mark_notification_read(&self, id: Uuid) -> ApiResult<()>;
    async fn mark_all_notifications_read(&self) -> ApiResult<()>;
}

#[async_trait]
pub trait FollowApi: Send + Sync {
    async fn set_following(&self, user_id: Uuid, follow: bool) -> ApiResult<FollowState>;
}

#[async_trait]
pub trait CommunityApi: Send + Sync {
    async fn set_membership(&self, community_id: Uuid, join: bool) -> ApiResult<MembershipState>;
    async fn list_community_messages(
        &self,
        community_id: Uuid,
        limit: u32,
    ) -> ApiResult<Vec<CommunityMessage>>;
}

#[async_trait]
pub trait CommentApi: Send + Sync {
    /// Top-level comments when `parent` is `None`, otherwise direct replies.
    async fn list_comments(&self, post_id: Uuid, parent: Option<Uuid>) -> ApiResult<Vec<Comment>>;
}
