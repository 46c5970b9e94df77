use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use plaza_types::api::{
    FeedPage, FollowRequest, FollowState, MembershipRequest, MembershipState, NotificationPage,
    SendMessageRequest, VoteRequest, VoteTally,
};
use plaza_types::models::{Comment, CommunityMessage, Conversation, Message, Session, VoteDirection};

use crate::api::{
    CommentApi, CommunityApi, ConversationApi, Credentials, FeedApi, FollowApi, NotificationApi,
};
use crate::error::{ApiError, ApiResult};

/// REST implementation of every pull-side trait, authenticated with the session token.
pub struct HttpApi {
    http: Client,
    base_url: String,
    token: RwLock<String>,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(token.into()),
        }
    }

    /// Swap credentials after a new login.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(self.token.read().as_str())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ApiResult<T> {
        debug!("GET {}", path);
        let res = self
            .authed(self.http.get(self.url(path)).query(query))
            .send()
            .await?;
        Ok(check(res).await?.json::<T>().await?)
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> ApiResult<T> {
        debug!("POST {}", path);
        let res = self
            .authed(self.http.post(self.url(path)).json(body))
            .send()
            .await?;
        Ok(check(res).await?.json::<T>().await?)
    }

    async fn post_empty(&self, path: &str) -> ApiResult<()> {
        debug!("POST {}", path);
        let res = self.authed(self.http.post(self.url(path))).send().await?;
        check(res).await?;
        Ok(())
    }
}

impl Credentials for HttpApi {
    fn set_session(&self, session: &Session) {
        self.set_token(session.token.clone());
    }
}

async fn check(res: Response) -> ApiResult<Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    Err(ApiError::Status { status, body })
}

#[async_trait]
impl FeedApi for HttpApi {
    async fn list_feed(&self, page: u32, limit: u32) -> ApiResult<FeedPage> {
        self.get(
            "/posts",
            &[("page", page.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn vote(&self, post_id: Uuid, direction: Option<VoteDirection>) -> ApiResult<VoteTally> {
        self.post(&format!("/posts/{}/vote", post_id), &VoteRequest { direction })
            .await
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn list_conversations(&self) -> ApiResult<Vec<Conversation>> {
        self.get("/conversations", &[]).await
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> ApiResult<Vec<Message>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339()));
        }
        self.get(&format!("/conversations/{}/messages", conversation_id), &query)
            .await
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        content: &str,
        client_id: Uuid,
    ) -> ApiResult<Message> {
        let body = SendMessageRequest {
            content: content.to_string(),
            client_id,
        };
        self.post(&format!("/conversations/{}/messages", conversation_id), &body)
            .await
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid) -> ApiResult<()> {
        self.post_empty(&format!("/conversations/{}/read", conversation_id))
            .await
    }
}

#[async_trait]
impl NotificationApi for HttpApi {
    async fn list_notifications(&self) -> ApiResult<NotificationPage> {
        self.get("/notifications", &[]).await
    }

    async fn mark_notification_read(&self, id: Uuid) -> ApiResult<()> {
        self.post_empty(&format!("/notifications/{}/read", id)).await
    }

    async fn mark_all_notifications_read(&self) -> ApiResult<()> {
        self.post_empty("/notifications/read-all").await
    }
}

#[async_trait]
impl FollowApi for HttpApi {
    async fn set_following(&self, user_id: Uuid, follow: bool) -> ApiResult<FollowState> {
        self.post(&format!("/users/{}/follow", user_id), &FollowRequest { follow })
            .await
    }
}

#[async_trait]
impl CommunityApi for HttpApi {
    async fn set_membership(&self, community_id: Uuid, join: bool) -> ApiResult<MembershipState> {
        self.post(
            &format!("/communities/{}/membership", community_id),
            &MembershipRequest { join },
        )
        .await
    }

    async fn list_community_messages(
        &self,
        community_id: Uuid,
        limit: u32,
    ) -> ApiResult<Vec<CommunityMessage>> {
        self.get(
            &format!("/communities/{}/messages", community_id),
            &[("limit", limit.to_string())],
        )
        .await
    }
}

#[async_trait]
impl CommentApi for HttpApi {
    async fn list_comments(&self, post_id: Uuid, parent: Option<Uuid>) -> ApiResult<Vec<Comment>> {
        let query: Vec<(&str, String)> = parent
            .map(|p| vec![("parent", p.to_string())])
            .unwrap_or_default();
        self.get(&format!("/posts/{}/comments", post_id), &query).await
    }
}
