use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{FeedItem, Notification, VoteDirection};

// -- Feed --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct VoteRequest {
    /// `None` clears any existing vote.
    pub direction: Option<VoteDirection>,
}

/// Authoritative vote sets returned after a vote is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub upvoters: BTreeSet<Uuid>,
    pub downvoters: BTreeSet<Uuid>,
}

// -- Messages --

#[derive(Debug, Serialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub client_id: Uuid,
}

// -- Notifications --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    #[serde(default)]
    pub unread_count: u32,
}

// -- Relations --

#[derive(Debug, Serialize)]
pub struct FollowRequest {
    pub follow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowState {
    pub user_id: Uuid,
    pub following: bool,
    pub follower_count: u32,
}

#[derive(Debug, Serialize)]
pub struct MembershipRequest {
    pub join: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipState {
    pub community_id: Uuid,
    pub joined: bool,
    pub member_count: u32,
}
