pub mod api;
pub mod comments;
pub mod communities;
pub mod conversations;
pub mod error;
pub mod feed;
pub mod follows;
pub mod http;
pub mod notifications;
pub mod optimistic;
pub mod realtime;

pub use comments::CommentSynchronizer;
pub use communities::CommunitySynchronizer;
pub use conversations::{ConversationConfig, ConversationSynchronizer, DeliveryStatus};
pub use error::{ApiError, ApiResult, SyncError, SyncResult};
pub use feed::{FeedConfig, FeedSynchronizer};
pub use follows::FollowSynchronizer;
pub use http::HttpApi;
pub use notifications::NotificationSynchronizer;
pub use realtime::{Apis, Realtime, RealtimeConfig, Synchronizers};
