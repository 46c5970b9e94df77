use thiserror::Error;
use uuid::Uuid;

/// Failures of the pull-side HTTP collaborator.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("no local entity with id {0}")]
    UnknownEntity(Uuid),

    #[error("reply {reply} cannot attach to {parent}: parent missing or not older")]
    InvalidReply { reply: Uuid, parent: Uuid },
}

pub type ApiResult<T> = Result<T, ApiError>;
pub type SyncResult<T> = Result<T, SyncError>;
