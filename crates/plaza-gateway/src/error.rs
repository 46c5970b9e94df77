use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// Decode errors affect a single frame; everything else ends the link.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}
