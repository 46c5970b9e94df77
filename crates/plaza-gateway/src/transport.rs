use std::pin::Pin;

use async_trait::async_trait;
use futures_util::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use plaza_types::events::{ChannelCommand, ChannelEvent};

use crate::error::ChannelError;

pub type CommandSink = Pin<Box<dyn Sink<ChannelCommand, Error = ChannelError> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChannelEvent, ChannelError>> + Send>>;

/// One live, already-opened channel: outbound commands and inbound events.
pub struct ChannelLink {
    pub sink: CommandSink,
    pub stream: EventStream,
}

impl ChannelLink {
    pub fn new(sink: CommandSink, stream: EventStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens authenticated channel links. The token must be presented on every open.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, token: &str) -> Result<ChannelLink, ChannelError>;
}

/// WebSocket connector. The session token travels as the `token` query parameter.
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Accepts `http(s)://` as well as `ws(s)://` base URLs.
    pub fn from_base(base: &str) -> Result<Self, url::ParseError> {
        let ws = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        Ok(Self::new(Url::parse(&ws)?))
    }

    fn url_for(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, token: &str) -> Result<ChannelLink, ChannelError> {
        let url = self.url_for(token);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        debug!("WebSocket opened to {}", self.url);

        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx.with(|cmd: ChannelCommand| future::ready(encode_command(&cmd)));
        let stream = ws_rx.filter_map(|frame| future::ready(decode_frame(frame)));

        Ok(ChannelLink::new(Box::pin(sink), Box::pin(stream)))
    }
}

fn encode_command(cmd: &ChannelCommand) -> Result<Message, ChannelError> {
    Ok(Message::Text(serde_json::to_string(cmd)?.into()))
}

/// Text frames carry events, close frames end the link, control frames are skipped.
fn decode_frame(
    frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<ChannelEvent, ChannelError>> {
    match frame {
        Ok(Message::Text(text)) => {
            Some(serde_json::from_str::<ChannelEvent>(text.as_str()).map_err(ChannelError::from))
        }
        Ok(Message::Close(_)) => Some(Err(ChannelError::Closed)),
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_appended_as_query_parameter() {
        let connector = WsConnector::from_base("https://plaza.example/gateway?v=2").unwrap();
        let url = connector.url_for("abc def");
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.as_str(), "wss://plaza.example/gateway?v=2&token=abc+def");
    }

    #[test]
    fn control_frames_are_skipped_and_close_ends_the_link() {
        assert!(decode_frame(Ok(Message::Ping(Vec::new().into()))).is_none());
        assert!(matches!(
            decode_frame(Ok(Message::Close(None))),
            Some(Err(ChannelError::Closed))
        ));
    }

    #[test]
    fn unknown_event_type_is_a_non_fatal_decode_error() {
        let frame = Message::Text(r#"{"type":"typing","data":{}}"#.to_string().into());
        match decode_frame(Ok(frame)) {
            Some(Err(e)) => assert!(!e.is_fatal()),
            other => panic!("expected decode error, got {:?}", other.map(|r| r.is_ok())),
        }
    }
}
