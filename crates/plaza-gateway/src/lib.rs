pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod subscriptions;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use dispatcher::{Dispatcher, HandlerGuard, HandlerToken};
pub use error::ChannelError;
pub use subscriptions::{HolderId, SubscriptionRegistry};
pub use transport::{ChannelLink, Connector, WsConnector};
