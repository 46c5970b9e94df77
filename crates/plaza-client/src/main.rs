mod config;

use std::sync::Arc;

use tracing::info;

use plaza_gateway::WsConnector;
use plaza_sync::{Apis, HttpApi, Realtime};
use plaza_types::models::Session;

use crate::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plaza=debug".into()),
        )
        .init();

    let config = ClientConfig::from_env()?;

    let api = Arc::new(HttpApi::new(config.api_url.clone(), config.token.clone()));
    let connector = Arc::new(WsConnector::from_base(&config.gateway_url)?);
    let engine = Realtime::new(connector, Apis::http(api), config.engine.clone());

    let session = Session::new(config.token.clone(), config.user_id);
    let sync = engine.start(session).await;
    info!(
        "Plaza client for {} running against {}",
        config.user_id, config.api_url
    );

    let mut state = engine.watch_state();
    let mut feed = sync.feed.subscribe();
    let mut conversations = sync.conversations.subscribe();
    let mut notifications = sync.notifications.subscribe();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("Shutting down");
                break;
            }
            Ok(()) = state.changed() => {
                info!("Channel {:?}", *state.borrow_and_update());
            }
            Ok(()) = feed.changed() => {
                feed.borrow_and_update();
                info!("Feed: {} posts", sync.feed.items().len());
            }
            Ok(()) = conversations.changed() => {
                conversations.borrow_and_update();
                info!(
                    "Conversations: {} ({} unread)",
                    sync.conversations.conversations().len(),
                    sync.conversations.total_unread()
                );
            }
            Ok(()) = notifications.changed() => {
                notifications.borrow_and_update();
                info!("Notifications: {} unread", sync.notifications.unread());
            }
        }
    }

    engine.stop().await;
    Ok(())
}
