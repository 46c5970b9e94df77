use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use plaza_gateway::ConnectionConfig;
use plaza_sync::{ConversationConfig, FeedConfig, RealtimeConfig};

const DEFAULT_RESYNC_SECS: u64 = 300;

/// Everything the `plaza` binary reads from the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub gateway_url: String,
    pub token: String,
    pub user_id: Uuid,
    pub engine: RealtimeConfig,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_url = var("PLAZA_API_URL").unwrap_or_else(|| "http://localhost:3000".into());
        let gateway_url =
            var("PLAZA_GATEWAY_URL").unwrap_or_else(|| format!("{}/gateway", api_url));
        let token = var("PLAZA_TOKEN").context("PLAZA_TOKEN must be set")?;
        let user_id: Uuid = var("PLAZA_USER_ID")
            .context("PLAZA_USER_ID must be set")?
            .parse()
            .context("PLAZA_USER_ID is not a UUID")?;

        let defaults = ConnectionConfig::default();
        let connection = ConnectionConfig {
            handshake_timeout: parse::<u64>(&var, "PLAZA_HANDSHAKE_TIMEOUT_SECS")?
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            backoff_base: parse::<u64>(&var, "PLAZA_BACKOFF_BASE_MS")?
                .map_or(defaults.backoff_base, Duration::from_millis),
            backoff_max: parse::<u64>(&var, "PLAZA_BACKOFF_MAX_MS")?
                .map_or(defaults.backoff_max, Duration::from_millis),
        };

        let feed = FeedConfig {
            page_size: parse(&var, "PLAZA_FEED_PAGE_SIZE")?.unwrap_or(FeedConfig::default().page_size),
        };

        // 0 turns the periodic resync off
        let resync_secs = parse(&var, "PLAZA_RESYNC_SECS")?.unwrap_or(DEFAULT_RESYNC_SECS);
        let resync_interval = (resync_secs > 0).then(|| Duration::from_secs(resync_secs));

        Ok(Self {
            api_url,
            gateway_url,
            token,
            user_id,
            engine: RealtimeConfig {
                connection,
                feed,
                conversations: ConversationConfig::default(),
                resync_interval,
            },
        })
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{} has an invalid value: {}", key, raw))
        })
        .transpose()
}
