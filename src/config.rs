use crate::chats::ChatIdStrategy;
use crate::receipts::DEFAULT_POLL_INTERVAL;
use crate::status::DEFAULT_STATUS_TTL_HOURS;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub media_dir: PathBuf,
    pub media_base_url: String,
    pub receipt_poll_interval: Duration,
    pub message_page_size: usize,
    pub status_ttl: chrono::Duration,
    pub chat_id_strategy: ChatIdStrategy,
}

impl Config {
    /// Reads the process environment; call `dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").unwrap_or("./chat.db".to_string());
        let media_dir = PathBuf::from(lookup("MEDIA_DIR").unwrap_or("./media".to_string()));
        let media_base_url = lookup("MEDIA_BASE_URL")
            .unwrap_or_else(|| format!("file://{}", media_dir.display()));

        let poll_ms: u64 = parse(&lookup, "RECEIPT_POLL_INTERVAL_MS")?
            .unwrap_or(DEFAULT_POLL_INTERVAL.as_millis() as u64);
        if poll_ms == 0 {
            return Err(anyhow!("RECEIPT_POLL_INTERVAL_MS must be greater than zero"));
        }
        let message_page_size = parse(&lookup, "MESSAGE_PAGE_SIZE")?.unwrap_or(50);
        let ttl_hours: i64 = parse(&lookup, "STATUS_TTL_HOURS")?.unwrap_or(DEFAULT_STATUS_TTL_HOURS);
        if ttl_hours <= 0 {
            return Err(anyhow!("STATUS_TTL_HOURS must be greater than zero"));
        }
        let status_ttl = chrono::Duration::try_hours(ttl_hours)
            .ok_or_else(|| anyhow!("STATUS_TTL_HOURS is out of range: {ttl_hours}"))?;
        let chat_id_strategy = lookup("CHAT_ID_STRATEGY")
            .map(|raw| ChatIdStrategy::from_str(&raw).map_err(|e| anyhow!(e)))
            .transpose()?
            .unwrap_or_default();

        Ok(Config {
            database_url,
            media_dir,
            media_base_url,
            receipt_poll_interval: Duration::from_millis(poll_ms),
            message_page_size,
            status_ttl,
            chat_id_strategy,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("Invalid {key}: '{raw}'")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.database_url, "./chat.db");
        assert_eq!(config.media_base_url, "file://./media");
        assert_eq!(config.receipt_poll_interval, Duration::from_secs(3));
        assert_eq!(config.message_page_size, 50);
        assert_eq!(config.status_ttl, chrono::Duration::hours(24));
        assert_eq!(config.chat_id_strategy, ChatIdStrategy::Deterministic);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("DATABASE_URL", ":memory:"),
            ("RECEIPT_POLL_INTERVAL_MS", "500"),
            ("CHAT_ID_STRATEGY", "Scan"),
            ("STATUS_TTL_HOURS", "12"),
        ])
        .unwrap();
        assert_eq!(config.database_url, ":memory:");
        assert_eq!(config.receipt_poll_interval, Duration::from_millis(500));
        assert_eq!(config.chat_id_strategy, ChatIdStrategy::Scan);
        assert_eq!(config.status_ttl, chrono::Duration::hours(12));
    }

    #[test]
    fn test_malformed_values() {
        assert!(config_from(&[("RECEIPT_POLL_INTERVAL_MS", "soon")]).is_err());
        assert!(config_from(&[("RECEIPT_POLL_INTERVAL_MS", "0")]).is_err());
        assert!(config_from(&[("MESSAGE_PAGE_SIZE", "-1")]).is_err());
        assert!(config_from(&[("CHAT_ID_STRATEGY", "random")]).is_err());
        assert!(config_from(&[("STATUS_TTL_HOURS", "-5")]).is_err());
        assert!(config_from(&[("STATUS_TTL_HOURS", "0")]).is_err());
        assert!(config_from(&[("STATUS_TTL_HOURS", "9223372036854775807")]).is_err());
    }
}
