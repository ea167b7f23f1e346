use crate::error::ConfigError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3500;
pub const DEFAULT_MAX_HISTORY: usize = 50;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;
pub const DEFAULT_PERSIST_QUEUE_CAPACITY: usize = 1024;

/// Frames a subscriber must be able to hold right after connecting
/// (`connected` + `history`).
const MIN_SUBSCRIBER_BUFFER: usize = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub public_url: String,
    pub max_history: usize,
    /// Pre-bound secret, for deployments where the handshake happened
    /// before this process started.
    pub initial_secret: Option<String>,
    pub data_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub subscriber_buffer: usize,
    pub persist_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            public_url: format!("http://localhost:{DEFAULT_PORT}"),
            max_history: DEFAULT_MAX_HISTORY,
            initial_secret: None,
            data_dir: PathBuf::from("./data"),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            persist_queue_capacity: DEFAULT_PERSIST_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(get("PORT"), "PORT", DEFAULT_PORT)?;
        let public_url = get("PUBLIC_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{port}"));

        let max_history = parse_or(get("WEBHOOK_MAX_HISTORY"), "WEBHOOK_MAX_HISTORY", DEFAULT_MAX_HISTORY)?;
        if max_history == 0 {
            return Err(ConfigError::Invalid {
                key: "WEBHOOK_MAX_HISTORY",
                value: "0".into(),
                reason: "history capacity must be at least 1".into(),
            });
        }

        let heartbeat_secs: u64 = parse_or(
            get("HEARTBEAT_INTERVAL_SECS"),
            "HEARTBEAT_INTERVAL_SECS",
            DEFAULT_HEARTBEAT_SECS,
        )?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "HEARTBEAT_INTERVAL_SECS",
                value: "0".into(),
                reason: "interval must be positive".into(),
            });
        }

        let subscriber_buffer: usize =
            parse_or(get("SUBSCRIBER_BUFFER"), "SUBSCRIBER_BUFFER", DEFAULT_SUBSCRIBER_BUFFER)?;
        let persist_queue_capacity: usize = parse_or(
            get("PERSIST_QUEUE_CAPACITY"),
            "PERSIST_QUEUE_CAPACITY",
            DEFAULT_PERSIST_QUEUE_CAPACITY,
        )?;

        Ok(Self {
            port,
            public_url,
            max_history,
            initial_secret: get("ASANA_WEBHOOK_SECRET"),
            data_dir: get("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            subscriber_buffer: subscriber_buffer.max(MIN_SUBSCRIBER_BUFFER),
            persist_queue_capacity: persist_queue_capacity.max(1),
        })
    }

    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.public_url)
    }
}

fn parse_or<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 3500);
        assert_eq!(cfg.public_url, "http://localhost:3500");
        assert_eq!(cfg.max_history, 50);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert!(cfg.initial_secret.is_none());
    }

    #[test]
    fn public_url_follows_port_and_drops_trailing_slash() {
        let cfg = Config::from_lookup(lookup(&[("PORT", "8080")])).unwrap();
        assert_eq!(cfg.public_url, "http://localhost:8080");

        let cfg = Config::from_lookup(lookup(&[("PUBLIC_URL", "https://hooks.example.com/")])).unwrap();
        assert_eq!(cfg.webhook_url(), "https://hooks.example.com/webhook");
    }

    #[test]
    fn empty_values_count_as_unset() {
        let cfg = Config::from_lookup(lookup(&[("ASANA_WEBHOOK_SECRET", ""), ("PORT", " ")])).unwrap();
        assert!(cfg.initial_secret.is_none());
        assert_eq!(cfg.port, 3500);
    }

    #[test]
    fn rejects_unparsable_and_zero_values() {
        let err = Config::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        assert!(Config::from_lookup(lookup(&[("WEBHOOK_MAX_HISTORY", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("HEARTBEAT_INTERVAL_SECS", "0")])).is_err());
    }

    #[test]
    fn subscriber_buffer_is_clamped() {
        let cfg = Config::from_lookup(lookup(&[("SUBSCRIBER_BUFFER", "1")])).unwrap();
        assert_eq!(cfg.subscriber_buffer, 2);
    }
}
