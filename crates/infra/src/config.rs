//! Process settings loaded from `WAYPOINT_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use waypoint_observability::LogFormat;

use crate::dispatch::{DispatchConfig, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub poll_interval: Duration,
    pub max_deliveries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub pending_timeout: Duration,
    pub consumers_per_subscription: usize,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            redis_url: "redis://localhost:6379".to_string(),
            consumer_group: "waypoint.orchestrator".to_string(),
            consumer_name: format!("orchestrator-{}", uuid::Uuid::now_v7()),
            poll_interval: Duration::from_millis(250),
            max_deliveries: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(60),
            pending_timeout: Duration::from_secs(60),
            consumers_per_subscription: 1,
            log_format: LogFormat::Json,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut s = Settings::default();

        if let Some(v) = get("WAYPOINT_DATABASE_URL") {
            s.database_url = Some(v);
        }
        if let Some(v) = get("WAYPOINT_DATABASE_MAX_CONNECTIONS") {
            s.database_max_connections = parse("WAYPOINT_DATABASE_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = get("WAYPOINT_REDIS_URL") {
            s.redis_url = v;
        }
        if let Some(v) = get("WAYPOINT_CONSUMER_GROUP") {
            s.consumer_group = v;
        }
        if let Some(v) = get("WAYPOINT_CONSUMER_NAME") {
            s.consumer_name = v;
        }
        if let Some(v) = get("WAYPOINT_POLL_INTERVAL_MS") {
            s.poll_interval = millis("WAYPOINT_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("WAYPOINT_MAX_DELIVERIES") {
            s.max_deliveries = parse("WAYPOINT_MAX_DELIVERIES", &v)?;
        }
        if let Some(v) = get("WAYPOINT_RETRY_BASE_DELAY_MS") {
            s.retry_base_delay = millis("WAYPOINT_RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = get("WAYPOINT_RETRY_MAX_DELAY_MS") {
            s.retry_max_delay = millis("WAYPOINT_RETRY_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = get("WAYPOINT_PENDING_TIMEOUT_MS") {
            s.pending_timeout = millis("WAYPOINT_PENDING_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("WAYPOINT_CONSUMERS_PER_SUBSCRIPTION") {
            s.consumers_per_subscription = parse("WAYPOINT_CONSUMERS_PER_SUBSCRIPTION", &v)?;
        }
        if let Some(v) = get("WAYPOINT_LOG_FORMAT") {
            s.log_format = v.parse().map_err(|message| ConfigError::Invalid {
                key: "WAYPOINT_LOG_FORMAT",
                message,
            })?;
        }

        if s.max_deliveries == 0 {
            return Err(ConfigError::Invalid {
                key: "WAYPOINT_MAX_DELIVERIES",
                message: "must be at least 1".to_string(),
            });
        }
        if s.consumers_per_subscription == 0 {
            return Err(ConfigError::Invalid {
                key: "WAYPOINT_CONSUMERS_PER_SUBSCRIPTION",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(s)
    }

    /// The database URL, which the binary cannot run without.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("WAYPOINT_DATABASE_URL"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_deliveries, self.retry_base_delay, self.retry_max_delay)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            group: self.consumer_group.clone(),
            consumer_name: self.consumer_name.clone(),
            poll_interval: self.poll_interval,
            consumers_per_subscription: self.consumers_per_subscription,
            retry_policy: self.retry_policy(),
        }
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        message: format!("'{value}': {e}"),
    })
}

fn millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let s = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(s.database_url, None);
        assert_eq!(s.redis_url, "redis://localhost:6379");
        assert_eq!(s.consumer_group, "waypoint.orchestrator");
        assert!(s.consumer_name.starts_with("orchestrator-"));
        assert_eq!(s.poll_interval, Duration::from_millis(250));
        assert_eq!(s.max_deliveries, 5);
        assert_eq!(s.log_format, LogFormat::Json);
        assert!(s.require_database_url().is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let s = Settings::from_lookup(lookup(&[
            ("WAYPOINT_DATABASE_URL", "postgres://localhost/waypoint"),
            ("WAYPOINT_MAX_DELIVERIES", "3"),
            ("WAYPOINT_RETRY_BASE_DELAY_MS", "100"),
            ("WAYPOINT_CONSUMERS_PER_SUBSCRIPTION", "4"),
            ("WAYPOINT_LOG_FORMAT", "Pretty"),
        ]))
        .unwrap();

        assert_eq!(s.require_database_url().unwrap(), "postgres://localhost/waypoint");
        assert_eq!(s.max_deliveries, 3);
        assert_eq!(s.retry_base_delay, Duration::from_millis(100));
        assert_eq!(s.log_format, LogFormat::Pretty);

        let dispatch = s.dispatch_config();
        assert_eq!(dispatch.consumers_per_subscription, 4);
        assert_eq!(dispatch.retry_policy.max_deliveries, 3);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Settings::from_lookup(lookup(&[("WAYPOINT_POLL_INTERVAL_MS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "WAYPOINT_POLL_INTERVAL_MS",
                ..
            }
        ));

        let err = Settings::from_lookup(lookup(&[("WAYPOINT_LOG_FORMAT", "xml")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WAYPOINT_LOG_FORMAT", .. }));

        let err = Settings::from_lookup(lookup(&[("WAYPOINT_MAX_DELIVERIES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
