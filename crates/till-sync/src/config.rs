//! Sync engine configuration
//!
//! Values can be built in code with the `with_*` helpers, deserialized from
//! an application config file, or read from `TILL_SYNC_*` environment
//! variables via [`SyncConfig::from_env`].

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_PUSH_BATCH_SIZE: usize = 50;
const DEFAULT_MAX_PULL_PAGES: usize = 20;
const DEFAULT_MAX_PUSH_BATCHES: usize = 20;
const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_RESOLUTION_CAPACITY: usize = 64;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Exponential backoff: `base_delay * 2^min(n, max_exponent)`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub max_exponent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_exponent: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.max_exponent);
        let factor = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Configuration for a terminal's sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Terminal identifier sent with pushes
    pub device_id: String,
    /// Automatic sync interval; `None` means triggers only
    #[serde(with = "option_duration_secs")]
    pub sync_interval: Option<Duration>,
    /// Maximum outbox entries per push request
    pub push_batch_size: usize,
    /// Maximum pull pages reconciled in one cycle
    pub max_pull_pages: usize,
    /// Maximum push requests in one cycle
    pub max_push_batches: usize,
    /// Backoff for failed cycles and failed outbox entries
    pub retry: RetryPolicy,
    /// Buffered events per subscriber before slow subscribers lag
    pub event_capacity: usize,
    /// Buffered resolution decisions
    pub resolution_capacity: usize,
    /// How long shutdown waits for an in-flight cycle
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: "terminal".to_string(),
            sync_interval: Some(Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS)),
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            max_pull_pages: DEFAULT_MAX_PULL_PAGES,
            max_push_batches: DEFAULT_MAX_PUSH_BATCHES,
            retry: RetryPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            resolution_capacity: DEFAULT_RESOLUTION_CAPACITY,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl SyncConfig {
    /// Create a configuration for the given terminal with default tuning
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    /// Set the automatic sync interval
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disable automatic sync (triggers only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Set the push batch size
    #[must_use]
    pub const fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Set the backoff policy
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Check values that would stall or spin the engine
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::Config("device_id must not be empty".into()));
        }
        if self.sync_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::Config("sync_interval must be greater than zero".into()));
        }
        for (name, value) in [
            ("push_batch_size", self.push_batch_size),
            ("max_pull_pages", self.max_pull_pages),
            ("max_push_batches", self.max_push_batches),
            ("event_capacity", self.event_capacity),
            ("resolution_capacity", self.resolution_capacity),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.retry.base_delay.is_zero() {
            return Err(Error::Config("retry.base_delay must be greater than zero".into()));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(Error::Config(
                "retry.max_delay must be >= retry.base_delay".into(),
            ));
        }
        Ok(())
    }

    /// Read overrides from `TILL_SYNC_*` environment variables
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(device_id) = optional_trimmed(&lookup, "TILL_SYNC_DEVICE_ID") {
            config.device_id = device_id;
        }
        if let Some(secs) = parse_optional::<u64>(&lookup, "TILL_SYNC_INTERVAL_SECS")? {
            config.sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(size) = parse_optional(&lookup, "TILL_SYNC_PUSH_BATCH_SIZE")? {
            config.push_batch_size = size;
        }
        if let Some(pages) = parse_optional(&lookup, "TILL_SYNC_MAX_PULL_PAGES")? {
            config.max_pull_pages = pages;
        }
        if let Some(batches) = parse_optional(&lookup, "TILL_SYNC_MAX_PUSH_BATCHES")? {
            config.max_push_batches = batches;
        }
        if let Some(ms) = parse_optional(&lookup, "TILL_SYNC_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_optional(&lookup, "TILL_SYNC_RETRY_MAX_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_optional(&lookup, "TILL_SYNC_SHUTDOWN_GRACE_SECS")? {
            config.shutdown_grace = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Connection settings for [`crate::gateway::HttpGateway`]
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Sync API base URL, without trailing slash
    pub base_url: String,
    /// Bearer token for the sync API
    pub auth_token: Option<String>,
    /// Per-request timeout; connectivity loss fails fast instead of hanging
    pub request_timeout: Duration,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .ok_or_else(|| Error::Config("gateway base_url must not be empty".into()))?;
        if !is_http_url(&base_url) {
            return Err(Error::Config(
                "gateway base_url must include http:// or https://".into(),
            ));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        })
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = normalize_text_option(Some(token.into()));
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Read `TILL_SYNC_API_URL`, `TILL_SYNC_API_TOKEN` and `TILL_SYNC_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = optional_trimmed(&lookup, "TILL_SYNC_API_URL")
            .ok_or_else(|| Error::Config("Missing TILL_SYNC_API_URL".into()))?;
        let mut config = Self::new(base_url)?;
        if let Some(token) = optional_trimmed(&lookup, "TILL_SYNC_API_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Some(secs) = parse_optional(&lookup, "TILL_SYNC_REQUEST_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(Error::Config(
                    "TILL_SYNC_REQUEST_TIMEOUT_SECS must be greater than zero".into(),
                ));
            }
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

fn parse_optional<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    optional_trimmed(lookup, name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| Error::Config(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
