use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8765;

/// What `send_command` does while the connection is not `connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflinePolicy {
    /// Reject immediately with `NotConnected`.
    FailFast,
    /// Hold up to `max_depth` commands while a connection is being pursued.
    Queue { max_depth: usize },
}

/// How replies are matched to outstanding commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMode {
    /// Only `correlationId` resolves a command.
    Strict,
    /// Also accept uncorrelated replies by `(pluginId, action)`; commands sharing
    /// that pair are issued one at a time.
    ByName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Url,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub offline: OfflinePolicy,
    pub correlation: CorrelationMode,
    /// How long a cancelled `ByName` command keeps its key blocked for a late reply.
    pub stale_reply_window: Duration,
    pub short_circuit_unavailable: bool,
}

impl ClientConfig {
    pub fn for_endpoint(endpoint: Url) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            offline: OfflinePolicy::FailFast,
            correlation: CorrelationMode::Strict,
            stale_reply_window: Duration::from_secs(2),
            short_circuit_unavailable: false,
        }
    }

    pub fn local(host: &str, port: u16) -> Result<Self, ConfigError> {
        Ok(Self::for_endpoint(parse_endpoint(&format!("ws://{host}:{port}"))?))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match lookup("CONTROLLER_URL") {
            Some(url) => Self::for_endpoint(parse_endpoint(url.trim())?),
            None => {
                let host = lookup("CONTROLLER_HOST")
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| DEFAULT_HOST.to_string());
                let port = setting(&lookup, "CONTROLLER_PORT").unwrap_or(DEFAULT_PORT);
                Self::local(&host, port)?
            }
        };

        if let Some(ms) = setting(&lookup, "CONTROLLER_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout = millis(ms, 100, 120_000);
        }
        if let Some(ms) = setting(&lookup, "CONTROLLER_COMMAND_TIMEOUT_MS") {
            cfg.command_timeout = millis(ms, 10, 600_000);
        }
        if let Some(ms) = setting(&lookup, "CONTROLLER_RECONNECT_BASE_MS") {
            cfg.reconnect.base_delay = millis(ms, 10, 60_000);
        }
        if let Some(ms) = setting(&lookup, "CONTROLLER_RECONNECT_MAX_MS") {
            cfg.reconnect.max_delay = millis(ms, 10, 600_000);
        }
        if cfg.reconnect.max_delay < cfg.reconnect.base_delay {
            cfg.reconnect.max_delay = cfg.reconnect.base_delay;
        }
        if let Some(n) = setting::<u32, _>(&lookup, "CONTROLLER_RECONNECT_MAX_ATTEMPTS") {
            cfg.reconnect.max_attempts = Some(n);
        }
        if let Some(ms) = setting(&lookup, "CONTROLLER_STALE_REPLY_WINDOW_MS") {
            cfg.stale_reply_window = millis(ms, 0, 600_000);
        }

        let depth = setting(&lookup, "CONTROLLER_OFFLINE_QUEUE_DEPTH")
            .unwrap_or(64usize)
            .clamp(1, 10_000);
        if let Some(raw) = lookup("CONTROLLER_OFFLINE_POLICY") {
            cfg.offline = match raw.trim().to_ascii_lowercase().as_str() {
                "fail_fast" | "fail-fast" | "fail" => OfflinePolicy::FailFast,
                "queue" | "wait" => OfflinePolicy::Queue { max_depth: depth },
                other => {
                    warn!(value = other, "unknown CONTROLLER_OFFLINE_POLICY, keeping fail_fast");
                    OfflinePolicy::FailFast
                }
            };
        }

        if let Some(raw) = lookup("CONTROLLER_CORRELATION") {
            cfg.correlation = match raw.trim().to_ascii_lowercase().as_str() {
                "strict" | "id" => CorrelationMode::Strict,
                "by_name" | "by-name" | "name" | "legacy" => CorrelationMode::ByName,
                other => {
                    warn!(value = other, "unknown CONTROLLER_CORRELATION, keeping strict");
                    CorrelationMode::Strict
                }
            };
        }

        if let Some(raw) = lookup("CONTROLLER_SHORT_CIRCUIT") {
            cfg.short_circuit_unavailable =
                matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        Ok(cfg)
    }
}

pub fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

fn setting<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable controller setting");
            None
        }
    }
}

fn millis(ms: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(ms.clamp(min, max))
}
