#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use url::Url;

use super::error::WsError;
use crate::Result;
use crate::error::Error;

/// Environment variable holding the `host[:port]` of the event server.
pub const HOST_VAR: &str = "VISION_WS_HOST";
/// Environment variable selecting `wss` when set to `1` or `true`.
pub const SECURE_VAR: &str = "VISION_WS_SECURE";

const DEFAULT_HOST: &str = "localhost:8000";
const DEFAULT_PATH_PREFIX: &str = "/ws";
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Ceiling handed to the backoff schedule when no cap is configured. Unreachable within the
/// default attempt budget (the tenth delay is 512s).
const UNCAPPED_BACKOFF_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
const JITTER_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Configuration for the real-time event client.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// `host[:port]` of the event server
    #[builder(into, default = DEFAULT_HOST.to_owned())]
    pub host: String,
    /// Use `wss` instead of `ws`
    #[builder(default)]
    pub secure: bool,
    /// Path under which channels are mounted
    #[builder(into, default = DEFAULT_PATH_PREFIX.to_owned())]
    pub path_prefix: String,
    /// Interval for sending `ping` requests while a connection is open. `None` disables it.
    pub heartbeat_interval: Option<Duration>,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            secure: false,
            path_prefix: DEFAULT_PATH_PREFIX.to_owned(),
            heartbeat_interval: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Derive host and scheme from the origin the dashboard is served from.
    ///
    /// A page served over `https` connects with `wss`, anything else with `ws`.
    pub fn from_origin(origin: &str) -> Result<Self> {
        let origin = Url::parse(origin)?;
        let host = origin
            .host_str()
            .ok_or_else(|| WsError::InvalidEndpoint(format!("{origin} has no host")))?;
        let host = match origin.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        Ok(Self {
            host,
            secure: matches!(origin.scheme(), "https" | "wss"),
            ..Self::default()
        })
    }

    /// Defaults overlaid with [`HOST_VAR`] and [`SECURE_VAR`] when present.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var(HOST_VAR)
            && !host.trim().is_empty()
        {
            host.trim().clone_into(&mut config.host);
        }
        if let Ok(secure) = std::env::var(SECURE_VAR) {
            config.secure = matches!(secure.trim(), "1" | "true" | "TRUE" | "yes");
        }
        config
    }

    /// Reject settings that can never produce a working session.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::validation("host must not be empty"));
        }
        let multiplier = self.reconnect.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::validation(format!(
                "backoff multiplier must be at least 1, got {multiplier}"
            )));
        }
        Ok(())
    }

    /// Build the URL of a channel: `<ws|wss>://<host><prefix>/<channel>`.
    pub fn channel_url(&self, channel: &str) -> Result<Url> {
        if self.host.trim().is_empty() {
            return Err(WsError::InvalidEndpoint("host must not be empty".to_owned()).into());
        }
        if channel.is_empty() {
            return Err(WsError::InvalidEndpoint("channel must not be empty".to_owned()).into());
        }

        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}", self.host.trim()))?;
        url.path_segments_mut()
            .map_err(|()| WsError::InvalidEndpoint(format!("{} cannot be a base", self.host)))?
            .clear()
            .extend(self.path_prefix.split('/').filter(|s| !s.is_empty()))
            .push(channel);

        Ok(url)
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts per session before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt
    pub initial_backoff: Duration,
    /// Multiplier applied to the delay after every attempt
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay. `None` lets the delay grow unbounded.
    pub max_backoff: Option<Duration>,
    /// Randomize each delay by ±50%
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff: None,
            jitter: false,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        let randomization = if config.jitter {
            JITTER_RANDOMIZATION_FACTOR
        } else {
            0.0
        };

        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_randomization_factor(randomization)
            .with_multiplier(config.backoff_multiplier)
            .with_max_interval(config.max_backoff.unwrap_or(UNCAPPED_BACKOFF_DURATION))
            .with_max_elapsed_time(None) // Attempts are bounded separately
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url_uses_ws_prefix() {
        let url = Config::default().channel_url("alerts").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/alerts");
    }

    #[test]
    fn secure_origin_selects_wss() {
        let config = Config::from_origin("https://dashboard.example.com").unwrap();
        assert!(config.secure);
        assert_eq!(
            config.channel_url("detections").unwrap().as_str(),
            "wss://dashboard.example.com/ws/detections"
        );
    }

    #[test]
    fn plain_origin_keeps_port() {
        let config = Config::from_origin("http://10.0.0.5:3000/devices").unwrap();
        assert!(!config.secure);
        assert_eq!(config.host, "10.0.0.5:3000");
    }

    #[test]
    fn channel_is_a_single_escaped_segment() {
        let url = Config::default().channel_url("stream/cam 1").unwrap();
        assert_eq!(url.path(), "/ws/stream%2Fcam%201");
    }

    #[test]
    fn empty_channel_is_rejected() {
        assert!(Config::default().channel_url("").is_err());
    }

    #[test]
    fn builder_applies_defaults() {
        let config = Config::builder().host("example.org").secure(true).build();
        assert_eq!(config.path_prefix, "/ws");
        assert_eq!(config.reconnect.max_attempts, Some(10));
        assert_eq!(config.reconnect.initial_backoff, Duration::from_secs(1));
        assert!(config.heartbeat_interval.is_none());
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let mut config = Config::default();
        config.reconnect.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        config.reconnect.backoff_multiplier = 1.0;
        assert!(config.validate().is_ok());

        config.host = "  ".to_owned();
        assert!(config.validate().is_err());
    }
}
