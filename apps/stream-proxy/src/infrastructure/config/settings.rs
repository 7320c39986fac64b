//! Proxy Configuration Settings
//!
//! Configuration types for the stream proxy, loaded from environment
//! variables. Binance market streams are public, so there are no
//! credentials; every key has a default.

use std::time::Duration;

use crate::infrastructure::binance::ReconnectConfig;

/// Streaming behavior settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Master switch; when false, client connections are refused with an
    /// error frame.
    pub enabled: bool,
    /// Upstream WebSocket base URL.
    pub ws_base: String,
    /// Symbols tracked at startup and handed to clients that connect
    /// without a symbol list.
    pub default_symbols: Vec<String>,
    /// Bus channel prefix.
    pub channel_prefix: String,
    /// Per-client symbol cap.
    pub max_symbols_per_client: usize,
    /// System-wide tracked symbol cap.
    pub max_total_symbols: usize,
    /// Capacity of each client outbox.
    pub outbox_capacity: usize,
    /// Bus poll timeout for reader tasks.
    pub poll_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ws_base: "wss://stream.binance.com:9443".to_string(),
            default_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            channel_prefix: "prices".to_string(),
            max_symbols_per_client: 20,
            max_total_symbols: 50,
            outbox_capacity: 256,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Client WebSocket port.
    pub ws_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8000,
            health_port: 8082,
        }
    }
}

/// Upstream reconnection settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Initial reconnection delay.
    pub initial_delay: Duration,
    /// Maximum reconnection delay.
    pub max_delay: Duration,
    /// Delay multiplier for exponential backoff.
    pub multiplier: f64,
    /// Maximum consecutive attempts before reporting stopped (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.initial_delay,
            max_delay: settings.max_delay,
            multiplier: settings.multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_attempts,
        }
    }
}

/// Bus settings.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Per-channel buffer capacity.
    pub channel_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Streaming behavior.
    pub stream: StreamSettings,
    /// Server ports.
    pub server: ServerSettings,
    /// Upstream reconnection behavior.
    pub reconnect: ReconnectSettings,
    /// Bus buffering.
    pub bus: BusSettings,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a cap is configured to zero or the upstream URL
    /// has the wrong scheme.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let stream = StreamSettings {
            enabled: parse_env_bool("STREAM_ENABLED", defaults.stream.enabled),
            ws_base: std::env::var("BINANCE_WS_BASE").unwrap_or(defaults.stream.ws_base),
            default_symbols: std::env::var("STREAM_DEFAULT_SYMBOLS")
                .map(|raw| parse_symbol_list(&raw))
                .unwrap_or(defaults.stream.default_symbols),
            channel_prefix: std::env::var("STREAM_CHANNEL_PREFIX")
                .unwrap_or(defaults.stream.channel_prefix),
            max_symbols_per_client: parse_env_usize(
                "STREAM_MAX_SYMBOLS_PER_CLIENT",
                defaults.stream.max_symbols_per_client,
            ),
            max_total_symbols: parse_env_usize(
                "STREAM_MAX_TOTAL_SYMBOLS",
                defaults.stream.max_total_symbols,
            ),
            outbox_capacity: parse_env_usize(
                "STREAM_OUTBOX_CAPACITY",
                defaults.stream.outbox_capacity,
            ),
            poll_timeout: parse_env_duration_millis(
                "STREAM_POLL_TIMEOUT_MS",
                defaults.stream.poll_timeout,
            ),
        };

        let server = ServerSettings {
            ws_port: parse_env_u16("STREAM_WS_PORT", defaults.server.ws_port),
            health_port: parse_env_u16("STREAM_HEALTH_PORT", defaults.server.health_port),
        };

        let reconnect = ReconnectSettings {
            initial_delay: parse_env_duration_millis(
                "STREAM_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect.initial_delay,
            ),
            max_delay: parse_env_duration_secs(
                "STREAM_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect.max_delay,
            ),
            multiplier: parse_env_f64(
                "STREAM_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect.multiplier,
            ),
            max_attempts: parse_env_u32(
                "STREAM_MAX_RECONNECT_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
        };

        let bus = BusSettings {
            channel_capacity: parse_env_usize(
                "STREAM_BUS_CHANNEL_CAPACITY",
                defaults.bus.channel_capacity,
            ),
        };

        let config = Self {
            stream,
            server,
            reconnect,
            bus,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.max_symbols_per_client == 0 {
            return Err(ConfigError::InvalidValue(
                "STREAM_MAX_SYMBOLS_PER_CLIENT",
                "must be at least 1".to_string(),
            ));
        }
        if self.stream.max_total_symbols == 0 {
            return Err(ConfigError::InvalidValue(
                "STREAM_MAX_TOTAL_SYMBOLS",
                "must be at least 1".to_string(),
            ));
        }
        if self.bus.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "STREAM_BUS_CHANNEL_CAPACITY",
                "must be at least 1".to_string(),
            ));
        }
        if !self.stream.ws_base.starts_with("ws") {
            return Err(ConfigError::InvalidValue(
                "BINANCE_WS_BASE",
                format!("expected a ws:// or wss:// URL, got {}", self.stream.ws_base),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has an unusable value.
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
        .unwrap_or(default)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ProxyConfig::default();

        assert!(config.stream.enabled);
        assert_eq!(config.stream.max_symbols_per_client, 20);
        assert_eq!(config.stream.max_total_symbols, 50);
        assert_eq!(
            config.stream.default_symbols,
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
        assert_eq!(config.server.ws_port, 8000);
        assert_eq!(config.server.health_port, 8082);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn symbol_list_parsing_normalizes() {
        assert_eq!(
            parse_symbol_list("btcusdt, solusdt ,,"),
            vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()]
        );
    }

    #[test]
    fn zero_caps_are_rejected() {
        let mut config = ProxyConfig::default();
        config.stream.max_symbols_per_client = 0;
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.stream.max_total_symbols = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_ws_url_is_rejected() {
        let mut config = ProxyConfig::default();
        config.stream.ws_base = "https://stream.binance.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reconnect_settings_convert_to_policy_config() {
        let settings = ReconnectSettings::default();
        let config = ReconnectConfig::from(&settings);

        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 5);
        assert!((config.jitter_factor - 0.1).abs() < f64::EPSILON);
    }
}
