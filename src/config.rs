use http::{HeaderName, HeaderValue};
use std::time::Duration;
use url::Url;

/// Default base URL for realtime endpoints
pub const DEFAULT_BASE_URL: &str = "ws://localhost:8000/ws";

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Base WebSocket URL; endpoints resolve to `<base_url>/<endpoint>/`
    pub base_url: String,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Keep-alive settings
    pub heartbeat: HeartbeatConfig,
    /// Reconnect attempts after an unexpected close before giving up
    pub max_reconnect_attempts: u32,
    /// Upper bound on a single open (TCP + TLS + handshake); `None` waits forever
    pub connect_timeout: Option<Duration>,
    /// Outbound frames buffered per endpoint before `send` starts refusing
    pub command_buffer: usize,
    /// Extra headers sent with every handshake request
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            backoff: BackoffConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            max_reconnect_attempts: 5,
            connect_timeout: Some(Duration::from_secs(10)),
            command_buffer: 100,
            headers: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

/// Builder for ManagerConfig
#[derive(Debug, Clone, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set the base WebSocket URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set heartbeat configuration
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.config.heartbeat = config;
        self
    }

    /// Set the maximum number of reconnect attempts
    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.config.max_reconnect_attempts = max;
        self
    }

    /// Set (or clear) the connect timeout
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the per-endpoint outbound buffer size
    pub fn command_buffer(mut self, size: usize) -> Self {
        self.config.command_buffer = size;
        self
    }

    /// Add a header to every handshake request
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.push((name, value));
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ManagerConfig, ConfigError> {
        let base = Url::parse(&self.config.base_url)
            .map_err(|e| ConfigError::InvalidBaseUrl(format!("{}: {}", self.config.base_url, e)))?;
        if base.scheme() != "ws" && base.scheme() != "wss" {
            return Err(ConfigError::InvalidBaseUrl(format!(
                "scheme must be ws or wss, got '{}'",
                base.scheme()
            )));
        }

        if self.config.backoff.max_delay < self.config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        if self.config.heartbeat.interval.is_zero() {
            return Err(ConfigError::InvalidHeartbeat(
                "interval must be > 0".to_string(),
            ));
        }

        if let Some(pong_timeout) = self.config.heartbeat.pong_timeout {
            if pong_timeout > self.config.heartbeat.interval {
                return Err(ConfigError::InvalidHeartbeat(
                    "pong_timeout should be <= interval".to_string(),
                ));
            }
        }

        if self.config.command_buffer == 0 {
            return Err(ConfigError::InvalidBuffer(
                "command_buffer cannot be 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Base URL is not a ws:// or wss:// URL
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid outbound buffer size
    #[error("Invalid command buffer: {0}")]
    InvalidBuffer(String),
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// Keep-alive configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between application-level `ping` envelopes
    pub interval: Duration,
    /// How long to wait for a `pong`; `None` never treats a missing pong as failure
    pub pong_timeout: Option<Duration>,
    /// Consecutive missed pongs before the connection is dropped and retried
    pub failure_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: None,
            failure_threshold: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_calculation() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_default_backoff_is_plain_exponential() {
        let config = BackoffConfig::default();
        for attempt in 0..4 {
            assert_eq!(
                config.delay_for_attempt(attempt),
                Duration::from_secs(1) * 2u32.pow(attempt)
            );
        }
    }

    #[test]
    fn test_backoff_with_jitter() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        };

        for attempt in 0..5 {
            let delay = config.delay_for_attempt(attempt);
            let max_expected =
                Duration::from_millis((100.0 * 2.0_f64.powi(attempt as i32)) as u64);
            assert!(delay <= max_expected);
        }
    }

    #[test]
    fn test_config_builder() {
        let config = ManagerConfig::builder()
            .base_url("wss://api.verihome.test/ws")
            .max_reconnect_attempts(3)
            .connect_timeout(None)
            .build()
            .expect("valid config");

        assert_eq!(config.base_url, "wss://api.verihome.test/ws");
        assert_eq!(config.max_reconnect_attempts, 3);
        assert!(config.connect_timeout.is_none());
        assert_eq!(config.command_buffer, 100); // default
    }

    #[test]
    fn test_config_builder_rejects_http_base_url() {
        let result = ManagerConfig::builder()
            .base_url("https://api.verihome.test")
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidBaseUrl(_))));
    }

    #[test]
    fn test_config_builder_rejects_inverted_backoff() {
        let result = ManagerConfig::builder()
            .backoff(BackoffConfig {
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(1),
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidBackoff(_))));
    }

    #[test]
    fn test_config_builder_rejects_long_pong_timeout() {
        let result = ManagerConfig::builder()
            .heartbeat(HeartbeatConfig {
                interval: Duration::from_secs(10),
                pong_timeout: Some(Duration::from_secs(20)),
                failure_threshold: 1,
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidHeartbeat(_))));
    }

    #[test]
    fn test_config_builder_rejects_zero_buffer() {
        let result = ManagerConfig::builder().command_buffer(0).build();
        assert!(result.is_err());
    }
}
