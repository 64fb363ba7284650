//! Configuration for the order book collector

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MarketDataError, Result};

/// Reconnect backoff settings
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Base delay before the first retry
    pub base_delay_ms: u64,
    /// Cap on the exponential delay
    pub max_delay_ms: u64,
    /// Jitter fraction applied to each delay, in [0, 1)
    pub jitter: f64,
    /// Attempts after which the symbol is flagged unhealthy (retries continue)
    pub max_attempts: u32,
}

/// Collector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Trading symbols to track (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// REST API endpoint for snapshots
    pub rest_endpoint: String,

    /// WebSocket endpoint for diff streams
    pub ws_endpoint: String,

    /// Maximum price levels retained per book side
    pub depth_limit: usize,

    /// Mid-price history capacity for rolling volatility
    pub metrics_window: usize,

    /// Levels per side used by default for depth/imbalance/pressure
    pub metrics_levels: usize,

    /// Interval between subscriber callback emissions
    pub callback_interval_ms: u64,

    /// Minimum spacing between REST snapshot requests (shared gate)
    pub rest_min_interval_ms: u64,

    /// Reconnect behavior
    pub backoff: BackoffConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            symbols,
            rest_endpoint: env::var("REST_ENDPOINT")
                .unwrap_or_else(|_| "https://api.binance.com/api/v3".to_string()),
            ws_endpoint: env::var("WS_ENDPOINT")
                .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string()),
            depth_limit: env_parse("DEPTH_LIMIT", 20),
            metrics_window: env_parse("METRICS_WINDOW", 100),
            metrics_levels: env_parse("METRICS_LEVELS", 5),
            callback_interval_ms: env_parse("CALLBACK_INTERVAL_MS", 1000),
            rest_min_interval_ms: env_parse("REST_MIN_INTERVAL_MS", 250),
            backoff: BackoffConfig {
                base_delay_ms: env_parse("RECONNECT_BASE_DELAY_MS", 1000),
                max_delay_ms: env_parse("RECONNECT_MAX_DELAY_MS", 60_000),
                jitter: env_parse("RECONNECT_JITTER", 0.2),
                max_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", 10),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants; called at collector construction
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(MarketDataError::Config("no symbols configured".into()));
        }
        if self.depth_limit == 0 {
            return Err(MarketDataError::Config("depth_limit must be > 0".into()));
        }
        if self.metrics_window == 0 {
            return Err(MarketDataError::Config("metrics_window must be > 0".into()));
        }
        if self.metrics_levels == 0 || self.metrics_levels > self.depth_limit {
            return Err(MarketDataError::Config(format!(
                "metrics_levels must be in [1, {}], got {}",
                self.depth_limit, self.metrics_levels
            )));
        }
        if self.callback_interval_ms == 0 {
            return Err(MarketDataError::Config(
                "callback_interval_ms must be > 0".into(),
            ));
        }
        if self.rest_min_interval_ms == 0 {
            return Err(MarketDataError::Config(
                "rest_min_interval_ms must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return Err(MarketDataError::Config(format!(
                "backoff jitter must be in [0, 1), got {}",
                self.backoff.jitter
            )));
        }
        if self.backoff.base_delay_ms == 0 || self.backoff.max_delay_ms < self.backoff.base_delay_ms
        {
            return Err(MarketDataError::Config(
                "backoff delays must satisfy 0 < base <= max".into(),
            ));
        }
        Ok(())
    }

    pub fn callback_interval(&self) -> Duration {
        Duration::from_millis(self.callback_interval_ms)
    }

    pub fn rest_min_interval(&self) -> Duration {
        Duration::from_millis(self.rest_min_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            depth_limit: 20,
            metrics_window: 100,
            metrics_levels: 5,
            callback_interval_ms: 1000,
            rest_min_interval_ms: 250,
            backoff: BackoffConfig {
                base_delay_ms: 1000,
                max_delay_ms: 60_000,
                jitter: 0.2,
                max_attempts: 10,
            },
        }
    }
}
