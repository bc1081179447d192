//! Configuration module for the market data hub
//!
//! Sources are layered: built-in defaults, then an optional file (path from
//! `MARKET_DATA_CONFIG`, default `market-data.toml`), then `MARKET_DATA_*`
//! environment variables. `.env` is loaded into the environment first.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::adapter::bitfinex::Credentials;
use crate::adapter::Exchange;
use crate::connection::ConnectionSettings;
use crate::error::{MarketDataError, Result};
use crate::queue::DropPolicy;

const CONFIG_PATH_VAR: &str = "MARKET_DATA_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "market-data.toml";
const ENV_PREFIX: &str = "MARKET_DATA";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name used as the last topic segment and as envelope origin
    pub node_name: String,

    /// Exchanges to connect to (binance, bitfinex, coinbase, gemini)
    pub exchanges: Vec<String>,

    /// Instruments to subscribe to, e.g. ["BTCUSD", "ETHUSD"]
    pub pairs: Vec<String>,

    /// IPC socket path for publishing; publications are only logged when unset
    pub ipc_socket_path: Option<String>,

    /// Listen address of the health and metrics server
    pub health_addr: String,

    pub connection_timeout_secs: u64,
    pub pong_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub reconnect_interval_secs: u64,

    /// Frame queue capacity and what happens when it is full
    pub queue_capacity: usize,
    pub backpressure: DropPolicy,

    /// Data node receive timeout in milliseconds
    pub recv_timeout_ms: u64,

    /// Maintain composite books and publish their level-2 view
    pub aggregate_books: bool,

    /// Websocket endpoint overrides keyed by exchange name
    pub endpoints: HashMap<String, String>,

    /// Bitfinex credentials; both or neither
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "market-data".to_string(),
            exchanges: vec!["gemini".to_string(), "bitfinex".to_string()],
            pairs: vec!["BTCUSD".to_string()],
            ipc_socket_path: None,
            health_addr: "0.0.0.0:9090".to_string(),
            connection_timeout_secs: 10,
            pong_timeout_secs: 30,
            ping_interval_secs: 120,
            reconnect_interval_secs: 10,
            queue_capacity: 10_000,
            backpressure: DropPolicy::DropOldest,
            recv_timeout_ms: 100,
            aggregate_books: true,
            endpoints: HashMap::new(),
            api_key: None,
            api_secret: None,
        }
    }
}

impl Config {
    /// Load configuration from `.env`, the config file and the environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load configuration with `path` as the (optional) file layer
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("exchanges")
                    .with_list_parse_key("pairs"),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        config.pairs = config.pairs.iter().map(|p| p.trim().to_uppercase()).collect();
        Ok(config)
    }

    /// Reject configurations that cannot work. These errors are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(MarketDataError::Config("node_name must not be empty".to_string()));
        }
        if self.pairs.is_empty() || self.pairs.iter().any(|p| p.is_empty()) {
            return Err(MarketDataError::Config("pairs must list at least one instrument".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(MarketDataError::Config("queue_capacity must be positive".to_string()));
        }
        if self.recv_timeout_ms == 0 {
            return Err(MarketDataError::Config("recv_timeout_ms must be positive".to_string()));
        }
        for (name, secs) in [
            ("connection_timeout_secs", self.connection_timeout_secs),
            ("pong_timeout_secs", self.pong_timeout_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("reconnect_interval_secs", self.reconnect_interval_secs),
        ] {
            if secs == 0 {
                return Err(MarketDataError::Config(format!("{} must be positive", name)));
            }
        }

        let exchanges = self.exchanges()?;
        if exchanges.is_empty() {
            return Err(MarketDataError::Config("exchanges must not be empty".to_string()));
        }

        for (name, url) in &self.endpoints {
            name.parse::<Exchange>()?;
            reqwest::Url::parse(url).map_err(|e| {
                MarketDataError::Config(format!("invalid endpoint for {}: {} ({})", name, url, e))
            })?;
        }

        self.health_addr.parse::<SocketAddr>().map_err(|e| {
            MarketDataError::Config(format!("invalid health_addr {}: {}", self.health_addr, e))
        })?;

        match (&self.api_key, &self.api_secret) {
            (Some(_), None) => Err(MarketDataError::Config("api_key set without api_secret".to_string())),
            (None, Some(_)) => Err(MarketDataError::Config("api_secret set without api_key".to_string())),
            _ => Ok(()),
        }
    }

    /// Configured exchanges in order, without duplicates
    pub fn exchanges(&self) -> Result<Vec<Exchange>> {
        let mut exchanges = Vec::with_capacity(self.exchanges.len());
        for name in &self.exchanges {
            let exchange: Exchange = name.parse()?;
            if !exchanges.contains(&exchange) {
                exchanges.push(exchange);
            }
        }
        Ok(exchanges)
    }

    /// Websocket endpoint for `exchange`, honouring overrides
    pub fn endpoint(&self, exchange: Exchange) -> String {
        self.endpoints
            .iter()
            .find(|(name, _)| name.parse::<Exchange>().ok() == Some(exchange))
            .map(|(_, url)| url.clone())
            .unwrap_or_else(|| exchange.default_endpoint().to_string())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(api_key), Some(api_secret)) => Some(Credentials {
                api_key: api_key.clone(),
                api_secret: api_secret.clone(),
            }),
            _ => None,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
        }
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}
