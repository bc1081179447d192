//! Error types for the market data hub

use thiserror::Error;

/// Market data errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Sequence number mismatch: expected {expected}, got {got}")]
    Desync { expected: u64, got: u64 },

    #[error("No data received within {0} seconds")]
    ConnectionTimeout(u64),

    #[error("No pong received within {0} seconds")]
    PongTimeout(u64),

    #[error("Connection not established")]
    NotConnected,

    #[error("REST API error: {0}")]
    RestApi(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Malformed frame: expected 3 parts, got {parts}")]
    MalformedFrame { parts: usize },

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl MarketDataError {
    /// Shorthand for a decode error on a missing or mistyped key.
    pub fn missing(key: &str) -> Self {
        MarketDataError::Decode(format!("missing or invalid key `{}`", key))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketDataError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        MarketDataError::RestApi(err.to_string())
    }
}

impl From<std::io::Error> for MarketDataError {
    fn from(err: std::io::Error) -> Self {
        MarketDataError::Ipc(err.to_string())
    }
}

impl From<config::ConfigError> for MarketDataError {
    fn from(err: config::ConfigError) -> Self {
        MarketDataError::Config(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for MarketDataError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        MarketDataError::Serialization(err.to_string())
    }
}

impl From<prometheus::Error> for MarketDataError {
    fn from(err: prometheus::Error) -> Self {
        MarketDataError::Metrics(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
