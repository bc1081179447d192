//! Publisher module for topic-based distribution
//!
//! The data node hands every publication to a [`Bus`]. [`IpcPublisher`]
//! forwards envelopes over a Unix socket; [`LogBus`] only traces them.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::book::LevelTwoView;
use crate::decimal::now_millis;
use crate::error::{MarketDataError, Result};
use crate::model::{BookSnapshot, Candle, Quote, RawBook, Ticker, TopLevel, Trade};

/// Data carried by one publication
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    /// Frame parts exactly as received from the queue
    Raw(Vec<Bytes>),
    Book(BookSnapshot),
    RawBook(RawBook),
    TopLevel(TopLevel),
    Quote(Quote),
    Trades(Vec<Trade>),
    Candle(Candle),
    Ticker(Ticker),
    AggregatedBook(LevelTwoView),
}

/// Wire envelope around a payload
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub topic: &'a str,
    /// Name of the publishing node
    pub origin: &'a str,
    pub data: &'a Payload,
    /// Publication time, milliseconds since the Unix epoch
    pub ts: u64,
}

/// External publish interface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `payload` on `topic`. Failures are logged and reported as `false`.
    async fn publish(&self, topic: &str, payload: Payload) -> bool;
}

/// Encode an envelope as MessagePack with a 4-byte big-endian length prefix.
pub fn encode_envelope(envelope: &Envelope<'_>) -> Result<Vec<u8>> {
    let data = rmp_serde::to_vec_named(envelope)?;
    let len = u32::try_from(data.len())
        .map_err(|_| MarketDataError::Serialization(format!("envelope too large: {} bytes", data.len())))?
        .to_be_bytes();

    let mut message = Vec::with_capacity(4 + data.len());
    message.extend_from_slice(&len);
    message.extend_from_slice(&data);
    Ok(message)
}

/// Publisher for sending envelopes via Unix socket
pub struct IpcPublisher {
    socket_path: String,
    origin: String,
    stream: Mutex<Option<UnixStream>>,
}

impl IpcPublisher {
    /// Create a new publisher
    pub async fn new(socket_path: &str, origin: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            origin: origin.to_string(),
            stream: Mutex::new(None),
        };

        // Try initial connection (the consumer may not be up yet)
        let mut guard = publisher.stream.lock().await;
        match publisher.connect().await {
            Ok(stream) => *guard = Some(stream),
            Err(e) => warn!(error = %e, "Initial IPC connection failed, will retry on publish"),
        }
        drop(guard);

        publisher
    }

    /// Connect to the Unix socket
    async fn connect(&self) -> Result<UnixStream> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(MarketDataError::Ipc(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            MarketDataError::Ipc(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(stream)
    }
}

#[async_trait]
impl Bus for IpcPublisher {
    async fn publish(&self, topic: &str, payload: Payload) -> bool {
        let envelope = Envelope {
            topic,
            origin: &self.origin,
            data: &payload,
            ts: now_millis(),
        };
        let message = match encode_envelope(&envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to encode envelope");
                return false;
            }
        };

        let mut guard = self.stream.lock().await;

        // Reconnect lazily
        if guard.is_none() {
            match self.connect().await {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    debug!(error = %e, "Failed to reconnect to IPC socket");
                    return false;
                }
            }
        }

        let Some(stream) = guard.as_mut() else {
            return false;
        };
        match stream.write_all(&message).await {
            Ok(()) => {
                debug!(topic = %topic, bytes = message.len(), "Published envelope");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to write to IPC socket");
                *guard = None; // Mark as disconnected
                false
            }
        }
    }
}

/// Bus that only traces publications, used when no IPC socket is configured
#[derive(Debug, Default)]
pub struct LogBus;

#[async_trait]
impl Bus for LogBus {
    async fn publish(&self, topic: &str, payload: Payload) -> bool {
        debug!(topic = %topic, payload = ?payload, "Publication");
        true
    }
}
