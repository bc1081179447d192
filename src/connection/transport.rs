//! WebSocket transport
//!
//! Handles connection, sending and message reception for one endpoint.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{MarketDataError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound event delivered by a transport, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Ping,
    Pong,
    Closed(Option<String>),
}

/// Byte transport underneath a connection supervisor
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, url: &str) -> Result<()>;

    async fn send(&mut self, payload: &str) -> Result<()>;

    /// Send a transport-level ping frame.
    async fn ping(&mut self) -> Result<()>;

    /// Wait for the next inbound event. Must be cancel safe.
    async fn recv(&mut self) -> Result<Inbound>;

    async fn close(&mut self);
}

/// tokio-tungstenite backed transport
#[derive(Default)]
pub struct WsTransport {
    stream: Option<WsStream>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self { stream: None }
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self, url: &str) -> Result<()> {
        info!(url = %url, "Connecting to WebSocket");

        let (ws_stream, response) = connect_async(url).await.map_err(|e| {
            MarketDataError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);

        Ok(())
    }

    async fn send(&mut self, payload: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(MarketDataError::NotConnected)?;
        stream
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))
    }

    async fn ping(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(MarketDataError::NotConnected)?;
        stream
            .send(Message::Ping(vec![]))
            .await
            .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Inbound> {
        let stream = self.stream.as_mut().ok_or(MarketDataError::NotConnected)?;

        loop {
            return match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    debug!(len = text.len(), "Received text message");
                    Ok(Inbound::Text(text))
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data).to_string();
                    Ok(Inbound::Text(text))
                }
                // tungstenite queues the pong and flushes it with the next read or write.
                Some(Ok(Message::Ping(_))) => {
                    debug!("Received ping");
                    Ok(Inbound::Ping)
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("Received pong");
                    Ok(Inbound::Pong)
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "Received close frame");
                    self.stream = None;
                    Ok(Inbound::Closed(frame.map(|f| f.reason.to_string())))
                }
                // Raw frames are never surfaced while reading.
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket error");
                    self.stream = None;
                    Err(MarketDataError::WebSocketMessage(e.to_string()))
                }
                None => {
                    warn!("WebSocket stream ended");
                    self.stream = None;
                    Ok(Inbound::Closed(Some("stream ended".to_string())))
                }
            };
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ping_is_answered_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Ping(b"hi".to_vec())).await.unwrap();

            let mut received = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                let done = matches!(message, Message::Text(_));
                received.push(message);
                if done {
                    break;
                }
            }
            received
        });

        let mut transport = WsTransport::new();
        transport.connect(&format!("ws://{}", addr)).await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), Inbound::Ping);
        transport.send("after").await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(
            received,
            vec![
                Message::Pong(b"hi".to_vec()),
                Message::Text("after".to_string()),
            ]
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let mut transport = WsTransport::new();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send("x").await,
            Err(MarketDataError::NotConnected)
        ));
    }
}
