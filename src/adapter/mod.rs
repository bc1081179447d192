//! Exchange protocol adapters
//!
//! Each exchange variant decodes its own wire format and translates it into
//! the canonical [`MarketEvent`]s. The variant is chosen once from
//! configuration; the connection supervisor drives it through
//! [`ExchangeAdapter::process`] for every inbound text message.

pub mod binance;
pub mod bitfinex;
pub mod coinbase;
pub mod gemini;

pub use binance::BinanceAdapter;
pub use bitfinex::{BitfinexAdapter, Credentials};
pub use coinbase::CoinbaseAdapter;
pub use gemini::GeminiAdapter;

use std::fmt;
use std::str::FromStr;

use tracing::{error, trace, warn};

use crate::error::{MarketDataError, Result};
use crate::model::MarketEvent;

/// Supported venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Binance,
    Bitfinex,
    Coinbase,
    Gemini,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bitfinex => "bitfinex",
            Exchange::Coinbase => "coinbase",
            Exchange::Gemini => "gemini",
        }
    }

    /// Public websocket endpoint used when configuration does not override it
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Exchange::Binance => binance::BINANCE_WS_URL,
            Exchange::Bitfinex => bitfinex::BITFINEX_WS_URL,
            Exchange::Coinbase => coinbase::COINBASE_WS_URL,
            Exchange::Gemini => gemini::GEMINI_WS_URL,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bitfinex" => Ok(Exchange::Bitfinex),
            "coinbase" | "gdax" => Ok(Exchange::Coinbase),
            "gemini" => Ok(Exchange::Gemini),
            other => Err(MarketDataError::Config(format!("unknown exchange `{}`", other))),
        }
    }
}

/// Classification of a decoded wire message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Heartbeat,
    Snapshot,
    Delta,
    Trade,
    Ticker,
    Candle,
    Error,
    ControlAck,
}

/// Connection-level reaction requested by an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Tear the connection down and reconnect.
    Reconnect(String),
    /// Venue asked clients to pause activity.
    Pause,
    /// Venue finished its maintenance; resubscribe.
    Resume,
    /// Application-level pong received.
    Pong,
}

/// How a connection proves liveness to the venue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keepalive {
    /// No pings; only the idle timer applies.
    None,
    /// WebSocket ping frames answered with pong frames.
    WsPing,
    /// Application ping message answered by an adapter-classified pong.
    Command(String),
}

/// Result of the sequence check performed before classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    InOrder,
    /// Already covered by the current book state; drop silently.
    Stale,
}

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled(EventKind),
    Stale,
    Discarded,
    Desync,
}

/// Canonical events and connection actions produced from one message
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub events: Vec<MarketEvent>,
    pub actions: Vec<Action>,
    pub outcome: Outcome,
}

impl Translation {
    pub fn handled(kind: EventKind) -> Self {
        Self {
            events: Vec::new(),
            actions: Vec::new(),
            outcome: Outcome::Handled(kind),
        }
    }

    pub fn with_events(kind: EventKind, events: Vec<MarketEvent>) -> Self {
        Self {
            events,
            actions: Vec::new(),
            outcome: Outcome::Handled(kind),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    fn outcome(outcome: Outcome) -> Self {
        Self {
            events: Vec::new(),
            actions: Vec::new(),
            outcome,
        }
    }
}

/// REST snapshot an adapter needs after (re)connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub instrument: String,
    pub url: String,
}

/// Capability set of one exchange variant
pub trait ExchangeAdapter: Send + 'static {
    /// Decoded, exchange-specific message
    type Event: Send;

    fn exchange(&self) -> Exchange;

    fn endpoint(&self) -> String;

    /// Commands sent on the first successful connection.
    fn subscriptions(&self) -> Vec<String>;

    fn keepalive(&self) -> Keepalive {
        Keepalive::WsPing
    }

    fn decode(&mut self, raw: &str) -> Result<Self::Event>;

    /// Validate sequence numbers; an error is a desync and forces a reconnect.
    fn check_sequence(&mut self, _event: &Self::Event) -> Result<Sequencing> {
        Ok(Sequencing::InOrder)
    }

    fn classify(&self, event: &Self::Event) -> EventKind;

    fn translate(
        &mut self,
        event: Self::Event,
        kind: EventKind,
        received_at: u64,
    ) -> Result<Translation>;

    /// Forget per-connection state (sequence counters, channel ids).
    fn reset(&mut self) {}

    fn snapshot_requests(&self) -> Vec<SnapshotRequest> {
        Vec::new()
    }

    fn load_rest_snapshot(
        &mut self,
        _request: &SnapshotRequest,
        _body: &str,
        _received_at: u64,
    ) -> Result<Vec<MarketEvent>> {
        Ok(Vec::new())
    }

    /// Rebuild a recorded command before it is replayed after a reconnect.
    fn replay_command(&self, command: &str) -> String {
        command.to_string()
    }

    /// Commands to send when the venue signals that activity may resume.
    fn resume_commands(&self, history: &[String]) -> Vec<String> {
        history.iter().map(|c| self.replay_command(c)).collect()
    }

    /// Run one raw message through decode, sequence check, classify and translate.
    fn process(&mut self, raw: &str, received_at: u64) -> Translation {
        let origin = self.exchange();

        let event = match self.decode(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(origin = %origin, error = %e, raw = %raw, "Discarding undecodable message");
                return Translation::outcome(Outcome::Discarded);
            }
        };

        match self.check_sequence(&event) {
            Ok(Sequencing::InOrder) => {}
            Ok(Sequencing::Stale) => {
                trace!(origin = %origin, "Dropping stale message");
                return Translation::outcome(Outcome::Stale);
            }
            Err(e) => {
                error!(origin = %origin, error = %e, "Protocol desync, reconnect required");
                return Translation::outcome(Outcome::Desync)
                    .with_action(Action::Reconnect(e.to_string()));
            }
        }

        let kind = self.classify(&event);
        if kind == EventKind::Heartbeat {
            trace!(origin = %origin, "Heartbeat");
            return Translation::handled(kind);
        }

        match self.translate(event, kind, received_at) {
            Ok(translation) => translation,
            Err(e) => {
                warn!(origin = %origin, error = %e, kind = ?kind, "Discarding untranslatable message");
                Translation::outcome(Outcome::Discarded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_parsing() {
        assert_eq!("Gemini".parse::<Exchange>().unwrap(), Exchange::Gemini);
        assert_eq!("gdax".parse::<Exchange>().unwrap(), Exchange::Coinbase);
        assert!(matches!(
            "kraken".parse::<Exchange>(),
            Err(MarketDataError::Config(_))
        ));
    }

    #[test]
    fn test_exchange_display() {
        assert_eq!(Exchange::Bitfinex.to_string(), "bitfinex");
        assert!(Exchange::Binance.default_endpoint().starts_with("wss://"));
    }
}
