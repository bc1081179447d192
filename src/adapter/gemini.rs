//! Gemini v1 market data adapter
//!
//! One connection per pair. Every message carries a `socket_sequence` that
//! must increase by exactly one; the first update after connecting holds the
//! full book as `change` events with reason `initial`.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{EventKind, Exchange, ExchangeAdapter, Keepalive, Sequencing, Translation};
use crate::decimal::deserialize_decimal;
use crate::error::{MarketDataError, Result};
use crate::model::{canonical_instrument, BookEntry, BookSnapshot, MarketEvent, Quote, Side, Trade};

pub const GEMINI_WS_URL: &str = "wss://api.gemini.com/v1/marketdata/";

/// One entry of the `events` array of an update
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeminiEvent {
    Change {
        #[serde(deserialize_with = "deserialize_decimal")]
        price: Decimal,
        #[serde(deserialize_with = "deserialize_decimal")]
        remaining: Decimal,
        side: String,
        reason: String,
    },
    Trade {
        tid: u64,
        #[serde(deserialize_with = "deserialize_decimal")]
        price: Decimal,
        #[serde(deserialize_with = "deserialize_decimal")]
        amount: Decimal,
        #[serde(rename = "makerSide")]
        maker_side: String,
    },
    /// Auction open, indicative and result events carry no book or trade data.
    #[serde(other)]
    Skipped,
}

#[derive(Debug, Clone)]
pub struct GeminiUpdate {
    pub socket_sequence: u64,
    pub timestamp_ms: Option<u64>,
    pub events: Vec<GeminiEvent>,
}

/// Update as received; events are parsed one by one so a bad entry cannot
/// hide the sequence number.
#[derive(Debug, Deserialize)]
struct RawUpdate {
    socket_sequence: u64,
    #[serde(rename = "timestampms")]
    timestamp_ms: Option<u64>,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    Heartbeat { socket_sequence: u64 },
    Update(RawUpdate),
}

/// Decoded Gemini message
#[derive(Debug, Clone)]
pub enum GeminiMessage {
    Heartbeat { socket_sequence: u64 },
    Update(GeminiUpdate),
    Error { reason: String, message: String },
}

impl GeminiMessage {
    fn socket_sequence(&self) -> Option<u64> {
        match self {
            GeminiMessage::Heartbeat { socket_sequence } => Some(*socket_sequence),
            GeminiMessage::Update(update) => Some(update.socket_sequence),
            GeminiMessage::Error { .. } => None,
        }
    }
}

pub struct GeminiAdapter {
    pair: String,
    instrument: String,
    base_url: String,
    last_sequence: Option<u64>,
}

impl GeminiAdapter {
    pub fn new(pair: &str) -> Self {
        Self {
            pair: pair.to_lowercase(),
            instrument: canonical_instrument(pair),
            base_url: GEMINI_WS_URL.to_string(),
            last_sequence: None,
        }
    }

    /// Override the base URL; the pair is appended to it.
    pub fn with_endpoint(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    fn parse_update(&self, raw: RawUpdate) -> GeminiUpdate {
        let socket_sequence = raw.socket_sequence;
        let events = raw
            .events
            .into_iter()
            .filter_map(|event| match serde_json::from_value::<GeminiEvent>(event) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(pair = %self.pair, socket_sequence, error = %e, "Skipping malformed event");
                    None
                }
            })
            .collect();

        GeminiUpdate {
            socket_sequence,
            timestamp_ms: raw.timestamp_ms,
            events,
        }
    }

    fn translate_update(&self, update: GeminiUpdate, received_at: u64) -> Vec<MarketEvent> {
        let ts = update.timestamp_ms.unwrap_or(received_at);
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        let mut quotes = Vec::new();
        let mut trades = Vec::new();

        for event in update.events {
            match event {
                GeminiEvent::Change {
                    price,
                    remaining,
                    side,
                    reason,
                } => {
                    let side = match Side::parse(&side) {
                        Ok(side) => side,
                        Err(e) => {
                            debug!(error = %e, "Skipping change with unknown side");
                            continue;
                        }
                    };
                    if reason == "initial" {
                        let entry = BookEntry::new(price, remaining, ts);
                        match side {
                            Side::Bid => bids.push(entry),
                            Side::Ask => asks.push(entry),
                        }
                    } else {
                        quotes.push(
                            Quote::new(&self.instrument, price, remaining, side, ts)
                                .with_origin(Exchange::Gemini.as_str())
                                .with_sequence(update.socket_sequence),
                        );
                    }
                }
                GeminiEvent::Trade {
                    tid,
                    price,
                    amount,
                    maker_side,
                } => match Side::parse(&maker_side) {
                    Ok(maker) => trades.push(Trade {
                        instrument: self.instrument.clone(),
                        price,
                        size: amount,
                        side: maker.opposite(),
                        trade_id: Some(tid.to_string()),
                        sequence: Some(update.socket_sequence),
                        timestamp: ts,
                    }),
                    // Auction fills report `makerSide: auction`.
                    Err(_) => debug!(tid, maker_side = %maker_side, "Skipping auction trade"),
                },
                GeminiEvent::Skipped => {}
            }
        }

        let mut events = Vec::new();
        if !bids.is_empty() || !asks.is_empty() {
            events.push(MarketEvent::Book(
                BookSnapshot::new(&self.instrument, bids, asks, ts)
                    .with_origin(Exchange::Gemini.as_str()),
            ));
        }
        if !quotes.is_empty() {
            events.push(MarketEvent::Quotes(quotes));
        }
        if !trades.is_empty() {
            events.push(MarketEvent::Trades(trades));
        }
        events
    }
}

impl ExchangeAdapter for GeminiAdapter {
    type Event = GeminiMessage;

    fn exchange(&self) -> Exchange {
        Exchange::Gemini
    }

    fn endpoint(&self) -> String {
        format!("{}{}?heartbeat=true", self.base_url, self.pair)
    }

    /// The pair is selected by the URL, so nothing is sent.
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive::None
    }

    fn decode(&mut self, raw: &str) -> Result<GeminiMessage> {
        let value: Value = serde_json::from_str(raw)?;

        if value.get("result").and_then(Value::as_str) == Some("error") {
            let field = |key: &str| {
                value
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            return Ok(GeminiMessage::Error {
                reason: field("reason"),
                message: field("message"),
            });
        }

        match serde_json::from_value::<Envelope>(value)? {
            Envelope::Heartbeat { socket_sequence } => {
                Ok(GeminiMessage::Heartbeat { socket_sequence })
            }
            Envelope::Update(raw) => Ok(GeminiMessage::Update(self.parse_update(raw))),
        }
    }

    fn check_sequence(&mut self, event: &GeminiMessage) -> Result<Sequencing> {
        let Some(sequence) = event.socket_sequence() else {
            return Ok(Sequencing::InOrder);
        };
        if let Some(last) = self.last_sequence {
            if sequence != last + 1 {
                return Err(MarketDataError::Desync {
                    expected: last + 1,
                    got: sequence,
                });
            }
        }
        self.last_sequence = Some(sequence);
        Ok(Sequencing::InOrder)
    }

    fn classify(&self, event: &GeminiMessage) -> EventKind {
        match event {
            GeminiMessage::Heartbeat { .. } => EventKind::Heartbeat,
            GeminiMessage::Error { .. } => EventKind::Error,
            GeminiMessage::Update(update) => {
                let mut kind = EventKind::Trade;
                for event in &update.events {
                    if let GeminiEvent::Change { reason, .. } = event {
                        if reason == "initial" {
                            return EventKind::Snapshot;
                        }
                        kind = EventKind::Delta;
                    }
                }
                kind
            }
        }
    }

    fn translate(
        &mut self,
        event: GeminiMessage,
        kind: EventKind,
        received_at: u64,
    ) -> Result<Translation> {
        match event {
            GeminiMessage::Update(update) => Ok(Translation::with_events(
                kind,
                self.translate_update(update, received_at),
            )),
            GeminiMessage::Error { reason, message } => {
                error!(pair = %self.pair, reason = %reason, message = %message, "Gemini reported an error");
                Ok(Translation::handled(kind))
            }
            GeminiMessage::Heartbeat { .. } => Ok(Translation::handled(kind)),
        }
    }

    fn reset(&mut self) {
        self.last_sequence = None;
    }
}
