//! Binance combined-stream adapter
//!
//! Handles deserialization of depth updates, trades, klines and tickers, and
//! keeps the diff-depth stream aligned with the REST depth snapshot.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{EventKind, Exchange, ExchangeAdapter, Sequencing, SnapshotRequest, Translation};
use crate::decimal::{decimal_from_value, deserialize_decimal};
use crate::error::{MarketDataError, Result};
use crate::model::{
    canonical_instrument, BookEntry, BookSnapshot, Candle, MarketEvent, Quote, Side, Ticker,
    TopLevel, Trade,
};

pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/stream";
const BINANCE_REST_URL: &str = "https://api.binance.com/api/v3";
const SNAPSHOT_DEPTH: usize = 1000;

/// Binance depth update message
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    #[serde(rename = "b", default, deserialize_with = "deserialize_depth_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(rename = "a", default, deserialize_with = "deserialize_depth_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Binance trade message
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "t")]
    pub trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,

    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: u64,

    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Kline payload nested under `k`
#[derive(Debug, Clone, Deserialize)]
pub struct Kline {
    /// Open time
    #[serde(rename = "t")]
    pub start_time: u64,

    #[serde(rename = "i")]
    pub interval: String,

    #[serde(rename = "o", deserialize_with = "deserialize_decimal")]
    pub open: Decimal,

    #[serde(rename = "h", deserialize_with = "deserialize_decimal")]
    pub high: Decimal,

    #[serde(rename = "l", deserialize_with = "deserialize_decimal")]
    pub low: Decimal,

    #[serde(rename = "c", deserialize_with = "deserialize_decimal")]
    pub close: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "k")]
    pub kline: Kline,
}

/// 24 hour rolling ticker
#[derive(Debug, Clone, Deserialize)]
pub struct TickerEvent {
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "b", deserialize_with = "deserialize_decimal")]
    pub best_bid: Decimal,

    #[serde(rename = "B", deserialize_with = "deserialize_decimal")]
    pub best_bid_qty: Decimal,

    #[serde(rename = "a", deserialize_with = "deserialize_decimal")]
    pub best_ask: Decimal,

    #[serde(rename = "A", deserialize_with = "deserialize_decimal")]
    pub best_ask_qty: Decimal,

    #[serde(rename = "c", deserialize_with = "deserialize_decimal")]
    pub last: Decimal,

    #[serde(rename = "h", deserialize_with = "deserialize_decimal")]
    pub high: Decimal,

    #[serde(rename = "l", deserialize_with = "deserialize_decimal")]
    pub low: Decimal,

    #[serde(rename = "v", deserialize_with = "deserialize_decimal")]
    pub volume: Decimal,
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
struct StreamMessage {
    data: Value,
}

/// Decoded Binance message
#[derive(Debug, Clone)]
pub enum BinanceMessage {
    Depth(DepthUpdate),
    Trade(TradeEvent),
    Kline(KlineEvent),
    Ticker(TickerEvent),
    /// Response to a SUBSCRIBE request
    Ack { id: u64 },
    Error(String),
}

/// Diff-depth alignment state for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DepthSync {
    /// Last update id applied, either from the snapshot or the stream
    last_update_id: u64,
    /// Whether the first event bridging the snapshot has been seen
    bridged: bool,
}

pub struct BinanceAdapter {
    symbols: Vec<String>,
    endpoint: String,
    rest_endpoint: String,
    depth: HashMap<String, DepthSync>,
}

impl BinanceAdapter {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            symbols: symbols.iter().map(|s| canonical_instrument(s)).collect(),
            endpoint: BINANCE_WS_URL.to_string(),
            rest_endpoint: BINANCE_REST_URL.to_string(),
            depth: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn with_rest_endpoint(mut self, endpoint: &str) -> Self {
        self.rest_endpoint = endpoint.to_string();
        self
    }

    fn streams(&self) -> Vec<String> {
        self.symbols
            .iter()
            .flat_map(|s| {
                let s_lower = s.to_lowercase();
                vec![
                    format!("{}@depth@100ms", s_lower),
                    format!("{}@trade", s_lower),
                    format!("{}@kline_1m", s_lower),
                    format!("{}@ticker", s_lower),
                ]
            })
            .collect()
    }

    fn parse_event(data: Value) -> Result<BinanceMessage> {
        let event_type = data
            .get("e")
            .and_then(Value::as_str)
            .ok_or_else(|| MarketDataError::missing("e"))?
            .to_string();

        match event_type.as_str() {
            "depthUpdate" => Ok(BinanceMessage::Depth(serde_json::from_value(data)?)),
            "trade" => Ok(BinanceMessage::Trade(serde_json::from_value(data)?)),
            "kline" => Ok(BinanceMessage::Kline(serde_json::from_value(data)?)),
            "24hrTicker" => Ok(BinanceMessage::Ticker(serde_json::from_value(data)?)),
            other => Err(MarketDataError::Decode(format!("unhandled event type `{}`", other))),
        }
    }

    fn translate_depth(&self, update: DepthUpdate) -> MarketEvent {
        let instrument = canonical_instrument(&update.symbol);
        let quote = |side: Side, level: &PriceLevel| {
            Quote::new(&instrument, level.price, level.quantity, side, update.event_time)
                .with_origin(Exchange::Binance.as_str())
                .with_sequence(update.final_update_id)
        };
        let quotes = update
            .bids
            .iter()
            .map(|l| quote(Side::Bid, l))
            .chain(update.asks.iter().map(|l| quote(Side::Ask, l)))
            .collect();
        MarketEvent::Quotes(quotes)
    }
}

impl ExchangeAdapter for BinanceAdapter {
    type Event = BinanceMessage;

    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn subscriptions(&self) -> Vec<String> {
        let request = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": self.streams(),
            "id": 1,
        });
        vec![request.to_string()]
    }

    fn decode(&mut self, raw: &str) -> Result<BinanceMessage> {
        let value: Value = serde_json::from_str(raw)?;

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if let Some(err) = value.get("error") {
                return Ok(BinanceMessage::Error(err.to_string()));
            }
            return Ok(BinanceMessage::Ack { id });
        }

        // Combined streams wrap the payload; raw streams do not.
        let data = match serde_json::from_value::<StreamMessage>(value.clone()) {
            Ok(stream_msg) => stream_msg.data,
            Err(_) => value,
        };
        Self::parse_event(data)
    }

    fn check_sequence(&mut self, event: &BinanceMessage) -> Result<Sequencing> {
        let BinanceMessage::Depth(update) = event else {
            return Ok(Sequencing::InOrder);
        };
        let symbol = canonical_instrument(&update.symbol);
        let Some(sync) = self.depth.get_mut(&symbol) else {
            debug!(symbol = %symbol, "Ignoring depth update before snapshot");
            return Ok(Sequencing::Stale);
        };

        if update.final_update_id <= sync.last_update_id {
            return Ok(Sequencing::Stale);
        }

        let expected = sync.last_update_id + 1;
        let in_order = if sync.bridged {
            update.first_update_id == expected
        } else {
            update.first_update_id <= expected
        };
        if !in_order {
            return Err(MarketDataError::Desync {
                expected,
                got: update.first_update_id,
            });
        }

        sync.last_update_id = update.final_update_id;
        sync.bridged = true;
        Ok(Sequencing::InOrder)
    }

    fn classify(&self, event: &BinanceMessage) -> EventKind {
        match event {
            BinanceMessage::Depth(_) => EventKind::Delta,
            BinanceMessage::Trade(_) => EventKind::Trade,
            BinanceMessage::Kline(_) => EventKind::Candle,
            BinanceMessage::Ticker(_) => EventKind::Ticker,
            BinanceMessage::Ack { .. } => EventKind::ControlAck,
            BinanceMessage::Error(_) => EventKind::Error,
        }
    }

    fn translate(
        &mut self,
        event: BinanceMessage,
        kind: EventKind,
        _received_at: u64,
    ) -> Result<Translation> {
        let events = match event {
            BinanceMessage::Depth(update) => vec![self.translate_depth(update)],
            BinanceMessage::Trade(trade) => {
                // Buyer as maker means the aggressor sold.
                let side = if trade.is_buyer_maker { Side::Ask } else { Side::Bid };
                vec![MarketEvent::Trades(vec![Trade {
                    instrument: canonical_instrument(&trade.symbol),
                    price: trade.price,
                    size: trade.quantity,
                    side,
                    trade_id: Some(trade.trade_id.to_string()),
                    sequence: None,
                    timestamp: trade.trade_time,
                }])]
            }
            BinanceMessage::Kline(event) => vec![MarketEvent::Candle(Candle {
                instrument: canonical_instrument(&event.symbol),
                interval: Some(event.kline.interval),
                open: event.kline.open,
                high: event.kline.high,
                low: event.kline.low,
                close: event.kline.close,
                timestamp: event.kline.start_time,
            })],
            BinanceMessage::Ticker(t) => {
                let instrument = canonical_instrument(&t.symbol);
                vec![
                    MarketEvent::Ticker(Ticker {
                        instrument: instrument.clone(),
                        bid: Some(t.best_bid),
                        ask: Some(t.best_ask),
                        last: Some(t.last),
                        high: Some(t.high),
                        low: Some(t.low),
                        volume: Some(t.volume),
                        timestamp: t.event_time,
                    }),
                    MarketEvent::TopLevel(TopLevel {
                        instrument,
                        bid: BookEntry::new(t.best_bid, t.best_bid_qty, t.event_time),
                        ask: BookEntry::new(t.best_ask, t.best_ask_qty, t.event_time),
                        timestamp: t.event_time,
                    }),
                ]
            }
            BinanceMessage::Ack { id } => {
                info!(request_id = id, "Binance subscription confirmed");
                Vec::new()
            }
            BinanceMessage::Error(msg) => {
                error!(error = %msg, "Binance rejected a request");
                Vec::new()
            }
        };
        Ok(Translation::with_events(kind, events))
    }

    fn reset(&mut self) {
        self.depth.clear();
    }

    fn snapshot_requests(&self) -> Vec<SnapshotRequest> {
        self.symbols
            .iter()
            .map(|symbol| SnapshotRequest {
                instrument: symbol.clone(),
                url: format!(
                    "{}/depth?symbol={}&limit={}",
                    self.rest_endpoint, symbol, SNAPSHOT_DEPTH
                ),
            })
            .collect()
    }

    fn load_rest_snapshot(
        &mut self,
        request: &SnapshotRequest,
        body: &str,
        received_at: u64,
    ) -> Result<Vec<MarketEvent>> {
        let snapshot: DepthSnapshot = serde_json::from_str(body)?;
        self.depth.insert(
            request.instrument.clone(),
            DepthSync {
                last_update_id: snapshot.last_update_id,
                bridged: false,
            },
        );

        let entries = |levels: &[PriceLevel]| -> Vec<BookEntry> {
            levels
                .iter()
                .filter(|l| l.quantity > Decimal::ZERO)
                .map(|l| BookEntry::new(l.price, l.quantity, received_at))
                .collect()
        };
        let book = BookSnapshot::new(
            &request.instrument,
            entries(&snapshot.bids),
            entries(&snapshot.asks),
            received_at,
        )
        .with_origin(Exchange::Binance.as_str());

        info!(symbol = %request.instrument, last_update_id = snapshot.last_update_id, "Order book snapshot loaded");
        Ok(vec![MarketEvent::Book(book)])
    }
}

fn price_level(level: &Value) -> Result<PriceLevel> {
    match level.as_array().map(Vec::as_slice) {
        Some([price, quantity]) => Ok(PriceLevel {
            price: decimal_from_value(price)?,
            quantity: decimal_from_value(quantity)?,
        }),
        _ => Err(MarketDataError::Decode(format!("invalid price level {}", level))),
    }
}

/// Price levels of a REST snapshot; any bad level rejects the snapshot.
fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Value> = Deserialize::deserialize(deserializer)?;
    raw.iter()
        .map(|level| price_level(level).map_err(serde::de::Error::custom))
        .collect()
}

/// Price levels of a depth update. Bad levels are skipped so the update ids
/// still reach the sequence check.
fn deserialize_depth_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Value> = Deserialize::deserialize(deserializer)?;
    Ok(raw
        .iter()
        .filter_map(|level| match price_level(level) {
            Ok(level) => Some(level),
            Err(e) => {
                warn!(error = %e, "Skipping malformed price level");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Action, Outcome};
    use rust_decimal_macros::dec;

    fn depth(first: u64, last: u64) -> String {
        format!(
            r#"{{"stream":"btcusdt@depth@100ms","data":{{
                "e": "depthUpdate",
                "E": 1672531200000,
                "s": "BTCUSDT",
                "U": {},
                "u": {},
                "b": [["50000.00", "1.5"], ["49999.00", "0"]],
                "a": [["50001.00", "1.0"]]
            }}}}"#,
            first, last
        )
    }

    fn synced_adapter(last_update_id: u64) -> BinanceAdapter {
        let mut adapter = BinanceAdapter::new(vec!["BTCUSDT".to_string()]);
        let request = adapter.snapshot_requests().remove(0);
        let body = format!(
            r#"{{"lastUpdateId": {}, "bids": [["49998.00", "2.0"]], "asks": [["50002.00", "0.5"]]}}"#,
            last_update_id
        );
        adapter.load_rest_snapshot(&request, &body, 5).unwrap();
        adapter
    }

    #[test]
    fn test_parse_depth_update() {
        let mut adapter = synced_adapter(100);
        let translation = adapter.process(&depth(99, 105), 1);

        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Delta));
        let MarketEvent::Quotes(quotes) = &translation.events[0] else {
            panic!("Expected quotes");
        };
        assert_eq!(quotes.len(), 3);
        assert_eq!(quotes[0].instrument, "BTCUSDT");
        assert_eq!(quotes[0].price, dec!(50000.00));
        assert!(quotes[1].is_deletion());
        assert_eq!(quotes[2].side, Side::Ask);
        assert_eq!(quotes[0].origin.as_deref(), Some("binance"));
    }

    #[test]
    fn test_parse_trade() {
        let raw = r#"{
            "e": "trade",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "t": 12345,
            "p": "50000.50",
            "q": "0.5",
            "b": 111,
            "a": 222,
            "T": 1672531200000,
            "m": false
        }"#;

        let mut adapter = BinanceAdapter::new(vec!["BTCUSDT".to_string()]);
        let translation = adapter.process(raw, 1);
        let MarketEvent::Trades(trades) = &translation.events[0] else {
            panic!("Expected trades");
        };
        assert_eq!(trades[0].price, dec!(50000.50));
        assert_eq!(trades[0].side, Side::Bid);
        assert_eq!(trades[0].trade_id.as_deref(), Some("12345"));
    }

    #[test]
    fn test_snapshot_becomes_book() {
        let mut adapter = BinanceAdapter::new(vec!["btcusdt".to_string()]);
        let request = adapter.snapshot_requests().remove(0);
        assert!(request.url.contains("symbol=BTCUSDT"));

        let events = adapter
            .load_rest_snapshot(
                &request,
                r#"{"lastUpdateId": 7, "bids": [["1.0", "2.0"], ["1.1", "0"]], "asks": []}"#,
                42,
            )
            .unwrap();
        let MarketEvent::Book(book) = &events[0] else {
            panic!("Expected book");
        };
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.origin.as_deref(), Some("binance"));
    }

    #[test]
    fn test_depth_before_snapshot_is_stale() {
        let mut adapter = BinanceAdapter::new(vec!["BTCUSDT".to_string()]);
        let translation = adapter.process(&depth(1, 2), 1);
        assert_eq!(translation.outcome, Outcome::Stale);
        assert!(translation.events.is_empty());
    }

    #[test]
    fn test_old_depth_is_stale() {
        let mut adapter = synced_adapter(100);
        assert_eq!(adapter.process(&depth(90, 100), 1).outcome, Outcome::Stale);
    }

    #[test]
    fn test_gap_after_bridge_forces_reconnect() {
        let mut adapter = synced_adapter(100);
        assert_eq!(
            adapter.process(&depth(99, 105), 1).outcome,
            Outcome::Handled(EventKind::Delta)
        );
        assert_eq!(
            adapter.process(&depth(106, 110), 1).outcome,
            Outcome::Handled(EventKind::Delta)
        );

        let translation = adapter.process(&depth(112, 115), 1);
        assert_eq!(translation.outcome, Outcome::Desync);
        assert!(translation.events.is_empty());
        assert!(matches!(translation.actions[..], [Action::Reconnect(_)]));
    }

    #[test]
    fn test_malformed_level_still_advances_update_id() {
        let mut adapter = synced_adapter(100);
        adapter.process(&depth(99, 105), 1);

        let bad_level = r#"{"stream":"btcusdt@depth@100ms","data":{
            "e": "depthUpdate", "E": 1672531200100, "s": "BTCUSDT", "U": 106, "u": 110,
            "b": [["oops", "1.0"], ["49990.00"]],
            "a": [["50003.00", "2.0"]]
        }}"#;
        let translation = adapter.process(bad_level, 2);
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Delta));
        let MarketEvent::Quotes(quotes) = &translation.events[0] else {
            panic!("Expected quotes");
        };
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].price, dec!(50003.00));
        assert_eq!(quotes[0].sequence, Some(110));

        let translation = adapter.process(&depth(111, 115), 3);
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Delta));
        assert!(translation.actions.is_empty());
    }

    #[test]
    fn test_snapshot_with_bad_level_is_rejected() {
        let mut adapter = BinanceAdapter::new(vec!["BTCUSDT".to_string()]);
        let request = adapter.snapshot_requests().remove(0);
        let result = adapter.load_rest_snapshot(
            &request,
            r#"{"lastUpdateId": 7, "bids": [["1.0"]], "asks": []}"#,
            1,
        );
        assert!(matches!(result, Err(MarketDataError::Decode(_))));
    }

    #[test]
    fn test_first_event_must_bridge_snapshot() {
        let mut adapter = synced_adapter(100);
        let translation = adapter.process(&depth(150, 160), 1);
        assert_eq!(translation.outcome, Outcome::Desync);
    }

    #[test]
    fn test_ticker_emits_top_level() {
        let raw = r#"{"stream":"btcusdt@ticker","data":{
            "e":"24hrTicker","E":1000,"s":"BTCUSDT",
            "b":"99.5","B":"1","a":"100.5","A":"2",
            "c":"100","h":"110","l":"90","v":"1234"
        }}"#;
        let mut adapter = BinanceAdapter::new(vec!["BTCUSDT".to_string()]);
        let translation = adapter.process(raw, 1);
        assert_eq!(translation.events.len(), 2);
        let MarketEvent::TopLevel(top) = &translation.events[1] else {
            panic!("Expected top level");
        };
        assert_eq!(top.bid.price, dec!(99.5));
        assert_eq!(top.ask.size, dec!(2));
    }

    #[test]
    fn test_subscribe_ack_and_garbage() {
        let mut adapter = BinanceAdapter::new(vec!["BTCUSDT".to_string()]);
        assert_eq!(
            adapter.process(r#"{"result":null,"id":1}"#, 1).outcome,
            Outcome::Handled(EventKind::ControlAck)
        );
        assert_eq!(adapter.process("not json", 1).outcome, Outcome::Discarded);
        assert_eq!(
            adapter.process(r#"{"e":"mystery"}"#, 1).outcome,
            Outcome::Discarded
        );
    }

    #[test]
    fn test_subscriptions_cover_all_streams() {
        let adapter = BinanceAdapter::new(vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        let subs = adapter.subscriptions();
        assert_eq!(subs.len(), 1);
        let request: Value = serde_json::from_str(&subs[0]).unwrap();
        assert_eq!(request["method"], "SUBSCRIBE");
        assert_eq!(request["params"].as_array().unwrap().len(), 8);
        assert!(subs[0].contains("ethusdt@kline_1m"));
    }
}
