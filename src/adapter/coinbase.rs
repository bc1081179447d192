//! Coinbase Exchange websocket feed adapter
//!
//! Messages are dispatched on their `type` field through a handler table.
//! Matches, tickers and heartbeats carry a per-product `sequence` that the
//! channels share, so a ticker repeats the sequence of the match behind it.
//! Heartbeats also report the last trade id, which exposes dropped matches.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::{EventKind, Exchange, ExchangeAdapter, Keepalive, Sequencing, Translation};
use crate::decimal::{deserialize_decimal, parse_decimal, rfc3339_millis};
use crate::error::{MarketDataError, Result};
use crate::model::{
    canonical_instrument, BookEntry, BookSnapshot, MarketEvent, Quote, Side, Ticker, TopLevel,
    Trade,
};

pub const COINBASE_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

type Handler = fn(&Value, u64) -> Result<Vec<MarketEvent>>;

/// Decoded Coinbase message: its `type` plus the untouched body
#[derive(Debug, Clone)]
pub struct CoinbaseMessage {
    pub msg_type: String,
    pub body: Value,
}

#[derive(Debug, Deserialize)]
struct Level2Snapshot {
    product_id: String,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct Level2Update {
    product_id: String,
    time: Option<String>,
    changes: Vec<[String; 3]>,
}

#[derive(Debug, Deserialize)]
struct Match {
    trade_id: u64,
    sequence: Option<u64>,
    product_id: String,
    #[serde(deserialize_with = "deserialize_decimal")]
    size: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    price: Decimal,
    /// Maker order side
    side: String,
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerUpdate {
    product_id: String,
    #[serde(deserialize_with = "deserialize_decimal")]
    price: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    best_bid: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    best_bid_size: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    best_ask: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    best_ask_size: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    high_24h: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    low_24h: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    volume_24h: Decimal,
    time: Option<String>,
}

/// Sequencing state of one product
#[derive(Debug, Default, Clone)]
struct ProductSequence {
    /// Last sequence seen on each channel
    sequences: HashMap<&'static str, u64>,
    last_trade_id: Option<u64>,
}

/// Channel a sequenced message belongs to
fn channel_of(msg_type: &str) -> &'static str {
    match msg_type {
        "match" | "last_match" => "matches",
        "ticker" => "ticker",
        "heartbeat" => "heartbeat",
        _ => "level2",
    }
}

pub struct CoinbaseAdapter {
    product_ids: Vec<String>,
    endpoint: String,
    products: HashMap<String, ProductSequence>,
    handlers: HashMap<&'static str, (EventKind, Handler)>,
}

impl CoinbaseAdapter {
    /// `pairs` may be given as `BTCUSD` or `BTC-USD`.
    pub fn new(pairs: Vec<String>) -> Self {
        let mut handlers: HashMap<&'static str, (EventKind, Handler)> = HashMap::new();
        handlers.insert("snapshot", (EventKind::Snapshot, handle_snapshot));
        handlers.insert("l2update", (EventKind::Delta, handle_l2update));
        handlers.insert("match", (EventKind::Trade, handle_match));
        handlers.insert("last_match", (EventKind::Trade, handle_match));
        handlers.insert("ticker", (EventKind::Ticker, handle_ticker));
        handlers.insert("heartbeat", (EventKind::Heartbeat, handle_nothing));
        handlers.insert("subscriptions", (EventKind::ControlAck, handle_subscriptions));
        handlers.insert("error", (EventKind::Error, handle_error));

        Self {
            product_ids: pairs.iter().map(|p| product_id(p)).collect(),
            endpoint: COINBASE_WS_URL.to_string(),
            products: HashMap::new(),
            handlers,
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

/// Coinbase product ids are dash separated: `BTCUSD` becomes `BTC-USD`.
fn product_id(pair: &str) -> String {
    if pair.contains('-') {
        return pair.to_ascii_uppercase();
    }
    let pair = pair.to_ascii_uppercase();
    // Quote currencies on Coinbase are three or four letters.
    let split = if ["USDT", "USDC", "EURC"].iter().any(|q| pair.ends_with(q)) {
        pair.len().saturating_sub(4)
    } else {
        pair.len().saturating_sub(3)
    };
    format!("{}-{}", &pair[..split], &pair[split..])
}

impl ExchangeAdapter for CoinbaseAdapter {
    type Event = CoinbaseMessage;

    fn exchange(&self) -> Exchange {
        Exchange::Coinbase
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![json!({
            "type": "subscribe",
            "product_ids": self.product_ids,
            "channels": ["level2", "matches", "ticker", "heartbeat"],
        })
        .to_string()]
    }

    /// The heartbeat channel keeps the idle timer fed.
    fn keepalive(&self) -> Keepalive {
        Keepalive::None
    }

    fn decode(&mut self, raw: &str) -> Result<CoinbaseMessage> {
        let body: Value = serde_json::from_str(raw)?;
        let msg_type = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| MarketDataError::missing("type"))?;
        if !self.handlers.contains_key(msg_type) {
            return Err(MarketDataError::Decode(format!("unhandled message type `{}`", msg_type)));
        }
        Ok(CoinbaseMessage {
            msg_type: msg_type.to_string(),
            body,
        })
    }

    fn check_sequence(&mut self, event: &CoinbaseMessage) -> Result<Sequencing> {
        let body = &event.body;
        let Some(product) = body.get("product_id").and_then(Value::as_str) else {
            return Ok(Sequencing::InOrder);
        };
        let state = self.products.entry(product.to_string()).or_default();

        if event.msg_type == "heartbeat" {
            let reported = body.get("last_trade_id").and_then(Value::as_u64);
            match (state.last_trade_id, reported) {
                (Some(seen), Some(reported)) if reported > seen => {
                    return Err(MarketDataError::Desync {
                        expected: seen,
                        got: reported,
                    });
                }
                (None, Some(_)) => state.last_trade_id = reported,
                _ => {}
            }
        }

        let Some(sequence) = body.get("sequence").and_then(Value::as_u64) else {
            return Ok(Sequencing::InOrder);
        };
        let channel = channel_of(&event.msg_type);
        if state.sequences.get(channel).map_or(false, |&last| sequence <= last) {
            return Ok(Sequencing::Stale);
        }
        state.sequences.insert(channel, sequence);

        if channel == "matches" {
            if let Some(trade_id) = body.get("trade_id").and_then(Value::as_u64) {
                state.last_trade_id = Some(state.last_trade_id.map_or(trade_id, |seen| seen.max(trade_id)));
            }
        }
        Ok(Sequencing::InOrder)
    }

    fn classify(&self, event: &CoinbaseMessage) -> EventKind {
        self.handlers
            .get(event.msg_type.as_str())
            .map_or(EventKind::Error, |(kind, _)| *kind)
    }

    fn translate(
        &mut self,
        event: CoinbaseMessage,
        kind: EventKind,
        received_at: u64,
    ) -> Result<Translation> {
        let (_, handler) = self.handlers.get(event.msg_type.as_str()).ok_or_else(|| {
            MarketDataError::Decode(format!("unhandled message type `{}`", event.msg_type))
        })?;
        Ok(Translation::with_events(kind, handler(&event.body, received_at)?))
    }

    fn reset(&mut self) {
        self.products.clear();
    }
}

fn timestamp(time: Option<&str>, received_at: u64) -> u64 {
    time.and_then(rfc3339_millis).unwrap_or(received_at)
}

fn entries(levels: &[[String; 2]], ts: u64) -> Result<Vec<BookEntry>> {
    levels
        .iter()
        .map(|[price, size]| Ok(BookEntry::new(parse_decimal(price)?, parse_decimal(size)?, ts)))
        .collect()
}

fn handle_snapshot(body: &Value, received_at: u64) -> Result<Vec<MarketEvent>> {
    let snapshot: Level2Snapshot = serde_json::from_value(body.clone())?;
    let book = BookSnapshot::new(
        &canonical_instrument(&snapshot.product_id),
        entries(&snapshot.bids, received_at)?,
        entries(&snapshot.asks, received_at)?,
        received_at,
    )
    .with_origin(Exchange::Coinbase.as_str());
    Ok(vec![MarketEvent::Book(book)])
}

fn handle_l2update(body: &Value, received_at: u64) -> Result<Vec<MarketEvent>> {
    let update: Level2Update = serde_json::from_value(body.clone())?;
    let instrument = canonical_instrument(&update.product_id);
    let ts = timestamp(update.time.as_deref(), received_at);

    let quotes = update
        .changes
        .iter()
        .map(|[side, price, size]| {
            Ok(Quote::new(
                &instrument,
                parse_decimal(price)?,
                parse_decimal(size)?,
                Side::parse(side)?,
                ts,
            )
            .with_origin(Exchange::Coinbase.as_str()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(vec![MarketEvent::Quotes(quotes)])
}

fn handle_match(body: &Value, received_at: u64) -> Result<Vec<MarketEvent>> {
    let m: Match = serde_json::from_value(body.clone())?;
    Ok(vec![MarketEvent::Trades(vec![Trade {
        instrument: canonical_instrument(&m.product_id),
        price: m.price,
        size: m.size,
        // A resting sell filled means the taker bought.
        side: Side::parse(&m.side)?.opposite(),
        trade_id: Some(m.trade_id.to_string()),
        sequence: m.sequence,
        timestamp: timestamp(m.time.as_deref(), received_at),
    }])])
}

fn handle_ticker(body: &Value, received_at: u64) -> Result<Vec<MarketEvent>> {
    let t: TickerUpdate = serde_json::from_value(body.clone())?;
    let instrument = canonical_instrument(&t.product_id);
    let ts = timestamp(t.time.as_deref(), received_at);
    Ok(vec![
        MarketEvent::Ticker(Ticker {
            instrument: instrument.clone(),
            bid: Some(t.best_bid),
            ask: Some(t.best_ask),
            last: Some(t.price),
            high: Some(t.high_24h),
            low: Some(t.low_24h),
            volume: Some(t.volume_24h),
            timestamp: ts,
        }),
        MarketEvent::TopLevel(TopLevel {
            instrument,
            bid: BookEntry::new(t.best_bid, t.best_bid_size, ts),
            ask: BookEntry::new(t.best_ask, t.best_ask_size, ts),
            timestamp: ts,
        }),
    ])
}

fn handle_subscriptions(body: &Value, _received_at: u64) -> Result<Vec<MarketEvent>> {
    info!(channels = %body.get("channels").unwrap_or(&serde_json::Value::Null), "Coinbase subscriptions confirmed");
    Ok(Vec::new())
}

fn handle_error(body: &Value, _received_at: u64) -> Result<Vec<MarketEvent>> {
    error!(
        message = %body.get("message").and_then(serde_json::Value::as_str).unwrap_or_default(),
        reason = %body.get("reason").and_then(serde_json::Value::as_str).unwrap_or_default(),
        "Coinbase reported an error"
    );
    Ok(Vec::new())
}

fn handle_nothing(_body: &Value, _received_at: u64) -> Result<Vec<MarketEvent>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Action, Outcome};
    use rust_decimal_macros::dec;

    fn heartbeat(sequence: u64, last_trade_id: u64) -> String {
        format!(
            r#"{{"type":"heartbeat","sequence":{},"last_trade_id":{},"product_id":"BTC-USD","time":"2014-11-07T08:19:28.464459Z"}}"#,
            sequence, last_trade_id
        )
    }

    fn matched(sequence: u64, trade_id: u64) -> String {
        format!(
            r#"{{"type":"match","trade_id":{},"sequence":{},"maker_order_id":"a","taker_order_id":"b",
                "time":"2014-11-07T08:19:27.028459Z","product_id":"BTC-USD","size":"5.23512","price":"400.23","side":"sell"}}"#,
            trade_id, sequence
        )
    }

    #[test]
    fn test_product_ids() {
        assert_eq!(product_id("BTCUSD"), "BTC-USD");
        assert_eq!(product_id("ethusdt"), "ETH-USDT");
        assert_eq!(product_id("BTC-EUR"), "BTC-EUR");
    }

    #[test]
    fn test_snapshot_and_l2update() {
        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        let translation = adapter.process(
            r#"{"type":"snapshot","product_id":"BTC-USD","bids":[["10101.10","0.45054140"]],"asks":[["10102.55","0.57753524"]]}"#,
            9,
        );
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Snapshot));
        let MarketEvent::Book(book) = &translation.events[0] else {
            panic!("Expected book");
        };
        assert_eq!(book.instrument, "BTCUSD");
        assert_eq!(book.bids[0].price, dec!(10101.10));

        let translation = adapter.process(
            r#"{"type":"l2update","product_id":"BTC-USD","time":"2019-08-14T20:42:27.265Z","changes":[["buy","10101.80000000","0.162567"],["sell","10102.55","0"]]}"#,
            10,
        );
        let MarketEvent::Quotes(quotes) = &translation.events[0] else {
            panic!("Expected quotes");
        };
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].side, Side::Bid);
        assert_eq!(quotes[0].timestamp, 1565815347265);
        assert!(quotes[1].is_deletion());
    }

    #[test]
    fn test_match_uses_taker_side() {
        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        let translation = adapter.process(&matched(50, 10), 1);
        let MarketEvent::Trades(trades) = &translation.events[0] else {
            panic!("Expected trades");
        };
        assert_eq!(trades[0].side, Side::Bid);
        assert_eq!(trades[0].sequence, Some(50));
        assert_eq!(trades[0].size, dec!(5.23512));
    }

    #[test]
    fn test_old_sequence_is_stale() {
        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        adapter.process(&matched(50, 10), 1);
        assert_eq!(adapter.process(&matched(49, 9), 1).outcome, Outcome::Stale);
    }

    fn ticker(sequence: u64) -> String {
        format!(
            r#"{{"type":"ticker","sequence":{},"product_id":"BTC-USD","price":"400.23","open_24h":"0","volume_24h":"5323.1",
                "low_24h":"300","high_24h":"410","best_bid":"400.22","best_bid_size":"1.2","best_ask":"400.23","best_ask_size":"0.5",
                "side":"buy","time":"2014-11-07T08:19:27.028459Z","trade_id":10,"last_size":"5.23512"}}"#,
            sequence
        )
    }

    #[test]
    fn test_ticker_sharing_match_sequence_is_translated() {
        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        adapter.process(&matched(100, 10), 1);

        let translation = adapter.process(&ticker(100), 2);
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Ticker));
        assert_eq!(translation.events.len(), 2);

        // A replayed ticker on the same channel is still stale.
        assert_eq!(adapter.process(&ticker(100), 3).outcome, Outcome::Stale);
    }

    #[test]
    fn test_heartbeat_sharing_match_sequence_checks_trade_id() {
        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        adapter.process(&matched(100, 21), 1);
        assert_eq!(
            adapter.process(&heartbeat(100, 21), 2).outcome,
            Outcome::Handled(EventKind::Heartbeat)
        );

        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        adapter.process(&matched(100, 21), 1);
        let translation = adapter.process(&heartbeat(100, 23), 2);
        assert_eq!(translation.outcome, Outcome::Desync);
        assert!(matches!(translation.actions[..], [Action::Reconnect(_)]));
    }

    #[test]
    fn test_heartbeat_detects_missed_trades() {
        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        let translation = adapter.process(&heartbeat(90, 20), 1);
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Heartbeat));
        assert!(translation.events.is_empty());

        adapter.process(&matched(91, 21), 1);
        assert_eq!(
            adapter.process(&heartbeat(92, 21), 1).outcome,
            Outcome::Handled(EventKind::Heartbeat)
        );

        let translation = adapter.process(&heartbeat(95, 23), 1);
        assert_eq!(translation.outcome, Outcome::Desync);
        assert!(matches!(translation.actions[..], [Action::Reconnect(_)]));

        adapter.reset();
        assert_eq!(
            adapter.process(&heartbeat(96, 23), 1).outcome,
            Outcome::Handled(EventKind::Heartbeat)
        );
    }

    #[test]
    fn test_ticker_emits_top_level() {
        let raw = r#"{"type":"ticker","sequence":5,"product_id":"BTC-USD","price":"333.99","open_24h":"0","volume_24h":"5323.1",
            "low_24h":"300","high_24h":"340","best_bid":"333.98","best_bid_size":"1.2","best_ask":"333.99","best_ask_size":"0.5",
            "side":"buy","time":"2015-03-14T17:28:28.000000Z","trade_id":4,"last_size":"0.03"}"#;
        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        let translation = adapter.process(raw, 1);
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Ticker));
        let MarketEvent::TopLevel(top) = &translation.events[1] else {
            panic!("Expected top level");
        };
        assert_eq!(top.bid.size, dec!(1.2));
    }

    #[test]
    fn test_control_and_unknown_messages() {
        let mut adapter = CoinbaseAdapter::new(vec!["BTCUSD".to_string()]);
        assert_eq!(
            adapter
                .process(r#"{"type":"subscriptions","channels":[{"name":"level2","product_ids":["BTC-USD"]}]}"#, 1)
                .outcome,
            Outcome::Handled(EventKind::ControlAck)
        );
        assert_eq!(
            adapter.process(r#"{"type":"error","message":"Failed to subscribe","reason":"bad product"}"#, 1).outcome,
            Outcome::Handled(EventKind::Error)
        );
        assert_eq!(adapter.process(r#"{"type":"received"}"#, 1).outcome, Outcome::Discarded);

        let subs = adapter.subscriptions();
        assert!(subs[0].contains(r#""product_ids":["BTC-USD"]"#));
    }
}
