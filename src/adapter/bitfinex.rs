//! Bitfinex v2 websocket adapter
//!
//! System messages arrive as JSON objects, channel data as arrays headed by a
//! channel id. `subscribed` events fill a channel table; data is then
//! dispatched through a handler table keyed by channel name.

use std::collections::HashMap;

use ring::hmac;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{Action, EventKind, Exchange, ExchangeAdapter, Keepalive, Translation};
use crate::decimal::{decimal_from_value, now_millis};
use crate::error::{MarketDataError, Result};
use crate::model::{
    canonical_instrument, BookEntry, BookSnapshot, Candle, MarketEvent, Quote, Side, Ticker,
    TopLevel, Trade,
};

pub const BITFINEX_WS_URL: &str = "wss://api-pub.bitfinex.com/ws/2";

const INFO_RECONNECT: u64 = 20051;
const INFO_PAUSE: u64 = 20060;
const INFO_RESUME: u64 = 20061;

/// API key pair for authenticated sessions
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Sign a Bitfinex auth payload.
///
/// Bitfinex expects `HMAC-SHA384(secret, "AUTH" + nonce)`, hex encoded.
pub fn sign_auth_payload(secret: &str, payload: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA384, secret.as_bytes());
    let signature = hmac::sign(&key, payload.as_bytes());
    hex::encode(signature.as_ref())
}

/// Decoded Bitfinex message
#[derive(Debug, Clone)]
pub enum BitfinexMessage {
    Info {
        code: Option<u64>,
        version: Option<u64>,
        msg: String,
    },
    Subscribed {
        chan_id: u64,
        channel: String,
        instrument: String,
    },
    Unsubscribed {
        chan_id: u64,
    },
    Auth {
        status: String,
    },
    Pong,
    Error {
        code: Option<u64>,
        msg: String,
    },
    Heartbeat,
    /// Channel data; `body` is the array without its leading channel id.
    Data {
        chan_id: u64,
        body: Vec<Value>,
    },
}

#[derive(Debug, Clone)]
struct ChannelInfo {
    channel: String,
    instrument: String,
}

type Handler = fn(&str, &[Value], u64) -> Result<Vec<MarketEvent>>;

pub struct BitfinexAdapter {
    pairs: Vec<String>,
    endpoint: String,
    credentials: Option<Credentials>,
    channels: HashMap<u64, ChannelInfo>,
    handlers: HashMap<&'static str, Handler>,
}

impl BitfinexAdapter {
    pub fn new(pairs: Vec<String>) -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert("book", handle_book);
        handlers.insert("trades", handle_trades);
        handlers.insert("ticker", handle_ticker);
        handlers.insert("candles", handle_candles);

        Self {
            pairs: pairs.iter().map(|p| canonical_instrument(p)).collect(),
            endpoint: BITFINEX_WS_URL.to_string(),
            credentials: None,
            channels: HashMap::new(),
            handlers,
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Build a fresh auth command; every call uses a new nonce.
    fn auth_command(&self, credentials: &Credentials) -> String {
        let nonce = (now_millis() * 1000).to_string();
        let payload = format!("AUTH{}", nonce);
        json!({
            "event": "auth",
            "apiKey": credentials.api_key,
            "authSig": sign_auth_payload(&credentials.api_secret, &payload),
            "authPayload": payload,
            "authNonce": nonce,
        })
        .to_string()
    }

    fn handle_info(&self, code: Option<u64>, version: Option<u64>, msg: &str) -> Translation {
        let ack = Translation::handled(EventKind::ControlAck);
        match code {
            None => {
                info!(version = ?version, "Bitfinex API version");
                ack
            }
            Some(INFO_RECONNECT) => {
                warn!(code = INFO_RECONNECT, msg = %msg, "Bitfinex requested reconnect");
                ack.with_action(Action::Reconnect(format!("info {}: {}", INFO_RECONNECT, msg)))
            }
            Some(INFO_PAUSE) => {
                info!(code = INFO_PAUSE, msg = %msg, "Bitfinex refreshing, pausing activity");
                ack.with_action(Action::Pause)
            }
            Some(INFO_RESUME) => {
                info!(code = INFO_RESUME, msg = %msg, "Bitfinex refresh done, resubscribing");
                ack.with_action(Action::Resume)
            }
            Some(other) => {
                warn!(code = other, msg = %msg, "Unhandled Bitfinex info code");
                ack
            }
        }
    }
}

impl ExchangeAdapter for BitfinexAdapter {
    type Event = BitfinexMessage;

    fn exchange(&self) -> Exchange {
        Exchange::Bitfinex
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut commands = Vec::new();
        if let Some(credentials) = &self.credentials {
            commands.push(self.auth_command(credentials));
        }
        for pair in &self.pairs {
            let symbol = format!("t{}", pair);
            commands.push(
                json!({"event": "subscribe", "channel": "book", "symbol": symbol, "prec": "P0", "freq": "F0", "len": "25"})
                    .to_string(),
            );
            commands.push(json!({"event": "subscribe", "channel": "trades", "symbol": symbol}).to_string());
            commands.push(json!({"event": "subscribe", "channel": "ticker", "symbol": symbol}).to_string());
            commands.push(
                json!({"event": "subscribe", "channel": "candles", "key": format!("trade:1m:{}", symbol)})
                    .to_string(),
            );
        }
        commands
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive::Command(json!({"event": "ping"}).to_string())
    }

    fn decode(&mut self, raw: &str) -> Result<BitfinexMessage> {
        let value: Value = serde_json::from_str(raw)?;

        match value {
            Value::Object(obj) => {
                let event = obj
                    .get("event")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MarketDataError::missing("event"))?;
                let text = |key: &str| {
                    obj.get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                let number = |key: &str| obj.get(key).and_then(Value::as_u64);

                match event {
                    "info" => Ok(BitfinexMessage::Info {
                        code: number("code"),
                        version: number("version"),
                        msg: text("msg"),
                    }),
                    "subscribed" => {
                        let chan_id = number("chanId").ok_or_else(|| MarketDataError::missing("chanId"))?;
                        let raw_instrument = match obj.get("pair").and_then(Value::as_str) {
                            Some(pair) => pair.to_string(),
                            None => match obj.get("symbol").and_then(Value::as_str) {
                                Some(symbol) => symbol.to_string(),
                                // Candle subscriptions only echo `trade:1m:tBTCUSD`.
                                None => text("key").rsplit(':').next().unwrap_or_default().to_string(),
                            },
                        };
                        Ok(BitfinexMessage::Subscribed {
                            chan_id,
                            channel: text("channel"),
                            instrument: canonical_instrument(&raw_instrument),
                        })
                    }
                    "unsubscribed" => Ok(BitfinexMessage::Unsubscribed {
                        chan_id: number("chanId").ok_or_else(|| MarketDataError::missing("chanId"))?,
                    }),
                    "auth" => Ok(BitfinexMessage::Auth { status: text("status") }),
                    "pong" => Ok(BitfinexMessage::Pong),
                    "error" => Ok(BitfinexMessage::Error {
                        code: number("code"),
                        msg: text("msg"),
                    }),
                    other => Err(MarketDataError::Decode(format!("unhandled event `{}`", other))),
                }
            }
            Value::Array(mut items) => {
                if items.len() < 2 {
                    return Err(MarketDataError::Decode("short channel message".to_string()));
                }
                let chan_id = items[0]
                    .as_u64()
                    .ok_or_else(|| MarketDataError::missing("chanId"))?;
                if items[1].as_str() == Some("hb") {
                    return Ok(BitfinexMessage::Heartbeat);
                }
                let body = items.split_off(1);
                Ok(BitfinexMessage::Data { chan_id, body })
            }
            other => Err(MarketDataError::Decode(format!("unexpected message {}", other))),
        }
    }

    fn classify(&self, event: &BitfinexMessage) -> EventKind {
        match event {
            BitfinexMessage::Heartbeat => EventKind::Heartbeat,
            BitfinexMessage::Error { .. } => EventKind::Error,
            BitfinexMessage::Info { .. }
            | BitfinexMessage::Subscribed { .. }
            | BitfinexMessage::Unsubscribed { .. }
            | BitfinexMessage::Auth { .. }
            | BitfinexMessage::Pong => EventKind::ControlAck,
            BitfinexMessage::Data { chan_id, body } => {
                let channel = self.channels.get(chan_id).map(|c| c.channel.as_str());
                match channel {
                    Some("book") if is_snapshot(body) => EventKind::Snapshot,
                    Some("book") => EventKind::Delta,
                    Some("trades") => EventKind::Trade,
                    Some("ticker") => EventKind::Ticker,
                    Some("candles") => EventKind::Candle,
                    _ => EventKind::Delta,
                }
            }
        }
    }

    fn translate(
        &mut self,
        event: BitfinexMessage,
        kind: EventKind,
        received_at: u64,
    ) -> Result<Translation> {
        let translation = match event {
            BitfinexMessage::Info { code, version, msg } => self.handle_info(code, version, &msg),
            BitfinexMessage::Subscribed {
                chan_id,
                channel,
                instrument,
            } => {
                info!(chan_id, channel = %channel, instrument = %instrument, "Bitfinex channel subscribed");
                self.channels.insert(chan_id, ChannelInfo { channel, instrument });
                Translation::handled(kind)
            }
            BitfinexMessage::Unsubscribed { chan_id } => {
                debug!(chan_id, "Bitfinex channel unsubscribed");
                self.channels.remove(&chan_id);
                Translation::handled(kind)
            }
            BitfinexMessage::Auth { status } => {
                if status == "OK" {
                    info!("Bitfinex authentication succeeded");
                } else {
                    error!(status = %status, "Bitfinex authentication failed");
                }
                Translation::handled(kind)
            }
            BitfinexMessage::Pong => Translation::handled(kind).with_action(Action::Pong),
            BitfinexMessage::Error { code, msg } => {
                error!(code = ?code, msg = %msg, "Bitfinex reported an error");
                Translation::handled(kind)
            }
            BitfinexMessage::Heartbeat => Translation::handled(kind),
            BitfinexMessage::Data { chan_id, body } => {
                let channel = self
                    .channels
                    .get(&chan_id)
                    .ok_or_else(|| MarketDataError::Decode(format!("unknown channel id {}", chan_id)))?;
                let handler = self.handlers.get(channel.channel.as_str()).ok_or_else(|| {
                    MarketDataError::Decode(format!("no handler for channel `{}`", channel.channel))
                })?;
                Translation::with_events(kind, handler(&channel.instrument, &body, received_at)?)
            }
        };
        Ok(translation)
    }

    fn reset(&mut self) {
        self.channels.clear();
    }

    fn replay_command(&self, command: &str) -> String {
        match (&self.credentials, is_auth_command(command)) {
            (Some(credentials), true) => self.auth_command(credentials),
            _ => command.to_string(),
        }
    }

    /// Unsubscribe every live channel, then subscribe again from history.
    /// The session stays authenticated, so auth is not sent again.
    fn resume_commands(&self, history: &[String]) -> Vec<String> {
        let mut chan_ids: Vec<u64> = self.channels.keys().copied().collect();
        chan_ids.sort_unstable();

        chan_ids
            .into_iter()
            .map(|chan_id| json!({"event": "unsubscribe", "chanId": chan_id}).to_string())
            .chain(
                history
                    .iter()
                    .filter(|c| !is_auth_command(c))
                    .map(|c| self.replay_command(c)),
            )
            .collect()
    }
}

fn is_auth_command(command: &str) -> bool {
    serde_json::from_str::<Value>(command)
        .map(|v| v.get("event").and_then(Value::as_str) == Some("auth"))
        .unwrap_or(false)
}

fn is_snapshot(body: &[Value]) -> bool {
    body.first()
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .map_or(false, Value::is_array)
}

fn row(value: &Value) -> Result<&Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| MarketDataError::Decode(format!("expected array, got {}", value)))
}

fn field(row: &[Value], idx: usize) -> Result<Decimal> {
    row.get(idx)
        .ok_or_else(|| MarketDataError::Decode(format!("row too short: {:?}", row)))
        .and_then(decimal_from_value)
}

fn body_rows(body: &[Value]) -> Result<Vec<&Vec<Value>>> {
    let first = body
        .first()
        .ok_or_else(|| MarketDataError::Decode("empty channel body".to_string()))?;
    if is_snapshot(body) {
        row(first)?.iter().map(row).collect()
    } else {
        Ok(vec![row(first)?])
    }
}

/// Book P0 rows: `[PRICE, COUNT, AMOUNT]`, amount sign gives the side.
fn handle_book(instrument: &str, body: &[Value], received_at: u64) -> Result<Vec<MarketEvent>> {
    let origin = Exchange::Bitfinex.as_str();
    let parse = |r: &Vec<Value>| -> Result<(Decimal, Decimal, Side, Decimal)> {
        let price = field(r, 0)?;
        let count = field(r, 1)?;
        let amount = field(r, 2)?;
        let side = if amount.is_sign_negative() { Side::Ask } else { Side::Bid };
        let size = if count.is_zero() { Decimal::ZERO } else { amount.abs() };
        Ok((price, size, side, count))
    };

    if is_snapshot(body) {
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for r in body_rows(body)? {
            let (price, size, side, count) = parse(r)?;
            if count.is_zero() {
                continue;
            }
            let entry = BookEntry::new(price, size, received_at);
            match side {
                Side::Bid => bids.push(entry),
                Side::Ask => asks.push(entry),
            }
        }
        let book = BookSnapshot::new(instrument, bids, asks, received_at).with_origin(origin);
        return Ok(vec![MarketEvent::Book(book)]);
    }

    let quotes = body_rows(body)?
        .into_iter()
        .map(|r| {
            let (price, size, side, _) = parse(r)?;
            Ok(Quote::new(instrument, price, size, side, received_at).with_origin(origin))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(vec![MarketEvent::Quotes(quotes)])
}

/// Trade rows: `[ID, MTS, AMOUNT, PRICE]`; only executions (`te`) are kept.
fn handle_trades(instrument: &str, body: &[Value], _received_at: u64) -> Result<Vec<MarketEvent>> {
    let rows = match body.first().and_then(Value::as_str) {
        Some("te") => vec![row(body.get(1).ok_or_else(|| MarketDataError::missing("te"))?)?],
        Some(_) => return Ok(Vec::new()),
        None => body_rows(body)?,
    };

    let trades = rows
        .into_iter()
        .map(|r| {
            let amount = field(r, 2)?;
            Ok(Trade {
                instrument: instrument.to_string(),
                price: field(r, 3)?,
                size: amount.abs(),
                side: if amount.is_sign_negative() { Side::Ask } else { Side::Bid },
                trade_id: r.first().map(|id| id.to_string()),
                sequence: None,
                timestamp: r.get(1).and_then(Value::as_u64).unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(vec![MarketEvent::Trades(trades)])
}

/// Ticker row: `[BID, BID_SIZE, ASK, ASK_SIZE, CHG, CHG_REL, LAST, VOLUME, HIGH, LOW]`
fn handle_ticker(instrument: &str, body: &[Value], received_at: u64) -> Result<Vec<MarketEvent>> {
    let r = row(body.first().ok_or_else(|| MarketDataError::missing("ticker"))?)?;
    let bid = field(r, 0)?;
    let ask = field(r, 2)?;
    Ok(vec![
        MarketEvent::Ticker(Ticker {
            instrument: instrument.to_string(),
            bid: Some(bid),
            ask: Some(ask),
            last: Some(field(r, 6)?),
            high: Some(field(r, 8)?),
            low: Some(field(r, 9)?),
            volume: Some(field(r, 7)?),
            timestamp: received_at,
        }),
        MarketEvent::TopLevel(TopLevel {
            instrument: instrument.to_string(),
            bid: BookEntry::new(bid, field(r, 1)?, received_at),
            ask: BookEntry::new(ask, field(r, 3)?, received_at),
            timestamp: received_at,
        }),
    ])
}

/// Candle rows: `[MTS, OPEN, CLOSE, HIGH, LOW, VOLUME]`
fn handle_candles(instrument: &str, body: &[Value], _received_at: u64) -> Result<Vec<MarketEvent>> {
    body_rows(body)?
        .into_iter()
        .map(|r| {
            Ok(MarketEvent::Candle(Candle {
                instrument: instrument.to_string(),
                interval: Some("1m".to_string()),
                open: field(r, 1)?,
                close: field(r, 2)?,
                high: field(r, 3)?,
                low: field(r, 4)?,
                timestamp: r.first().and_then(Value::as_u64).unwrap_or_default(),
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Outcome;
    use rust_decimal_macros::dec;

    fn subscribed(adapter: &mut BitfinexAdapter, chan_id: u64, channel: &str) {
        let raw = format!(
            r#"{{"event":"subscribed","channel":"{}","chanId":{},"symbol":"tBTCUSD","pair":"BTCUSD"}}"#,
            channel, chan_id
        );
        adapter.process(&raw, 1);
    }

    #[test]
    fn test_sign_auth_payload() {
        let sig = sign_auth_payload("secret", "AUTH1234");
        // SHA-384 = 48 bytes = 96 hex chars
        assert_eq!(sig.len(), 96);
        assert_eq!(sig, sign_auth_payload("secret", "AUTH1234"));
        assert_ne!(sig, sign_auth_payload("other", "AUTH1234"));
    }

    #[test]
    fn test_book_snapshot_and_updates() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        subscribed(&mut adapter, 17, "book");

        let translation = adapter.process(
            r#"[17,[[7254.7,3,3.3],[7254.6,2,2.1],[7255.1,1,-1.5]]]"#,
            100,
        );
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Snapshot));
        let MarketEvent::Book(book) = &translation.events[0] else {
            panic!("Expected book");
        };
        assert_eq!(book.instrument, "BTCUSD");
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks[0].size, dec!(1.5));

        let translation = adapter.process(r#"[17,[7255.1,0,-1]]"#, 101);
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Delta));
        let MarketEvent::Quotes(quotes) = &translation.events[0] else {
            panic!("Expected quotes");
        };
        assert_eq!(quotes[0].side, Side::Ask);
        assert!(quotes[0].is_deletion());
    }

    #[test]
    fn test_trades_keep_executions_only() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        subscribed(&mut adapter, 5, "trades");

        let translation = adapter.process(r#"[5,"te",[401597393,1574694475039,-0.005,7245.3]]"#, 1);
        let MarketEvent::Trades(trades) = &translation.events[0] else {
            panic!("Expected trades");
        };
        assert_eq!(trades[0].side, Side::Ask);
        assert_eq!(trades[0].size, dec!(0.005));
        assert_eq!(trades[0].timestamp, 1574694475039);

        let translation = adapter.process(r#"[5,"tu",[401597393,1574694475039,-0.005,7245.3]]"#, 1);
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Trade));
        assert!(translation.events.is_empty());
    }

    #[test]
    fn test_ticker_emits_top_level() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        subscribed(&mut adapter, 9, "ticker");

        let translation = adapter.process(
            r#"[9,[7616.5,31.89,7617.5,43.36,-550.8,-0.0674,7617.1,8314.71,8257.8,7500]]"#,
            5,
        );
        assert_eq!(translation.events.len(), 2);
        let MarketEvent::TopLevel(top) = &translation.events[1] else {
            panic!("Expected top level");
        };
        assert_eq!(top.ask.price, dec!(7617.5));
        assert_eq!(top.bid.size, dec!(31.89));
    }

    #[test]
    fn test_candle_subscription_uses_key() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        adapter.process(
            r#"{"event":"subscribed","channel":"candles","chanId":3,"key":"trade:1m:tBTCUSD"}"#,
            1,
        );
        let translation = adapter.process(r#"[3,[1574698260000,7379.8,7379.8,7379.8,7379.8,0.1]]"#, 1);
        let MarketEvent::Candle(candle) = &translation.events[0] else {
            panic!("Expected candle");
        };
        assert_eq!(candle.instrument, "BTCUSD");
        assert_eq!(candle.open, dec!(7379.8));
    }

    #[test]
    fn test_info_codes_map_to_actions() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        let actions = |adapter: &mut BitfinexAdapter, code: u64| {
            adapter
                .process(&format!(r#"{{"event":"info","code":{},"msg":"x"}}"#, code), 1)
                .actions
        };
        assert!(matches!(actions(&mut adapter, 20051)[..], [Action::Reconnect(_)]));
        assert_eq!(actions(&mut adapter, 20060), vec![Action::Pause]);
        assert_eq!(actions(&mut adapter, 20061), vec![Action::Resume]);
        assert!(actions(&mut adapter, 12345).is_empty());
    }

    #[test]
    fn test_heartbeat_and_pong() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        let translation = adapter.process(r#"[17,"hb"]"#, 1);
        assert_eq!(translation.outcome, Outcome::Handled(EventKind::Heartbeat));

        let translation = adapter.process(r#"{"event":"pong","ts":1511545528111,"cid":1234}"#, 1);
        assert_eq!(translation.actions, vec![Action::Pong]);
        assert_eq!(
            adapter.keepalive(),
            Keepalive::Command(r#"{"event":"ping"}"#.to_string())
        );
    }

    #[test]
    fn test_unknown_channel_is_discarded() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        assert_eq!(adapter.process(r#"[99,[1,2,3]]"#, 1).outcome, Outcome::Discarded);
    }

    #[test]
    fn test_auth_is_first_and_resigned_on_replay() {
        let adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]).with_credentials(Credentials {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        });
        let subs = adapter.subscriptions();
        assert_eq!(subs.len(), 5);
        let auth: Value = serde_json::from_str(&subs[0]).unwrap();
        assert_eq!(auth["event"], "auth");
        assert_eq!(auth["authPayload"], format!("AUTH{}", auth["authNonce"].as_str().unwrap()));

        let replayed: Value = serde_json::from_str(&adapter.replay_command(&subs[0])).unwrap();
        assert_eq!(replayed["event"], "auth");
        assert_eq!(adapter.replay_command(&subs[1]), subs[1]);
    }

    #[test]
    fn test_resume_unsubscribes_then_resubscribes() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        subscribed(&mut adapter, 17, "book");
        subscribed(&mut adapter, 5, "trades");

        let history = adapter.subscriptions();
        let commands = adapter.resume_commands(&history);
        assert_eq!(commands.len(), 2 + history.len());
        assert_eq!(commands[0], r#"{"chanId":5,"event":"unsubscribe"}"#);
        assert_eq!(commands[1], r#"{"chanId":17,"event":"unsubscribe"}"#);
        assert_eq!(&commands[2..], &history[..]);

        adapter.reset();
        assert_eq!(adapter.resume_commands(&history), history);
    }

    #[test]
    fn test_resume_skips_auth() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]).with_credentials(Credentials {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        });
        subscribed(&mut adapter, 17, "book");

        let history = adapter.subscriptions();
        let commands = adapter.resume_commands(&history);
        // One unsubscribe in, the auth command out
        assert_eq!(commands.len(), history.len());
        assert_eq!(commands[0], r#"{"chanId":17,"event":"unsubscribe"}"#);
        assert_eq!(&commands[1..], &history[1..]);
        assert!(!commands.iter().any(|c| c.contains(r#""event":"auth""#)));
    }

    #[test]
    fn test_book_prices_keep_full_precision() {
        let mut adapter = BitfinexAdapter::new(vec!["BTCUSD".to_string()]);
        subscribed(&mut adapter, 17, "book");

        let translation = adapter.process(r#"[17,[7254.123456789012345678,3,0.12345678901234567891]]"#, 1);
        let MarketEvent::Quotes(quotes) = &translation.events[0] else {
            panic!("Expected quotes");
        };
        assert_eq!(quotes[0].price, dec!(7254.123456789012345678));
        assert_eq!(quotes[0].size, dec!(0.12345678901234567891));
        assert_eq!(quotes[0].side, Side::Bid);
    }
}
