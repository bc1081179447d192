//! Canonical market data types
//!
//! Every exchange adapter translates its wire format into these structures.
//! Prices and sizes are decimals serialized as strings; timestamps are
//! milliseconds since the Unix epoch.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MarketDataError, Result};
use crate::queue::Frame;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Parse the various spellings exchanges use for a side.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "bid" | "bids" | "buy" | "b" => Ok(Side::Bid),
            "ask" | "asks" | "sell" | "s" | "offer" => Ok(Side::Ask),
            other => Err(MarketDataError::Decode(format!("unknown side `{}`", other))),
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Normalize a venue-specific pair name (`tBTCUSD`, `BTC-USD`, `btcusd`) to `BTCUSD`.
pub fn canonical_instrument(raw: &str) -> String {
    let trimmed = match raw.strip_prefix('t') {
        // Bitfinex trading pairs carry a lowercase `t` prefix.
        Some(rest) if rest.chars().next().map_or(false, |c| c.is_ascii_uppercase()) => rest,
        _ => raw,
    };
    trimmed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// A created, modified or removed resting quote
///
/// `size == 0` marks a deletion. Filled and cancelled quotes are not
/// distinguished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub sequence: Option<u64>,
    pub timestamp: u64,
}

impl Quote {
    pub fn new(instrument: &str, price: Decimal, size: Decimal, side: Side, timestamp: u64) -> Self {
        Self {
            instrument: instrument.to_string(),
            price,
            size,
            side,
            origin: None,
            order_id: None,
            sequence: None,
            timestamp,
        }
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn is_deletion(&self) -> bool {
        self.size.is_zero()
    }
}

/// One `(price, size, timestamp)` row of a level-2 book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookEntry {
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp: u64,
}

impl BookEntry {
    pub fn new(price: Decimal, size: Decimal, timestamp: u64) -> Self {
        Self { price, size, timestamp }
    }
}

/// Full replacement of one or both sides of a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub instrument: String,
    #[serde(default)]
    pub origin: Option<String>,
    /// Sorted by price descending
    pub bids: Vec<BookEntry>,
    /// Sorted by price ascending
    pub asks: Vec<BookEntry>,
    pub timestamp: u64,
}

impl BookSnapshot {
    /// Build a snapshot, ordering bids best-first (descending) and asks ascending.
    pub fn new(
        instrument: &str,
        mut bids: Vec<BookEntry>,
        mut asks: Vec<BookEntry>,
        timestamp: u64,
    ) -> Self {
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        Self {
            instrument: instrument.to_string(),
            origin: None,
            bids,
            asks,
            timestamp,
        }
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    /// Snapshot rows as quotes, bids first.
    pub fn quotes(&self) -> impl Iterator<Item = Quote> + '_ {
        let bids = self.bids.iter().map(move |e| (Side::Bid, e));
        let asks = self.asks.iter().map(move |e| (Side::Ask, e));
        bids.chain(asks).map(move |(side, entry)| Quote {
            instrument: self.instrument.clone(),
            price: entry.price,
            size: entry.size,
            side,
            origin: self.origin.clone(),
            order_id: None,
            sequence: None,
            timestamp: entry.timestamp,
        })
    }
}

/// One resting order of a level-3 book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBookEntry {
    pub price: Decimal,
    pub size: Decimal,
    pub order_id: String,
    pub timestamp: u64,
}

/// Level-3 book snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBook {
    pub instrument: String,
    pub bids: Vec<RawBookEntry>,
    pub asks: Vec<RawBookEntry>,
    pub timestamp: u64,
}

/// Best bid and ask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopLevel {
    pub instrument: String,
    pub bid: BookEntry,
    pub ask: BookEntry,
    pub timestamp: u64,
}

/// An executed trade. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    #[serde(default)]
    pub trade_id: Option<String>,
    #[serde(default)]
    pub sequence: Option<u64>,
    pub timestamp: u64,
}

/// OHLC candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    #[serde(default)]
    pub interval: Option<String>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub timestamp: u64,
}

/// Rolling ticker statistics; venues fill what they provide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub instrument: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub timestamp: u64,
}

/// Canonical event produced by an exchange adapter
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Book(BookSnapshot),
    RawBook(RawBook),
    TopLevel(TopLevel),
    Quotes(Vec<Quote>),
    Trades(Vec<Trade>),
    Candle(Candle),
    Ticker(Ticker),
}

/// Type tags carried in the second frame part
pub mod tags {
    pub const BOOK: &str = "Book";
    pub const RAW_BOOK: &str = "RawBook";
    pub const TOP_LEVEL: &str = "TopLevel";
    pub const QUOTE: &str = "Quote";
    pub const TRADES: &str = "Trades";
    pub const CANDLE: &str = "Candle";
    pub const TICKER: &str = "Ticker";
}

impl MarketEvent {
    pub fn instrument(&self) -> &str {
        match self {
            MarketEvent::Book(b) => &b.instrument,
            MarketEvent::RawBook(b) => &b.instrument,
            MarketEvent::TopLevel(t) => &t.instrument,
            MarketEvent::Quotes(q) => q.first().map_or("", |q| q.instrument.as_str()),
            MarketEvent::Trades(t) => t.first().map_or("", |t| t.instrument.as_str()),
            MarketEvent::Candle(c) => &c.instrument,
            MarketEvent::Ticker(t) => &t.instrument,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            MarketEvent::Book(_) => tags::BOOK,
            MarketEvent::RawBook(_) => tags::RAW_BOOK,
            MarketEvent::TopLevel(_) => tags::TOP_LEVEL,
            MarketEvent::Quotes(_) => tags::QUOTE,
            MarketEvent::Trades(_) => tags::TRADES,
            MarketEvent::Candle(_) => tags::CANDLE,
            MarketEvent::Ticker(_) => tags::TICKER,
        }
    }

    /// Serialize into an `[instrument, type_tag, payload]` frame.
    pub fn to_frame(&self, received_at: u64) -> Result<Frame> {
        let payload = match self {
            MarketEvent::Book(b) => serde_json::to_vec(b),
            MarketEvent::RawBook(b) => serde_json::to_vec(b),
            MarketEvent::TopLevel(t) => serde_json::to_vec(t),
            MarketEvent::Quotes(q) => serde_json::to_vec(q),
            MarketEvent::Trades(t) => serde_json::to_vec(t),
            MarketEvent::Candle(c) => serde_json::to_vec(c),
            MarketEvent::Ticker(t) => serde_json::to_vec(t),
        }
        .map_err(|e| MarketDataError::Serialization(e.to_string()))?;

        Ok(Frame::new(self.instrument(), self.type_tag(), payload, received_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_parsing() {
        assert_eq!(Side::parse("buy").unwrap(), Side::Bid);
        assert_eq!(Side::parse("Sell").unwrap(), Side::Ask);
        assert_eq!(Side::parse("bid").unwrap(), Side::Bid);
        assert!(Side::parse("sideways").is_err());
    }

    #[test]
    fn test_canonical_instrument() {
        assert_eq!(canonical_instrument("tBTCUSD"), "BTCUSD");
        assert_eq!(canonical_instrument("BTC-USD"), "BTCUSD");
        assert_eq!(canonical_instrument("btcusd"), "BTCUSD");
        assert_eq!(canonical_instrument("ETH_BTC"), "ETHBTC");
    }

    #[test]
    fn test_snapshot_ordering() {
        let snapshot = BookSnapshot::new(
            "BTCUSD",
            vec![
                BookEntry::new(dec!(99), dec!(1), 1),
                BookEntry::new(dec!(100), dec!(2), 1),
            ],
            vec![
                BookEntry::new(dec!(102), dec!(1), 1),
                BookEntry::new(dec!(101), dec!(3), 1),
            ],
            1,
        );
        assert_eq!(snapshot.bids[0].price, dec!(100));
        assert_eq!(snapshot.asks[0].price, dec!(101));
    }

    #[test]
    fn test_prices_serialize_as_strings() {
        let quote = Quote::new("BTCUSD", dec!(100.10), dec!(0.5), Side::Bid, 7).with_origin("gemini");
        let json = serde_json::to_value(&quote).unwrap();
        assert_eq!(json["price"], "100.10");
        assert_eq!(json["size"], "0.5");
        assert_eq!(json["side"], "bid");
    }

    #[test]
    fn test_event_frame_parts() {
        let event = MarketEvent::Quotes(vec![Quote::new("ETHUSD", dec!(1), dec!(0), Side::Ask, 3)]);
        let frame = event.to_frame(10).unwrap();
        assert_eq!(frame.parts().len(), 3);
        assert_eq!(&frame.parts()[0][..], b"ETHUSD");
        assert_eq!(&frame.parts()[1][..], b"Quote");
        let decoded: Vec<Quote> = serde_json::from_slice(&frame.parts()[2]).unwrap();
        assert!(decoded[0].is_deletion());
    }
}
