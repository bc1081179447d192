//! Composite order book across origins
//!
//! Uses BTreeMap for efficient sorted price level management.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::Serialize;

use super::level::{origin_of, AggregatedBookLevel};
use crate::model::{BookEntry, BookSnapshot, Quote, Side};

/// Level-2 view: aggregated size per price
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelTwoView {
    pub instrument: String,
    /// Sorted by price descending
    pub bids: Vec<BookEntry>,
    /// Sorted by price ascending
    pub asks: Vec<BookEntry>,
    pub timestamp: u64,
}

/// Best bid and ask levels
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopOfBook {
    pub instrument: String,
    pub bid: BookEntry,
    pub ask: BookEntry,
    pub timestamp: u64,
}

impl TopOfBook {
    /// Get mid price
    pub fn mid_price(&self) -> Decimal {
        (self.bid.price + self.ask.price) / Decimal::from(2)
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        let mid = self.mid_price();
        if mid > Decimal::ZERO {
            Some((self.ask.price - self.bid.price) / mid * Decimal::from(10000))
        } else {
            None
        }
    }
}

/// Order book for a single instrument, merged over every origin
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedBook {
    instrument: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, AggregatedBookLevel>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, AggregatedBookLevel>,
    /// Timestamp of last update
    timestamp: u64,
}

impl AggregatedBook {
    pub fn new(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            timestamp: 0,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Replace `origin`'s entries at every price the snapshot mentions.
    ///
    /// Levels the snapshot does not mention keep whatever `origin` had there.
    pub fn load_snapshot(&mut self, snapshot: &BookSnapshot, origin: &str) {
        for mut quote in snapshot.quotes() {
            quote.origin = Some(origin.to_string());
            self.apply_quote(&quote);
        }
        self.timestamp = self.timestamp.max(snapshot.timestamp);
    }

    pub fn apply_quote(&mut self, quote: &Quote) {
        match quote.side {
            Side::Bid => apply_to_side(&mut self.bids, Reverse(quote.price), quote),
            Side::Ask => apply_to_side(&mut self.asks, quote.price, quote),
        }
        self.timestamp = self.timestamp.max(quote.timestamp);
    }

    pub fn level_two_view(&self) -> LevelTwoView {
        let entry = |level: &AggregatedBookLevel| {
            BookEntry::new(level.price(), level.level_size(), level.timestamp())
        };
        LevelTwoView {
            instrument: self.instrument.clone(),
            bids: self.bids.values().map(entry).collect(),
            asks: self.asks.values().map(entry).collect(),
            timestamp: self.timestamp,
        }
    }

    /// Best bid and ask, or `None` while either side is empty.
    pub fn top_of_book(&self) -> Option<TopOfBook> {
        let bid = self.bids.values().next()?;
        let ask = self.asks.values().next()?;
        Some(TopOfBook {
            instrument: self.instrument.clone(),
            bid: BookEntry::new(bid.price(), bid.level_size(), bid.timestamp()),
            ask: BookEntry::new(ask.price(), ask.level_size(), ask.timestamp()),
            timestamp: self.timestamp,
        })
    }

    pub fn level(&self, side: Side, price: Decimal) -> Option<&AggregatedBookLevel> {
        match side {
            Side::Bid => self.bids.get(&Reverse(price)),
            Side::Ask => self.asks.get(&price),
        }
    }

    /// Largest resting quote at a price, used to attribute liquidity to a venue.
    pub fn tallest_order_at(&self, side: Side, price: Decimal) -> Option<&Quote> {
        self.level(side, price)?.tallest_order()
    }

    /// Every origin with at least one resting quote
    pub fn origins(&self) -> BTreeSet<String> {
        self.bids
            .values()
            .chain(self.asks.values())
            .flat_map(|level| level.quotes().iter().map(|q| origin_of(q).to_string()))
            .collect()
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

fn apply_to_side<K: Ord>(side: &mut BTreeMap<K, AggregatedBookLevel>, key: K, quote: &Quote) {
    if quote.is_deletion() {
        if let Some(level) = side.get_mut(&key) {
            level.apply(quote);
            if level.is_empty() {
                side.remove(&key);
            }
        }
        return;
    }
    side.entry(key)
        .or_insert_with(|| AggregatedBookLevel::new(quote.price))
        .apply(quote);
}
