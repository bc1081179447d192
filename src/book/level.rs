//! One price level shared by every origin quoting it

use rust_decimal::Decimal;
use serde::Serialize;

use crate::model::Quote;

/// Origin key used for quotes that do not name their venue
pub const UNKNOWN_ORIGIN: &str = "unknown";

pub(crate) fn origin_of(quote: &Quote) -> &str {
    quote.origin.as_deref().unwrap_or(UNKNOWN_ORIGIN)
}

/// Resting quotes at one price, keyed by origin
///
/// Entries keep their insertion order; `level_size` always equals the sum of
/// the entries' sizes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedBookLevel {
    price: Decimal,
    entries: Vec<Quote>,
    level_size: Decimal,
}

impl AggregatedBookLevel {
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            entries: Vec::new(),
            level_size: Decimal::ZERO,
        }
    }

    /// Insert, overwrite or (for `size == 0`) remove the quote's origin entry.
    pub fn apply(&mut self, quote: &Quote) {
        let origin = origin_of(quote);
        let existing = self.entries.iter().position(|q| origin_of(q) == origin);

        match existing {
            Some(idx) if quote.is_deletion() => {
                let removed = self.entries.remove(idx);
                self.level_size -= removed.size;
            }
            // Deleting an origin that never quoted here is a no-op.
            None if quote.is_deletion() => {}
            Some(idx) => {
                self.level_size = self.level_size - self.entries[idx].size + quote.size;
                self.entries[idx] = quote.clone();
            }
            None => {
                self.level_size += quote.size;
                self.entries.push(quote.clone());
            }
        }
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn level_size(&self) -> Decimal {
        self.level_size
    }

    /// Largest resting quote; the earliest inserted wins ties.
    pub fn tallest_order(&self) -> Option<&Quote> {
        self.entries.iter().fold(None, |best: Option<&Quote>, q| match best {
            Some(b) if b.size >= q.size => Some(b),
            _ => Some(q),
        })
    }

    pub fn quotes(&self) -> &[Quote] {
        &self.entries
    }

    pub fn get(&self, origin: &str) -> Option<&Quote> {
        self.entries.iter().find(|q| origin_of(q) == origin)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Latest timestamp among the resting quotes
    pub fn timestamp(&self) -> u64 {
        self.entries.iter().map(|q| q.timestamp).max().unwrap_or_default()
    }
}
