//! Per-instrument book registry
//!
//! Books are created on first use. Each book sits behind its own mutex, so
//! writers to different instruments never contend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::AggregatedBook;

pub type SharedBook = Arc<Mutex<AggregatedBook>>;

#[derive(Debug, Default)]
pub struct BookRegistry {
    books: RwLock<HashMap<String, SharedBook>>,
}

impl BookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the book for `instrument`, creating it if needed.
    pub async fn book(&self, instrument: &str) -> SharedBook {
        if let Some(book) = self.books.read().await.get(instrument) {
            return book.clone();
        }
        self.books
            .write()
            .await
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AggregatedBook::new(instrument))))
            .clone()
    }

    pub async fn get(&self, instrument: &str) -> Option<SharedBook> {
        self.books.read().await.get(instrument).cloned()
    }

    /// Get all tracked instruments
    pub async fn instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.books.read().await.keys().cloned().collect();
        instruments.sort();
        instruments
    }

    pub async fn len(&self) -> usize {
        self.books.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Quote, Side};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_books_created_once() {
        let registry = BookRegistry::new();
        assert!(registry.get("BTCUSD").await.is_none());

        let first = registry.book("BTCUSD").await;
        first
            .lock()
            .await
            .apply_quote(&Quote::new("BTCUSD", dec!(1), dec!(1), Side::Bid, 1));
        let second = registry.book("BTCUSD").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.best_bid(), Some(dec!(1)));
        registry.book("ETHUSD").await;
        assert_eq!(registry.instruments().await, vec!["BTCUSD", "ETHUSD"]);
        assert_eq!(registry.len().await, 2);
    }
}
