//! Data node
//!
//! Single consumer of the frame queue, running on its own thread. Every
//! well-formed frame is republished unmodified on `raw/<node>` and then on
//! the channel its type tag names.
//! When a [`BookRegistry`] is attached, book and quote frames also update the
//! composite book and its level-2 view is published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::book::{AggregatedBook, BookRegistry};
use crate::error::{MarketDataError, Result};
use crate::metrics::Metrics;
use crate::model::{tags, BookSnapshot, Candle, Quote, RawBook, Ticker, TopLevel, Trade};
use crate::publisher::{Bus, Payload};
use crate::queue::{Frame, FrameReceiver, RecvTimeoutError};

/// Topic for per-instrument channels
fn instrument_topic(channel: &str, instrument: &str, node: &str) -> String {
    format!("{}/{}/{}", channel, instrument, node)
}

/// Topic for channels not split by instrument
fn global_topic(channel: &str, node: &str) -> String {
    format!("{}/{}", channel, node)
}

/// Stops a running [`DataNode`]
#[derive(Debug, Clone)]
pub struct NodeHandle {
    running: Arc<AtomicBool>,
}

impl NodeHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct DataNode {
    name: String,
    receiver: FrameReceiver,
    bus: Arc<dyn Bus>,
    recv_timeout: Duration,
    metrics: Metrics,
    books: Option<Arc<BookRegistry>>,
    running: Arc<AtomicBool>,
}

impl DataNode {
    pub fn new(
        name: &str,
        receiver: FrameReceiver,
        bus: Arc<dyn Bus>,
        recv_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            name: name.to_string(),
            receiver,
            bus,
            recv_timeout,
            metrics,
            books: None,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Materialize composite books from book and quote frames.
    pub fn with_books(mut self, books: Arc<BookRegistry>) -> Self {
        self.books = Some(books);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            running: self.running.clone(),
        }
    }

    /// Drain the queue on a dedicated thread, publishing through the current runtime.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let runtime = Handle::try_current().map_err(|e| MarketDataError::Runtime(e.to_string()))?;
        let thread = std::thread::Builder::new()
            .name(format!("node-{}", self.name))
            .spawn(move || self.run(&runtime))
            .map_err(|e| MarketDataError::Runtime(e.to_string()))?;
        Ok(thread)
    }

    /// Drain the queue until stopped or until every sender is gone.
    ///
    /// Blocks the calling thread, which must not be a runtime worker.
    pub fn run(self, runtime: &Handle) {
        info!(node = %self.name, "Data node started");

        while self.running.load(Ordering::SeqCst) {
            match self.receiver.recv_timeout(self.recv_timeout) {
                Ok(frame) => {
                    self.update_queue_metrics();
                    runtime.block_on(self.handle_frame(frame));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!(node = %self.name, "Frame queue closed");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(node = %self.name, "Data node stopped");
    }

    fn update_queue_metrics(&self) {
        self.metrics.queue_depth.set(self.receiver.len() as i64);
        self.metrics
            .frames_dropped
            .set(i64::try_from(self.receiver.dropped()).unwrap_or(i64::MAX));
    }

    async fn handle_frame(&self, frame: Frame) {
        let parts = frame.parts();
        if parts.len() != 3 {
            let err = MarketDataError::MalformedFrame { parts: parts.len() };
            error!(node = %self.name, error = %err, "Dropping frame");
            self.metrics.malformed_frames.inc();
            return;
        }

        self.publish(&global_topic("raw", &self.name), Payload::Raw(parts.to_vec()))
            .await;

        let instrument = String::from_utf8_lossy(&parts[0]).into_owned();
        let tag = String::from_utf8_lossy(&parts[1]).into_owned();
        if let Err(e) = self.dispatch(&instrument, &tag, &parts[2]).await {
            warn!(
                node = %self.name,
                instrument = %instrument,
                tag = %tag,
                error = %e,
                "Failed to decode frame payload"
            );
        }
    }

    async fn dispatch(&self, instrument: &str, tag: &str, payload: &[u8]) -> Result<()> {
        let topic = |channel: &str| instrument_topic(channel, instrument, &self.name);

        match tag {
            tags::BOOK => {
                let snapshot: BookSnapshot = serde_json::from_slice(payload)?;
                let origin = snapshot.origin.clone().unwrap_or_else(|| self.name.clone());
                self.publish(&topic(tags::BOOK), Payload::Book(snapshot.clone()))
                    .await;
                self.aggregate(instrument, |book| book.load_snapshot(&snapshot, &origin))
                    .await;
            }
            tags::QUOTE => {
                let quotes: Vec<Quote> = serde_json::from_slice(payload)?;
                let quote_topic = topic(tags::QUOTE);
                for quote in &quotes {
                    self.publish(&quote_topic, Payload::Quote(quote.clone())).await;
                }
                self.aggregate(instrument, |book| {
                    for quote in &quotes {
                        book.apply_quote(quote);
                    }
                })
                .await;
            }
            tags::RAW_BOOK => {
                let book: RawBook = serde_json::from_slice(payload)?;
                self.publish(&topic(tags::RAW_BOOK), Payload::RawBook(book)).await;
            }
            tags::TOP_LEVEL => {
                let top: TopLevel = serde_json::from_slice(payload)?;
                self.publish(&topic(tags::TOP_LEVEL), Payload::TopLevel(top)).await;
            }
            tags::CANDLE => {
                let candle: Candle = serde_json::from_slice(payload)?;
                self.publish(&topic(tags::CANDLE), Payload::Candle(candle)).await;
            }
            tags::TICKER => {
                let ticker: Ticker = serde_json::from_slice(payload)?;
                self.publish(&topic(tags::TICKER), Payload::Ticker(ticker)).await;
            }
            tags::TRADES => {
                let trades: Vec<Trade> = serde_json::from_slice(payload)?;
                self.publish(&global_topic(tags::TRADES, &self.name), Payload::Trades(trades))
                    .await;
            }
            other => {
                debug!(node = %self.name, tag = %other, "No typed channel for tag");
            }
        }
        Ok(())
    }

    /// Apply `update` to the instrument's composite book and publish its level-2 view.
    async fn aggregate<F>(&self, instrument: &str, update: F)
    where
        F: FnOnce(&mut AggregatedBook),
    {
        let Some(books) = &self.books else {
            return;
        };

        let shared = books.book(instrument).await;
        let view = {
            let mut book = shared.lock().await;
            update(&mut book);
            book.level_two_view()
        };

        let topic = instrument_topic("AggregatedBook", instrument, &self.name);
        self.publish(&topic, Payload::AggregatedBook(view)).await;
    }

    async fn publish(&self, topic: &str, payload: Payload) {
        let result = if self.bus.publish(topic, payload).await {
            "ok"
        } else {
            "failed"
        };
        let channel = topic.split('/').next().unwrap_or(topic);
        self.metrics
            .publications
            .with_label_values(&[channel, result])
            .inc();
    }
}
