//! Market Data Hub Library
//!
//! Connects to exchange websocket feeds, normalizes every venue's wire format
//! into canonical market events, aggregates order books across venues and
//! republishes everything on a topic-based bus.

pub mod adapter;
pub mod book;
pub mod config;
pub mod connection;
pub mod decimal;
pub mod error;
pub mod metrics;
pub mod model;
pub mod node;
pub mod publisher;
pub mod queue;

pub use adapter::{Exchange, ExchangeAdapter};
pub use book::{AggregatedBook, AggregatedBookLevel, BookRegistry};
pub use config::Config;
pub use connection::{ConnectionSettings, ConnectionState, ConnectionSupervisor, SupervisorHandle};
pub use error::{MarketDataError, Result};
pub use metrics::Metrics;
pub use model::{BookSnapshot, MarketEvent, Quote, Side, Trade};
pub use node::{DataNode, NodeHandle};
pub use publisher::{Bus, IpcPublisher, LogBus, Payload};
pub use queue::{frame_queue, DropPolicy, Frame, FrameReceiver, FrameSender};
