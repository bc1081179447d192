//! Prometheus metrics
//!
//! All collectors live in a registry owned by the application, so tests can
//! create as many independent sets as they like.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::Result;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Inbound messages by origin and outcome (handled, stale, discarded, desync)
    pub messages: IntCounterVec,
    /// Faults that led to a reconnect, by origin
    pub reconnects: IntCounterVec,
    /// Current connection state code by origin
    pub connection_state: IntGaugeVec,
    /// Frames pushed onto the queue by origin
    pub frames_forwarded: IntCounterVec,
    /// Frames evicted by a full queue
    pub frames_dropped: IntGauge,
    /// Frames waiting in the queue
    pub queue_depth: IntGauge,
    /// Frames rejected by the data node for having the wrong arity
    pub malformed_frames: IntCounter,
    /// Bus publications by channel and result (ok, failed)
    pub publications: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages = IntCounterVec::new(
            Opts::new("market_data_messages_total", "Inbound exchange messages"),
            &["origin", "outcome"],
        )?;
        let reconnects = IntCounterVec::new(
            Opts::new("market_data_reconnects_total", "Connection faults followed by a reconnect"),
            &["origin"],
        )?;
        let connection_state = IntGaugeVec::new(
            Opts::new("market_data_connection_state", "Connection state code"),
            &["origin"],
        )?;
        let frames_forwarded = IntCounterVec::new(
            Opts::new("market_data_frames_forwarded_total", "Frames handed to the data node"),
            &["origin"],
        )?;
        let frames_dropped = IntGauge::new(
            "market_data_frames_dropped",
            "Frames evicted from the full frame queue",
        )?;
        let queue_depth = IntGauge::new("market_data_queue_depth", "Frames waiting in the queue")?;
        let malformed_frames = IntCounter::new(
            "market_data_malformed_frames_total",
            "Frames with an unexpected number of parts",
        )?;
        let publications = IntCounterVec::new(
            Opts::new("market_data_publications_total", "Bus publications"),
            &["channel", "result"],
        )?;

        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(frames_forwarded.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(malformed_frames.clone()))?;
        registry.register(Box::new(publications.clone()))?;

        Ok(Self {
            registry,
            messages,
            reconnects,
            connection_state,
            frames_forwarded,
            frames_dropped,
            queue_depth,
            malformed_frames,
            publications,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
