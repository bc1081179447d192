//! Bounded frame queue between connection tasks and the data node
//!
//! Connections push `[instrument, type_tag, payload]` frames in arrival order;
//! the single consumer drains them FIFO on its own thread. When the consumer
//! falls behind, the configured [`DropPolicy`] decides between evicting the
//! oldest frame (logged) and making the producer wait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use serde::Deserialize;
use tracing::warn;

pub use crossbeam_channel::RecvTimeoutError;

/// How long a blocked producer waits before rechecking the consumer
const BLOCKED_SEND_POLL: Duration = Duration::from_millis(100);

/// Multipart message handed from a connection to the data node
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    parts: Vec<Bytes>,
    received_at: u64,
}

impl Frame {
    pub fn new(instrument: &str, type_tag: &str, payload: Vec<u8>, received_at: u64) -> Self {
        Self {
            parts: vec![
                Bytes::copy_from_slice(instrument.as_bytes()),
                Bytes::copy_from_slice(type_tag.as_bytes()),
                Bytes::from(payload),
            ],
            received_at,
        }
    }

    /// Build a frame from arbitrary parts; arity is checked by the consumer.
    pub fn from_parts(parts: Vec<Bytes>, received_at: u64) -> Self {
        Self { parts, received_at }
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn received_at(&self) -> u64 {
        self.received_at
    }
}

/// What a full queue does with a new frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued frame and log a warning.
    #[default]
    DropOldest,
    /// Wait until the consumer frees a slot.
    Block,
}

/// Error returned by [`FrameSender::push`] once the receiver is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// Create a queue holding at most `capacity` frames.
pub fn frame_queue(capacity: usize, policy: DropPolicy) -> (FrameSender, FrameReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let receiver_alive = Arc::new(AtomicBool::new(true));
    (
        FrameSender {
            tx,
            evict: rx.clone(),
            policy,
            capacity,
            dropped: dropped.clone(),
            receiver_alive: receiver_alive.clone(),
        },
        FrameReceiver {
            rx,
            dropped,
            receiver_alive,
        },
    )
}

/// Producer half; clone one per connection
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: Sender<Frame>,
    // Eviction handle for DropOldest. It keeps the channel open after the
    // consumer is dropped, so liveness is tracked by `receiver_alive`.
    evict: Receiver<Frame>,
    policy: DropPolicy,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    receiver_alive: Arc<AtomicBool>,
}

impl FrameSender {
    /// Enqueue a frame according to the drop policy.
    pub async fn push(&self, frame: Frame) -> Result<(), QueueClosed> {
        let mut frame = frame;
        loop {
            if !self.receiver_alive.load(Ordering::SeqCst) {
                return Err(QueueClosed);
            }

            match self.tx.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(QueueClosed),
                Err(TrySendError::Full(rejected)) => match self.policy {
                    DropPolicy::DropOldest => {
                        if self.evict.try_recv().is_ok() {
                            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!(
                                capacity = self.capacity,
                                dropped_total = dropped,
                                "Frame queue full, dropped oldest frame"
                            );
                        }
                        frame = rejected;
                    }
                    DropPolicy::Block => return self.push_blocking(rejected).await,
                },
            }
        }
    }

    /// Wait for a free slot off the async runtime.
    async fn push_blocking(&self, frame: Frame) -> Result<(), QueueClosed> {
        let tx = self.tx.clone();
        let receiver_alive = self.receiver_alive.clone();

        let send = tokio::task::spawn_blocking(move || {
            let mut frame = frame;
            loop {
                if !receiver_alive.load(Ordering::SeqCst) {
                    return Err(QueueClosed);
                }
                match tx.send_timeout(frame, BLOCKED_SEND_POLL) {
                    Ok(()) => return Ok(()),
                    Err(SendTimeoutError::Timeout(rejected)) => frame = rejected,
                    Err(SendTimeoutError::Disconnected(_)) => return Err(QueueClosed),
                }
            }
        });

        send.await.unwrap_or(Err(QueueClosed))
    }

    /// Frames evicted so far under [`DropPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half
#[derive(Debug)]
pub struct FrameReceiver {
    rx: Receiver<Frame>,
    dropped: Arc<AtomicU64>,
    receiver_alive: Arc<AtomicBool>,
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.receiver_alive.store(false, Ordering::SeqCst);
    }
}

impl FrameReceiver {
    /// Take the next frame without waiting.
    pub fn try_recv(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Block the calling thread up to `timeout` for the next frame.
    ///
    /// Returns `Disconnected` once every sender is gone and the queue is drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Frames evicted so far under [`DropPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
