//! Owned, cancellable deadline timers
//!
//! Each connection keeps its own ping, pong and idle timers. A timer is just
//! an optional deadline polled from the connection's `select!` loop, so
//! cancelling it is a plain reset and can be repeated freely.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct Timer {
    name: &'static str,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            deadline: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Arm the timer, replacing any previous deadline.
    pub fn start(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    /// Disarm the timer. Cancelling a fired or never-started timer is a no-op.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve once the deadline passes, disarming the timer.
    ///
    /// Pends forever while disarmed. Dropping the future before it resolves
    /// leaves the deadline in place.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
