//! Connection supervisor
//!
//! Drives one adapter over one transport: connects, subscribes, feeds inbound
//! messages through the adapter and forwards the resulting frames. Silence,
//! missing pongs, transport errors and adapter desyncs are all faults; every
//! fault closes the transport and reconnects after a fixed delay, replaying
//! the recorded subscription history.

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{ConnectionSettings, ConnectionState, Inbound, Timer, Transport};
use crate::adapter::{Action, ExchangeAdapter, Keepalive, Outcome};
use crate::decimal::now_millis;
use crate::error::{MarketDataError, Result};
use crate::metrics::Metrics;
use crate::model::MarketEvent;
use crate::queue::FrameSender;

/// Control side of a running supervisor
///
/// Dropping the handle stops the supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<String>,
}

impl SupervisorHandle {
    /// Request a cooperative stop. The supervisor closes the transport and
    /// ends in [`ConnectionState::Disconnected`] without reconnecting.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Send a command on the connection.
    ///
    /// Commands are fire-and-forget: while the connection is not
    /// [`ConnectionState::Connected`] they are logged and dropped.
    pub fn send(&self, command: impl Into<String>) {
        if self.commands.send(command.into()).is_err() {
            debug!("Supervisor has exited, command dropped");
        }
    }
}

enum Step {
    Stop,
    Command(String),
    Inbound(Result<Inbound>),
    IdleTimeout,
    Ping,
    PongTimeout,
}

/// Why a connected session ended
enum Exit {
    Stopped,
    Fault(String),
}

pub struct ConnectionSupervisor<A: ExchangeAdapter, T: Transport> {
    adapter: A,
    transport: T,
    settings: ConnectionSettings,
    sender: FrameSender,
    metrics: Metrics,
    http: reqwest::Client,
    history: Vec<String>,
    /// Whether the adapter's initial subscriptions went out; later opens replay history.
    subscribed: bool,
    ping_timer: Timer,
    pong_timer: Timer,
    idle_timer: Timer,
    state_tx: watch::Sender<ConnectionState>,
    stop_rx: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<String>,
}

impl<A: ExchangeAdapter, T: Transport> ConnectionSupervisor<A, T> {
    pub fn new(
        adapter: A,
        transport: T,
        settings: ConnectionSettings,
        sender: FrameSender,
        metrics: Metrics,
    ) -> (Self, SupervisorHandle) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            adapter,
            transport,
            settings,
            sender,
            metrics,
            http: reqwest::Client::new(),
            history: Vec::new(),
            subscribed: false,
            ping_timer: Timer::new("ping"),
            pong_timer: Timer::new("pong"),
            idle_timer: Timer::new("idle"),
            state_tx,
            stop_rx,
            commands: command_rx,
        };
        let handle = SupervisorHandle {
            stop_tx,
            state_rx,
            commands: command_tx,
        };
        (supervisor, handle)
    }

    /// Run until stopped, reconnecting after every fault.
    pub async fn run(mut self) {
        let origin = self.adapter.exchange();
        info!(origin = %origin, endpoint = %self.adapter.endpoint(), "Starting connection supervisor");

        loop {
            if self.stop_requested() {
                break;
            }

            match self.connect().await {
                None => break,
                Some(Err(reason)) => {
                    self.fault(&reason).await;
                    if !self.backoff().await {
                        break;
                    }
                    continue;
                }
                Some(Ok(())) => {}
            }

            if let Err(e) = self.on_open().await {
                self.fault(&e.to_string()).await;
                if !self.backoff().await {
                    break;
                }
                continue;
            }

            match self.read_loop().await {
                Exit::Stopped => break,
                Exit::Fault(reason) => {
                    self.fault(&reason).await;
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        self.cancel_timers();
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!(origin = %origin, "Connection supervisor stopped");
    }

    fn stop_requested(&self) -> bool {
        // A dropped handle counts as a stop request.
        *self.stop_rx.borrow() || self.stop_rx.has_changed().is_err()
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let origin = self.adapter.exchange();
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(origin = %origin, from = %previous, to = %state, "Connection state changed");
        }
        self.metrics
            .connection_state
            .with_label_values(&[origin.as_str()])
            .set(state.code());
    }

    fn cancel_timers(&mut self) {
        self.ping_timer.cancel();
        self.pong_timer.cancel();
        self.idle_timer.cancel();
    }

    /// Connect within `connection_timeout`. `None` means a stop arrived first.
    async fn connect(&mut self) -> Option<std::result::Result<(), String>> {
        self.set_state(ConnectionState::Connecting);
        let origin = self.adapter.exchange();
        let url = self.adapter.endpoint();
        let limit = self.settings.connection_timeout;

        let connect = timeout(limit, self.transport.connect(&url));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stop_rx) => return None,
                Some(command) = self.commands.recv() => {
                    reject_command(origin.as_str(), ConnectionState::Connecting, &command);
                }
                result = &mut connect => {
                    return Some(match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(format!("connect failed: {}", e)),
                        Err(_) => Err(format!("connect timed out after {}s", limit.as_secs())),
                    });
                }
            }
        }
    }

    /// Arm timers, (re)subscribe and load REST snapshots.
    async fn on_open(&mut self) -> Result<()> {
        let origin = self.adapter.exchange();
        self.set_state(ConnectionState::Connected);
        info!(origin = %origin, "Connection established");

        self.idle_timer.start(self.settings.connection_timeout);
        if self.adapter.keepalive() != Keepalive::None {
            self.ping_timer.start(self.settings.ping_interval);
        }

        if self.subscribed {
            let history = std::mem::take(&mut self.history);
            info!(origin = %origin, commands = history.len(), "Replaying subscription history");
            for command in history {
                let command = self.adapter.replay_command(&command);
                self.send(command).await;
            }
        } else {
            for command in self.adapter.subscriptions() {
                self.send(command).await;
            }
            self.subscribed = true;
        }

        self.load_snapshots().await
    }

    async fn load_snapshots(&mut self) -> Result<()> {
        for request in self.adapter.snapshot_requests() {
            debug!(instrument = %request.instrument, url = %request.url, "Fetching REST snapshot");
            let body = self
                .http
                .get(&request.url)
                .timeout(self.settings.connection_timeout)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;

            let received_at = now_millis();
            let events = self.adapter.load_rest_snapshot(&request, &body, received_at)?;
            if !self.forward(events, received_at).await {
                return Err(MarketDataError::Ipc("frame queue closed".to_string()));
            }
        }
        Ok(())
    }

    async fn read_loop(&mut self) -> Exit {
        let origin = self.adapter.exchange();

        loop {
            let step = tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stop_rx) => Step::Stop,
                Some(command) = self.commands.recv() => Step::Command(command),
                _ = self.pong_timer.expired() => Step::PongTimeout,
                _ = self.idle_timer.expired() => Step::IdleTimeout,
                _ = self.ping_timer.expired() => Step::Ping,
                inbound = self.transport.recv() => Step::Inbound(inbound),
            };

            match step {
                Step::Stop => return Exit::Stopped,
                Step::Command(command) => {
                    self.send(command).await;
                }
                Step::IdleTimeout => {
                    let secs = self.settings.connection_timeout.as_secs();
                    return Exit::Fault(MarketDataError::ConnectionTimeout(secs).to_string());
                }
                Step::PongTimeout => {
                    let secs = self.settings.pong_timeout.as_secs();
                    return Exit::Fault(MarketDataError::PongTimeout(secs).to_string());
                }
                Step::Ping => {
                    if let Err(e) = self.send_ping().await {
                        return Exit::Fault(format!("ping failed: {}", e));
                    }
                }
                Step::Inbound(Err(e)) => return Exit::Fault(e.to_string()),
                Step::Inbound(Ok(inbound)) => {
                    self.idle_timer.start(self.settings.connection_timeout);
                    match inbound {
                        Inbound::Text(raw) => {
                            if let Some(exit) = self.handle_text(&raw).await {
                                return exit;
                            }
                        }
                        Inbound::Ping => {}
                        Inbound::Pong => {
                            debug!(origin = %origin, "Pong received");
                            self.pong_timer.cancel();
                        }
                        Inbound::Closed(reason) => {
                            return Exit::Fault(format!(
                                "closed by peer: {}",
                                reason.unwrap_or_else(|| "no reason".to_string())
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(&mut self, raw: &str) -> Option<Exit> {
        let origin = self.adapter.exchange();
        let received_at = now_millis();
        let translation = self.adapter.process(raw, received_at);

        self.metrics
            .messages
            .with_label_values(&[origin.as_str(), outcome_label(&translation.outcome)])
            .inc();

        if !self.forward(translation.events, received_at).await {
            error!(origin = %origin, "Frame queue closed, stopping connection");
            return Some(Exit::Stopped);
        }

        for action in translation.actions {
            match action {
                Action::Reconnect(reason) => return Some(Exit::Fault(reason)),
                Action::Pause => {
                    info!(origin = %origin, "Pausing connection activity");
                    self.set_state(ConnectionState::Paused);
                }
                Action::Resume => {
                    info!(origin = %origin, "Resuming connection activity");
                    self.set_state(ConnectionState::Connected);
                    for command in self.adapter.resume_commands(&self.history) {
                        if let Err(e) = self.transport.send(&command).await {
                            warn!(origin = %origin, error = %e, "Failed to resend command on resume");
                        }
                    }
                }
                Action::Pong => {
                    debug!(origin = %origin, "Pong received");
                    self.pong_timer.cancel();
                }
            }
        }
        None
    }

    async fn send_ping(&mut self) -> Result<()> {
        match self.adapter.keepalive() {
            Keepalive::None => return Ok(()),
            Keepalive::WsPing => self.transport.ping().await?,
            // Pings are not subscriptions and never enter the history.
            Keepalive::Command(command) => self.transport.send(&command).await?,
        }
        if !self.pong_timer.is_armed() {
            self.pong_timer.start(self.settings.pong_timeout);
        }
        self.ping_timer.start(self.settings.ping_interval);
        Ok(())
    }

    /// Send a command and record it for replay. Rejected unless connected.
    async fn send(&mut self, command: String) -> bool {
        let origin = self.adapter.exchange();
        let state = self.state();
        if state != ConnectionState::Connected {
            reject_command(origin.as_str(), state, &command);
            return false;
        }

        debug!(origin = %origin, command = %command, "Sending command");
        let sent = match self.transport.send(&command).await {
            Ok(()) => true,
            Err(e) => {
                // Still recorded: the next reconnect replays it.
                warn!(origin = %origin, error = %e, command = %command, "Failed to send command");
                false
            }
        };
        self.history.push(command);
        sent
    }

    /// Push canonical events onto the frame queue. `false` once the queue is closed.
    async fn forward(&mut self, events: Vec<MarketEvent>, received_at: u64) -> bool {
        let origin = self.adapter.exchange();
        for event in events {
            let frame = match event.to_frame(received_at) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(origin = %origin, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if self.sender.push(frame).await.is_err() {
                return false;
            }
            self.metrics
                .frames_forwarded
                .with_label_values(&[origin.as_str()])
                .inc();
        }
        true
    }

    async fn fault(&mut self, reason: &str) {
        let origin = self.adapter.exchange();
        warn!(origin = %origin, reason = %reason, "Connection fault, reconnecting");
        self.metrics
            .reconnects
            .with_label_values(&[origin.as_str()])
            .inc();

        self.cancel_timers();
        self.transport.close().await;
        self.adapter.reset();
        self.set_state(ConnectionState::ReconnectPending);
    }

    /// Wait `reconnect_interval`. Returns `false` if a stop arrived first.
    async fn backoff(&mut self) -> bool {
        let origin = self.adapter.exchange();
        let delay = sleep(self.settings.reconnect_interval);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stop_rx) => return false,
                Some(command) = self.commands.recv() => {
                    reject_command(origin.as_str(), ConnectionState::ReconnectPending, &command);
                }
                _ = &mut delay => return true,
            }
        }
    }
}

/// Resolve once a stop is requested or the handle is dropped.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

fn reject_command(origin: &str, state: ConnectionState, command: &str) {
    error!(origin = %origin, state = %state, command = %command, "Cannot send command, connection not ready");
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Handled(_) => "handled",
        Outcome::Stale => "stale",
        Outcome::Discarded => "discarded",
        Outcome::Desync => "desync",
    }
}
