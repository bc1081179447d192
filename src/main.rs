//! Market Data Hub
//!
//! Runs one supervised websocket connection per configured exchange (per pair
//! for Gemini), a data node draining their frames onto the bus, and a small
//! HTTP server for health checks and metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_data_hub::adapter::{
    BinanceAdapter, BitfinexAdapter, CoinbaseAdapter, Exchange, ExchangeAdapter, GeminiAdapter,
};
use market_data_hub::connection::{
    ConnectionSettings, ConnectionState, ConnectionSupervisor, SupervisorHandle, WsTransport,
};
use market_data_hub::{
    frame_queue, BookRegistry, Bus, Config, DataNode, FrameSender, IpcPublisher, LogBus, Metrics,
};

/// Time allowed for tasks to wind down after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared with the HTTP handlers
#[derive(Clone)]
struct AppState {
    node_name: String,
    metrics: Metrics,
    connections: Vec<(String, watch::Receiver<ConnectionState>)>,
}

/// Supervisor handles and tasks
#[derive(Default)]
struct Connections {
    handles: Vec<(String, SupervisorHandle)>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connections {
    fn spawn<A: ExchangeAdapter>(
        &mut self,
        adapter: A,
        settings: ConnectionSettings,
        sender: FrameSender,
        metrics: Metrics,
    ) {
        let label = format!("{}:{}", adapter.exchange(), adapter.endpoint());
        let (supervisor, handle) =
            ConnectionSupervisor::new(adapter, WsTransport::new(), settings, sender, metrics);
        self.tasks.push(tokio::spawn(supervisor.run()));
        self.handles.push((label, handle));
    }

    fn stop(&self) {
        for (_, handle) in &self.handles {
            handle.stop();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Market Data Hub");

    // Load configuration; invalid settings are fatal
    let config = Config::load()?;
    config.validate()?;
    let exchanges = config.exchanges()?;
    info!(
        node = %config.node_name,
        exchanges = ?exchanges,
        pairs = ?config.pairs,
        "Configuration loaded"
    );

    let metrics = Metrics::new()?;
    let (sender, receiver) = frame_queue(config.queue_capacity, config.backpressure);

    let bus: Arc<dyn Bus> = match &config.ipc_socket_path {
        Some(path) => Arc::new(IpcPublisher::new(path, &config.node_name).await),
        None => {
            warn!("No ipc_socket_path configured, publications are only logged");
            Arc::new(LogBus)
        }
    };

    // One supervised connection per exchange
    let settings = config.connection_settings();
    let mut connections = Connections::default();
    for exchange in exchanges {
        let endpoint = config.endpoint(exchange);
        match exchange {
            Exchange::Binance => connections.spawn(
                BinanceAdapter::new(config.pairs.clone()).with_endpoint(&endpoint),
                settings,
                sender.clone(),
                metrics.clone(),
            ),
            Exchange::Bitfinex => {
                let mut adapter = BitfinexAdapter::new(config.pairs.clone()).with_endpoint(&endpoint);
                if let Some(credentials) = config.credentials() {
                    adapter = adapter.with_credentials(credentials);
                }
                connections.spawn(adapter, settings, sender.clone(), metrics.clone());
            }
            Exchange::Coinbase => connections.spawn(
                CoinbaseAdapter::new(config.pairs.clone()).with_endpoint(&endpoint),
                settings,
                sender.clone(),
                metrics.clone(),
            ),
            // Gemini serves one instrument per connection
            Exchange::Gemini => {
                for pair in &config.pairs {
                    connections.spawn(
                        GeminiAdapter::new(pair).with_endpoint(&endpoint),
                        settings,
                        sender.clone(),
                        metrics.clone(),
                    );
                }
            }
        }
    }
    // The node sees a closed queue once every supervisor has exited
    drop(sender);

    let mut node = DataNode::new(
        &config.node_name,
        receiver,
        bus,
        config.recv_timeout(),
        metrics.clone(),
    );
    if config.aggregate_books {
        node = node.with_books(Arc::new(BookRegistry::new()));
    }
    let node_handle = node.handle();
    let node_thread = node.spawn()?;

    // Start health check server
    let state = AppState {
        node_name: config.node_name.clone(),
        metrics,
        connections: connections
            .handles
            .iter()
            .map(|(label, handle)| (label.clone(), handle.state_changes()))
            .collect(),
    };
    let health_addr: SocketAddr = config.health_addr.parse()?;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr, state).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    connections.stop();
    node_handle.stop();

    for task in connections.tasks {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Task panicked"),
            Err(_) => warn!("Task did not stop within the grace period"),
        }
    }

    let node_join = tokio::task::spawn_blocking(move || node_thread.join());
    match tokio::time::timeout(SHUTDOWN_GRACE, node_join).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(_))) => error!("Data node thread panicked"),
        Ok(Err(e)) => error!(error = %e, "Failed to join data node thread"),
        Err(_) => warn!("Data node did not stop within the grace period"),
    }

    info!("Market Data Hub stopped");
    Ok(())
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connections: serde_json::Map<String, serde_json::Value> = state
        .connections
        .iter()
        .map(|(label, rx)| (label.clone(), serde_json::Value::from(rx.borrow().as_str())))
        .collect();
    let connected = state
        .connections
        .iter()
        .filter(|(_, rx)| *rx.borrow() == ConnectionState::Connected)
        .count();

    Json(serde_json::json!({
        "status": if connected > 0 { "healthy" } else { "degraded" },
        "component": state.node_name,
        "connections": connections,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.encode().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
