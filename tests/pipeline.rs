//! End-to-end: supervisor -> frame queue -> data node -> bus

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use market_data_hub::adapter::GeminiAdapter;
use market_data_hub::connection::{
    ConnectionSettings, ConnectionState, ConnectionSupervisor, Inbound, Transport,
};
use market_data_hub::{
    frame_queue, BookRegistry, Bus, DataNode, DropPolicy, MarketDataError, Metrics, Payload,
    Result, Side,
};

/// Transport fed from a channel the test controls
struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    connects: Arc<Mutex<usize>>,
    connected: bool,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&mut self, _url: &str) -> Result<()> {
        *self.connects.lock().unwrap() += 1;
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, _payload: &str) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(MarketDataError::NotConnected)
        }
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Inbound> {
        match self.inbound.recv().await {
            Some(inbound) => Ok(inbound),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}

#[derive(Default)]
struct RecordingBus {
    published: Mutex<Vec<(String, Payload)>>,
}

impl RecordingBus {
    fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    fn find(&self, topic: &str) -> Vec<Payload> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Bus for RecordingBus {
    async fn publish(&self, topic: &str, payload: Payload) -> bool {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        true
    }
}

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        connection_timeout: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(30),
        ping_interval: Duration::from_secs(120),
        reconnect_interval: Duration::from_millis(20),
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn join_node(thread: std::thread::JoinHandle<()>) {
    tokio::task::spawn_blocking(move || thread.join())
        .await
        .unwrap()
        .expect("data node thread panicked");
}

fn text(raw: &str) -> Inbound {
    Inbound::Text(raw.to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gemini_feed_reaches_bus_and_book() {
    let metrics = Metrics::new().unwrap();
    let (sender, receiver) = frame_queue(128, DropPolicy::DropOldest);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let connects = Arc::new(Mutex::new(0));

    let transport = ChannelTransport {
        inbound: inbound_rx,
        connects: connects.clone(),
        connected: false,
    };
    let (supervisor, handle) = ConnectionSupervisor::new(
        GeminiAdapter::new("BTCUSD"),
        transport,
        settings(),
        sender,
        metrics.clone(),
    );

    let bus = Arc::new(RecordingBus::default());
    let books = Arc::new(BookRegistry::new());
    let node = DataNode::new(
        "hub",
        receiver,
        bus.clone(),
        Duration::from_millis(10),
        metrics.clone(),
    )
    .with_books(books.clone());
    let node_handle = node.handle();

    let supervisor_task = tokio::spawn(supervisor.run());
    let node_thread = node.spawn().unwrap();

    inbound_tx.send(text(r#"{"type":"update","eventId":1,"socket_sequence":0,"events":[
        {"type":"change","reason":"initial","price":"100.00","delta":"2","remaining":"2","side":"bid"},
        {"type":"change","reason":"initial","price":"101.00","delta":"1","remaining":"1","side":"ask"}]}"#)).unwrap();
    inbound_tx.send(text(r#"{"type":"update","eventId":2,"socket_sequence":1,"timestampms":1700000000000,"events":[
        {"type":"change","reason":"place","price":"100.00","delta":"1","remaining":"3","side":"bid"}]}"#)).unwrap();
    inbound_tx.send(text(r#"{"type":"heartbeat","socket_sequence":2}"#)).unwrap();
    inbound_tx.send(text(r#"{"type":"update","eventId":3,"socket_sequence":3,"timestampms":1700000000001,"events":[
        {"type":"trade","tid":77,"price":"101.00","amount":"0.5","makerSide":"ask"}]}"#)).unwrap();

    wait_for(|| bus.topics().iter().any(|t| t == "Trades/hub")).await;

    assert_eq!(
        bus.topics(),
        vec![
            "raw/hub",
            "Book/BTCUSD/hub",
            "AggregatedBook/BTCUSD/hub",
            "raw/hub",
            "Quote/BTCUSD/hub",
            "AggregatedBook/BTCUSD/hub",
            "raw/hub",
            "Trades/hub",
        ]
    );

    match &bus.find("Trades/hub")[0] {
        Payload::Trades(trades) => {
            assert_eq!(trades[0].price, dec!(101));
            assert_eq!(trades[0].side, Side::Bid);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    {
        let book = books.get("BTCUSD").await.unwrap();
        let book = book.lock().await;
        assert_eq!(book.best_bid(), Some(dec!(100)));
        assert_eq!(book.level(Side::Bid, dec!(100)).unwrap().level_size(), dec!(3));
        assert_eq!(book.best_ask(), Some(dec!(101)));
    }

    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(*connects.lock().unwrap(), 1);

    handle.stop();
    supervisor_task.await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);

    node_handle.stop();
    join_node(node_thread).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sequence_gap_reconnects_once() {
    let metrics = Metrics::new().unwrap();
    let (sender, receiver) = frame_queue(128, DropPolicy::DropOldest);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let connects = Arc::new(Mutex::new(0));

    let transport = ChannelTransport {
        inbound: inbound_rx,
        connects: connects.clone(),
        connected: false,
    };
    let (supervisor, handle) = ConnectionSupervisor::new(
        GeminiAdapter::new("BTCUSD"),
        transport,
        settings(),
        sender,
        metrics.clone(),
    );
    let bus = Arc::new(RecordingBus::default());
    let node = DataNode::new("hub", receiver, bus.clone(), Duration::from_millis(10), metrics.clone());
    let node_handle = node.handle();

    let supervisor_task = tokio::spawn(supervisor.run());
    let node_thread = node.spawn().unwrap();

    inbound_tx.send(text(r#"{"type":"heartbeat","socket_sequence":41}"#)).unwrap();
    inbound_tx.send(text(r#"{"type":"heartbeat","socket_sequence":42}"#)).unwrap();
    inbound_tx.send(text(r#"{"type":"update","eventId":9,"socket_sequence":44,"events":[
        {"type":"change","reason":"place","price":"100.00","delta":"1","remaining":"1","side":"bid"}]}"#)).unwrap();

    wait_for(|| *connects.lock().unwrap() == 2).await;
    wait_for(|| handle.state() == ConnectionState::Connected).await;

    assert_eq!(metrics.reconnects.with_label_values(&["gemini"]).get(), 1);
    // The out-of-order update never reached the bus
    assert!(bus.topics().is_empty());

    handle.stop();
    supervisor_task.await.unwrap();
    node_handle.stop();
    join_node(node_thread).await;
}
