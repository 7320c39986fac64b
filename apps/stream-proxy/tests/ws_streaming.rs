//! WebSocket Streaming Integration Tests
//!
//! Drives the full client path over real sockets: axum server on an
//! ephemeral port, tungstenite client, ticks published on the bus.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use quantboard_stream_proxy::infrastructure::binance::{
    Ingestor, IngestorConfig, IngestorHandle, ReconnectConfig,
};
use quantboard_stream_proxy::infrastructure::ws::{WsState, router};
use quantboard_stream_proxy::{
    Bus, ChannelBus, FanoutConfig, NormalizedTick, SubscriptionManager,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    bus: Arc<ChannelBus>,
    addr: std::net::SocketAddr,
    server: tokio::task::JoinHandle<()>,
}

async fn setup(enabled: bool) -> Harness {
    let bus = Arc::new(ChannelBus::with_defaults());

    let (event_tx, _event_rx) = mpsc::channel(64);
    let ingestor = Arc::new(Ingestor::new(
        IngestorConfig {
            ws_base: "wss://stream.example.test:9443".to_string(),
            channel_prefix: "prices".to_string(),
            max_total_symbols: 100,
            reconnect: ReconnectConfig::default(),
        },
        Arc::clone(&bus) as Arc<dyn Bus>,
        vec![],
        event_tx,
        CancellationToken::new(),
    ));

    let manager = Arc::new(SubscriptionManager::new(
        Arc::clone(&bus) as Arc<dyn Bus>,
        Arc::new(IngestorHandle::new(ingestor)),
        FanoutConfig {
            channel_prefix: "prices".to_string(),
            max_symbols_per_client: 20,
            poll_timeout: Duration::from_millis(50),
            outbox_capacity: 64,
        },
        CancellationToken::new(),
    ));

    let state = Arc::new(WsState {
        manager,
        default_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        enabled,
        shutdown: CancellationToken::new(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness { bus, addr, server }
}

async fn connect(h: &Harness, query: &str) -> WsClient {
    let url = format!("ws://{}/ws/prices{query}", h.addr);
    let (client, _response) = connect_async(url).await.unwrap();
    client
}

async fn recv_json(client: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("socket error");

        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(client: &mut WsClient, text: &str) {
    client
        .send(Message::Text(text.to_string().into()))
        .await
        .unwrap();
}

async fn publish_tick(bus: &ChannelBus, symbol: &str, trade_id: u64) {
    let payload = serde_json::to_string(&NormalizedTick {
        symbol: symbol.to_string(),
        price: rust_decimal::Decimal::from(50_000_u64),
        quantity: rust_decimal::Decimal::ONE,
        exchange_time: chrono::Utc::now(),
        trade_id,
        is_buyer_maker: false,
    })
    .unwrap();

    bus.publish(&format!("prices:{symbol}"), payload)
        .await
        .unwrap();
}

fn symbols_of(frame: &serde_json::Value) -> Vec<String> {
    frame["symbols"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap().to_string())
        .collect()
}

// =============================================================================
// Connection Tests
// =============================================================================

#[tokio::test]
async fn connect_acks_requested_symbols() {
    let h = setup(true).await;
    let mut client = connect(&h, "?symbols=btcusdt,SOLUSDT").await;

    let ack = recv_json(&mut client).await;

    assert_eq!(ack["type"], "subscribed");
    assert_eq!(symbols_of(&ack), vec!["BTCUSDT", "SOLUSDT"]);

    h.server.abort();
}

#[tokio::test]
async fn connect_without_symbols_gets_defaults() {
    let h = setup(true).await;
    let mut client = connect(&h, "").await;

    let ack = recv_json(&mut client).await;

    assert_eq!(ack["type"], "subscribed");
    assert_eq!(symbols_of(&ack), vec!["BTCUSDT", "ETHUSDT"]);

    h.server.abort();
}

#[tokio::test]
async fn disabled_streaming_fails_fast_and_closes() {
    let h = setup(false).await;
    let mut client = connect(&h, "").await;

    let frame = recv_json(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "STREAMING_DISABLED");

    // The server closes right after the error frame.
    let next = timeout(RECV_TIMEOUT, client.next()).await.expect("timeout");
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        other => panic!("expected close, got {other:?}"),
    }

    h.server.abort();
}

// =============================================================================
// Delivery Tests
// =============================================================================

#[tokio::test]
async fn published_ticks_reach_the_subscribed_client() {
    let h = setup(true).await;
    let mut client = connect(&h, "?symbols=BTCUSDT").await;
    let _ack = recv_json(&mut client).await;

    publish_tick(&h.bus, "BTCUSDT", 42).await;

    let frame = recv_json(&mut client).await;
    assert_eq!(frame["type"], "price");
    assert_eq!(frame["symbol"], "BTCUSDT");
    assert_eq!(frame["trade_id"], 42);

    h.server.abort();
}

#[tokio::test]
async fn ticks_are_not_delivered_to_other_symbols_subscribers() {
    let h = setup(true).await;
    let mut watcher = connect(&h, "?symbols=ETHUSDT").await;
    let mut bystander = connect(&h, "?symbols=BTCUSDT").await;
    let _ = recv_json(&mut watcher).await;
    let _ = recv_json(&mut bystander).await;

    publish_tick(&h.bus, "ETHUSDT", 7).await;

    let frame = recv_json(&mut watcher).await;
    assert_eq!(frame["symbol"], "ETHUSDT");

    let stray = timeout(Duration::from_millis(200), bystander.next()).await;
    assert!(stray.is_err(), "bystander received a tick for a foreign symbol");

    h.server.abort();
}

// =============================================================================
// Control Message Tests
// =============================================================================

#[tokio::test]
async fn subscribe_and_unsubscribe_round_trip() {
    let h = setup(true).await;
    let mut client = connect(&h, "?symbols=BTCUSDT").await;
    let _ = recv_json(&mut client).await;

    send_json(&mut client, r#"{"type":"subscribe","symbols":["ETHUSDT"]}"#).await;
    let ack = recv_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(symbols_of(&ack), vec!["ETHUSDT"]);

    publish_tick(&h.bus, "ETHUSDT", 9).await;
    let frame = recv_json(&mut client).await;
    assert_eq!(frame["symbol"], "ETHUSDT");

    send_json(&mut client, r#"{"type":"unsubscribe","symbols":["ETHUSDT"]}"#).await;
    let ack = recv_json(&mut client).await;
    assert_eq!(ack["type"], "unsubscribed");
    assert_eq!(symbols_of(&ack), vec!["ETHUSDT"]);

    // Unsubscribed: later ETHUSDT ticks stay away.
    publish_tick(&h.bus, "ETHUSDT", 10).await;
    let stray = timeout(Duration::from_millis(200), client.next()).await;
    assert!(stray.is_err());

    h.server.abort();
}

#[tokio::test]
async fn oversized_subscribe_is_clipped_to_the_cap() {
    let h = setup(true).await;
    let requested: Vec<String> = (0..25).map(|i| format!("SYM{i:02}USDT")).collect();
    let query = format!("?symbols={}", requested.join(","));

    let mut client = connect(&h, &query).await;
    let ack = recv_json(&mut client).await;

    assert_eq!(ack["type"], "subscribed");
    assert_eq!(symbols_of(&ack).len(), 20);

    // At the cap, one more is rejected outright.
    send_json(&mut client, r#"{"type":"subscribe","symbols":["LATEUSDT"]}"#).await;
    let ack = recv_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    assert!(symbols_of(&ack).is_empty());

    h.server.abort();
}

#[tokio::test]
async fn ping_gets_pong() {
    let h = setup(true).await;
    let mut client = connect(&h, "?symbols=BTCUSDT").await;
    let _ = recv_json(&mut client).await;

    send_json(&mut client, r#"{"type":"ping"}"#).await;

    let frame = recv_json(&mut client).await;
    assert_eq!(frame["type"], "pong");

    h.server.abort();
}

#[tokio::test]
async fn malformed_requests_get_error_frames() {
    let h = setup(true).await;
    let mut client = connect(&h, "?symbols=BTCUSDT").await;
    let _ = recv_json(&mut client).await;

    send_json(&mut client, "{not json").await;
    let frame = recv_json(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "INVALID_JSON");

    send_json(&mut client, r#"{"type":"subscribe","symbols":"BTCUSDT"}"#).await;
    let frame = recv_json(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "INVALID_SYMBOLS");

    h.server.abort();
}

// =============================================================================
// Disconnect Tests
// =============================================================================

#[tokio::test]
async fn client_disconnect_releases_its_subscriptions() {
    let h = setup(true).await;
    let mut client = connect(&h, "?symbols=BTCUSDT").await;
    let _ = recv_json(&mut client).await;
    assert_eq!(h.bus.subscriber_count("prices:BTCUSDT"), 1);

    client.close(None).await.unwrap();

    timeout(RECV_TIMEOUT, async {
        loop {
            if h.bus.subscriber_count("prices:BTCUSDT") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("bus subscription was never released");

    h.server.abort();
}
