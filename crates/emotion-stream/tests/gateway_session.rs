mod support;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use emotion_stream::gateway::GatewayHandle;
use emotion_stream::{GatewayConfig, GatewayEvent, SessionSummary, StreamGateway};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use support::mock_upstream::{MockUpstreamServer, STEP_TIMEOUT};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STREAM_PATH: &str = "/api/emotion/stream";

struct TestGateway {
    addr: SocketAddr,
    handle: GatewayHandle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestGateway {
    async fn start(config: GatewayConfig) -> Self {
        support::init_tracing();
        let gateway = StreamGateway::bind(config).await.expect("gateway bind failed");
        let addr = gateway.local_addr().unwrap();
        let handle = gateway.handle();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            gateway
                .serve_with_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("gateway failed");
        });
        Self {
            addr,
            handle,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn connect(&self) -> Client {
        let (client, _) = connect_async(self.url(STREAM_PATH))
            .await
            .expect("client connect failed");
        client
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

fn gateway_config(upstream_url: String, forward_ms: u64) -> GatewayConfig {
    let mut config = GatewayConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..GatewayConfig::default()
    };
    config.upstream.url = upstream_url;
    config.forwarding.interval_ms = forward_ms;
    config.reconnect.base_delay_ms = 50;
    config.reconnect.max_delay_ms = 200;
    config
}

async fn start_upstream_or_skip(test_name: &str) -> Option<MockUpstreamServer> {
    support::init_tracing();
    match MockUpstreamServer::start().await {
        Ok(server) => Some(server),
        Err(err) => {
            eprintln!("Skipping {test_name}: unable to start mock server: {err}");
            None
        }
    }
}

async fn next_opened(events: &mut broadcast::Receiver<GatewayEvent>) -> String {
    loop {
        let event = tokio::time::timeout(STEP_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for SessionOpened")
            .expect("event channel closed");
        if let GatewayEvent::SessionOpened { session_id } = event {
            return session_id;
        }
    }
}

async fn next_closed(events: &mut broadcast::Receiver<GatewayEvent>) -> SessionSummary {
    loop {
        let event = tokio::time::timeout(STEP_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for SessionClosed")
            .expect("event channel closed");
        if let GatewayEvent::SessionClosed(summary) = event {
            return summary;
        }
    }
}

/// Next JSON text message from the gateway, skipping control frames.
async fn next_update(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(STEP_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for update")
            .expect("client stream ended")
            .expect("client stream error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("update is not JSON");
        }
    }
}

#[tokio::test]
async fn forwards_latest_frame_and_summarizes_on_stop() {
    let Some(mut upstream) = start_upstream_or_skip("forwards_latest_frame_and_summarizes_on_stop").await
    else {
        return;
    };
    let gateway = TestGateway::start(gateway_config(upstream.ws_url(), 400)).await;
    let mut events = gateway.handle.subscribe();

    let mut client = gateway.connect().await;
    let session_id = next_opened(&mut events).await;
    let mut provider = upstream.accept_connection().await;

    for frame in ["frame-1", "frame-2", "frame-3"] {
        client
            .send(Message::Binary(Bytes::from_static(frame.as_bytes())))
            .await
            .unwrap();
    }

    assert_eq!(provider.recv_frame().await, Bytes::from_static(b"frame-3"));
    assert!(
        provider.try_recv(Duration::from_millis(900)).await.is_none(),
        "older frames must never be forwarded"
    );

    provider
        .send_json(json!({"emotion": "happy", "confidence": 0.9}))
        .await;
    let update = next_update(&mut client).await;
    assert_eq!(update["type"], "emotion");
    assert_eq!(update["sessionId"], session_id.as_str());
    assert_eq!(update["emotion"], "happy");
    assert_eq!(update["confidence"], 0.9);
    assert!(update["ts"].is_i64());
    assert_eq!(update["recommendations"]["outfit"], "Bright casual outfit");

    client
        .send(Message::text(r#"{"type":"control","action":"stop"}"#))
        .await
        .unwrap();

    let summary = next_closed(&mut events).await;
    assert_eq!(summary.session_id, session_id);
    assert_eq!(summary.total_observations, 1);
    assert_eq!(summary.dominant_label, "happy");
    assert_eq!(gateway.handle.live_clients(), 0);

    let stats = gateway.handle.stats();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.frames_overwritten, 2);
    assert_eq!(stats.frames_forwarded, 1);
    assert_eq!(stats.updates_sent, 1);
}

#[tokio::test]
async fn client_close_without_results_is_neutral() {
    let Some(mut upstream) = start_upstream_or_skip("client_close_without_results_is_neutral").await
    else {
        return;
    };
    let gateway = TestGateway::start(gateway_config(upstream.ws_url(), 2_000)).await;
    let mut events = gateway.handle.subscribe();

    let mut client = gateway.connect().await;
    let session_id = next_opened(&mut events).await;
    let _provider = upstream.accept_connection().await;

    client.close(None).await.unwrap();

    let summary = next_closed(&mut events).await;
    assert_eq!(summary.session_id, session_id);
    assert_eq!(summary.total_observations, 0);
    assert_eq!(summary.dominant_label, "neutral");
}

#[tokio::test]
async fn rejects_upgrade_on_other_paths() {
    let Some(upstream) = start_upstream_or_skip("rejects_upgrade_on_other_paths").await else {
        return;
    };
    let gateway = TestGateway::start(gateway_config(upstream.ws_url(), 2_000)).await;
    let mut events = gateway.handle.subscribe();

    for path in ["/", "/api/emotion", "/api/emotion/stream/extra", "/other?x=/api/emotion/stream"] {
        assert!(
            connect_async(gateway.url(path)).await.is_err(),
            "upgrade on {path} should be refused"
        );
    }

    let rejected = tokio::time::timeout(STEP_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(rejected, GatewayEvent::UpgradeRejected { .. }));

    // Query strings on the stream path are fine.
    let (mut client, _) = connect_async(gateway.url("/api/emotion/stream?token=abc"))
        .await
        .expect("query string should be ignored");
    assert_eq!(gateway.handle.stats().rejected, 4);
    client.close(None).await.unwrap();
}

#[tokio::test]
async fn malformed_messages_do_not_end_session() {
    let Some(mut upstream) = start_upstream_or_skip("malformed_messages_do_not_end_session").await
    else {
        return;
    };
    let gateway = TestGateway::start(gateway_config(upstream.ws_url(), 200)).await;
    let mut events = gateway.handle.subscribe();

    let mut client = gateway.connect().await;
    let session_id = next_opened(&mut events).await;
    let mut provider = upstream.accept_connection().await;

    for text in [
        "not json at all",
        "[1, 2, 3]",
        r#"{"type":"dance"}"#,
        r#"{"type":"location","lat":"north"}"#,
        r#"{"type":"location","lat":40.4237,"lng":-86.9212}"#,
    ] {
        client.send(Message::text(text)).await.unwrap();
    }
    client
        .send(Message::Binary(Bytes::from_static(b"still-alive")))
        .await
        .unwrap();

    assert_eq!(provider.recv_frame().await, Bytes::from_static(b"still-alive"));

    provider.send_json(json!({"data": {"face": {"emotion": "Sad"}}})).await;
    let update = next_update(&mut client).await;
    assert_eq!(update["emotion"], "sad");
    assert_eq!(update["recommendations"]["food"], "Chocolate");

    // Unlabeled results still reach the client, as "unknown".
    provider.send_json(json!({"status": "processing"})).await;
    let update = next_update(&mut client).await;
    assert_eq!(update["emotion"], "unknown");

    let stats = gateway.handle.stats();
    assert_eq!(stats.malformed_messages, 2);
    assert_eq!(stats.ignored_messages, 2);
    assert!(gateway.handle.registry().contains(&session_id));
    assert_eq!(gateway.handle.live_clients(), 1);

    client.close(None).await.unwrap();
    let summary = next_closed(&mut events).await;
    assert_eq!(summary.total_observations, 2);
    assert_eq!(summary.dominant_label, "sad");
}

#[tokio::test]
async fn session_survives_upstream_reconnect() {
    let Some(mut upstream) = start_upstream_or_skip("session_survives_upstream_reconnect").await
    else {
        return;
    };
    let gateway = TestGateway::start(gateway_config(upstream.ws_url(), 200)).await;

    let mut client = gateway.connect().await;
    let mut first = upstream.accept_connection().await;

    client
        .send(Message::Binary(Bytes::from_static(b"before")))
        .await
        .unwrap();
    assert_eq!(first.recv_frame().await, Bytes::from_static(b"before"));

    first.force_close().await;
    let mut second = upstream.accept_connection().await;
    assert_eq!(second.index(), 1);

    client
        .send(Message::Binary(Bytes::from_static(b"after")))
        .await
        .unwrap();
    assert_eq!(second.recv_frame().await, Bytes::from_static(b"after"));

    second.send_json(json!({"emotion": "neutral"})).await;
    assert_eq!(next_update(&mut client).await["emotion"], "neutral");

    client.close(None).await.unwrap();
}

#[tokio::test]
async fn unresponsive_client_is_evicted() {
    let mut config = gateway_config("ws://127.0.0.1:9".into(), 2_000);
    config.heartbeat.interval_ms = 300;
    config.reconnect.base_delay_ms = 60_000;
    config.reconnect.max_delay_ms = 60_000;
    let gateway = TestGateway::start(config).await;
    let mut events = gateway.handle.subscribe();

    // Never polled after the handshake, so pings go unanswered.
    let _silent = gateway.connect().await;
    let silent_id = next_opened(&mut events).await;

    // Keeps reading, which answers pings.
    let mut responsive = gateway.connect().await;
    let responsive_id = next_opened(&mut events).await;
    let reader = tokio::spawn(async move {
        while let Some(Ok(_)) = responsive.next().await {}
    });

    let summary = next_closed(&mut events).await;
    assert_eq!(summary.session_id, silent_id);
    assert_eq!(summary.dominant_label, "neutral");

    tokio::time::sleep(Duration::from_millis(900)).await;
    let registry = gateway.handle.registry();
    assert!(registry.contains(&responsive_id));
    assert!(!registry.contains(&silent_id));
    assert_eq!(gateway.handle.live_clients(), 1);

    reader.abort();
}

#[tokio::test]
async fn stalled_client_is_evicted_and_torn_down() {
    let Some(mut upstream) = start_upstream_or_skip("stalled_client_is_evicted_and_torn_down").await
    else {
        return;
    };
    let mut config = gateway_config(upstream.ws_url(), 2_000);
    config.heartbeat.interval_ms = 500;
    let gateway = TestGateway::start(config).await;
    let mut events = gateway.handle.subscribe();

    // Never polled, so its receive buffer fills and gateway writes stall.
    let _stalled = gateway.connect().await;
    let session_id = next_opened(&mut events).await;
    let mut provider = upstream.accept_connection().await;

    let label = "a".repeat(256 * 1024);
    for _ in 0..200 {
        if !provider.try_send_json(json!({ "emotion": label })).await {
            break;
        }
    }

    let summary = next_closed(&mut events).await;
    assert_eq!(summary.session_id, session_id);
    assert!(!gateway.handle.registry().contains(&session_id));

    assert!(
        provider.wait_closed(STEP_TIMEOUT).await,
        "upstream connection of an evicted session must be closed"
    );
    tokio::time::timeout(STEP_TIMEOUT, async {
        while gateway.handle.stats().live > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("evicted session was never torn down");
}
