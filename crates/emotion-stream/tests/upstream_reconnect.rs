mod support;

use std::time::Duration;

use bytes::Bytes;
use emotion_stream::config::{FrameEncoding, ReconnectConfig, UpstreamConfig};
use emotion_stream::{ConnectionState, UpstreamClient};
use serde_json::json;

use support::mock_upstream::{MockUpstreamServer, STEP_TIMEOUT};

fn upstream_config(url: String) -> UpstreamConfig {
    UpstreamConfig {
        url,
        ..UpstreamConfig::default()
    }
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        base_delay_ms: 20,
        max_delay_ms: 100,
    }
}

async fn start_server_or_skip(test_name: &str) -> Option<MockUpstreamServer> {
    support::init_tracing();
    match MockUpstreamServer::start().await {
        Ok(server) => Some(server),
        Err(err) => {
            eprintln!("Skipping {test_name}: unable to start mock server: {err}");
            None
        }
    }
}

async fn wait_open(client: &UpstreamClient) {
    let mut states = client.state_changes();
    tokio::time::timeout(STEP_TIMEOUT, states.wait_for(ConnectionState::is_open))
        .await
        .expect("upstream never opened")
        .expect("upstream state channel closed");
}

#[tokio::test]
async fn reconnects_after_provider_drops_connection() {
    let Some(mut server) = start_server_or_skip("reconnects_after_provider_drops_connection").await
    else {
        return;
    };

    let (mut client, mut results) =
        UpstreamClient::spawn("test", upstream_config(server.ws_url()), &fast_reconnect());

    let mut first = server.accept_connection().await;
    assert_eq!(first.index(), 0);
    wait_open(&client).await;

    assert!(client.send(Bytes::from_static(b"frame-1")));
    assert_eq!(first.recv_frame().await, Bytes::from_static(b"frame-1"));

    first.force_close().await;

    let mut second = server.accept_connection().await;
    assert_eq!(second.index(), 1);
    wait_open(&client).await;
    assert_eq!(client.reconnect_attempts(), 1);

    assert!(client.send(Bytes::from_static(b"frame-2")));
    assert_eq!(second.recv_frame().await, Bytes::from_static(b"frame-2"));

    second.send_json(json!({"emotion": "sad", "confidence": 0.7})).await;
    let observation = tokio::time::timeout(STEP_TIMEOUT, results.recv())
        .await
        .expect("no result delivered")
        .expect("result channel closed");
    assert_eq!(observation.label, "sad");
    assert_eq!(observation.confidence, Some(0.7));

    client.close().await;
}

#[tokio::test]
async fn voluntary_close_does_not_reconnect() {
    let Some(mut server) = start_server_or_skip("voluntary_close_does_not_reconnect").await else {
        return;
    };

    let (mut client, _results) =
        UpstreamClient::spawn("test", upstream_config(server.ws_url()), &fast_reconnect());
    let _connection = server.accept_connection().await;
    wait_open(&client).await;

    client.close().await;

    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(!client.is_open());
    assert!(!client.send(Bytes::from_static(b"late")));
    assert!(
        server
            .try_accept_connection(Duration::from_millis(300))
            .await
            .is_none(),
        "client reconnected after a voluntary close"
    );
    assert_eq!(client.reconnect_attempts(), 0);
}

#[tokio::test]
async fn non_json_and_unlabeled_results() {
    let Some(mut server) = start_server_or_skip("non_json_and_unlabeled_results").await else {
        return;
    };

    let (mut client, mut results) =
        UpstreamClient::spawn("test", upstream_config(server.ws_url()), &fast_reconnect());
    let connection = server.accept_connection().await;
    wait_open(&client).await;

    connection.send_raw("definitely not json").await;
    connection.send_json(json!({"status": "ok"})).await;
    connection
        .send_json(json!({"face": {"predictions": [{"emotions": [
            {"name": "Joy", "score": 0.2},
            {"name": "Anger", "score": 0.6}
        ]}]}}))
        .await;

    // The non-JSON payload is dropped; the unlabeled one becomes "unknown".
    let first = tokio::time::timeout(STEP_TIMEOUT, results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.is_unknown());

    let second = tokio::time::timeout(STEP_TIMEOUT, results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.label, "anger");

    assert!(client.is_open(), "bad payloads must not drop the connection");
    client.close().await;
}

#[tokio::test]
async fn bearer_header_only_when_key_configured() {
    let Some(mut server) = start_server_or_skip("bearer_header_only_when_key_configured").await
    else {
        return;
    };

    let mut config = upstream_config(server.ws_url());
    config.api_key = Some("secret-key".into());
    let (mut with_key, _results) = UpstreamClient::spawn("keyed", config, &fast_reconnect());
    let connection = server.accept_connection().await;
    assert_eq!(connection.authorization(), Some("Bearer secret-key"));
    with_key.close().await;

    let (mut without_key, _results) =
        UpstreamClient::spawn("anonymous", upstream_config(server.ws_url()), &fast_reconnect());
    let connection = server.accept_connection().await;
    assert_eq!(connection.authorization(), None);
    without_key.close().await;
}

#[tokio::test]
async fn base64_json_frame_encoding() {
    let Some(mut server) = start_server_or_skip("base64_json_frame_encoding").await else {
        return;
    };

    let mut config = upstream_config(server.ws_url());
    config.frame_encoding = FrameEncoding::Base64Json;
    let (mut client, _results) = UpstreamClient::spawn("test", config, &fast_reconnect());
    let mut connection = server.accept_connection().await;
    wait_open(&client).await;

    assert!(client.send(Bytes::from_static(b"abc")));
    let envelope = connection.recv_text().await;
    assert_eq!(envelope["data"], "YWJj");
    assert!(envelope["models"]["face"].is_object());

    client.close().await;
}
