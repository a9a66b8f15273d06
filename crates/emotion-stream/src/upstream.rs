//! # Upstream Inference Client
//!
//! One persistent WebSocket connection to the inference provider per
//! session, hidden behind a stable interface: [`UpstreamClient::send`],
//! a results channel, and [`UpstreamClient::close`].
//!
//! ## Architecture
//!
//! A single driver task owns the socket and runs the reconnect loop:
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                  UpstreamClient                     │
//! │                                                     │
//! │  frame_tx ──► driver task ──► provider socket       │
//! │  state_rx ◄──     │   ▲                             │
//! │  closed_tx ──►    │   └── ping every ping_interval  │
//! │                   ▼                                 │
//! │  results rx ◄── normalize(provider message)         │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! When the socket drops without the owner asking for it, the driver waits
//! `min(base * 2^attempt, max)` and dials again. Setting the
//! `closed_by_owner` flag (done first thing in [`UpstreamClient::close`])
//! ends the loop instead, including a reconnect that is already waiting.
//! Transport errors never escape the driver; they only lead to a reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::{FrameEncoding, ReconnectConfig, UpstreamConfig};
use crate::error::{StreamError, StreamResult};
use crate::observation::{EmotionObservation, normalize_text};
use crate::reconnect::{Backoff, ConnectionState};
use crate::scheduler::FrameSink;

/// Results waiting to be picked up by the session before new ones are dropped.
const RESULT_CHANNEL_BUFFER: usize = 16;

/// How long [`UpstreamClient::close`] waits for the driver to finish.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a single connection ended.
enum Disconnect {
    /// The owner closed the client (or dropped it).
    Owner,
    /// The provider or the network ended the connection.
    Lost(String),
}

/// Cloneable sending side of an [`UpstreamClient`], used by the
/// forwarding scheduler.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    frame_tx: mpsc::Sender<Bytes>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl UpstreamHandle {
    pub fn is_open(&self) -> bool {
        self.state_rx.borrow().is_open()
    }

    /// Queue one frame for the provider.
    ///
    /// Returns `false` without queuing when the connection is not open or a
    /// frame is already in flight.
    pub fn send(&self, frame: Bytes) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.frame_tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Upstream frame not queued");
                false
            }
        }
    }
}

impl FrameSink for UpstreamHandle {
    fn is_open(&self) -> bool {
        UpstreamHandle::is_open(self)
    }

    fn is_ready(&self) -> bool {
        self.is_open() && self.frame_tx.capacity() > 0
    }

    fn send_frame(&self, frame: Bytes) -> bool {
        self.send(frame)
    }
}

/// Self-healing connection to the inference provider.
///
/// Created with [`UpstreamClient::spawn`], which also returns the receiver
/// for normalized results.
pub struct UpstreamClient {
    handle: UpstreamHandle,
    closed_tx: watch::Sender<bool>,
    reconnects: Arc<AtomicU32>,
    driver: Option<JoinHandle<()>>,
}

impl UpstreamClient {
    /// Start connecting in the background.
    ///
    /// `label` identifies the owning session in log events.
    pub fn spawn(
        label: impl Into<String>,
        config: UpstreamConfig,
        reconnect: &ReconnectConfig,
    ) -> (Self, mpsc::Receiver<EmotionObservation>) {
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (closed_tx, closed_rx) = watch::channel(false);
        let reconnects = Arc::new(AtomicU32::new(0));

        let driver = Driver {
            label: label.into(),
            config,
            backoff: Backoff::from_config(reconnect),
            frame_rx,
            result_tx,
            state_tx,
            closed_rx,
            reconnects: Arc::clone(&reconnects),
        };
        let driver = tokio::spawn(driver.run());

        (
            Self {
                handle: UpstreamHandle { frame_tx, state_rx },
                closed_tx,
                reconnects,
                driver: Some(driver),
            },
            result_rx,
        )
    }

    /// Sending handle for the forwarding scheduler.
    pub fn handle(&self) -> UpstreamHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.handle.state_rx.borrow()
    }

    /// Watch channel following every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.handle.state_rx.clone()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    /// See [`UpstreamHandle::send`].
    pub fn send(&self, frame: Bytes) -> bool {
        self.handle.send(frame)
    }

    /// Total reconnects scheduled over the client's lifetime.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Close voluntarily. No reconnect is attempted afterwards, and a
    /// reconnect that is already waiting is cancelled.
    pub async fn close(&mut self) {
        // Raised before anything else so the driver can never read a stale
        // flag when the socket goes down.
        self.closed_tx.send_replace(true);

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut driver).await.is_err() {
                tracing::warn!("Upstream driver did not stop in time, aborting");
                driver.abort();
            }
        }
    }
}

impl Drop for UpstreamClient {
    fn drop(&mut self) {
        self.closed_tx.send_replace(true);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

// ─── Driver task ────────────────────────────────────────────────────────

struct Driver {
    label: String,
    config: UpstreamConfig,
    backoff: Backoff,
    frame_rx: mpsc::Receiver<Bytes>,
    result_tx: mpsc::Sender<EmotionObservation>,
    state_tx: watch::Sender<ConnectionState>,
    closed_rx: watch::Receiver<bool>,
    reconnects: Arc<AtomicU32>,
}

impl Driver {
    async fn run(mut self) {
        let mut state = ConnectionState::Connecting;

        loop {
            self.publish(state);

            let connected = tokio::select! {
                result = connect_upstream(&self.config) => result,
                _ = wait_for_owner_close(&mut self.closed_rx) => break,
            };

            match connected {
                Ok(socket) => {
                    self.backoff.reset();
                    state = state.on_open();
                    self.publish(state);
                    tracing::info!(session_id = %self.label, url = %self.config.url, "Connected to upstream");

                    match self.pump(socket).await {
                        Disconnect::Owner => break,
                        Disconnect::Lost(reason) => {
                            tracing::warn!(session_id = %self.label, reason, "Upstream connection lost");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.label, error = %e, "Upstream connect failed");
                }
            }

            let closed_by_owner = *self.closed_rx.borrow();
            state = state.on_close(closed_by_owner, &mut self.backoff);

            let ConnectionState::ReconnectScheduled { attempt, delay } = state else {
                break;
            };
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            self.publish(state);
            tracing::info!(
                session_id = %self.label,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to upstream"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = wait_for_owner_close(&mut self.closed_rx) => break,
            }
            state = state.on_retry();
        }

        self.publish(ConnectionState::Closed);
        tracing::debug!(session_id = %self.label, "Upstream driver stopped");
    }

    /// Move frames out and results in until the connection ends.
    async fn pump(&mut self, socket: UpstreamSocket) -> Disconnect {
        let (mut sink, mut stream) = socket.split();

        let ping_interval = self.config.ping_interval();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_owner_close(&mut self.closed_rx) => {
                    self.publish(ConnectionState::Open.on_owner_close());
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return Disconnect::Owner;
                }
                frame = self.frame_rx.recv() => {
                    let Some(frame) = frame else {
                        return Disconnect::Owner;
                    };
                    let bytes = frame.len();
                    if let Err(e) = sink.send(encode_frame(self.config.frame_encoding, frame)).await {
                        return Disconnect::Lost(format!("send failed: {e}"));
                    }
                    tracing::trace!(session_id = %self.label, bytes, "Forwarded frame upstream");
                }
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        return Disconnect::Lost(format!("ping failed: {e}"));
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.deliver(text),
                        Err(_) => tracing::debug!(session_id = %self.label, "Ignoring non-UTF-8 upstream payload"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by provider".to_string(),
                            |f| format!("closed by provider ({}): {}", u16::from(f.code), f.reason.as_str()),
                        );
                        return Disconnect::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                    None => return Disconnect::Lost("stream ended".into()),
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        let Some(observation) = normalize_text(text) else {
            return;
        };
        if observation.is_unknown() {
            tracing::debug!(session_id = %self.label, raw = %text, "Upstream result without label");
        }
        if let Err(e) = self.result_tx.try_send(observation) {
            tracing::debug!(session_id = %self.label, error = %e, "Dropping upstream result");
        }
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

/// Resolves once the owner has closed the client or dropped it.
async fn wait_for_owner_close(closed_rx: &mut watch::Receiver<bool>) {
    let _ = closed_rx.wait_for(|closed| *closed).await;
}

/// Dial the provider, attaching the bearer credential when configured.
async fn connect_upstream(config: &UpstreamConfig) -> StreamResult<UpstreamSocket> {
    let mut request =
        config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::ConnectionFailed {
                url: config.url.clone(),
                reason: format!("Invalid URL: {e}"),
            })?;

    if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
            StreamError::ConfigError {
                reason: format!("Upstream API key is not a valid header value: {e}"),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, response) =
        connect_async(request)
            .await
            .map_err(|e| StreamError::ConnectionFailed {
                url: config.url.clone(),
                reason: format!("WebSocket connection failed: {e}"),
            })?;

    tracing::debug!(url = %config.url, status = %response.status(), "Upstream handshake complete");
    Ok(socket)
}

/// Wrap a frame the way the provider expects it.
pub fn encode_frame(encoding: FrameEncoding, frame: Bytes) -> Message {
    match encoding {
        FrameEncoding::Binary => Message::Binary(frame),
        FrameEncoding::Base64Json => {
            let data = base64::engine::general_purpose::STANDARD.encode(&frame);
            Message::text(
                serde_json::json!({
                    "models": { "face": {} },
                    "data": data,
                })
                .to_string(),
            )
        }
    }
}
