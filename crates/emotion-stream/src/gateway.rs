//! # Stream Gateway
//!
//! The ingress WebSocket server. Each accepted client gets its own session:
//!
//! ```text
//! client ──binary──► FrameBuffer ──tick──► ForwardingScheduler ──► UpstreamClient ──► provider
//!    ▲                                                                   │
//!    └──────────── {"type":"emotion",...} ◄── record + recommend ◄───────┘
//! ```
//!
//! Upgrades are accepted only on the configured stream path (query string
//! ignored); any other request line gets its connection dropped before the
//! WebSocket handshake starts. Malformed client messages are logged and
//! ignored, never fatal to the session or the gateway.
//!
//! A session ends when the client closes, sends a stop command, fails to
//! answer heartbeats, or hits a transport error. Every path goes through the
//! same teardown, which stops the scheduler, closes the upstream without
//! reconnect, removes the registry entry, and closes the client socket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{StreamError, StreamResult};
use crate::frame_buffer::FrameBuffer;
use crate::health::LivenessMonitor;
use crate::observation::EmotionObservation;
use crate::protocol::{ClientCommand, EmotionUpdate};
use crate::recommend::{GeoLocation, Recommender, StaticRecommender};
use crate::registry::{SessionCommand, SessionRegistry, SessionSummary};
use crate::scheduler::ForwardingScheduler;
use crate::upstream::UpstreamClient;

/// Longest request line accepted while checking the upgrade path.
const MAX_REQUEST_LINE: usize = 8 * 1024;

/// Time allowed for the request line to arrive.
const REQUEST_LINE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between peeks while the request line is still incomplete.
const PEEK_RETRY: Duration = Duration::from_millis(10);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Time allowed for a client to take the close frame during teardown.
const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type ClientSocket = WebSocketStream<TcpStream>;

/// Lifecycle notifications published by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    SessionOpened { session_id: String },
    /// Emitted once per session, whichever way it ended.
    SessionClosed(SessionSummary),
    UpgradeRejected { peer: SocketAddr, reason: String },
}

/// Running counters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    live: AtomicU64,
    frames_received: AtomicU64,
    frames_overwritten: AtomicU64,
    frames_forwarded: AtomicU64,
    updates_sent: AtomicU64,
    malformed_messages: AtomicU64,
    ignored_messages: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub live: u64,
    pub frames_received: u64,
    pub frames_overwritten: u64,
    pub frames_forwarded: u64,
    pub updates_sent: u64,
    pub malformed_messages: u64,
    pub ignored_messages: u64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            live: self.live.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_overwritten: self.frames_overwritten.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            ignored_messages: self.ignored_messages.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
    recommender: Arc<dyn Recommender>,
    events: broadcast::Sender<GatewayEvent>,
    stats: GatewayStats,
}

impl Shared {
    fn publish(&self, event: GatewayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Cheap handle for observing a gateway after `serve` has taken it.
#[derive(Clone)]
pub struct GatewayHandle {
    shared: Arc<Shared>,
}

impl GatewayHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of currently connected clients.
    pub fn live_clients(&self) -> usize {
        self.shared.registry.len()
    }
}

/// WebSocket gateway bound to a local address.
pub struct StreamGateway {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl StreamGateway {
    /// Bind with the built-in recommendation table.
    pub async fn bind(config: GatewayConfig) -> StreamResult<Self> {
        Self::bind_with(config, Arc::new(StaticRecommender)).await
    }

    /// Bind with a custom recommender.
    pub async fn bind_with(
        config: GatewayConfig,
        recommender: Arc<dyn Recommender>,
    ) -> StreamResult<Self> {
        config.validate()?;

        let listener =
            TcpListener::bind(&config.bind_addr)
                .await
                .map_err(|source| StreamError::Bind {
                    addr: config.bind_addr.clone(),
                    source,
                })?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(SessionRegistry::new(config.session.history_capacity));

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                registry,
                recommender,
                events,
                stats: GatewayStats::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> StreamResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accept clients until the task is cancelled.
    pub async fn serve(self) -> StreamResult<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept clients until `shutdown` resolves.
    ///
    /// Sessions that are already running are not interrupted.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> StreamResult<()> {
        let addr = self.local_addr()?;
        let shared = self.shared;
        tracing::info!(
            %addr,
            path = %shared.config.stream_path,
            upstream = %shared.config.upstream.url,
            "Emotion stream gateway listening"
        );

        let (mut monitor, mut reports) =
            LivenessMonitor::start(Arc::clone(&shared.registry), &shared.config.heartbeat);
        let reporter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Some(report) = reports.recv().await {
                    for summary in report.terminated {
                        shared.publish(GatewayEvent::SessionClosed(summary));
                    }
                }
            })
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Gateway shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(Arc::clone(&shared), stream, peer));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        monitor.stop().await;
        reporter.abort();
        Ok(())
    }
}

// ─── Upgrade path check ─────────────────────────────────────────────────

/// `true` if an HTTP request target names the stream path exactly.
/// The query string is ignored.
pub fn path_matches(target: &str, stream_path: &str) -> bool {
    let path = target.split(['?', '#']).next().unwrap_or_default();
    path == stream_path
}

/// Extract the request target from an HTTP request line.
fn request_target(line: &[u8]) -> StreamResult<String> {
    let line = std::str::from_utf8(line).map_err(|_| StreamError::HandshakeRejected {
        reason: "request line is not UTF-8".into(),
    })?;
    let mut parts = line.split_ascii_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("GET"), Some(target), Some(version)) if version.starts_with("HTTP/") => {
            Ok(target.to_string())
        }
        _ => Err(StreamError::HandshakeRejected {
            reason: format!("not a WebSocket upgrade request: {line:?}"),
        }),
    }
}

/// Read the request line without consuming it, so the WebSocket handshake
/// still sees the full request.
async fn peek_request_target(stream: &TcpStream) -> StreamResult<String> {
    let peek = async {
        let mut buf = vec![0u8; MAX_REQUEST_LINE];
        loop {
            let n = stream.peek(&mut buf).await?;
            if n == 0 {
                return Err(StreamError::ConnectionLost {
                    reason: "peer closed before sending a request".into(),
                });
            }
            if let Some(end) = buf[..n].windows(2).position(|w| w == b"\r\n") {
                return request_target(&buf[..end]);
            }
            if n == buf.len() {
                return Err(StreamError::HandshakeRejected {
                    reason: "request line too long".into(),
                });
            }
            tokio::time::sleep(PEEK_RETRY).await;
        }
    };

    tokio::time::timeout(REQUEST_LINE_TIMEOUT, peek)
        .await
        .map_err(|_| StreamError::HandshakeRejected {
            reason: "timed out waiting for request line".into(),
        })?
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let checked = peek_request_target(&stream).await.and_then(|target| {
        if path_matches(&target, &shared.config.stream_path) {
            Ok(())
        } else {
            Err(StreamError::HandshakeRejected {
                reason: format!("unexpected path {target}"),
            })
        }
    });
    if let Err(e) = checked {
        shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%peer, error = %e, "Rejecting connection");
        shared.publish(GatewayEvent::UpgradeRejected {
            peer,
            reason: e.to_string(),
        });
        drop(stream);
        return;
    }

    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    Session::open(shared, socket, peer).run().await;
}

// ─── Per-client session ─────────────────────────────────────────────────

enum Flow {
    Continue,
    End(&'static str),
}

struct Session {
    id: String,
    peer: SocketAddr,
    shared: Arc<Shared>,
    buffer: Arc<FrameBuffer>,
    scheduler: ForwardingScheduler,
    upstream: UpstreamClient,
    results: mpsc::Receiver<EmotionObservation>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    location: Option<GeoLocation>,
    sink: SplitSink<ClientSocket, Message>,
    stream: SplitStream<ClientSocket>,
}

impl Session {
    fn open(shared: Arc<Shared>, socket: ClientSocket, peer: SocketAddr) -> Self {
        let id = Uuid::new_v4().to_string();
        let (sink, stream) = socket.split();

        let buffer = Arc::new(FrameBuffer::new());
        let (upstream, results) = UpstreamClient::spawn(
            id.clone(),
            shared.config.upstream.clone(),
            &shared.config.reconnect,
        );
        let scheduler = ForwardingScheduler::start(
            Arc::clone(&buffer),
            upstream.handle(),
            shared.config.forwarding.interval(),
        );

        let (command_tx, commands) = mpsc::unbounded_channel();
        shared.registry.register(id.clone(), command_tx);

        shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
        shared.stats.live.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session_id = %id, %peer, "Client session opened");
        shared.publish(GatewayEvent::SessionOpened {
            session_id: id.clone(),
        });

        Self {
            id,
            peer,
            shared,
            buffer,
            scheduler,
            upstream,
            results,
            commands,
            location: None,
            sink,
            stream,
        }
    }

    async fn run(mut self) {
        let reason = loop {
            let flow = tokio::select! {
                message = self.stream.next() => self.on_client_message(message),
                Some(observation) = self.results.recv() => self.on_observation(observation).await,
                command = self.commands.recv() => self.on_command(command).await,
            };
            if let Flow::End(reason) = flow {
                break reason;
            }
        };
        self.teardown(reason).await;
    }

    fn on_client_message(
        &mut self,
        message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Flow {
        match message {
            Some(Ok(Message::Binary(frame))) => {
                self.on_frame(frame);
                Flow::Continue
            }
            Some(Ok(Message::Text(text))) => self.on_text(text.as_str()),
            Some(Ok(Message::Pong(_))) => {
                self.shared.registry.mark_alive(&self.id);
                Flow::Continue
            }
            Some(Ok(Message::Close(_))) => Flow::End("client closed"),
            // Pings are answered by the socket itself.
            Some(Ok(Message::Ping(_) | Message::Frame(_))) => Flow::Continue,
            Some(Err(e)) => {
                tracing::warn!(session_id = %self.id, error = %e, "Client transport error");
                Flow::End("transport error")
            }
            None => Flow::End("client stream ended"),
        }
    }

    fn on_frame(&self, frame: Bytes) {
        self.shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        if self.buffer.write(frame) {
            self.shared
                .stats
                .frames_overwritten
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(session_id = %self.id, "Replaced unsent frame");
        }
    }

    fn on_text(&mut self, text: &str) -> Flow {
        match ClientCommand::parse(text) {
            Ok(Some(ClientCommand::Location(location))) => {
                tracing::debug!(session_id = %self.id, lat = location.lat, lng = location.lng, "Location updated");
                self.location = Some(location);
                Flow::Continue
            }
            Ok(Some(ClientCommand::Stop)) => Flow::End("client requested stop"),
            Ok(None) => {
                self.shared
                    .stats
                    .ignored_messages
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session_id = %self.id, "Ignoring unrecognized control message");
                Flow::Continue
            }
            Err(e) => {
                self.shared
                    .stats
                    .malformed_messages
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session_id = %self.id, error = %e, "Ignoring malformed client message");
                Flow::Continue
            }
        }
    }

    async fn on_observation(&mut self, observation: EmotionObservation) -> Flow {
        let recommendations = self
            .shared
            .recommender
            .recommend(&observation.label, self.location.as_ref());
        let observation = observation.with_recommendations(recommendations);

        self.shared.registry.record(&self.id, observation.clone());

        let json = match EmotionUpdate::from_observation(&self.id, &observation).to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Could not encode update");
                return Flow::Continue;
            }
        };
        if let Err(reason) = self.send_to_client(Message::text(json)).await {
            return Flow::End(reason);
        }

        self.shared.stats.updates_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id = %self.id, emotion = %observation.label, "Delivered emotion update");
        Flow::Continue
    }

    async fn on_command(&mut self, command: Option<SessionCommand>) -> Flow {
        match command {
            Some(SessionCommand::Ping) => match self.send_to_client(Message::Ping(Bytes::new())).await {
                Ok(()) => Flow::Continue,
                Err(reason) => Flow::End(reason),
            },
            Some(SessionCommand::Terminate) | None => Flow::End("heartbeat missed"),
        }
    }

    /// Write one message to the client.
    ///
    /// A client that stops reading stalls the write once the socket buffers
    /// fill, so registry commands are still received meanwhile and a
    /// `Terminate` abandons the write.
    async fn send_to_client(&mut self, message: Message) -> Result<(), &'static str> {
        let send = self.sink.send(message);
        tokio::pin!(send);
        loop {
            tokio::select! {
                sent = &mut send => {
                    return match sent {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            tracing::warn!(session_id = %self.id, error = %e, "Client send failed");
                            Err("client send failed")
                        }
                    };
                }
                command = self.commands.recv() => match command {
                    // A stalled client cannot take a ping either.
                    Some(SessionCommand::Ping) => {}
                    Some(SessionCommand::Terminate) | None => {
                        tracing::warn!(session_id = %self.id, "Terminated while a client write was stalled");
                        return Err("heartbeat missed");
                    }
                },
            }
        }
    }

    async fn teardown(mut self, reason: &str) {
        self.scheduler.stop();
        self.buffer.clear();
        let summary = self.shared.registry.close(&self.id);
        self.upstream.close().await;

        let sink = &mut self.sink;
        let close = async move {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLIENT_CLOSE_TIMEOUT, close).await.is_err() {
            tracing::debug!(session_id = %self.id, "Client did not take the close frame");
        }

        let stats = &self.shared.stats;
        stats.live.fetch_sub(1, Ordering::Relaxed);
        stats
            .frames_forwarded
            .fetch_add(self.scheduler.forwarded(), Ordering::Relaxed);

        tracing::info!(session_id = %self.id, peer = %self.peer, reason, "Client session closed");

        // A liveness sweep that removed the entry has already published it.
        if let Some(summary) = summary {
            tracing::info!(
                session_id = %summary.session_id,
                total = summary.total_observations,
                dominant = %summary.dominant_label,
                duration_ms = u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
                "Session summary"
            );
            self.shared.publish(GatewayEvent::SessionClosed(summary));
        }
    }
}
