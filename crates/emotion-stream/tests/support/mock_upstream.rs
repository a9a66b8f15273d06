#![allow(dead_code)]

//! Scriptable WebSocket endpoint standing in for the inference provider
//! (and, in capture tests, for the gateway).

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// A message received from the client under test.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Binary(Bytes),
    Text(Value),
}

enum ConnectionCommand {
    SendJson(Value),
    SendRaw(String),
    ForceClose,
}

pub struct MockConnection {
    index: usize,
    path: String,
    authorization: Option<String>,
    inbound_rx: mpsc::Receiver<Inbound>,
    command_tx: mpsc::Sender<ConnectionCommand>,
}

impl MockConnection {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Request path including query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `Authorization` header sent with the upgrade request.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    pub async fn recv(&mut self) -> Inbound {
        timeout(STEP_TIMEOUT, self.inbound_rx.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("mock connection inbound channel closed")
    }

    pub async fn recv_frame(&mut self) -> Bytes {
        match self.recv().await {
            Inbound::Binary(frame) => frame,
            Inbound::Text(value) => panic!("expected binary frame, got text {value}"),
        }
    }

    pub async fn recv_text(&mut self) -> Value {
        match self.recv().await {
            Inbound::Text(value) => value,
            Inbound::Binary(frame) => panic!("expected text, got {} binary bytes", frame.len()),
        }
    }

    /// Skip binary frames until a text message arrives.
    pub async fn recv_next_text(&mut self) -> Value {
        loop {
            if let Inbound::Text(value) = self.recv().await {
                return value;
            }
        }
    }

    pub async fn try_recv(&mut self, wait: Duration) -> Option<Inbound> {
        match timeout(wait, self.inbound_rx.recv()).await {
            Ok(message) => message,
            Err(_) => None,
        }
    }

    pub async fn send_json(&self, value: Value) {
        self.command_tx
            .send(ConnectionCommand::SendJson(value))
            .await
            .expect("failed to send command to mock connection");
    }

    pub async fn send_raw(&self, text: &str) {
        self.command_tx
            .send(ConnectionCommand::SendRaw(text.to_string()))
            .await
            .expect("failed to send command to mock connection");
    }

    /// Like [`send_json`](Self::send_json), but returns `false` once the
    /// connection has ended instead of panicking.
    pub async fn try_send_json(&self, value: Value) -> bool {
        self.command_tx
            .send(ConnectionCommand::SendJson(value))
            .await
            .is_ok()
    }

    /// Wait until the client ends the connection, discarding anything it
    /// still sends. Returns `false` if it is still open after `wait`.
    pub async fn wait_closed(&mut self, wait: Duration) -> bool {
        timeout(wait, async {
            while self.inbound_rx.recv().await.is_some() {}
        })
        .await
        .is_ok()
    }

    /// Drop the TCP connection without a close handshake.
    pub async fn force_close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::ForceClose).await;
    }
}

pub struct MockUpstreamServer {
    addr: SocketAddr,
    connection_rx: mpsc::Receiver<MockConnection>,
    server_task: JoinHandle<()>,
}

impl MockUpstreamServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (connection_tx, connection_rx) = mpsc::channel(16);
        let next_connection_index = Arc::new(AtomicUsize::new(0));

        let server_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let connection_tx = connection_tx.clone();
                let connection_index = next_connection_index.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    let mut path = String::new();
                    let mut authorization = None;
                    let callback = |request: &Request, response: Response| {
                        path = request.uri().to_string();
                        authorization = request
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        Ok::<_, ErrorResponse>(response)
                    };
                    let Ok(ws_stream) = accept_hdr_async(stream, callback).await else {
                        return;
                    };

                    let (mut ws_sink, mut ws_source) = ws_stream.split();
                    let (inbound_tx, inbound_rx) = mpsc::channel(64);
                    let (command_tx, mut command_rx) = mpsc::channel(64);

                    let connection = MockConnection {
                        index: connection_index,
                        path,
                        authorization,
                        inbound_rx,
                        command_tx,
                    };

                    if connection_tx.send(connection).await.is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            command = command_rx.recv() => match command {
                                Some(ConnectionCommand::SendJson(value)) => {
                                    if ws_sink.send(Message::text(value.to_string())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(ConnectionCommand::SendRaw(text)) => {
                                    if ws_sink.send(Message::text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(ConnectionCommand::ForceClose) | None => break,
                            },
                            message = ws_source.next() => match message {
                                Some(Ok(Message::Binary(frame))) => {
                                    let _ = inbound_tx.send(Inbound::Binary(frame)).await;
                                }
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                                        let _ = inbound_tx.send(Inbound::Text(value)).await;
                                    }
                                }
                                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connection_rx,
            server_task,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn accept_connection(&mut self) -> MockConnection {
        timeout(STEP_TIMEOUT, self.connection_rx.recv())
            .await
            .expect("timed out waiting for client connection")
            .expect("mock server connection channel closed")
    }

    pub async fn try_accept_connection(&mut self, wait: Duration) -> Option<MockConnection> {
        match timeout(wait, self.connection_rx.recv()).await {
            Ok(Some(connection)) => Some(connection),
            _ => None,
        }
    }
}

impl Drop for MockUpstreamServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
