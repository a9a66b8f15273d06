//! # Adaptive Capture Client
//!
//! Producer side of the pipeline: streams frames from a [`FrameSource`] to
//! the gateway at an adaptive rate and collects the updates it sends back.
//!
//! ## Rate adaptation
//!
//! Capture starts at `initial_fps`. Each update whose label differs from the
//! previous one raises the rate by `raise_step` (capped at `ceiling_fps`);
//! each repeated label lowers it by `decay_step` (floored at `floor_fps`).
//! A rate change rebuilds the capture timer, so only one timer is ever live.
//!
//! ## Connection loss
//!
//! Capture is suspended while disconnected and the client redials after a
//! fixed `reconnect_delay`. The capture timer belongs to a single
//! connection and is dropped with it. [`AdaptiveCaptureClient::stop`] sends
//! the stop control message before closing, and no reconnect follows.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{StreamError, StreamResult};
use crate::protocol::{ClientCommand, ServerUpdate};
use crate::recommend::GeoLocation;

const UPDATE_CHANNEL_BUFFER: usize = 32;

/// Where captured frames come from (camera, file list, test fixture).
pub trait FrameSource: Send + 'static {
    /// Next encoded frame, or `None` if nothing is available right now.
    fn next_frame(&mut self) -> impl Future<Output = Option<Bytes>> + Send;
}

/// Cycles through a fixed list of frames.
#[derive(Debug, Clone)]
pub struct CyclingFrames {
    frames: Vec<Bytes>,
    next: usize,
}

impl CyclingFrames {
    pub fn new(frames: Vec<Bytes>) -> Self {
        Self { frames, next: 0 }
    }
}

impl FrameSource for CyclingFrames {
    async fn next_frame(&mut self) -> Option<Bytes> {
        if self.frames.is_empty() {
            return None;
        }
        let frame = self.frames[self.next % self.frames.len()].clone();
        self.next = (self.next + 1) % self.frames.len();
        Some(frame)
    }
}

/// Capture client settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Gateway stream URL, e.g. `ws://localhost:5000/api/emotion/stream`.
    pub url: String,
    pub initial_fps: u32,
    pub floor_fps: u32,
    pub ceiling_fps: u32,
    pub raise_step: u32,
    pub decay_step: u32,
    pub reconnect_delay: Duration,
    /// Sent as a `location` message after every connect.
    pub location: Option<GeoLocation>,
}

impl CaptureConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_fps: 4,
            floor_fps: 2,
            ceiling_fps: 6,
            raise_step: 4,
            decay_step: 1,
            reconnect_delay: Duration::from_secs(3),
            location: None,
        }
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.floor_fps == 0 {
            return Err(StreamError::ConfigError {
                reason: "floor_fps must be at least 1".into(),
            });
        }
        if self.ceiling_fps < self.floor_fps {
            return Err(StreamError::ConfigError {
                reason: format!(
                    "ceiling_fps ({}) is below floor_fps ({})",
                    self.ceiling_fps, self.floor_fps
                ),
            });
        }
        Ok(())
    }
}

/// Capture rate state machine.
#[derive(Debug, Clone)]
pub struct CaptureRate {
    fps: u32,
    floor: u32,
    ceiling: u32,
    raise_step: u32,
    decay_step: u32,
    last_label: Option<String>,
}

impl CaptureRate {
    /// Build from a config. An inverted range collapses to the floor
    /// instead of being rejected; [`CaptureConfig::validate`] reports it.
    pub fn from_config(config: &CaptureConfig) -> Self {
        let floor = config.floor_fps.max(1);
        let ceiling = config.ceiling_fps.max(floor);
        Self {
            fps: config.initial_fps.clamp(floor, ceiling),
            floor,
            ceiling,
            raise_step: config.raise_step,
            decay_step: config.decay_step,
            last_label: None,
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Time between captures at the current rate.
    pub fn period(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    /// Feed one received label. Returns `true` if the rate changed.
    ///
    /// The first label ever seen counts as a change.
    pub fn observe(&mut self, label: &str) -> bool {
        let changed = self.last_label.as_deref() != Some(label);
        if changed {
            self.last_label = Some(label.to_string());
        }

        let next = if changed {
            self.fps.saturating_add(self.raise_step).min(self.ceiling)
        } else {
            self.fps.saturating_sub(self.decay_step).max(self.floor)
        };
        let adjusted = next != self.fps;
        self.fps = next;
        adjusted
    }
}

/// Observable capture lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not started, or stopped.
    Idle,
    Connecting,
    /// Connected and sending frames.
    Capturing,
    /// Connection lost; waiting to redial.
    Suspended,
}

/// Handle to a running capture task.
pub struct AdaptiveCaptureClient {
    stop_tx: Option<oneshot::Sender<()>>,
    state_rx: watch::Receiver<CaptureState>,
    fps_rx: watch::Receiver<u32>,
    task: Option<JoinHandle<()>>,
}

impl AdaptiveCaptureClient {
    /// Start capturing; returns the handle and the stream of updates.
    pub fn start<S: FrameSource>(
        config: CaptureConfig,
        source: S,
    ) -> StreamResult<(Self, mpsc::Receiver<ServerUpdate>)> {
        config.validate()?;

        let rate = CaptureRate::from_config(&config);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(CaptureState::Idle);
        let (fps_tx, fps_rx) = watch::channel(rate.fps());
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_BUFFER);

        let worker = CaptureWorker {
            config,
            source,
            rate,
            stop_rx,
            state_tx,
            fps_tx,
            update_tx,
        };
        let task = tokio::spawn(worker.run());

        Ok((
            Self {
                stop_tx: Some(stop_tx),
                state_rx,
                fps_rx,
                task: Some(task),
            },
            update_rx,
        ))
    }

    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<CaptureState> {
        self.state_rx.clone()
    }

    pub fn current_fps(&self) -> u32 {
        *self.fps_rx.borrow()
    }

    /// Send the stop command, close the socket and wait for the task.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}

impl Drop for AdaptiveCaptureClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─── Worker task ────────────────────────────────────────────────────────

enum Ended {
    Stopped,
    Lost(String),
}

struct CaptureWorker<S> {
    config: CaptureConfig,
    source: S,
    rate: CaptureRate,
    stop_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<CaptureState>,
    fps_tx: watch::Sender<u32>,
    update_tx: mpsc::Sender<ServerUpdate>,
}

impl<S: FrameSource> CaptureWorker<S> {
    async fn run(mut self) {
        loop {
            self.state_tx.send_replace(CaptureState::Connecting);

            let connected = tokio::select! {
                result = connect_async(self.config.url.as_str()) => result,
                _ = &mut self.stop_rx => break,
            };

            match connected {
                Ok((socket, _)) => {
                    tracing::info!(url = %self.config.url, "Capture connected");
                    self.state_tx.send_replace(CaptureState::Capturing);
                    match self.capture(socket).await {
                        Ended::Stopped => break,
                        Ended::Lost(reason) => {
                            tracing::warn!(reason, "Capture connection lost");
                        }
                    }
                }
                Err(e) => tracing::warn!(url = %self.config.url, error = %e, "Capture connect failed"),
            }

            self.state_tx.send_replace(CaptureState::Suspended);
            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = &mut self.stop_rx => break,
            }
        }

        self.state_tx.send_replace(CaptureState::Idle);
        tracing::debug!("Capture stopped");
    }

    async fn capture<T>(&mut self, socket: tokio_tungstenite::WebSocketStream<T>) -> Ended
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        if let Some(location) = self.config.location {
            let message = Message::text(ClientCommand::Location(location).to_json());
            if let Err(e) = sink.send(message).await {
                return Ended::Lost(format!("location send failed: {e}"));
            }
        }

        let mut timer = capture_timer(self.rate.period());
        loop {
            tokio::select! {
                _ = &mut self.stop_rx => {
                    let _ = sink.send(Message::text(ClientCommand::Stop.to_json())).await;
                    let _ = sink.close().await;
                    return Ended::Stopped;
                }
                _ = timer.tick() => {
                    if let Some(frame) = self.source.next_frame().await {
                        if let Err(e) = sink.send(Message::Binary(frame)).await {
                            return Ended::Lost(format!("frame send failed: {e}"));
                        }
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(update) = ServerUpdate::parse(text.as_str()) {
                            if let Some(label) = update.emotion.as_deref() {
                                if self.rate.observe(label) {
                                    timer = capture_timer(self.rate.period());
                                    self.fps_tx.send_replace(self.rate.fps());
                                    tracing::debug!(fps = self.rate.fps(), emotion = label, "Capture rate adjusted");
                                }
                            }
                            let _ = self.update_tx.try_send(update);
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Ended::Lost("closed by gateway".into()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ended::Lost(e.to_string()),
                    None => return Ended::Lost("stream ended".into()),
                },
            }
        }
    }
}

fn capture_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate() -> CaptureRate {
        CaptureRate::from_config(&CaptureConfig::new("ws://localhost"))
    }

    #[test]
    fn test_new_label_jumps_to_ceiling() {
        let mut rate = rate();
        assert_eq!(rate.fps(), 4);
        assert!(rate.observe("happy"));
        assert_eq!(rate.fps(), 6);
    }

    #[test]
    fn test_repeated_label_decays_to_floor() {
        let mut rate = rate();
        rate.observe("happy");
        let mut seen = Vec::new();
        for _ in 0..6 {
            rate.observe("happy");
            seen.push(rate.fps());
        }
        assert_eq!(seen, vec![5, 4, 3, 2, 2, 2]);
        assert!(!rate.observe("happy"));

        assert!(rate.observe("sad"));
        assert_eq!(rate.fps(), 6);
    }

    #[test]
    fn test_period_follows_rate() {
        let mut rate = rate();
        assert_eq!(rate.period(), Duration::from_millis(250));
        rate.observe("happy");
        assert_eq!(rate.period(), Duration::from_secs(1) / 6);
    }

    #[test]
    fn test_initial_fps_is_clamped() {
        let config = CaptureConfig {
            initial_fps: 50,
            ..CaptureConfig::new("ws://localhost")
        };
        assert_eq!(CaptureRate::from_config(&config).fps(), 6);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let config = CaptureConfig {
            floor_fps: 0,
            ..CaptureConfig::new("ws://localhost")
        };
        assert!(config.validate().is_err());

        let config = CaptureConfig {
            floor_fps: 5,
            ceiling_fps: 3,
            ..CaptureConfig::new("ws://localhost")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_bounds_collapse_to_floor() {
        let mut config = CaptureConfig {
            floor_fps: 5,
            ceiling_fps: 3,
            ..CaptureConfig::new("ws://localhost")
        };
        let mut rate = CaptureRate::from_config(&config);
        assert_eq!(rate.fps(), 5);
        assert!(!rate.observe("happy"));
        assert_eq!(rate.fps(), 5);

        config.floor_fps = 0;
        config.ceiling_fps = 0;
        assert_eq!(CaptureRate::from_config(&config).fps(), 1);
    }

    #[tokio::test]
    async fn test_cycling_frames() {
        let mut source = CyclingFrames::new(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(source.next_frame().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(source.next_frame().await.unwrap(), Bytes::from_static(b"b"));
        assert_eq!(source.next_frame().await.unwrap(), Bytes::from_static(b"a"));

        let mut empty = CyclingFrames::new(Vec::new());
        assert!(empty.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_suspends_then_stops() {
        let config = CaptureConfig {
            reconnect_delay: Duration::from_secs(60),
            ..CaptureConfig::new("ws://127.0.0.1:9/api/emotion/stream")
        };
        let (mut client, _updates) =
            AdaptiveCaptureClient::start(config, CyclingFrames::new(Vec::new())).unwrap();

        let mut states = client.state_changes();
        tokio::time::timeout(
            Duration::from_secs(3),
            states.wait_for(|s| *s == CaptureState::Suspended),
        )
        .await
        .expect("capture never suspended")
        .unwrap();

        client.stop().await;
        assert_eq!(client.state(), CaptureState::Idle);
    }
}
