//! # emotion-stream
//!
//! A real-time emotion streaming gateway. Capture clients push camera frames
//! over a WebSocket, the gateway rate-limits them to a remote facial
//! emotion inference provider over a second, self-healing WebSocket, and the
//! normalized results flow back to the client together with mood-based
//! recommendations.
//!
//! ## Quick Start
//!
//! ```ignore
//! use emotion_stream::{GatewayConfig, StreamGateway};
//!
//! #[tokio::main]
//! async fn main() -> emotion_stream::StreamResult<()> {
//!     // Load config from environment or emotion-gateway.toml
//!     let config = GatewayConfig::discover(None)?;
//!
//!     let gateway = StreamGateway::bind(config).await?;
//!     let handle = gateway.handle();
//!
//!     tokio::spawn(async move {
//!         let mut events = handle.subscribe();
//!         while let Ok(event) = events.recv().await {
//!             println!("{event:?}");
//!         }
//!     });
//!
//!     gateway.serve_with_shutdown(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await
//! }
//! ```
//!
//! ## Components
//!
//! | Component | Type | Role |
//! |-----------|------|------|
//! | Gateway | [`StreamGateway`] | Ingress WebSocket server, one session per client |
//! | Frame buffer | [`FrameBuffer`] | Latest-wins slot for the newest frame |
//! | Scheduler | [`ForwardingScheduler`] | Forwards at most one frame per interval |
//! | Upstream | [`UpstreamClient`] | Provider connection with backoff reconnect |
//! | Registry | [`SessionRegistry`] | Live sessions, history, summaries |
//! | Liveness | [`LivenessMonitor`] | Heartbeat sweep evicting dead clients |
//! | Capture | [`AdaptiveCaptureClient`] | Producer with emotion-driven frame rate |
//!
//! ## Configuration
//!
//! See [`GatewayConfig`] for the full configuration reference.
//!
//! ```bash
//! export EMOTION_UPSTREAM_URL="wss://api.hume.ai/v0/stream/models?models=face"
//! export EMOTION_UPSTREAM_API_KEY="your-api-key"
//! ```
//!
//! Or an `emotion-gateway.toml` file:
//!
//! ```toml
//! bind_addr = "0.0.0.0:5000"
//!
//! [upstream]
//! url = "wss://api.hume.ai/v0/stream/models?models=face"
//! api_key = "your-api-key"
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod frame_buffer;
pub mod gateway;
pub mod health;
pub mod observation;
pub mod protocol;
pub mod recommend;
pub mod reconnect;
pub mod registry;
pub mod scheduler;
pub mod upstream;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use capture::{AdaptiveCaptureClient, CaptureConfig, CaptureState, CyclingFrames, FrameSource};
pub use config::GatewayConfig;
pub use error::{StreamError, StreamResult};
pub use frame_buffer::FrameBuffer;
pub use gateway::{GatewayEvent, GatewayHandle, StreamGateway};
pub use health::LivenessMonitor;
pub use observation::EmotionObservation;
pub use reconnect::ConnectionState;
pub use registry::{SessionRegistry, SessionSummary};
pub use scheduler::ForwardingScheduler;
pub use upstream::UpstreamClient;
