//! # Forwarding Scheduler
//!
//! Rate-limits upstream traffic: on every tick it takes whatever the
//! session's [`FrameBuffer`] holds and hands it to the sink, but only when
//! the sink is ready for it. While the upstream is down, or still busy with
//! the previous frame, the frame stays in the buffer and newer frames keep
//! replacing it, so the next tick that can forward sends the freshest frame.
//!
//! The first tick happens one full interval after [`ForwardingScheduler::start`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::frame_buffer::FrameBuffer;

/// Destination of forwarded frames.
pub trait FrameSink: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Open and able to take a frame right now.
    fn is_ready(&self) -> bool {
        self.is_open()
    }

    /// Hand one frame over. Returns `false` if it was not accepted.
    fn send_frame(&self, frame: Bytes) -> bool;
}

/// Periodic task moving the latest frame from a buffer to a sink.
pub struct ForwardingScheduler {
    handle: Option<JoinHandle<()>>,
    forwarded: Arc<AtomicU64>,
}

impl ForwardingScheduler {
    pub fn start<S: FrameSink>(buffer: Arc<FrameBuffer>, sink: S, interval: Duration) -> Self {
        let forwarded = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&forwarded);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if forward_once(&buffer, &sink) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        Self {
            handle: Some(handle),
            forwarded,
        }
    }

    /// Frames handed to the sink so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop ticking. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ForwardingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One scheduler tick.
///
/// Returns `true` if a frame was accepted by the sink. When the sink is
/// closed or busy the buffer is left untouched.
pub fn forward_once<S: FrameSink + ?Sized>(buffer: &FrameBuffer, sink: &S) -> bool {
    if !sink.is_ready() {
        return false;
    }
    match buffer.drain() {
        Some(frame) => {
            let accepted = sink.send_frame(frame);
            if !accepted {
                tracing::debug!("Sink refused frame");
            }
            accepted
        }
        None => false,
    }
}
