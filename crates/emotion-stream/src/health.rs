//! # Client Liveness Monitor
//!
//! Background task that runs a heartbeat sweep over the
//! [`SessionRegistry`] at a fixed interval to evict clients that vanished
//! without closing their socket.
//!
//! Each sweep terminates sessions that did not answer the previous ping and
//! pings the rest, so a silent client is gone after at most two intervals.
//! Reports are emitted on an mpsc channel for the gateway to log and publish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::HeartbeatConfig;
use crate::registry::{SessionRegistry, SweepReport};

/// Periodic heartbeat sweep over all live sessions.
pub struct LivenessMonitor {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl LivenessMonitor {
    /// Start sweeping.
    ///
    /// The first sweep runs one interval after start. Reports that cannot be
    /// delivered (full or closed channel) are dropped; the sweep itself
    /// always happens.
    pub fn start(
        registry: Arc<SessionRegistry>,
        config: &HeartbeatConfig,
    ) -> (Self, mpsc::Receiver<SweepReport>) {
        let interval = config.interval();
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(16);

        let handle = {
            let running = Arc::clone(&running);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                while running.load(Ordering::SeqCst) {
                    ticker.tick().await;

                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    let report = registry.sweep();
                    for summary in &report.terminated {
                        tracing::info!(
                            session_id = %summary.session_id,
                            "Terminating unresponsive client"
                        );
                    }
                    tracing::debug!(
                        pinged = report.pinged,
                        terminated = report.terminated.len(),
                        "Heartbeat sweep"
                    );
                    let _ = tx.try_send(report);
                }

                tracing::debug!("Liveness monitor stopped");
            })
        };

        (
            Self {
                handle: Some(handle),
                running,
            },
            rx,
        )
    }

    /// Stop sweeping.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            // The task is normally parked on the ticker; don't wait a full interval.
            handle.abort();
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
