//! # Frame Buffer
//!
//! Single-slot, latest-wins holder for the next frame to forward upstream.
//!
//! A write replaces whatever frame is waiting; a drain takes it and leaves
//! the slot empty. The slot never holds more than one frame, so a client
//! capturing faster than the forwarding interval costs no extra memory.
//! Frames are [`Bytes`] handles, so a write is a reference swap and a drain
//! can never observe a partially written frame.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// One-frame slot shared between a session's ingress handler and its
/// forwarding scheduler.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Mutex<Option<Bytes>>,
    overwritten: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, replacing any frame that has not been drained yet.
    ///
    /// Returns `true` if an undrained frame was discarded.
    pub fn write(&self, frame: Bytes) -> bool {
        let previous = self.lock().replace(frame);
        let replaced = previous.is_some();
        if replaced {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    /// Take the pending frame, leaving the slot empty.
    pub fn drain(&self) -> Option<Bytes> {
        self.lock().take()
    }

    /// Number of frames currently held: always 0 or 1.
    pub fn len(&self) -> usize {
        usize::from(self.lock().is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the pending frame, if any.
    pub fn clear(&self) {
        self.lock().take();
    }

    /// Frames that were replaced before they could be forwarded.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Bytes>> {
        // The slot holds plain data; a panic mid-swap cannot leave it torn.
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
