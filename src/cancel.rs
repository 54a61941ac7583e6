//! cooperative cancellation shared between a session and its collaborator.
//!
//! the flag is polled at every suspension point; the channel wakes a read
//! that is parked waiting for the next chunk.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flume::{Receiver, Sender};

#[derive(Debug)]
struct Shared {
    cancelled: AtomicBool,
    // an exchange owns the handle, from `begin` until its guard drops
    armed: AtomicBool,
    streaming: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

/// clonable handle to the session's in-flight stream.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                armed: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
                wake_tx,
                wake_rx,
            }),
        }
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// abort the in-flight exchange. no-op when none is running; during a
    /// missing-index rebuild it stops the retry from opening.
    pub fn cancel(&self) {
        if !self.is_busy() {
            return;
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.streaming.store(false, Ordering::SeqCst);
        // a full channel already holds a wake-up
        let _ = self.shared.wake_tx.try_send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    /// an exchange is running, including the rebuild between attempts
    /// where `is_streaming` reads false.
    pub fn is_busy(&self) -> bool {
        self.shared.armed.load(Ordering::SeqCst)
    }

    /// resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            if self.shared.wake_rx.recv_async().await.is_err() {
                return;
            }
        }
    }

    /// arm for a new stream: clears any stale cancel and marks streaming.
    pub(crate) fn begin(&self) -> StreamingGuard {
        self.shared.cancelled.store(false, Ordering::SeqCst);
        while self.shared.wake_rx.try_recv().is_ok() {}
        self.shared.armed.store(true, Ordering::SeqCst);
        self.shared.streaming.store(true, Ordering::SeqCst);
        StreamingGuard { handle: self.clone() }
    }

    fn release(&self) {
        self.shared.streaming.store(false, Ordering::SeqCst);
        self.shared.armed.store(false, Ordering::SeqCst);
    }
}

/// keeps `streaming` raised; lowering it on drop covers every exit path,
/// including the owning future being dropped mid-read.
#[derive(Debug)]
pub(crate) struct StreamingGuard {
    handle: CancelHandle,
}

impl StreamingGuard {
    pub(crate) fn handle(&self) -> &CancelHandle {
        &self.handle
    }

    /// temporarily lower `streaming` (index rebuild between attempts). the
    /// exchange stays armed, so `cancel` still lands.
    pub(crate) fn pause(&self) {
        self.handle.shared.streaming.store(false, Ordering::SeqCst);
    }

    /// raise `streaming` again; `false` if cancelled while paused.
    pub(crate) fn resume(&self) -> bool {
        if self.handle.is_cancelled() {
            return false;
        }
        self.handle.shared.streaming.store(true, Ordering::SeqCst);
        true
    }
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        self.handle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future;

    #[test]
    fn cancel_while_idle_is_noop() {
        let h = CancelHandle::new();
        h.cancel();
        assert!(!h.is_cancelled());
        assert!(!h.is_streaming());
    }

    #[test]
    fn guard_releases_streaming_on_drop() {
        let h = CancelHandle::new();
        {
            let _guard = h.begin();
            assert!(h.is_streaming());
            assert!(h.is_busy());
        }
        assert!(!h.is_streaming());
        assert!(!h.is_busy());
    }

    #[test]
    fn cancel_lands_while_paused() {
        let h = CancelHandle::new();
        let guard = h.begin();
        guard.pause();
        assert!(!h.is_streaming());
        assert!(h.is_busy());

        h.cancel();
        assert!(h.is_cancelled());
        assert!(!guard.resume());
        assert!(!h.is_streaming());
        drop(guard);
        assert!(!h.is_busy());
    }

    #[test]
    fn resume_after_pause_restores_streaming() {
        let h = CancelHandle::new();
        let guard = h.begin();
        guard.pause();
        assert!(guard.resume());
        assert!(h.is_streaming());
    }

    #[test]
    fn cancel_wakes_waiter_and_lowers_streaming() {
        let h = CancelHandle::new();
        let _guard = h.begin();
        let waiter = h.clone();
        h.cancel();
        assert!(!h.is_streaming());
        pollster::block_on(waiter.cancelled());
        assert!(h.is_cancelled());
    }

    #[test]
    fn begin_clears_stale_cancel() {
        let h = CancelHandle::new();
        drop(h.begin());
        let guard = h.begin();
        h.cancel();
        drop(guard);
        let _guard = h.begin();
        assert!(!h.is_cancelled());
        // no leftover wake-up: cancelled() must stay pending
        assert!(future::block_on(future::poll_once(h.cancelled())).is_none());
    }
}
