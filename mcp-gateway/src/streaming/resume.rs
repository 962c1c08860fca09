//! Stream tracking and resume tokens
//!
//! Every streaming request is registered here for the duration of its
//! life. The tracker drives the `open_streams` gauge, hands out resume
//! tokens for the socket transport, and drains everything on shutdown.
//!
//! Resume tokens are opaque server-side handles: random bytes with no
//! embedded meaning, mapped in process state to the stream they resume.

use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::connection::SharedStream;
use super::FramePayload;
use crate::metrics::Metrics;

/// One tracked stream
pub struct StreamHandle {
    pub resume_token: String,
    pub request_id: String,
    pub session_id: Uuid,
    pub tenant_id: String,
    pub stream: Arc<SharedStream>,
    completed: AtomicBool,
}

impl StreamHandle {
    /// Mark the producing request finished. Idempotent; returns true on
    /// the first call so the caller can decrement the gauge exactly once.
    fn complete(&self) -> bool {
        !self.completed.swap(true, Ordering::SeqCst)
    }
}

/// Process-wide registry of live streams
pub struct StreamTracker {
    streams: DashMap<String, Arc<StreamHandle>>,
    metrics: Arc<Metrics>,
    /// How long a closed stream stays resumable before it is swept
    retention: Duration,
}

impl StreamTracker {
    pub fn new(metrics: Arc<Metrics>, retention: Duration) -> Self {
        Self { streams: DashMap::new(), metrics, retention }
    }

    fn new_token() -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Register a new stream and take the `open_streams` slot
    pub fn register(
        &self,
        request_id: impl Into<String>,
        session_id: Uuid,
        tenant_id: impl Into<String>,
        stream: Arc<SharedStream>,
    ) -> Arc<StreamHandle> {
        self.sweep();
        let handle = Arc::new(StreamHandle {
            resume_token: Self::new_token(),
            request_id: request_id.into(),
            session_id,
            tenant_id: tenant_id.into(),
            stream,
            completed: AtomicBool::new(false),
        });
        self.streams.insert(handle.resume_token.clone(), Arc::clone(&handle));
        self.metrics.open_streams.inc();
        handle
    }

    /// Look up a stream for resumption
    pub fn lookup(&self, resume_token: &str) -> Option<Arc<StreamHandle>> {
        self.streams.get(resume_token).map(|entry| Arc::clone(&entry))
    }

    /// Release the gauge slot for a finished request. The handle stays
    /// resumable until swept, so a disconnected client can still fetch
    /// the retained tail.
    pub fn complete(&self, handle: &StreamHandle) {
        if handle.complete() {
            self.metrics.open_streams.dec();
        }
    }

    /// Drop closed streams past the retention window
    pub fn sweep(&self) {
        let stale: Vec<String> = self
            .streams
            .iter()
            .filter(|entry| {
                entry.stream.closed_since().map(|idle| idle > self.retention).unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for token in stale {
            if let Some((_, handle)) = self.streams.remove(&token) {
                // A stream abandoned before its producer finished still
                // holds the gauge slot
                self.complete(&handle);
            }
        }
    }

    /// Number of streams whose producing request is still running
    pub fn open_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|entry| !entry.completed.load(Ordering::SeqCst))
            .count()
    }

    /// Shutdown drain: push a final shutdown terminal on every live
    /// stream, cancel its request and release its slot.
    pub fn drain(&self) {
        for entry in self.streams.iter() {
            let handle = entry.value();
            if !handle.stream.is_closed() {
                handle.stream.push_final(FramePayload::terminal("shutdown"));
            }
            handle.stream.cancel_token().cancel();
            self.complete(handle);
        }
        tracing::info!(streams = self.streams.len(), "Active streams drained");
    }

    /// Wait until every live stream is closed or the deadline passes
    pub async fn await_drained(&self, deadline: Duration) {
        let poll = Duration::from_millis(50);
        let give_up = std::time::Instant::now() + deadline;
        loop {
            let live = self.streams.iter().filter(|e| !e.stream.is_closed()).count();
            if live == 0 || std::time::Instant::now() >= give_up {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::connection::StreamOptions;
    use tokio_util::sync::CancellationToken;

    fn options() -> StreamOptions {
        StreamOptions {
            queue_capacity: 8,
            resume_buffer_size: 8,
            stall_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    fn tracker() -> StreamTracker {
        StreamTracker::new(Arc::new(Metrics::new().unwrap()), Duration::from_secs(60))
    }

    fn shared() -> Arc<SharedStream> {
        Arc::new(SharedStream::new(options(), CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_register_lookup_complete() {
        let tracker = tracker();
        let handle = tracker.register("r1", Uuid::new_v4(), "t1", shared());
        assert_eq!(tracker.metrics.open_streams.get(), 1);
        assert_eq!(tracker.open_count(), 1);

        let found = tracker.lookup(&handle.resume_token).unwrap();
        assert_eq!(found.request_id, "r1");

        tracker.complete(&handle);
        tracker.complete(&handle);
        assert_eq!(tracker.metrics.open_streams.get(), 0);
        assert_eq!(tracker.open_count(), 0);
    }

    #[tokio::test]
    async fn test_tokens_are_unique_and_opaque() {
        let tracker = tracker();
        let a = tracker.register("r1", Uuid::new_v4(), "t1", shared());
        let b = tracker.register("r2", Uuid::new_v4(), "t1", shared());
        assert_ne!(a.resume_token, b.resume_token);
        assert!(!a.resume_token.contains("r1"));
    }

    #[tokio::test]
    async fn test_drain_pushes_shutdown_terminal() {
        let tracker = tracker();
        let handle = tracker.register("r1", Uuid::new_v4(), "t1", shared());

        tracker.drain();
        assert!(handle.stream.is_closed());
        assert!(handle.stream.cancel_token().is_cancelled());
        assert_eq!(tracker.metrics.open_streams.get(), 0);

        let frame = handle.stream.next_after(0).await.unwrap();
        assert_eq!(frame.kind, crate::streaming::FrameKind::Terminal);
        assert_eq!(frame.body["reason"], "shutdown");
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_closed_streams() {
        let tracker = StreamTracker::new(Arc::new(Metrics::new().unwrap()), Duration::ZERO);
        let handle = tracker.register("r1", Uuid::new_v4(), "t1", shared());
        handle.stream.close();

        tracker.sweep();
        assert!(tracker.lookup(&handle.resume_token).is_none());
        assert_eq!(tracker.metrics.open_streams.get(), 0);
    }
}
