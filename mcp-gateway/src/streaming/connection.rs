//! Per-request stream state
//!
//! A `SharedStream` sits between the orchestrator (producer) and a
//! transport attachment (reader). The producer suspends when the bounded
//! outgoing window is full; a reader that stays stalled past the stall
//! timeout closes the stream. Frames are stamped at the write point and a
//! bounded tail is retained for resume-after-disconnect.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{Frame, FrameKind, FramePayload};
use crate::error::{Error, Result};

/// Tuning for one stream, taken from `StreamingConfig`
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Bound of the outgoing window (produced but unacknowledged frames)
    pub queue_capacity: usize,
    /// Acknowledged frames retained for replay
    pub resume_buffer_size: usize,
    /// How long a producer tolerates a full window before the stream is
    /// closed as stalled
    pub stall_timeout: Duration,
    /// Heartbeat cadence while the stream is idle
    pub heartbeat_interval: Duration,
}

impl From<&crate::config::StreamingConfig> for StreamOptions {
    fn from(config: &crate::config::StreamingConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            resume_buffer_size: config.resume_buffer_size.max(1),
            stall_timeout: config.stall_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

#[derive(Debug)]
struct StreamState {
    /// Retained frames, contiguous in seq
    frames: VecDeque<Frame>,
    /// Next sequence number to assign; the first frame is seq 1
    next_seq: u64,
    /// Highest seq handed to an attached reader
    delivered: u64,
    /// Highest seq acknowledged by the client (tracks `delivered` on SSE)
    acked: u64,
    closed: bool,
    stalled: bool,
    closed_at: Option<Instant>,
    last_emit: Instant,
}

impl StreamState {
    fn inflight(&self) -> u64 {
        (self.next_seq - 1).saturating_sub(self.acked)
    }

    fn stamp(&mut self, payload: FramePayload) -> Frame {
        let frame = Frame {
            seq: self.next_seq,
            kind: payload.kind,
            producer: payload.producer,
            body: payload.body,
            ts: chrono::Utc::now(),
        };
        self.next_seq += 1;
        self.last_emit = Instant::now();
        self.frames.push_back(frame.clone());
        frame
    }

    fn trim(&mut self, resume_buffer_size: usize) {
        let floor = self.delivered.min(self.acked);
        while self.frames.len() > resume_buffer_size {
            match self.frames.front() {
                Some(front) if front.seq <= floor => {
                    self.frames.pop_front();
                }
                _ => break,
            }
        }
    }
}

/// Resumable, bounded, sequenced frame channel for one request
pub struct SharedStream {
    options: StreamOptions,
    state: Mutex<StreamState>,
    readable: Notify,
    writable: Notify,
    cancel: CancellationToken,
}

impl SharedStream {
    pub fn new(options: StreamOptions, cancel: CancellationToken) -> Self {
        Self {
            options,
            state: Mutex::new(StreamState {
                frames: VecDeque::new(),
                next_seq: 1,
                delivered: 0,
                acked: 0,
                closed: false,
                stalled: false,
                closed_at: None,
                last_emit: Instant::now(),
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            cancel,
        }
    }

    /// Cancellation token tied to this stream's request
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Emit one frame, suspending while the outgoing window is full.
    ///
    /// When the window stays full past the stall timeout the stream is
    /// closed with a `stalled` error frame, the request token is
    /// cancelled and `Cancelled` is returned to the producer.
    pub async fn push(&self, payload: FramePayload) -> Result<u64> {
        let give_up_at = Instant::now() + self.options.stall_timeout;
        loop {
            let notified = self.writable.notified();
            {
                let mut state = self.lock();
                if state.closed || self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if (state.inflight() as usize) < self.options.queue_capacity {
                    let frame = state.stamp(payload);
                    state.trim(self.options.resume_buffer_size);
                    drop(state);
                    self.readable.notify_waiters();
                    return Ok(frame.seq);
                }
            }

            let remaining = give_up_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.close_stalled();
                return Err(Error::Cancelled);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::timeout(remaining, notified) => {}
            }
        }
    }

    /// Emit a frame regardless of the window bound. Used for terminal,
    /// error and shutdown frames which must reach the client even when
    /// the window is full.
    pub fn push_final(&self, payload: FramePayload) -> u64 {
        let is_final = payload.kind.is_final();
        let seq = {
            let mut state = self.lock();
            if state.closed {
                return state.next_seq.saturating_sub(1);
            }
            let frame = state.stamp(payload);
            if is_final {
                state.closed = true;
                state.closed_at = Some(Instant::now());
            }
            frame.seq
        };
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        seq
    }

    /// Emit a heartbeat if the stream has been idle for a full heartbeat
    /// interval and the window has room. Never suspends.
    pub fn try_push_heartbeat(&self) -> Option<u64> {
        let seq = {
            let mut state = self.lock();
            if state.closed
                || state.last_emit.elapsed() < self.options.heartbeat_interval
                || (state.inflight() as usize) >= self.options.queue_capacity
            {
                return None;
            }
            state.stamp(FramePayload::heartbeat()).seq
        };
        self.readable.notify_waiters();
        Some(seq)
    }

    fn close_stalled(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.stalled = true;
            let frame = Frame {
                seq: state.next_seq,
                kind: FrameKind::Error,
                producer: None,
                body: serde_json::json!({
                    "kind": "stalled",
                    "message": "client did not drain the stream in time",
                }),
                ts: chrono::Utc::now(),
            };
            state.next_seq += 1;
            state.frames.push_back(frame);
            state.closed = true;
            state.closed_at = Some(Instant::now());
        }
        tracing::warn!("Stream stalled; closing and cancelling the request");
        self.cancel.cancel();
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Close without a final frame (reader-side teardown)
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.closed_at = Some(Instant::now());
        }
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn closed_since(&self) -> Option<Duration> {
        self.lock().closed_at.map(|at| at.elapsed())
    }

    /// Highest assigned sequence number
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq - 1
    }

    /// Acknowledge delivery up to `seq`, releasing window capacity
    pub fn ack(&self, seq: u64) {
        let mut state = self.lock();
        if seq > state.acked {
            state.acked = seq.min(state.next_seq - 1);
            state.trim(self.options.resume_buffer_size);
        }
        drop(state);
        self.writable.notify_waiters();
    }

    /// Whether a reader can resume from `ack` (the frame after it is
    /// still retained, or nothing was emitted past it)
    pub fn can_resume_from(&self, ack: u64) -> bool {
        let state = self.lock();
        if ack >= state.next_seq {
            return false;
        }
        match state.frames.front() {
            Some(front) => ack + 1 >= front.seq,
            None => ack == state.next_seq - 1,
        }
    }

    /// Wait for the frame following `cursor`. Returns `None` once the
    /// stream is closed and fully drained.
    pub async fn next_after(&self, cursor: u64) -> Option<Frame> {
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.lock();
                let found = state.frames.iter().find(|f| f.seq == cursor + 1).cloned();
                if let Some(frame) = found {
                    state.delivered = state.delivered.max(frame.seq);
                    return Some(frame);
                }
                if state.closed && state.next_seq - 1 <= cursor {
                    return None;
                }
                // A gap below the retained tail cannot be served
                if let Some(front) = state.frames.front() {
                    if cursor + 1 < front.seq {
                        return None;
                    }
                }
            }
            notified.await;
        }
    }

    /// Produced-but-unacknowledged frame count, for the backpressure hint
    pub fn pending(&self) -> u64 {
        self.lock().inflight()
    }

    /// Kind of the most recently emitted frame; the final frame of a
    /// finished stream, used for outcome accounting
    pub fn last_frame_kind(&self) -> Option<FrameKind> {
        self.lock().frames.back().map(|f| f.kind)
    }

    pub fn was_stalled(&self) -> bool {
        self.lock().stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;

    fn options() -> StreamOptions {
        StreamOptions {
            queue_capacity: 4,
            resume_buffer_size: 8,
            stall_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    fn stream() -> Arc<SharedStream> {
        Arc::new(SharedStream::new(options(), CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_sequences_start_at_one_and_increase() {
        let stream = stream();
        let first = stream.push(FramePayload::progress("orchestrator", Value::Null)).await.unwrap();
        let second = stream.push(FramePayload::token("orchestrator", "hi")).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_reader_sees_frames_in_order() {
        let stream = stream();
        for i in 0..3 {
            stream.push(FramePayload::token("orchestrator", format!("t{i}"))).await.unwrap();
        }
        stream.push_final(FramePayload::terminal("completed"));

        let mut cursor = 0;
        let mut kinds = Vec::new();
        while let Some(frame) = stream.next_after(cursor).await {
            assert_eq!(frame.seq, cursor + 1);
            cursor = frame.seq;
            stream.ack(frame.seq);
            kinds.push(frame.kind);
        }
        assert_eq!(kinds.len(), 4);
        assert_eq!(kinds[3], FrameKind::Terminal);
    }

    #[tokio::test]
    async fn test_full_window_suspends_producer_until_ack() {
        let stream = stream();
        for _ in 0..4 {
            stream.push(FramePayload::token("o", "x")).await.unwrap();
        }

        let producer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.push(FramePayload::token("o", "y")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        stream.ack(2);
        let seq = producer.await.unwrap().unwrap();
        assert_eq!(seq, 5);
    }

    #[tokio::test]
    async fn test_stalled_stream_closes_and_cancels() {
        let stream = stream();
        for _ in 0..4 {
            stream.push(FramePayload::token("o", "x")).await.unwrap();
        }

        // No acks arrive; the fifth push must stall out
        let err = stream.push(FramePayload::token("o", "y")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(stream.was_stalled());
        assert!(stream.cancel_token().is_cancelled());

        // The stalled error frame is retained for the reader
        let mut cursor = 4;
        let frame = stream.next_after(cursor).await.unwrap();
        cursor = frame.seq;
        assert_eq!(frame.kind, FrameKind::Error);
        assert_eq!(frame.body["kind"], "stalled");
        assert!(stream.next_after(cursor).await.is_none());
    }

    #[tokio::test]
    async fn test_resume_within_buffer() {
        let stream = stream();
        for i in 0..6 {
            stream.push(FramePayload::token("o", format!("t{i}"))).await.unwrap();
            stream.ack(i + 1);
        }
        assert!(stream.can_resume_from(4));
        let frame = stream.next_after(4).await.unwrap();
        assert_eq!(frame.seq, 5);
    }

    #[tokio::test]
    async fn test_resume_past_buffer_is_expired() {
        let opts = StreamOptions {
            queue_capacity: 4,
            resume_buffer_size: 2,
            stall_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
        };
        let stream = Arc::new(SharedStream::new(opts, CancellationToken::new()));
        for i in 0..6 {
            stream.push(FramePayload::token("o", format!("t{i}"))).await.unwrap();
            stream.ack(i + 1);
            // Deliver so the trim floor advances
            stream.next_after(i).await.unwrap();
        }
        // Frames 1..=4 were trimmed away
        assert!(!stream.can_resume_from(1));
        assert!(stream.can_resume_from(5));
    }

    #[tokio::test]
    async fn test_heartbeat_only_when_idle() {
        let stream = stream();
        stream.push(FramePayload::token("o", "x")).await.unwrap();
        assert!(stream.try_push_heartbeat().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let seq = stream.try_push_heartbeat().unwrap();
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn test_push_after_close_is_cancelled() {
        let stream = stream();
        stream.push_final(FramePayload::terminal("completed"));
        let err = stream.push(FramePayload::token("o", "late")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
