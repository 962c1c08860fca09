//! Streaming transport
//!
//! Server-sent events and the bidirectional socket share one chunk
//! model: every frame carries a per-request sequence number assigned at
//! the write point, so the client-observed sequence is strictly
//! increasing no matter how many producers were hopped.

pub mod connection;
pub mod resume;
pub mod ws;

pub use connection::{SharedStream, StreamOptions};
pub use resume::{StreamHandle, StreamTracker};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame kind on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    Token,
    Progress,
    ToolHop,
    Heartbeat,
    Terminal,
    Error,
    /// Socket-only: connection established
    Presence,
    /// Socket-only: the outgoing queue is filling up
    BackpressureHint,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Token => "token",
            FrameKind::Progress => "progress",
            FrameKind::ToolHop => "tool-hop",
            FrameKind::Heartbeat => "heartbeat",
            FrameKind::Terminal => "terminal",
            FrameKind::Error => "error",
            FrameKind::Presence => "presence",
            FrameKind::BackpressureHint => "backpressure-hint",
        }
    }

    /// Terminal and error frames end a stream
    pub fn is_final(self) -> bool {
        matches!(self, FrameKind::Terminal | FrameKind::Error)
    }
}

/// One stamped frame, as delivered to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub seq: u64,
    pub kind: FrameKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    pub body: Value,
    pub ts: DateTime<Utc>,
}

/// An unstamped frame payload; the connection assigns `seq` and `ts`
#[derive(Debug, Clone)]
pub struct FramePayload {
    pub kind: FrameKind,
    pub producer: Option<String>,
    pub body: Value,
}

impl FramePayload {
    pub fn token(producer: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Token,
            producer: Some(producer.into()),
            body: Value::String(text.into()),
        }
    }

    pub fn progress(producer: impl Into<String>, detail: Value) -> Self {
        Self { kind: FrameKind::Progress, producer: Some(producer.into()), body: detail }
    }

    /// Attribution marker emitted when the producing tool changes
    pub fn tool_hop(producer: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::ToolHop,
            producer: Some(producer.into()),
            body: Value::String(marker.into()),
        }
    }

    pub fn heartbeat() -> Self {
        Self { kind: FrameKind::Heartbeat, producer: None, body: Value::Null }
    }

    pub fn terminal(reason: &str) -> Self {
        Self {
            kind: FrameKind::Terminal,
            producer: None,
            body: serde_json::json!({ "reason": reason }),
        }
    }

    /// Error frame body: `{kind, message, retry_after?, trace_id?}`
    pub fn error(
        kind: &str,
        message: impl Into<String>,
        retry_after_secs: Option<u64>,
        trace_id: Option<&str>,
    ) -> Self {
        let mut body = serde_json::json!({
            "kind": kind,
            "message": message.into(),
        });
        if let Some(secs) = retry_after_secs {
            body["retry_after"] = Value::from(secs);
        }
        if let Some(trace) = trace_id {
            body["trace_id"] = Value::from(trace);
        }
        Self { kind: FrameKind::Error, producer: None, body }
    }

    pub fn presence(detail: Value) -> Self {
        Self { kind: FrameKind::Presence, producer: None, body: detail }
    }

    pub fn backpressure_hint(pending: u64) -> Self {
        Self {
            kind: FrameKind::BackpressureHint,
            producer: None,
            body: serde_json::json!({ "pending": pending }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(serde_json::to_string(&FrameKind::ToolHop).unwrap(), "\"tool-hop\"");
        assert_eq!(serde_json::to_string(&FrameKind::Heartbeat).unwrap(), "\"heartbeat\"");
        assert_eq!(
            serde_json::to_string(&FrameKind::BackpressureHint).unwrap(),
            "\"backpressure-hint\""
        );
    }

    #[test]
    fn test_frame_serialization_shape() {
        let frame = Frame {
            seq: 3,
            kind: FrameKind::Token,
            producer: Some("orchestrator".to_string()),
            body: Value::String("hello".to_string()),
            ts: Utc::now(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["kind"], "token");
        assert_eq!(json["producer"], "orchestrator");
        assert!(json["ts"].is_string());
    }

    #[test]
    fn test_error_frame_body() {
        let payload =
            FramePayload::error("resume-expired", "replay window exceeded", Some(2), Some("abc"));
        assert_eq!(payload.body["kind"], "resume-expired");
        assert_eq!(payload.body["retry_after"], 2);
        assert_eq!(payload.body["trace_id"], "abc");
    }
}
