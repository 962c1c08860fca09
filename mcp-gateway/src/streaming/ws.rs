//! WebSocket wire protocol
//!
//! Both directions carry the shared frame model; in addition the client
//! sends a small set of control messages. The first frame on a socket
//! must be `hello`, optionally carrying a resume token and the last
//! acknowledged sequence number.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the client may send on the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Mandatory first frame
    Hello {
        /// Bearer token or API key
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<uuid::Uuid>,
        /// Resume a previous stream instead of starting fresh
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
        /// Last acknowledged sequence number, with `resume_token`
        #[serde(skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    /// Start a request on this socket
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        intent: Value,
        /// Address a specialist directly (subject to the direct-access flag)
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    /// Acknowledge frames up to `seq`
    Ack { seq: u64 },
    /// Cancel the in-flight request
    Cancel,
    /// Forwarded to presence subscribers; no gateway semantics
    TypingIndicator,
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let raw = r#"{"type":"hello","token":"abc","session_id":null}"#;
        // Null optional fields deserialize as absent
        assert!(matches!(
            ClientMessage::parse(raw).unwrap(),
            ClientMessage::Hello { session_id: None, .. }
        ));

        let raw = r#"{"type":"hello","token":"abc"}"#;
        match ClientMessage::parse(raw).unwrap() {
            ClientMessage::Hello { token, session_id, resume_token, ack } => {
                assert_eq!(token, "abc");
                assert!(session_id.is_none());
                assert!(resume_token.is_none());
                assert!(ack.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_resume_hello() {
        let raw = r#"{"type":"hello","token":"abc","resume_token":"xyz","ack":12}"#;
        match ClientMessage::parse(raw).unwrap() {
            ClientMessage::Hello { resume_token, ack, .. } => {
                assert_eq!(resume_token.as_deref(), Some("xyz"));
                assert_eq!(ack, Some(12));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_control_messages() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"cancel"}"#).unwrap(),
            ClientMessage::Cancel
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"typing-indicator"}"#).unwrap(),
            ClientMessage::TypingIndicator
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"ack","seq":7}"#).unwrap(),
            ClientMessage::Ack { seq: 7 }
        ));
    }
}
