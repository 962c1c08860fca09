//! Upstream model client
//!
//! Specialist agents are opaque RPC-addressable services behind the
//! `ModelClient` interface: a unary invoke and a streaming call that
//! yields upstream events. The production implementation speaks HTTP
//! with server-sent events; tests substitute scripted clients.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::observability::TRACEPARENT;
use crate::registry::Tool;

/// One upstream call derived from a gateway request
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub request_id: String,
    pub session_id: Uuid,
    pub intent: Value,
    /// Absolute deadline; always at or before the parent request's
    pub deadline: Instant,
    pub trace_context: Option<String>,
}

impl UpstreamRequest {
    /// Remaining time budget for the call
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Events produced by a streaming upstream call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamEvent {
    /// A piece of generated output
    Token { text: String },
    /// Progress notification, forwarded verbatim
    Progress { detail: Value },
    /// The orchestrator requests a sub-call to another tool. Exactly one
    /// of `tool_id` (direct address) or `capability` must be set.
    Delegate {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        capability: Option<String>,
        intent: Value,
    },
    /// The call finished normally
    Done {
        #[serde(default)]
        detail: Value,
    },
}

pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent>> + Send>>;

/// Abstract model-provider interface
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Unary invocation; returns the tool's response document
    async fn invoke(&self, tool: &Tool, request: &UpstreamRequest) -> Result<Value>;

    /// Streaming invocation; events arrive until `Done` or an error
    async fn open_stream(&self, tool: &Tool, request: &UpstreamRequest) -> Result<UpstreamStream>;
}

/// HTTP implementation: POST `{base_url}/invoke`, streaming responses as
/// server-sent events with one JSON event document per `data:` line
pub struct HttpModelClient {
    client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build upstream client: {e}")))?;
        Ok(Self { client })
    }

    fn build_request(
        &self,
        tool: &Tool,
        request: &UpstreamRequest,
        streaming: bool,
    ) -> Result<reqwest::RequestBuilder> {
        let remaining = request.remaining();
        if remaining.is_zero() {
            return Err(Error::Timeout { tool_id: Some(tool.tool_id.clone()) });
        }

        let url = format!("{}/invoke", tool.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "request_id": request.request_id,
            "session_id": request.session_id,
            "intent": request.intent,
            "stream": streaming,
        });

        let mut builder = self.client.post(&url).json(&body).timeout(remaining);
        if streaming {
            builder = builder.header(http::header::ACCEPT, "text/event-stream");
        }
        if let Some(ref trace) = request.trace_context {
            builder = builder.header(TRACEPARENT, trace);
        }
        Ok(builder)
    }

    fn map_send_error(tool: &Tool, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout { tool_id: Some(tool.tool_id.clone()) }
        } else {
            Error::Upstream {
                tool_id: tool.tool_id.clone(),
                status: None,
                message: error.to_string(),
            }
        }
    }

    async fn check_status(tool: &Tool, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::Upstream {
            tool_id: tool.tool_id.clone(),
            status: Some(status.as_u16()),
            message,
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn invoke(&self, tool: &Tool, request: &UpstreamRequest) -> Result<Value> {
        let response = self
            .build_request(tool, request, false)?
            .send()
            .await
            .map_err(|e| Self::map_send_error(tool, e))?;
        let response = Self::check_status(tool, response).await?;
        response.json().await.map_err(|e| Error::Upstream {
            tool_id: tool.tool_id.clone(),
            status: None,
            message: format!("invalid response body: {e}"),
        })
    }

    async fn open_stream(&self, tool: &Tool, request: &UpstreamRequest) -> Result<UpstreamStream> {
        let response = self
            .build_request(tool, request, true)?
            .send()
            .await
            .map_err(|e| Self::map_send_error(tool, e))?;
        let response = Self::check_status(tool, response).await?;

        let tool_id = tool.tool_id.clone();
        let deadline = request.deadline;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    yield Err(Error::Timeout { tool_id: Some(tool_id.clone()) });
                    return;
                }

                let chunk = match tokio::time::timeout(remaining, bytes.next()).await {
                    Err(_) => {
                        yield Err(Error::Timeout { tool_id: Some(tool_id.clone()) });
                        return;
                    }
                    Ok(None) => {
                        // Upstream closed without a done event
                        yield Ok(UpstreamEvent::Done { detail: Value::Null });
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        yield Err(Error::Upstream {
                            tool_id: tool_id.clone(),
                            status: None,
                            message: e.to_string(),
                        });
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    match serde_json::from_str::<UpstreamEvent>(data.trim()) {
                        Ok(event) => {
                            let done = matches!(event, UpstreamEvent::Done { .. });
                            yield Ok(event);
                            if done {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(tool = %tool_id, error = %e, "Skipping unparseable upstream event");
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let token: UpstreamEvent =
            serde_json::from_str(r#"{"type":"token","text":"hi"}"#).unwrap();
        assert!(matches!(token, UpstreamEvent::Token { ref text } if text == "hi"));

        let delegate: UpstreamEvent = serde_json::from_str(
            r#"{"type":"delegate","capability":"nutrition","intent":{"q":"macros"}}"#,
        )
        .unwrap();
        match delegate {
            UpstreamEvent::Delegate { capability, tool_id, .. } => {
                assert_eq!(capability.as_deref(), Some("nutrition"));
                assert!(tool_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let done: UpstreamEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(matches!(done, UpstreamEvent::Done { .. }));
    }

    #[test]
    fn test_expired_deadline_is_timeout() {
        let client = HttpModelClient::new().unwrap();
        let tool = Tool {
            tool_id: "spec_a".to_string(),
            base_url: "http://spec-a.internal".to_string(),
            capabilities: Default::default(),
            priority: 5,
            status: crate::registry::ToolStatus::Healthy,
            last_probe_at: None,
            consecutive_failures: 0,
        };
        let request = UpstreamRequest {
            request_id: "r1".to_string(),
            session_id: Uuid::new_v4(),
            intent: Value::Null,
            deadline: Instant::now(),
            trace_context: None,
        };
        // Exactly-at-deadline must be treated as timeout, never dispatched
        let err = client.build_request(&tool, &request, false).unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
}
