//! Health, metrics and server-info handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::ToolStatus;
use crate::state::AppState;

/// Health document for one tool
#[derive(Debug, Serialize, Deserialize)]
pub struct ToolHealth {
    pub tool_id: String,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// Aggregated health document
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_s: u64,
    pub tools: Vec<ToolHealth>,
    pub streams_open: usize,
}

/// GET / -- server info
pub async fn info(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "name": state.config().service.name,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": "v1",
        "capabilities": ["messages", "streaming", "websocket", "tools", "feature-flags"],
    }))
}

/// GET /health -- aggregated tool status, uptime, open stream count
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let tools: Vec<ToolHealth> = state
        .registry()
        .tools()
        .into_iter()
        .map(|tool| ToolHealth {
            tool_id: tool.tool_id,
            status: tool.status,
            last_probe_at: tool.last_probe_at,
        })
        .collect();

    let orchestrator_id = &state.config().registry.orchestrator_id;
    let orchestrator_down = tools
        .iter()
        .any(|t| &t.tool_id == orchestrator_id && t.status == ToolStatus::Unhealthy);
    let any_impaired = tools
        .iter()
        .any(|t| matches!(t.status, ToolStatus::Degraded | ToolStatus::Unhealthy));

    let status = if orchestrator_down {
        "unhealthy"
    } else if any_impaired {
        "degraded"
    } else {
        "healthy"
    };

    let response = HealthResponse {
        status: status.to_string(),
        uptime_s: state.uptime().as_secs(),
        tools,
        streams_open: state.streams().open_count(),
    };

    let code = if status == "unhealthy" { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (code, Json(response))
}

/// GET /metrics -- Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.refresh_circuit_gauges();
    let body = state.metrics().render()?;
    Ok((
        [(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
