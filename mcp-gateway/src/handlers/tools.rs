//! Tool registry handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::config::ToolConfig;
use crate::error::{Error, Result};
use crate::middleware::TenantContext;
use crate::registry::{Tool, ToolStatus};
use crate::state::AppState;

/// Scope required for dynamic registration
const MANAGE_SCOPE: &str = "tools:manage";

/// Tenant-visible tool document
#[derive(Debug, Serialize, Deserialize)]
pub struct ToolView {
    pub tool_id: String,
    pub status: ToolStatus,
    pub capabilities: Vec<String>,
    pub priority: u8,
}

impl From<Tool> for ToolView {
    fn from(tool: Tool) -> Self {
        Self {
            tool_id: tool.tool_id,
            status: tool.status,
            capabilities: tool.capabilities.into_iter().collect(),
            priority: tool.priority,
        }
    }
}

/// GET /tools -- the tenant-visible subset of the registry
pub async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    let tools: Vec<ToolView> = state.registry().tools().into_iter().map(ToolView::from).collect();
    Json(serde_json::json!({ "tools": tools }))
}

/// Registration payload
#[derive(Debug, Deserialize)]
pub struct RegisterTool {
    pub tool_id: String,
    pub base_url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    5
}

/// POST /tools -- dynamic registration
pub async fn register_tool(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<RegisterTool>,
) -> Result<impl IntoResponse> {
    tenant.require_scope(MANAGE_SCOPE)?;

    if body.tool_id.is_empty() {
        return Err(Error::BadRequest("tool_id must not be empty".into()));
    }
    if !body.base_url.starts_with("http://") && !body.base_url.starts_with("https://") {
        return Err(Error::BadRequest("base_url must be an http(s) URL".into()));
    }

    let tool = Tool::from_config(&ToolConfig {
        tool_id: body.tool_id,
        base_url: body.base_url,
        capabilities: body.capabilities,
        priority: body.priority,
    });
    let changed = state.registry().register(tool.clone());

    let code = if changed { StatusCode::CREATED } else { StatusCode::OK };
    Ok((code, Json(serde_json::json!({ "tool_id": tool.tool_id, "changed": changed }))))
}

/// DELETE /tools/{tool_id} -- deregistration
pub async fn deregister_tool(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Path(tool_id): Path<String>,
) -> Result<impl IntoResponse> {
    tenant.require_scope(MANAGE_SCOPE)?;

    if !state.registry().deregister(&tool_id) {
        return Err(Error::BadRequest(format!("unknown tool id: {tool_id}")));
    }
    state.breaker().remove(&tool_id);
    Ok(StatusCode::NO_CONTENT)
}
