//! HTTP surface and router assembly

pub mod flags;
pub mod health;
pub mod messages;
pub mod tools;
pub mod ws;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::{from_fn_with_state, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};

use crate::error::Error;
use crate::middleware::{auth_middleware, rate_limit_middleware};
use crate::state::AppState;

/// New work is refused while the process is not (or no longer) ready;
/// in-flight streams keep draining.
async fn readiness_gate(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    if !state.is_ready() {
        return Err(Error::ToolUnavailable {
            tool_id: state.config().service.name.clone(),
            retry_after: Some(std::time::Duration::from_secs(2)),
            half_open: false,
        });
    }
    Ok(next.run(request).await)
}

/// Assemble the full application router
pub fn router(state: AppState) -> Router {
    // Informational endpoints stay reachable during startup and drain
    let public = Router::new()
        .route("/", get(health::info))
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics));

    // Tenant traffic: admission (auth), then rate limiting, behind the
    // readiness gate. Layers run top to bottom for a request.
    let protected = Router::new()
        .route("/v1/messages", post(messages::messages))
        .route("/tools", get(tools::list_tools).post(tools::register_tool))
        .route("/tools/{tool_id}", delete(tools::deregister_tool))
        .route("/feature-flags/client", get(flags::client_flags))
        .layer(from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .layer(from_fn_with_state(state.clone(), readiness_gate));

    // The socket authenticates in-band with its hello frame
    let socket = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .layer(from_fn_with_state(state.clone(), readiness_gate));

    public.merge(protected).merge(socket).with_state(state)
}
