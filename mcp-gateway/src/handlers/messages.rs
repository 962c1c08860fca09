//! The message endpoint: unary or server-streaming orchestration

use axum::{
    extract::State,
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::flags::{names, FlagContext};
use crate::middleware::TenantContext;
use crate::observability::TRACEPARENT;
use crate::orchestrator::GatewayRequest;
use crate::session::{Session, Transport};
use crate::state::AppState;
use crate::streaming::{FrameKind, SharedStream, StreamOptions};

/// POST /v1/messages body
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    pub intent: Value,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// Specialists the client addresses directly; the first entry is used
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

/// POST /v1/messages -- unary JSON or `text/event-stream`
pub async fn messages(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
    Json(body): Json<MessageRequest>,
) -> Result<Response> {
    if body.intent.is_null() {
        return Err(Error::BadRequest("intent must not be null".into()));
    }

    let ctx = FlagContext::for_tenant(&tenant.tenant_id);
    let streaming_requested = body.stream.unwrap_or(false);
    let streaming = streaming_requested && state.flags().evaluate(names::STREAMING_ENABLED, &ctx);
    if streaming_requested && !streaming {
        tracing::debug!(tenant = %tenant.tenant_id, "Streaming disabled by flag; serving unary");
    }

    let transport = if streaming { Transport::Sse } else { Transport::Unary };
    let mut session = resolve_session(&state, &tenant, body.session_id, transport).await?;

    let request = GatewayRequest {
        request_id: body.request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        session_id: session.session_id,
        tenant_id: tenant.tenant_id.clone(),
        intent: body.intent,
        deadline: Instant::now() + state.config().service.request_timeout(),
        trace_context: headers
            .get(TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        requested_tool: body.tools.as_ref().and_then(|tools| tools.first().cloned()),
    };

    session.pending_request_count += 1;
    session.touch();
    state.sessions().save(&mut session).await?;

    if streaming {
        Ok(serve_streaming(state, tenant, request).await)
    } else {
        serve_unary(state, tenant, request).await
    }
}

/// Load the named session or create a fresh one. A session belongs to
/// exactly one tenant.
async fn resolve_session(
    state: &AppState,
    tenant: &TenantContext,
    session_id: Option<Uuid>,
    transport: Transport,
) -> Result<Session> {
    match session_id {
        Some(id) => {
            let mut session = state
                .sessions()
                .load(id)
                .await?
                .ok_or_else(|| Error::BadRequest(format!("unknown session: {id}")))?;
            if session.tenant_id != tenant.tenant_id {
                return Err(Error::PermissionDenied("session belongs to another tenant".into()));
            }
            session.transport = transport;
            Ok(session)
        }
        None => Ok(Session::new(tenant.tenant_id.clone(), transport)),
    }
}

/// Decrement the pending counter when a request finishes; a lost CAS
/// race is retried once against the fresh record.
pub(crate) async fn finalize_session(state: &AppState, session_id: Uuid) {
    for _ in 0..2 {
        let Ok(Some(mut session)) = state.sessions().load(session_id).await else {
            return;
        };
        session.pending_request_count = session.pending_request_count.saturating_sub(1);
        session.touch();
        match state.sessions().save(&mut session).await {
            Ok(()) => return,
            Err(Error::Conflict(_)) => continue,
            Err(error) => {
                tracing::warn!(%session_id, %error, "Failed to finalize session");
                return;
            }
        }
    }
}

async fn serve_unary(
    state: AppState,
    tenant: TenantContext,
    request: GatewayRequest,
) -> Result<Response> {
    let started = Instant::now();
    let session_id = request.session_id;
    let result = state.orchestrator().run_unary(request).await;

    finalize_session(&state, session_id).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(error) => error.kind(),
    };
    state.metrics().record_request(
        &tenant.tenant_id,
        "messages",
        outcome,
        started.elapsed().as_secs_f64(),
    );

    result.map(|value| Json(value).into_response())
}

async fn serve_streaming(
    state: AppState,
    tenant: TenantContext,
    request: GatewayRequest,
) -> Response {
    let options = StreamOptions::from(&state.config().streaming);
    let cancel = state.shutdown_token().child_token();
    let stream = Arc::new(SharedStream::new(options, cancel));
    let handle = state.streams().register(
        request.request_id.clone(),
        request.session_id,
        tenant.tenant_id.clone(),
        Arc::clone(&stream),
    );

    // Producer: drive the state machine, then settle the books
    {
        let state = state.clone();
        let stream = Arc::clone(&stream);
        let handle = Arc::clone(&handle);
        let tenant_id = tenant.tenant_id.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            state.orchestrator().run(request, Arc::clone(&stream)).await;
            state.streams().complete(&handle);
            finalize_session(&state, handle.session_id).await;

            let outcome = match stream.last_frame_kind() {
                Some(FrameKind::Terminal) => "ok",
                Some(FrameKind::Error) => "error",
                _ => "cancelled",
            };
            state.metrics().record_request(
                &tenant_id,
                "messages",
                outcome,
                started.elapsed().as_secs_f64(),
            );
        });
    }

    let events = frame_events(state, stream);
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

/// Bridge a shared stream onto SSE: one event per frame, `event:` set to
/// the frame kind. Dropping the response body (client disconnect)
/// cancels the request.
fn frame_events(
    state: AppState,
    stream: Arc<SharedStream>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    let heartbeat = stream.options().heartbeat_interval;
    async_stream::stream! {
        // Cancels the request when the client goes away mid-stream
        let _guard = stream.cancel_token().clone().drop_guard();
        let mut ticker = tokio::time::interval(heartbeat);
        let mut cursor = 0u64;

        loop {
            tokio::select! {
                maybe = stream.next_after(cursor) => {
                    let Some(frame) = maybe else { break };
                    cursor = frame.seq;
                    // SSE has no client acks; delivery is acknowledgment
                    stream.ack(frame.seq);
                    let is_final = frame.kind.is_final();
                    let event = Event::default()
                        .event(frame.kind.as_str())
                        .data(serde_json::to_string(&frame).unwrap_or_default());
                    yield Ok(event);
                    if is_final {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if stream.try_push_heartbeat().is_some() {
                        state.metrics().chunks_emitted.inc();
                    }
                }
            }
        }
    }
}
