//! Bidirectional streaming socket
//!
//! The first client frame must be `hello`, carrying the credential
//! in-band (browsers cannot set headers on socket upgrades). A hello
//! with a resume token reattaches to a previous stream and replays from
//! the acknowledged sequence number; otherwise the client starts
//! requests with `message` frames. One request is in flight per socket
//! at a time.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::middleware::TenantContext;
use crate::orchestrator::GatewayRequest;
use crate::ratelimit::{Admission, EndpointClass};
use crate::session::{Session, Transport};
use crate::state::AppState;
use crate::streaming::ws::ClientMessage;
use crate::streaming::{Frame, FrameKind, FramePayload, SharedStream, StreamHandle, StreamOptions};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// GET /ws -- upgrade to the socket protocol
pub async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Socket-level frames (presence, rejected hello, resume-expired) sit
/// outside any request sequence and carry seq 0
fn control_frame(payload: FramePayload) -> Frame {
    Frame {
        seq: 0,
        kind: payload.kind,
        producer: payload.producer,
        body: payload.body,
        ts: chrono::Utc::now(),
    }
}

async fn send_frame(out: &mpsc::Sender<WsMessage>, frame: &Frame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => out.send(WsMessage::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();

    // Single writer task; both the control loop and the frame forwarder
    // feed it
    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(64);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // The hello must arrive promptly
    let hello = tokio::time::timeout(HELLO_TIMEOUT, next_client_message(&mut source)).await;
    let Ok(Some(message)) = hello else {
        let frame = control_frame(FramePayload::error(
            "unauthenticated",
            "expected a hello frame",
            None,
            None,
        ));
        let _ = send_frame(&out_tx, &frame).await;
        drop(out_tx);
        let _ = writer.await;
        return;
    };

    let ClientMessage::Hello { token, session_id, resume_token, ack } = message else {
        let frame = control_frame(FramePayload::error(
            "unauthenticated",
            "first frame must be hello",
            None,
            None,
        ));
        let _ = send_frame(&out_tx, &frame).await;
        drop(out_tx);
        let _ = writer.await;
        return;
    };

    let tenant = match state.authenticator().authenticate_token(&token) {
        Ok(tenant) => tenant,
        Err(error) => {
            let frame =
                control_frame(FramePayload::error(error.kind(), error.to_string(), None, None));
            let _ = send_frame(&out_tx, &frame).await;
            drop(out_tx);
            let _ = writer.await;
            return;
        }
    };

    let _ = send_frame(
        &out_tx,
        &control_frame(FramePayload::presence(serde_json::json!({
            "tenant_id": tenant.tenant_id,
            "connected": true,
        }))),
    )
    .await;

    let mut connection = Connection {
        state,
        tenant,
        session_id,
        out_tx,
        active: None,
    };

    // Resume before anything else when requested
    if let Some(token) = resume_token {
        connection.resume(&token, ack.unwrap_or(0)).await;
    }

    while let Some(message) = next_client_message(&mut source).await {
        if !connection.handle(message).await {
            break;
        }
    }

    // Socket gone. The active stream is left producing into its buffer
    // so the client may resume; the stall timeout bounds how long.
    drop(connection);
    let _ = writer.await;
}

async fn next_client_message(
    source: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<ClientMessage> {
    loop {
        match source.next().await? {
            Ok(WsMessage::Text(text)) => match ClientMessage::parse(&text) {
                Ok(message) => return Some(message),
                Err(error) => {
                    tracing::debug!(%error, "Ignoring unparseable client frame");
                }
            },
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

struct Connection {
    state: AppState,
    tenant: TenantContext,
    session_id: Option<Uuid>,
    out_tx: mpsc::Sender<WsMessage>,
    active: Option<Arc<StreamHandle>>,
}

impl Connection {
    /// Process one client message; false closes the connection
    async fn handle(&mut self, message: ClientMessage) -> bool {
        match message {
            ClientMessage::Hello { .. } => {
                self.send_error(Error::BadRequest("duplicate hello".into())).await
            }
            ClientMessage::Message { request_id, intent, tool } => {
                self.start_request(request_id, intent, tool).await
            }
            ClientMessage::Ack { seq } => {
                if let Some(ref handle) = self.active {
                    handle.stream.ack(seq);
                }
                true
            }
            ClientMessage::Cancel => {
                if let Some(ref handle) = self.active {
                    tracing::debug!(request = %handle.request_id, "Client cancelled request");
                    handle.stream.cancel_token().cancel();
                }
                true
            }
            ClientMessage::TypingIndicator => true,
        }
    }

    async fn send_error(&self, error: Error) -> bool {
        let retry = error.retry_after().map(|d| d.as_secs().max(1));
        let frame = control_frame(FramePayload::error(error.kind(), error.to_string(), retry, None));
        send_frame(&self.out_tx, &frame).await
    }

    /// Reattach to a previous stream and replay from `ack`
    async fn resume(&mut self, resume_token: &str, ack: u64) {
        let Some(handle) = self.state.streams().lookup(resume_token) else {
            let frame = control_frame(FramePayload::error(
                "resume-expired",
                "unknown or expired resume token",
                None,
                None,
            ));
            let _ = send_frame(&self.out_tx, &frame).await;
            return;
        };

        if handle.tenant_id != self.tenant.tenant_id {
            let _ = self
                .send_error(Error::PermissionDenied("stream belongs to another tenant".into()))
                .await;
            return;
        }

        if !handle.stream.can_resume_from(ack) {
            let frame = control_frame(FramePayload::error(
                "resume-expired",
                "acknowledged sequence fell out of the replay window",
                None,
                None,
            ));
            let _ = send_frame(&self.out_tx, &frame).await;
            return;
        }

        tracing::debug!(request = %handle.request_id, ack, "Stream resumed");
        self.session_id = Some(handle.session_id);
        self.spawn_forwarder(Arc::clone(&handle), ack);
        self.active = Some(handle);
    }

    async fn start_request(
        &mut self,
        request_id: Option<String>,
        intent: Value,
        tool: Option<String>,
    ) -> bool {
        if let Some(ref handle) = self.active {
            if !handle.stream.is_closed() {
                return self
                    .send_error(Error::Conflict("a request is already in flight".into()))
                    .await;
            }
        }
        if intent.is_null() {
            return self.send_error(Error::BadRequest("intent must not be null".into())).await;
        }

        // Socket traffic is write-class, like the message endpoint
        let admission = self
            .state
            .limiter()
            .admit(
                &self.tenant.tenant_id,
                &self.tenant.rate_plan,
                "messages",
                EndpointClass::Write,
                1.0,
            )
            .await;
        if let Admission::Throttled { retry_after } = admission {
            return self.send_error(Error::Throttled { retry_after }).await;
        }

        let mut session = match self.resolve_session().await {
            Ok(session) => session,
            Err(error) => return self.send_error(error).await,
        };
        session.pending_request_count += 1;
        session.touch();
        if let Err(error) = self.state.sessions().save(&mut session).await {
            return self.send_error(error).await;
        }
        self.session_id = Some(session.session_id);

        let request = GatewayRequest {
            request_id: request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id: session.session_id,
            tenant_id: self.tenant.tenant_id.clone(),
            intent,
            deadline: Instant::now() + self.state.config().service.request_timeout(),
            trace_context: None,
            requested_tool: tool,
        };

        let options = StreamOptions::from(&self.state.config().streaming);
        let cancel = self.state.shutdown_token().child_token();
        let stream = Arc::new(SharedStream::new(options, cancel));
        let handle = self.state.streams().register(
            request.request_id.clone(),
            session.session_id,
            self.tenant.tenant_id.clone(),
            Arc::clone(&stream),
        );

        // Tell the client how to come back
        let _ = send_frame(
            &self.out_tx,
            &control_frame(FramePayload::presence(serde_json::json!({
                "request_id": request.request_id,
                "session_id": session.session_id,
                "resume_token": handle.resume_token,
            }))),
        )
        .await;

        // Producer task
        {
            let state = self.state.clone();
            let handle = Arc::clone(&handle);
            let stream = Arc::clone(&stream);
            let tenant_id = self.tenant.tenant_id.clone();
            let started = Instant::now();
            tokio::spawn(async move {
                state.orchestrator().run(request, Arc::clone(&stream)).await;
                state.streams().complete(&handle);
                super::messages::finalize_session(&state, handle.session_id).await;
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

        self.spawn_forwarder(Arc::clone(&handle), 0);
        self.active = Some(handle);
        true
    }

    async fn resolve_session(&self) -> crate::error::Result<Session> {
        match self.session_id {
            Some(id) => {
                let session = self
                    .state
                    .sessions()
                    .load(id)
                    .await?
                    .ok_or_else(|| Error::BadRequest(format!("unknown session: {id}")))?;
                if session.tenant_id != self.tenant.tenant_id {
                    return Err(Error::PermissionDenied(
                        "session belongs to another tenant".into(),
                    ));
                }
                let mut session = session;
                session.transport = Transport::Websocket;
                Ok(session)
            }
            None => Ok(Session::new(self.tenant.tenant_id.clone(), Transport::Websocket)),
        }
    }

    /// Pump frames from the shared stream to the socket, with heartbeats
    /// and backpressure hints
    fn spawn_forwarder(&self, handle: Arc<StreamHandle>, from: u64) {
        let out_tx = self.out_tx.clone();
        let metrics = Arc::clone(self.state.metrics());
        tokio::spawn(async move {
            let options = handle.stream.options();
            let hint_threshold = (options.queue_capacity as u64 * 3) / 4;
            let mut ticker = tokio::time::interval(options.heartbeat_interval);
            let mut cursor = from;
            let mut hinted = false;

            loop {
                tokio::select! {
                    maybe = handle.stream.next_after(cursor) => {
                        let Some(frame) = maybe else { break };
                        cursor = frame.seq;
                        let is_final = frame.kind.is_final();
                        if !send_frame(&out_tx, &frame).await {
                            // Socket gone; stop forwarding, keep producing
                            break;
                        }
                        if is_final {
                            break;
                        }

                        let pending = handle.stream.pending();
                        if pending >= hint_threshold && !hinted {
                            hinted = true;
                            let hint = control_frame(FramePayload::backpressure_hint(pending));
                            let _ = send_frame(&out_tx, &hint).await;
                        } else if pending < hint_threshold {
                            hinted = false;
                        }
                    }
                    _ = ticker.tick() => {
                        if handle.stream.try_push_heartbeat().is_some() {
                            metrics.chunks_emitted.inc();
                        }
                    }
                }
            }
        });
    }
}
