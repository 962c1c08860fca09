//! Orchestration state machine
//!
//! Each admitted request walks Received → Planning → Dispatching →
//! Calling → Streaming → Completing (or Failed). Planning consults the
//! feature flags: in single-entry-point mode all traffic funnels to the
//! orchestrator tool, which may emit delegate events that loop back into
//! dispatch as child calls. A per-request depth counter caps the fan-out.
//!
//! Upstream calls run through the resilience pipeline: effective
//! deadline, retry on transient connect errors, and the per-tool circuit
//! breaker. Once events have flowed from a stream, errors surface rather
//! than retry so output is never duplicated.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::config::{OrchestrationConfig, RegistryConfig};
use crate::error::{Error, Result};
use crate::flags::{names, FlagContext, FlagEvaluator};
use crate::metrics::Metrics;
use crate::registry::{SelectionPolicy, Tool, ToolRegistry, ToolStatus};
use crate::resilience::{retry_with_backoff, CircuitBreaker, RetryPolicy};
use crate::streaming::{FramePayload, SharedStream};
use crate::upstream::{ModelClient, UpstreamEvent, UpstreamRequest};

/// One admitted unit of work
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub request_id: String,
    pub session_id: Uuid,
    pub tenant_id: String,
    pub intent: Value,
    /// Absolute deadline; upstream calls never exceed it
    pub deadline: Instant,
    pub trace_context: Option<String>,
    /// Specialist explicitly addressed by the client, if any
    pub requested_tool: Option<String>,
}

/// Chosen route for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Funnel through the orchestrator tool
    Orchestrator,
    /// Call a specialist directly
    Direct(String),
}

/// Attribution bookkeeping: a marker frame is emitted whenever the
/// producing tool changes mid-stream
struct Attribution {
    enabled: bool,
    format: String,
    last_producer: Mutex<Option<String>>,
}

impl Attribution {
    fn new(enabled: bool, format: String) -> Self {
        Self { enabled, format, last_producer: Mutex::new(None) }
    }

    /// Returns the marker to emit before output from `producer`, if the
    /// producer changed since the previous chunk
    fn on_producer(&self, producer: &str) -> Option<String> {
        let mut last = match self.last_producer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let changed = last.as_deref().is_some_and(|prev| prev != producer);
        let first = last.is_none();
        if first || changed {
            *last = Some(producer.to_string());
        }
        if self.enabled && changed {
            Some(self.format.replace("{tool}", producer))
        } else {
            None
        }
    }
}

/// Drives requests through planning, dispatch and streaming aggregation
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    breaker: Arc<CircuitBreaker>,
    model_client: Arc<dyn ModelClient>,
    flags: Arc<FlagEvaluator>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    orchestrator_id: String,
    config: OrchestrationConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        breaker: Arc<CircuitBreaker>,
        model_client: Arc<dyn ModelClient>,
        flags: Arc<FlagEvaluator>,
        metrics: Arc<Metrics>,
        retry: RetryPolicy,
        registry_config: &RegistryConfig,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            registry,
            breaker,
            model_client,
            flags,
            metrics,
            retry,
            orchestrator_id: registry_config.orchestrator_id.clone(),
            config,
        }
    }

    /// Planning: decide the route from flags and the request
    #[tracing::instrument(name = "planning", skip_all, fields(request_id = %request.request_id))]
    pub fn plan(&self, request: &GatewayRequest) -> Route {
        let ctx = FlagContext::for_tenant(&request.tenant_id);
        if self.flags.evaluate(names::SINGLE_ENTRY_POINT_MODE, &ctx) {
            return Route::Orchestrator;
        }
        if let Some(ref tool_id) = request.requested_tool {
            if self.flags.evaluate(names::ENABLE_DIRECT_TOOL_ACCESS, &ctx) {
                return Route::Direct(tool_id.clone());
            }
        }
        Route::Orchestrator
    }

    /// Run a request to completion against a stream. Always finishes the
    /// stream with exactly one terminal or error frame (none on client
    /// cancellation, where nobody is listening).
    pub async fn run(&self, request: GatewayRequest, stream: Arc<SharedStream>) {
        let route = self.plan(&request);
        tracing::debug!(request_id = %request.request_id, ?route, "Route planned");

        let attribution = self.attribution_for(&request);
        let deadline = tokio::time::Instant::from_std(request.deadline);
        let cancel = stream.cancel_token().clone();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(Error::Timeout { tool_id: None }),
            result = self.dispatch(&request, route, 0, &stream, &attribution) => result,
        };

        match outcome {
            Ok(()) => {
                stream.push_final(FramePayload::terminal("completed"));
                self.metrics.chunks_emitted.inc();
            }
            Err(Error::Cancelled) => {
                // Client went away or shutdown already emitted its frame
                stream.close();
            }
            Err(error) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    kind = error.kind(),
                    %error,
                    "Request failed"
                );
                stream.push_final(error_frame(&error, &request.request_id));
                self.metrics.chunks_emitted.inc();
            }
        }
    }

    /// Unary execution: the same machinery, collected instead of pushed
    /// over a transport.
    pub async fn run_unary(&self, request: GatewayRequest) -> Result<Value> {
        let collect_options = crate::streaming::StreamOptions {
            // Effectively unbounded: nothing acknowledges a collector
            queue_capacity: usize::MAX / 2,
            resume_buffer_size: usize::MAX / 2,
            stall_timeout: request.deadline.saturating_duration_since(Instant::now()),
            heartbeat_interval: std::time::Duration::from_secs(3600),
        };
        let stream = Arc::new(SharedStream::new(
            collect_options,
            tokio_util::sync::CancellationToken::new(),
        ));

        let route = self.plan(&request);
        let attribution = self.attribution_for(&request);
        let deadline = tokio::time::Instant::from_std(request.deadline);

        let result = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => Err(Error::Timeout { tool_id: None }),
            result = self.dispatch(&request, route, 0, &stream, &attribution) => result,
        };
        result?;

        let mut content = String::new();
        let mut producers: Vec<String> = Vec::new();
        let mut chunks = 0u64;
        let mut cursor = 0u64;
        stream.push_final(FramePayload::terminal("completed"));
        while let Some(frame) = stream.next_after(cursor).await {
            cursor = frame.seq;
            chunks += 1;
            if frame.kind == crate::streaming::FrameKind::Token {
                if let Some(text) = frame.body.as_str() {
                    content.push_str(text);
                }
            }
            if let Some(producer) = frame.producer {
                if producers.last() != Some(&producer) {
                    producers.push(producer);
                }
            }
        }

        Ok(serde_json::json!({
            "request_id": request.request_id,
            "session_id": request.session_id,
            "content": content,
            "chunks": chunks,
            "producers": producers,
        }))
    }

    fn attribution_for(&self, request: &GatewayRequest) -> Attribution {
        let ctx = FlagContext::for_tenant(&request.tenant_id);
        let enabled = self.flags.evaluate(names::EMIT_ATTRIBUTION, &ctx);
        let format = self
            .flags
            .payload(names::ATTRIBUTION_FORMAT)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "[{tool}]".to_string());
        Attribution::new(enabled, format)
    }

    /// Dispatching: resolve a tool for the route, apply the fallback
    /// policy, and drive the protected call. Delegate events recurse here
    /// with an incremented depth.
    fn dispatch<'a>(
        &'a self,
        request: &'a GatewayRequest,
        route: Route,
        depth: u32,
        stream: &'a SharedStream,
        attribution: &'a Attribution,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if depth > self.config.max_hop_depth {
                return Err(Error::BadRequest(format!(
                    "hop depth {} exceeds the maximum of {}",
                    depth, self.config.max_hop_depth
                )));
            }

            let tool = self.resolve(request, &route)?;
            tracing::debug!(
                request_id = %request.request_id,
                tool = %tool.tool_id,
                depth,
                "Dispatching"
            );
            self.call_streaming(request, &tool, depth, stream, attribution).await
        }
        .boxed()
    }

    /// Resolve the route to a concrete tool, applying the fallback policy
    /// when the orchestrator is not available
    fn resolve(&self, request: &GatewayRequest, route: &Route) -> Result<Tool> {
        match route {
            Route::Direct(tool_id) => {
                let tool = self
                    .registry
                    .get(tool_id)
                    .ok_or_else(|| Error::BadRequest(format!("unknown tool id: {tool_id}")))?;
                match tool.status {
                    ToolStatus::Healthy | ToolStatus::Degraded => Ok(tool),
                    _ => Err(Error::ToolUnavailable {
                        tool_id: tool.tool_id,
                        retry_after: None,
                        half_open: false,
                    }),
                }
            }
            Route::Orchestrator => {
                if let Some(tool) = self.registry.get(&self.orchestrator_id) {
                    if matches!(tool.status, ToolStatus::Healthy | ToolStatus::Unknown) {
                        return Ok(tool);
                    }
                }
                self.orchestrator_fallback(request)
            }
        }
    }

    /// Fallback when the orchestrator is unhealthy: bypass to the best
    /// matching specialist in degraded mode when direct access is on,
    /// otherwise surface service unavailability with a retry hint.
    fn orchestrator_fallback(&self, request: &GatewayRequest) -> Result<Tool> {
        let ctx = FlagContext::for_tenant(&request.tenant_id);
        if self.flags.evaluate(names::ENABLE_DIRECT_TOOL_ACCESS, &ctx) {
            let capability = request
                .intent
                .get("capability")
                .and_then(Value::as_str);
            let specialist = self
                .registry
                .select_best_effort(capability, SelectionPolicy::Priority)
                .filter(|tool| tool.tool_id != self.orchestrator_id);
            if let Some(tool) = specialist {
                tracing::warn!(
                    request_id = %request.request_id,
                    specialist = %tool.tool_id,
                    "Orchestrator unavailable; bypassing to specialist in degraded mode"
                );
                return Ok(tool);
            }
        }
        Err(Error::ToolUnavailable {
            tool_id: self.orchestrator_id.clone(),
            retry_after: Some(std::time::Duration::from_secs(5)),
            half_open: false,
        })
    }

    /// Calling + Streaming: open the protected upstream stream and
    /// aggregate its events into the request's frame sequence.
    #[tracing::instrument(name = "dispatch", skip_all, fields(tool = %tool.tool_id))]
    async fn call_streaming(
        &self,
        request: &GatewayRequest,
        tool: &Tool,
        depth: u32,
        stream: &SharedStream,
        attribution: &Attribution,
    ) -> Result<()> {
        // Effective deadline: never beyond the request's own
        let effective_deadline = request
            .deadline
            .min(Instant::now() + self.config.default_upstream_timeout());

        let upstream_request = UpstreamRequest {
            request_id: request.request_id.clone(),
            session_id: request.session_id,
            intent: request.intent.clone(),
            deadline: effective_deadline,
            trace_context: request.trace_context.clone(),
        };

        let cancel = stream.cancel_token();
        let started = Instant::now();

        // Opening the stream is idempotent and retried on transient
        // failures; each attempt takes a fresh breaker permit.
        let (permit, mut events) =
            retry_with_backoff(self.retry, effective_deadline, cancel, |attempt| {
                let upstream_request = upstream_request.clone();
                async move {
                    if attempt > 1 {
                        tracing::debug!(tool = %tool.tool_id, attempt, "Retrying upstream connect");
                    }
                    let permit = self.breaker.try_acquire(&tool.tool_id)?;
                    match self.model_client.open_stream(tool, &upstream_request).await {
                        Ok(events) => Ok((permit, events)),
                        Err(error) => {
                            permit.failure();
                            Err(error)
                        }
                    }
                }
            })
            .await?;

        let outcome = self
            .consume_events(request, tool, depth, stream, attribution, &mut events)
            .await;

        self.metrics
            .upstream_latency_seconds
            .with_label_values(&[tool.tool_id.as_str()])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => {
                permit.success();
                Ok(())
            }
            Err(Error::Cancelled) => {
                // The permit drop releases a half-open trial without
                // counting the cancelled call either way
                Err(Error::Cancelled)
            }
            Err(error) => {
                permit.failure();
                Err(error)
            }
        }
    }

    #[tracing::instrument(name = "streaming", skip_all)]
    async fn consume_events(
        &self,
        request: &GatewayRequest,
        tool: &Tool,
        depth: u32,
        stream: &SharedStream,
        attribution: &Attribution,
        events: &mut crate::upstream::UpstreamStream,
    ) -> Result<()> {
        let cancel = stream.cancel_token().clone();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = events.next() => event,
            };

            match event {
                None => return Ok(()),
                Some(Err(error)) => return Err(error),
                Some(Ok(UpstreamEvent::Done { .. })) => return Ok(()),
                Some(Ok(UpstreamEvent::Token { text })) => {
                    self.emit_attributed(stream, attribution, &tool.tool_id).await?;
                    self.emit(stream, FramePayload::token(&tool.tool_id, text)).await?;
                }
                Some(Ok(UpstreamEvent::Progress { detail })) => {
                    self.emit(stream, FramePayload::progress(&tool.tool_id, detail)).await?;
                }
                Some(Ok(UpstreamEvent::Delegate { tool_id, capability, intent })) => {
                    let child_route = self.delegate_route(tool_id, capability.as_deref())?;
                    let child_request = GatewayRequest {
                        intent,
                        ..request.clone()
                    };
                    self.dispatch(&child_request, child_route, depth + 1, stream, attribution)
                        .await?;
                }
            }
        }
    }

    /// Resolve a delegate event to a child route
    fn delegate_route(
        &self,
        tool_id: Option<String>,
        capability: Option<&str>,
    ) -> Result<Route> {
        if let Some(tool_id) = tool_id {
            return Ok(Route::Direct(tool_id));
        }
        let tool = self
            .registry
            .select(capability, SelectionPolicy::Priority)
            .ok_or_else(|| match capability {
                Some(c) => Error::ToolUnavailable {
                    tool_id: format!("capability:{c}"),
                    retry_after: None,
                    half_open: false,
                },
                None => Error::BadRequest("delegate event names no tool or capability".into()),
            })?;
        Ok(Route::Direct(tool.tool_id))
    }

    async fn emit_attributed(
        &self,
        stream: &SharedStream,
        attribution: &Attribution,
        producer: &str,
    ) -> Result<()> {
        if let Some(marker) = attribution.on_producer(producer) {
            self.emit(stream, FramePayload::tool_hop(producer, marker)).await?;
        }
        Ok(())
    }

    async fn emit(&self, stream: &SharedStream, payload: FramePayload) -> Result<()> {
        self.metrics.queue_depth.observe(stream.pending() as f64);
        stream.push(payload).await?;
        self.metrics.chunks_emitted.inc();
        Ok(())
    }
}

/// Build the error frame for a failed request, translating tool
/// unavailability into the wire-level `service_unavailable` kind
fn error_frame(error: &Error, trace_id: &str) -> FramePayload {
    let kind = match error.kind() {
        "tool_unavailable" => "service_unavailable",
        other => other,
    };
    let retry_after = error.retry_after().map(|d| d.as_secs().max(1));
    FramePayload::error(kind, error.to_string(), retry_after, Some(trace_id))
}
