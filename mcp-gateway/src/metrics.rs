//! Prometheus metrics registry and exposition

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// All gateway metrics, registered against one registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Requests by tenant, endpoint class and outcome
    pub requests_total: IntCounterVec,
    /// Stream chunks delivered to clients
    pub chunks_emitted: IntCounter,
    /// Tool status transitions observed by the prober
    pub tool_probe_transitions: IntCounterVec,

    /// End-to-end request latency by endpoint class
    pub request_latency_seconds: HistogramVec,
    /// Upstream call latency by tool
    pub upstream_latency_seconds: HistogramVec,
    /// Outgoing queue depth sampled at enqueue time
    pub queue_depth: Histogram,

    /// Currently open streaming connections
    pub open_streams: IntGauge,
    /// Circuit state per tool: 0 closed, 1 half-open, 2 open
    pub circuit_state: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Requests by tenant, endpoint and outcome"),
            &["tenant", "endpoint", "outcome"],
        )
        .map_err(internal)?;

        let chunks_emitted =
            IntCounter::new("chunks_emitted", "Stream chunks delivered to clients")
                .map_err(internal)?;

        let tool_probe_transitions = IntCounterVec::new(
            Opts::new("tool_probe_transitions", "Tool status transitions from the prober"),
            &["tool", "from", "to"],
        )
        .map_err(internal)?;

        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new("request_latency_seconds", "End-to-end request latency")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["endpoint"],
        )
        .map_err(internal)?;

        let upstream_latency_seconds = HistogramVec::new(
            HistogramOpts::new("upstream_latency_seconds", "Upstream call latency per tool")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["tool"],
        )
        .map_err(internal)?;

        let queue_depth = Histogram::with_opts(
            HistogramOpts::new("queue_depth", "Outgoing queue depth at enqueue")
                .buckets(vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
        )
        .map_err(internal)?;

        let open_streams =
            IntGauge::new("open_streams", "Currently open streaming connections")
                .map_err(internal)?;

        let circuit_state = IntGaugeVec::new(
            Opts::new("circuit_state", "Circuit state per tool (0 closed, 1 half-open, 2 open)"),
            &["tool"],
        )
        .map_err(internal)?;

        registry.register(Box::new(requests_total.clone())).map_err(internal)?;
        registry.register(Box::new(chunks_emitted.clone())).map_err(internal)?;
        registry.register(Box::new(tool_probe_transitions.clone())).map_err(internal)?;
        registry.register(Box::new(request_latency_seconds.clone())).map_err(internal)?;
        registry.register(Box::new(upstream_latency_seconds.clone())).map_err(internal)?;
        registry.register(Box::new(queue_depth.clone())).map_err(internal)?;
        registry.register(Box::new(open_streams.clone())).map_err(internal)?;
        registry.register(Box::new(circuit_state.clone())).map_err(internal)?;

        Ok(Self {
            registry,
            requests_total,
            chunks_emitted,
            tool_probe_transitions,
            request_latency_seconds,
            upstream_latency_seconds,
            queue_depth,
            open_streams,
            circuit_state,
        })
    }

    /// Record a finished request
    pub fn record_request(&self, tenant: &str, endpoint: &str, outcome: &str, latency_secs: f64) {
        self.requests_total.with_label_values(&[tenant, endpoint, outcome]).inc();
        self.request_latency_seconds.with_label_values(&[endpoint]).observe(latency_secs);
    }

    /// Record a probe-driven status transition
    pub fn record_probe_transition(&self, tool: &str, from: &str, to: &str) {
        self.tool_probe_transitions.with_label_values(&[tool, from, to]).inc();
    }

    /// Render the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Metrics encoding failed: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("Metrics encoding produced invalid UTF-8: {e}")))
    }
}

fn internal(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics registration failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("t1", "messages", "ok", 0.05);
        metrics.chunks_emitted.inc();
        metrics.open_streams.set(2);
        metrics.record_probe_transition("spec_a", "unknown", "healthy");

        let text = metrics.render().unwrap();
        assert!(text.contains("requests_total"));
        assert!(text.contains("chunks_emitted"));
        assert!(text.contains("open_streams"));
        assert!(text.contains("tool_probe_transitions"));
    }

    #[test]
    fn test_circuit_state_gauge_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.circuit_state.with_label_values(&["spec_b"]).set(2);
        let text = metrics.render().unwrap();
        assert!(text.contains("circuit_state"));
        assert!(text.contains("spec_b"));
    }
}
