//! Application state management
//!
//! All process-scoped components are built once by the lifecycle
//! controller and shared through `AppState`. There is no hidden
//! initialization on first use: stores, registry, breaker, limiter and
//! flag table all exist before the listener accepts traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::flags::FlagEvaluator;
use crate::metrics::Metrics;
use crate::middleware::auth::Authenticator;
use crate::orchestrator::Orchestrator;
use crate::ratelimit::{CounterStore, InMemoryCounterStore, RateLimiter, RedisCounterStore};
use crate::registry::prober::{HealthProbe, HttpHealthProbe};
use crate::registry::ToolRegistry;
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::session::{InMemorySessionStore, RedisSessionStore, SessionStore};
use crate::streaming::StreamTracker;
use crate::upstream::{HttpModelClient, ModelClient};

/// Shared application state, cheaply cloneable
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    flags: Arc<FlagEvaluator>,
    registry: Arc<ToolRegistry>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    counter_store: Arc<dyn CounterStore>,
    sessions: Arc<dyn SessionStore>,
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<Metrics>,
    streams: Arc<StreamTracker>,
    authenticator: Arc<Authenticator>,
    probe: Arc<dyn HealthProbe>,
    started_at: Instant,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn builder(config: Config) -> AppStateBuilder {
        AppStateBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flags(&self) -> &Arc<FlagEvaluator> {
        &self.flags
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn counter_store(&self) -> &Arc<dyn CounterStore> {
        &self.counter_store
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn streams(&self) -> &Arc<StreamTracker> {
        &self.streams
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    pub fn probe(&self) -> &Arc<dyn HealthProbe> {
        &self.probe
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Process readiness; flipped by the lifecycle controller after all
    /// startup phases complete, and off again when draining begins
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Root token cancelled at shutdown; request tokens are children
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Refresh the per-tool circuit gauge from breaker snapshots
    pub fn refresh_circuit_gauges(&self) {
        for snapshot in self.breaker.snapshot() {
            self.metrics
                .circuit_state
                .with_label_values(&[snapshot.tool_id.as_str()])
                .set(snapshot.kind.gauge_value());
        }
    }
}

/// Builds `AppState`, wiring Redis-backed stores when URLs are
/// configured and in-memory fallbacks otherwise. Tests override the
/// model client, probe and stores.
pub struct AppStateBuilder {
    config: Config,
    model_client: Option<Arc<dyn ModelClient>>,
    counter_store: Option<Arc<dyn CounterStore>>,
    session_store: Option<Arc<dyn SessionStore>>,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl AppStateBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            model_client: None,
            counter_store: None,
            session_store: None,
            probe: None,
        }
    }

    pub fn with_model_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.model_client = Some(client);
        self
    }

    pub fn with_counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = self.config;
        let metrics = Arc::new(Metrics::new()?);
        let flags = Arc::new(FlagEvaluator::from_config(&config.flags));
        let registry = Arc::new(ToolRegistry::new(&config.registry));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone()));

        let counter_store: Arc<dyn CounterStore> = match self.counter_store {
            Some(store) => store,
            None => match config.stores.counter_store_url {
                Some(ref url) => Arc::new(RedisCounterStore::connect(url)?),
                None => {
                    tracing::warn!("No counter store configured; using in-process buckets");
                    Arc::new(InMemoryCounterStore::new())
                }
            },
        };
        let limiter =
            Arc::new(RateLimiter::new(Arc::clone(&counter_store), config.rate_limit.clone()));

        let sessions: Arc<dyn SessionStore> = match self.session_store {
            Some(store) => store,
            None => match config.stores.session_store_url {
                Some(ref url) => {
                    Arc::new(RedisSessionStore::connect(url, config.streaming.session_idle())?)
                }
                None => {
                    tracing::warn!("No session store configured; sessions are process-local");
                    Arc::new(InMemorySessionStore::new())
                }
            },
        };

        let model_client: Arc<dyn ModelClient> = match self.model_client {
            Some(client) => client,
            None => Arc::new(HttpModelClient::new()?),
        };

        let probe: Arc<dyn HealthProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpHealthProbe::new(config.registry.probe_timeout())?),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&breaker),
            model_client,
            Arc::clone(&flags),
            Arc::clone(&metrics),
            RetryPolicy::from_config(&config.retry),
            &config.registry,
            config.orchestration.clone(),
        ));

        let streams = Arc::new(StreamTracker::new(
            Arc::clone(&metrics),
            // Closed streams stay resumable for one stall window
            config.streaming.stall_timeout().max(Duration::from_secs(30)),
        ));

        let authenticator = Arc::new(Authenticator::new(
            &config.auth,
            &config.service,
            &config.rate_limit.default_plan,
        ));

        Ok(AppState {
            config: Arc::new(config),
            flags,
            registry,
            breaker,
            limiter,
            counter_store,
            sessions,
            orchestrator,
            metrics,
            streams,
            authenticator,
            probe,
            started_at: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_defaults() {
        let state = AppState::builder(Config::default()).build().unwrap();
        assert!(!state.is_ready());
        state.set_ready(true);
        assert!(state.is_ready());
    }

    #[test]
    fn test_clones_share_state() {
        let state = AppState::builder(Config::default()).build().unwrap();
        let clone = state.clone();
        state.set_ready(true);
        assert!(clone.is_ready());
    }
}
