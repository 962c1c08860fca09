//! Periodic health probing
//!
//! A single loop wakes every `probe_interval`, probes each registered
//! tool's `/health` endpoint concurrently and applies the results to the
//! registry. Probe errors never affect in-flight requests; they only
//! drive registry status.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolRegistry};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Probe transport abstraction; the production implementation speaks HTTP
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Succeeds when the tool responded healthy within the probe timeout
    async fn probe(&self, tool: &Tool) -> Result<()>;
}

/// HTTP GET `{base_url}/health`, success on any 2xx
pub struct HttpHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build probe client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, tool: &Tool) -> Result<()> {
        let url = format!("{}/health", tool.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout { tool_id: Some(tool.tool_id.clone()) }
                } else {
                    Error::Upstream {
                        tool_id: tool.tool_id.clone(),
                        status: None,
                        message: e.to_string(),
                    }
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Upstream {
                tool_id: tool.tool_id.clone(),
                status: Some(response.status().as_u16()),
                message: "health probe returned non-success status".to_string(),
            })
        }
    }
}

/// The probe loop
pub struct Prober {
    registry: Arc<ToolRegistry>,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl Prober {
    pub fn new(
        registry: Arc<ToolRegistry>,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self { registry, probe, metrics, interval }
    }

    /// One pass over all registered tools. Probes run concurrently; each
    /// result is applied as it completes, stamped with its completion
    /// time so stale results lose.
    pub async fn probe_once(&self) {
        let tools = self.registry.tools();
        if tools.is_empty() {
            return;
        }

        let probes = tools.into_iter().map(|tool| {
            let probe = Arc::clone(&self.probe);
            let registry = Arc::clone(&self.registry);
            let metrics = Arc::clone(&self.metrics);
            async move {
                let outcome = probe.probe(&tool).await;
                let completed_at = Utc::now();
                if let Err(ref error) = outcome {
                    tracing::debug!(tool = %tool.tool_id, %error, "Probe failed");
                }
                if let Some(transition) =
                    registry.apply_probe(&tool.tool_id, outcome.is_ok(), completed_at)
                {
                    metrics.record_probe_transition(
                        &transition.tool_id,
                        transition.from.as_str(),
                        transition.to.as_str(),
                    );
                }
            }
        });
        join_all(probes).await;
    }

    /// Synchronous first pass at startup, bounded by the startup budget.
    /// Tools that could not be probed in time simply stay unknown.
    pub async fn startup_pass(&self, budget: Duration) {
        if tokio::time::timeout(budget, self.probe_once()).await.is_err() {
            tracing::warn!(
                budget_ms = budget.as_millis() as u64,
                "Startup probe pass exceeded its budget; remaining tools stay unknown"
            );
        }
    }

    /// Run the probe loop until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Health prober started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Health prober stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::registry::ToolStatus;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ScriptedProbe {
        healthy: AtomicBool,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(healthy: bool) -> Self {
            Self { healthy: AtomicBool::new(healthy), calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, tool: &Tool) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Timeout { tool_id: Some(tool.tool_id.clone()) })
            }
        }
    }

    fn registry_with_tool() -> Arc<ToolRegistry> {
        let config = RegistryConfig {
            tools: vec![crate::config::ToolConfig {
                tool_id: "spec_a".to_string(),
                base_url: "http://spec-a.internal".to_string(),
                capabilities: vec!["plan".to_string()],
                priority: 5,
            }],
            degraded_threshold: 1,
            unhealthy_threshold: 1,
            ..RegistryConfig::default()
        };
        Arc::new(ToolRegistry::new(&config))
    }

    #[tokio::test]
    async fn test_single_success_marks_healthy() {
        let registry = registry_with_tool();
        let probe = Arc::new(ScriptedProbe::new(true));
        let prober = Prober::new(
            registry.clone(),
            probe.clone(),
            Arc::new(Metrics::new().unwrap()),
            Duration::from_secs(60),
        );

        prober.probe_once().await;
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Healthy);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_walk_the_ladder() {
        let registry = registry_with_tool();
        let probe = Arc::new(ScriptedProbe::new(false));
        let prober = Prober::new(
            registry.clone(),
            probe.clone(),
            Arc::new(Metrics::new().unwrap()),
            Duration::from_secs(60),
        );

        prober.probe_once().await;
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Degraded);
        prober.probe_once().await;
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Unhealthy);

        probe.healthy.store(true, Ordering::SeqCst);
        prober.probe_once().await;
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Healthy);
    }

    #[tokio::test]
    async fn test_startup_pass_respects_budget() {
        struct SlowProbe;

        #[async_trait]
        impl HealthProbe for SlowProbe {
            async fn probe(&self, _tool: &Tool) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }

        let registry = registry_with_tool();
        let prober = Prober::new(
            registry.clone(),
            Arc::new(SlowProbe),
            Arc::new(Metrics::new().unwrap()),
            Duration::from_secs(60),
        );

        tokio::time::timeout(Duration::from_secs(5), prober.startup_pass(Duration::from_millis(50)))
            .await
            .expect("startup pass must return within its budget");
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Unknown);
    }
}
