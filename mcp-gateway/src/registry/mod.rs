//! Tool registry
//!
//! The registry owns the set of reachable specialist agents and is the
//! single source of truth for tool status. Reads are lock-free snapshots;
//! every mutation builds a new snapshot and atomically swaps it in, so a
//! reader never observes a half-applied update.

pub mod prober;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::{RegistryConfig, ToolConfig};

/// Tool health status as reported by the prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolStatus::Healthy => "healthy",
            ToolStatus::Degraded => "degraded",
            ToolStatus::Unhealthy => "unhealthy",
            ToolStatus::Unknown => "unknown",
        }
    }
}

/// A registered specialist agent endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub tool_id: String,
    pub base_url: String,
    pub capabilities: BTreeSet<String>,
    /// 1-10, highest selected first
    pub priority: u8,
    pub status: ToolStatus,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Tool {
    /// Build a fresh tool record; status starts as unknown
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            tool_id: config.tool_id.clone(),
            base_url: config.base_url.clone(),
            capabilities: config.capabilities.iter().cloned().collect(),
            priority: config.priority.clamp(1, 10),
            status: ToolStatus::Unknown,
            last_probe_at: None,
            consecutive_failures: 0,
        }
    }

    /// Registration identity: the attributes a caller supplies. Status and
    /// probe bookkeeping are excluded, so re-registering an identical tool
    /// is a no-op.
    fn declared_eq(&self, other: &Tool) -> bool {
        self.tool_id == other.tool_id
            && self.base_url == other.base_url
            && self.capabilities == other.capabilities
            && self.priority == other.priority
    }

    pub fn offers(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Selection policy for `select`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Highest priority first, stable tie-break by tool_id
    Priority,
    /// Per-process cursor over the eligible set
    RoundRobin,
}

/// One probe-driven status change, consumed by observability
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub tool_id: String,
    pub from: ToolStatus,
    pub to: ToolStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistrySnapshot {
    tools: BTreeMap<String, Tool>,
}

/// The process-wide tool registry
pub struct ToolRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    cursor: AtomicUsize,
    degraded_threshold: u32,
    unhealthy_threshold: u32,
}

impl ToolRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        let registry = Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            cursor: AtomicUsize::new(0),
            degraded_threshold: config.degraded_threshold.max(1),
            unhealthy_threshold: config.unhealthy_threshold.max(1),
        };
        for tool in &config.tools {
            registry.register(Tool::from_config(tool));
        }
        registry
    }

    fn read(&self) -> Arc<RegistrySnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap<F>(&self, mutate: F)
    where
        F: FnOnce(&mut BTreeMap<String, Tool>),
    {
        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut tools = guard.tools.clone();
        mutate(&mut tools);
        *guard = Arc::new(RegistrySnapshot { tools });
    }

    /// Insert or replace a tool. Re-registering with identical declared
    /// attributes is a no-op; mismatched attributes replace the record and
    /// reset status to unknown. Returns true when the registry changed.
    pub fn register(&self, tool: Tool) -> bool {
        let mut changed = false;
        self.swap(|tools| {
            match tools.get(&tool.tool_id) {
                Some(existing) if existing.declared_eq(&tool) => {}
                _ => {
                    tracing::info!(tool = %tool.tool_id, url = %tool.base_url, "Tool registered");
                    let mut fresh = tool.clone();
                    fresh.status = ToolStatus::Unknown;
                    fresh.last_probe_at = None;
                    fresh.consecutive_failures = 0;
                    tools.insert(fresh.tool_id.clone(), fresh);
                    changed = true;
                }
            }
        });
        changed
    }

    /// Remove a tool; returns true when it existed
    pub fn deregister(&self, tool_id: &str) -> bool {
        let mut removed = false;
        self.swap(|tools| {
            removed = tools.remove(tool_id).is_some();
        });
        if removed {
            tracing::info!(tool = tool_id, "Tool deregistered");
        }
        removed
    }

    pub fn get(&self, tool_id: &str) -> Option<Tool> {
        self.read().tools.get(tool_id).cloned()
    }

    /// Pick a healthy tool offering the capability. `None` capability
    /// matches any tool.
    pub fn select(&self, capability: Option<&str>, policy: SelectionPolicy) -> Option<Tool> {
        self.select_from(capability, policy, &[ToolStatus::Healthy])
    }

    /// Degraded-mode selection: healthy tools first, degraded accepted
    pub fn select_best_effort(
        &self,
        capability: Option<&str>,
        policy: SelectionPolicy,
    ) -> Option<Tool> {
        self.select_from(capability, policy, &[ToolStatus::Healthy])
            .or_else(|| self.select_from(capability, policy, &[ToolStatus::Degraded]))
    }

    fn select_from(
        &self,
        capability: Option<&str>,
        policy: SelectionPolicy,
        statuses: &[ToolStatus],
    ) -> Option<Tool> {
        let snapshot = self.read();
        // BTreeMap iteration gives the stable tool_id tie-break
        let mut eligible: Vec<&Tool> = snapshot
            .tools
            .values()
            .filter(|tool| statuses.contains(&tool.status))
            .filter(|tool| capability.map(|c| tool.offers(c)).unwrap_or(true))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        match policy {
            SelectionPolicy::Priority => {
                eligible.sort_by(|a, b| {
                    b.priority.cmp(&a.priority).then_with(|| a.tool_id.cmp(&b.tool_id))
                });
                Some(eligible[0].clone())
            }
            SelectionPolicy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
                Some(eligible[index].clone())
            }
        }
    }

    /// Status by tool id, for the health endpoint
    pub fn snapshot(&self) -> BTreeMap<String, ToolStatus> {
        self.read()
            .tools
            .iter()
            .map(|(id, tool)| (id.clone(), tool.status))
            .collect()
    }

    /// Full tool list, for `GET /tools`
    pub fn tools(&self) -> Vec<Tool> {
        self.read().tools.values().cloned().collect()
    }

    /// Apply one completed probe. `completed_at` provides the monotonic
    /// wall-clock tie-break: a result older than the recorded probe is
    /// discarded, so the latest-completed probe always wins.
    ///
    /// Returns the status transition, if the probe caused one.
    pub fn apply_probe(
        &self,
        tool_id: &str,
        success: bool,
        completed_at: DateTime<Utc>,
    ) -> Option<StatusTransition> {
        let mut transition = None;
        self.swap(|tools| {
            let Some(tool) = tools.get_mut(tool_id) else {
                return;
            };
            if let Some(last) = tool.last_probe_at {
                if last > completed_at {
                    return;
                }
            }
            tool.last_probe_at = Some(completed_at);

            let from = tool.status;
            if success {
                tool.consecutive_failures = 0;
                tool.status = ToolStatus::Healthy;
            } else {
                tool.consecutive_failures = tool.consecutive_failures.saturating_add(1);
                // One escalation ladder: degraded after the first threshold
                // of consecutive failures, unhealthy after the second
                if tool.consecutive_failures
                    >= self.degraded_threshold + self.unhealthy_threshold
                {
                    tool.status = ToolStatus::Unhealthy;
                } else if tool.consecutive_failures >= self.degraded_threshold {
                    tool.status = ToolStatus::Degraded;
                }
            }

            if tool.status != from {
                transition = Some(StatusTransition {
                    tool_id: tool.tool_id.clone(),
                    from,
                    to: tool.status,
                    at: completed_at,
                });
            }
        });

        if let Some(ref t) = transition {
            tracing::info!(
                tool = %t.tool_id,
                from = t.from.as_str(),
                to = t.to.as_str(),
                "Tool status transition"
            );
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(id: &str, priority: u8, caps: &[&str]) -> Tool {
        Tool {
            tool_id: id.to_string(),
            base_url: format!("http://{id}.internal"),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            priority,
            status: ToolStatus::Unknown,
            last_probe_at: None,
            consecutive_failures: 0,
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(&RegistryConfig::default())
    }

    fn mark_healthy(registry: &ToolRegistry, id: &str) {
        registry.apply_probe(id, true, Utc::now());
    }

    #[test]
    fn test_register_and_get() {
        let registry = registry();
        assert!(registry.register(tool("spec_a", 5, &["nutrition"])));
        let fetched = registry.get("spec_a").unwrap();
        assert_eq!(fetched.status, ToolStatus::Unknown);
        assert!(fetched.offers("nutrition"));
    }

    #[test]
    fn test_reregister_identical_is_noop() {
        let registry = registry();
        registry.register(tool("spec_a", 5, &["nutrition"]));
        mark_healthy(&registry, "spec_a");

        assert!(!registry.register(tool("spec_a", 5, &["nutrition"])));
        // Status survives the no-op
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Healthy);
    }

    #[test]
    fn test_reregister_mismatch_replaces() {
        let registry = registry();
        registry.register(tool("spec_a", 5, &["nutrition"]));
        mark_healthy(&registry, "spec_a");

        assert!(registry.register(tool("spec_a", 7, &["nutrition"])));
        let replaced = registry.get("spec_a").unwrap();
        assert_eq!(replaced.priority, 7);
        assert_eq!(replaced.status, ToolStatus::Unknown);
    }

    #[test]
    fn test_select_priority_with_stable_tiebreak() {
        let registry = registry();
        registry.register(tool("zeta", 5, &["plan"]));
        registry.register(tool("alpha", 5, &["plan"]));
        registry.register(tool("low", 2, &["plan"]));
        for id in ["zeta", "alpha", "low"] {
            mark_healthy(&registry, id);
        }

        let picked = registry.select(Some("plan"), SelectionPolicy::Priority).unwrap();
        assert_eq!(picked.tool_id, "alpha");
    }

    #[test]
    fn test_select_skips_unhealthy() {
        let registry = registry();
        registry.register(tool("spec_a", 9, &["plan"]));
        registry.register(tool("spec_b", 1, &["plan"]));
        mark_healthy(&registry, "spec_b");

        let picked = registry.select(Some("plan"), SelectionPolicy::Priority).unwrap();
        assert_eq!(picked.tool_id, "spec_b");
    }

    #[test]
    fn test_round_robin_cycles() {
        let registry = registry();
        registry.register(tool("a", 5, &["plan"]));
        registry.register(tool("b", 5, &["plan"]));
        mark_healthy(&registry, "a");
        mark_healthy(&registry, "b");

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..4 {
            seen.insert(registry.select(Some("plan"), SelectionPolicy::RoundRobin).unwrap().tool_id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_status_ladder() {
        let config = RegistryConfig {
            degraded_threshold: 2,
            unhealthy_threshold: 3,
            ..RegistryConfig::default()
        };
        let registry = ToolRegistry::new(&config);
        registry.register(tool("spec_a", 5, &[]));
        mark_healthy(&registry, "spec_a");

        let mut now = Utc::now();
        for i in 1..=5 {
            now += chrono::Duration::milliseconds(1);
            registry.apply_probe("spec_a", false, now);
            let status = registry.get("spec_a").unwrap().status;
            match i {
                1 => assert_eq!(status, ToolStatus::Healthy),
                2..=4 => assert_eq!(status, ToolStatus::Degraded),
                _ => assert_eq!(status, ToolStatus::Unhealthy),
            }
        }

        // One success restores healthy
        now += chrono::Duration::milliseconds(1);
        let transition = registry.apply_probe("spec_a", true, now).unwrap();
        assert_eq!(transition.from, ToolStatus::Unhealthy);
        assert_eq!(transition.to, ToolStatus::Healthy);
    }

    #[test]
    fn test_stale_probe_result_is_discarded() {
        let registry = registry();
        registry.register(tool("spec_a", 5, &[]));

        let newer = Utc::now();
        let older = newer - chrono::Duration::seconds(5);

        registry.apply_probe("spec_a", true, newer);
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Healthy);

        // A slow probe completing out of order must not regress status
        registry.apply_probe("spec_a", false, older);
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Healthy);
    }

    #[test]
    fn test_best_effort_accepts_degraded() {
        let config = RegistryConfig { degraded_threshold: 1, ..RegistryConfig::default() };
        let registry = ToolRegistry::new(&config);
        registry.register(tool("spec_a", 5, &["plan"]));
        let mut now = Utc::now();
        registry.apply_probe("spec_a", false, now);
        now += chrono::Duration::milliseconds(1);
        registry.apply_probe("spec_a", false, now);
        assert_eq!(registry.get("spec_a").unwrap().status, ToolStatus::Degraded);

        assert!(registry.select(Some("plan"), SelectionPolicy::Priority).is_none());
        let fallback = registry.select_best_effort(Some("plan"), SelectionPolicy::Priority);
        assert_eq!(fallback.unwrap().tool_id, "spec_a");
    }
}
