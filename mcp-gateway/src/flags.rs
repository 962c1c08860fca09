//! Feature flag evaluation
//!
//! Flags are held in an immutable table behind an atomic snapshot swap:
//! readers always see one consistent table, and `reload` never blocks a
//! request. Evaluation is a pure function over the table and the request
//! context; evaluator errors fall back to the compiled default for the
//! flag, except kill-switches which are denied by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::config::{FlagDefConfig, FlagsConfig};

/// Well-known gateway flag names
pub mod names {
    pub const SINGLE_ENTRY_POINT_MODE: &str = "single_entry_point_mode";
    pub const ENABLE_DIRECT_TOOL_ACCESS: &str = "enable_direct_tool_access";
    pub const EMIT_ATTRIBUTION: &str = "emit_attribution";
    pub const STREAMING_ENABLED: &str = "streaming_enabled";
    pub const CACHE_ENABLED: &str = "cache_enabled";
    pub const ATTRIBUTION_FORMAT: &str = "attribution_format";
}

/// Compiled default for a flag, used when the table has no entry or
/// evaluation fails. Kill-switches are handled separately: they deny on
/// evaluator failure regardless of this table.
pub fn compiled_default(name: &str) -> bool {
    match name {
        names::SINGLE_ENTRY_POINT_MODE => true,
        names::ENABLE_DIRECT_TOOL_ACCESS => false,
        names::EMIT_ATTRIBUTION => true,
        names::STREAMING_ENABLED => true,
        names::CACHE_ENABLED => true,
        _ => false,
    }
}

/// Flag kind and its evaluation payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FlagKind {
    /// Static on/off
    Boolean { enabled: bool },
    /// Stable hash of tenant_id into [0,100); enabled below the threshold
    Percentage { threshold: u8 },
    /// Enabled within a time window; an open end means unbounded
    Schedule {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    /// Enabled iff tenant_id is in the set
    AllowList { tenants: BTreeSet<String> },
    /// Boolean, but denied-by-default on evaluator failure
    KillSwitch { enabled: bool },
}

/// One named flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: FlagKind,
    /// Arbitrary payload carried alongside the toggle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub version: u64,
}

/// Immutable flag table; swapped wholesale on reload
#[derive(Debug, Default)]
pub struct FlagTable {
    flags: HashMap<String, FlagDef>,
    version: u64,
}

impl FlagTable {
    /// Build a table from config definitions, applying `FF_<NAME>`
    /// environment overrides (boolean only) last.
    pub fn from_config(config: &FlagsConfig, version: u64) -> Self {
        let mut flags = HashMap::new();

        for (name, def) in &config.defs {
            match parse_def(name, def, version) {
                Ok(flag) => {
                    flags.insert(name.clone(), flag);
                }
                Err(reason) => {
                    tracing::warn!(flag = %name, %reason, "Skipping malformed flag definition");
                }
            }
        }

        for (name, enabled) in env_overrides() {
            flags.insert(
                name.clone(),
                FlagDef {
                    name,
                    kind: FlagKind::Boolean { enabled },
                    payload: None,
                    version,
                },
            );
        }

        Self { flags, version }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<&FlagDef> {
        self.flags.get(name)
    }
}

fn parse_def(name: &str, def: &FlagDefConfig, version: u64) -> Result<FlagDef, String> {
    let kind = match def.kind.as_str() {
        "boolean" => FlagKind::Boolean { enabled: def.enabled.ok_or("boolean flag needs `enabled`")? },
        "percentage" => {
            let threshold = def.threshold.ok_or("percentage flag needs `threshold`")?;
            if threshold > 100 {
                return Err("threshold must be in [0,100]".to_string());
            }
            FlagKind::Percentage { threshold }
        }
        "schedule" => FlagKind::Schedule { start: def.start, end: def.end },
        "allow-list" => FlagKind::AllowList {
            tenants: def.tenants.clone().unwrap_or_default().into_iter().collect(),
        },
        "kill-switch" => {
            FlagKind::KillSwitch { enabled: def.enabled.ok_or("kill-switch flag needs `enabled`")? }
        }
        other => return Err(format!("unknown flag kind: {other}")),
    };
    Ok(FlagDef { name: name.to_string(), kind, payload: def.payload.clone(), version })
}

/// `FF_<FLAG_NAME>=true|false` static overrides
fn env_overrides() -> Vec<(String, bool)> {
    std::env::vars()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix("FF_")?;
            let enabled = match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => true,
                "false" | "0" | "off" => false,
                _ => return None,
            };
            Some((name.to_ascii_lowercase(), enabled))
        })
        .collect()
}

/// Per-request evaluation context
#[derive(Debug, Clone, Copy)]
pub struct FlagContext<'a> {
    pub tenant_id: &'a str,
    pub now: DateTime<Utc>,
}

impl<'a> FlagContext<'a> {
    pub fn for_tenant(tenant_id: &'a str) -> Self {
        Self { tenant_id, now: Utc::now() }
    }
}

/// Evaluates flags against an atomically swapped table
#[derive(Debug, Default)]
pub struct FlagEvaluator {
    table: RwLock<Arc<FlagTable>>,
}

impl FlagEvaluator {
    pub fn new(table: FlagTable) -> Self {
        Self { table: RwLock::new(Arc::new(table)) }
    }

    pub fn from_config(config: &FlagsConfig) -> Self {
        Self::new(FlagTable::from_config(config, 1))
    }

    fn snapshot(&self) -> Arc<FlagTable> {
        match self.table.read() {
            Ok(guard) => Arc::clone(&guard),
            // A poisoned lock still holds a consistent table
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Evaluate a flag for the given context.
    ///
    /// Never fails the request: a missing or unevaluable flag yields its
    /// compiled default, except kill-switches which yield `false`.
    pub fn evaluate(&self, name: &str, ctx: &FlagContext<'_>) -> bool {
        let table = self.snapshot();
        match table.get(name) {
            Some(def) => match &def.kind {
                FlagKind::Boolean { enabled } => *enabled,
                FlagKind::KillSwitch { enabled } => *enabled,
                FlagKind::Percentage { threshold } => {
                    percentage_bucket(name, ctx.tenant_id) < u64::from(*threshold)
                }
                FlagKind::Schedule { start, end } => {
                    let after_start = start.map(|s| ctx.now >= s).unwrap_or(true);
                    let before_end = end.map(|e| ctx.now < e).unwrap_or(true);
                    after_start && before_end
                }
                FlagKind::AllowList { tenants } => tenants.contains(ctx.tenant_id),
            },
            None => compiled_default(name),
        }
    }

    /// Fetch the payload of a flag (e.g. the attribution format string)
    pub fn payload(&self, name: &str) -> Option<Value> {
        self.snapshot().get(name).and_then(|def| def.payload.clone())
    }

    /// Atomically swap in a new table. In-flight evaluations keep reading
    /// the table they already hold.
    pub fn reload(&self, table: FlagTable) {
        let version = table.version();
        let next = Arc::new(table);
        match self.table.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!(version, "Feature flag table reloaded");
    }

    pub fn table_version(&self) -> u64 {
        self.snapshot().version()
    }

    /// Evaluate the client-visible subset for a tenant
    pub fn client_visible(
        &self,
        visible: &[String],
        ctx: &FlagContext<'_>,
    ) -> HashMap<String, bool> {
        visible
            .iter()
            .map(|name| (name.clone(), self.evaluate(name, ctx)))
            .collect()
    }
}

/// Stable bucket in [0,100) for percentage flags. The hash covers the
/// flag name so different flags slice the tenant population differently.
fn percentage_bucket(flag: &str, tenant_id: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(flag.as_bytes());
    hasher.update(b":");
    hasher.update(tenant_id.as_bytes());
    let digest = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(buf) % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn table_with(defs: Vec<FlagDef>) -> FlagTable {
        let mut flags = HashMap::new();
        for def in defs {
            flags.insert(def.name.clone(), def);
        }
        FlagTable { flags, version: 1 }
    }

    fn boolean(name: &str, enabled: bool) -> FlagDef {
        FlagDef {
            name: name.to_string(),
            kind: FlagKind::Boolean { enabled },
            payload: None,
            version: 1,
        }
    }

    #[test]
    fn test_boolean_flag() {
        let eval = FlagEvaluator::new(table_with(vec![boolean("demo", true)]));
        let ctx = FlagContext::for_tenant("t1");
        assert!(eval.evaluate("demo", &ctx));
    }

    #[test]
    fn test_missing_flag_uses_compiled_default() {
        let eval = FlagEvaluator::new(FlagTable::default());
        let ctx = FlagContext::for_tenant("t1");
        assert!(eval.evaluate(names::SINGLE_ENTRY_POINT_MODE, &ctx));
        assert!(!eval.evaluate(names::ENABLE_DIRECT_TOOL_ACCESS, &ctx));
        assert!(!eval.evaluate("unknown_kill_switch", &ctx));
    }

    #[test]
    fn test_percentage_is_stable_per_tenant() {
        let eval = FlagEvaluator::new(table_with(vec![FlagDef {
            name: "rollout".to_string(),
            kind: FlagKind::Percentage { threshold: 50 },
            payload: None,
            version: 1,
        }]));
        let ctx = FlagContext::for_tenant("tenant-42");
        let first = eval.evaluate("rollout", &ctx);
        for _ in 0..10 {
            assert_eq!(eval.evaluate("rollout", &ctx), first);
        }
    }

    #[test]
    fn test_percentage_extremes() {
        let all = FlagEvaluator::new(table_with(vec![FlagDef {
            name: "all".to_string(),
            kind: FlagKind::Percentage { threshold: 100 },
            payload: None,
            version: 1,
        }]));
        let none = FlagEvaluator::new(table_with(vec![FlagDef {
            name: "none".to_string(),
            kind: FlagKind::Percentage { threshold: 0 },
            payload: None,
            version: 1,
        }]));
        for tenant in ["a", "b", "c", "d"] {
            let ctx = FlagContext::for_tenant(tenant);
            assert!(all.evaluate("all", &ctx));
            assert!(!none.evaluate("none", &ctx));
        }
    }

    #[test]
    fn test_schedule_window() {
        let now = Utc::now();
        let eval = FlagEvaluator::new(table_with(vec![FlagDef {
            name: "window".to_string(),
            kind: FlagKind::Schedule {
                start: Some(now - Duration::hours(1)),
                end: Some(now + Duration::hours(1)),
            },
            payload: None,
            version: 1,
        }]));
        let inside = FlagContext { tenant_id: "t", now };
        assert!(eval.evaluate("window", &inside));

        let outside = FlagContext { tenant_id: "t", now: now + Duration::hours(2) };
        assert!(!eval.evaluate("window", &outside));
    }

    #[test]
    fn test_allow_list() {
        let eval = FlagEvaluator::new(table_with(vec![FlagDef {
            name: "beta".to_string(),
            kind: FlagKind::AllowList {
                tenants: ["t1".to_string(), "t2".to_string()].into_iter().collect(),
            },
            payload: None,
            version: 1,
        }]));
        assert!(eval.evaluate("beta", &FlagContext::for_tenant("t1")));
        assert!(!eval.evaluate("beta", &FlagContext::for_tenant("t3")));
    }

    #[test]
    fn test_reload_swaps_atomically() {
        let eval = FlagEvaluator::new(table_with(vec![boolean("demo", false)]));
        let ctx = FlagContext::for_tenant("t1");
        assert!(!eval.evaluate("demo", &ctx));

        let mut next = table_with(vec![boolean("demo", true)]);
        next.version = 2;
        eval.reload(next);
        assert!(eval.evaluate("demo", &ctx));
        assert_eq!(eval.table_version(), 2);
    }

    #[test]
    fn test_client_visible_subset() {
        let eval = FlagEvaluator::new(table_with(vec![
            boolean("streaming_enabled", true),
            boolean("internal_only", true),
        ]));
        let ctx = FlagContext::for_tenant("t1");
        let visible = eval.client_visible(&["streaming_enabled".to_string()], &ctx);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible.get("streaming_enabled"), Some(&true));
    }
}
