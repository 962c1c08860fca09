//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Well-known environment variables (`GATEWAY_PORT`, `AUTH_JWT_SECRET`, ...)
//! 2. Environment variables (prefix: GATEWAY_)
//! 3. Current working directory: ./config.toml
//! 4. XDG config directory: ~/.config/mcp-gateway/config.toml
//! 5. System directory: /etc/mcp-gateway/config.toml
//! 6. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Tool registry and health prober configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Orchestration configuration
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Streaming transport configuration
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// External store endpoints
    #[serde(default)]
    pub stores: StoreConfig,

    /// Feature flag definitions
    #[serde(default)]
    pub flags: FlagsConfig,

    /// TLS configuration (optional; terminate in front of the gateway when unset)
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Host to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds; requests are admitted with
    /// `deadline = now + timeout_secs`
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Request body size limit in MB
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    /// Drain deadline for graceful shutdown in milliseconds
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,
}

impl ServiceConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }
}

/// Static API key entry scoped to a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    /// The key value presented in `X-API-Key`
    pub key: String,

    /// Tenant identity the key resolves to
    pub tenant_id: String,

    /// Scopes granted to the key
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Named rate plan for the tenant
    #[serde(default = "default_rate_plan_name")]
    pub rate_plan: String,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret for bearer token verification.
    /// Required in production; absence aborts startup.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// JWT issuer to validate
    #[serde(default)]
    pub issuer: Option<String>,

    /// Static API keys
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,

    /// Allowed origins for browser clients; mismatched origin fails
    /// closed in production
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: None,
            api_keys: Vec::new(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Named rate plan: token bucket parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatePlanConfig {
    /// Bucket capacity in tokens
    pub capacity: f64,

    /// Refill rate in tokens per second
    pub refill_per_sec: f64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Named rate plans; tenants reference these by name
    #[serde(default = "default_rate_plans")]
    pub plans: HashMap<String, RatePlanConfig>,

    /// Plan applied when a tenant names no plan
    #[serde(default = "default_rate_plan_name")]
    pub default_plan: String,

    /// Enable progressive penalty on repeated violations
    #[serde(default = "default_true")]
    pub penalty_enabled: bool,

    /// Initial penalty offset in milliseconds
    #[serde(default = "default_penalty_base_ms")]
    pub penalty_base_ms: u64,

    /// Penalty cap in milliseconds
    #[serde(default = "default_penalty_cap_ms")]
    pub penalty_cap_ms: u64,

    /// Retry-after hint returned when the counter store is down and the
    /// endpoint fails closed, in milliseconds
    #[serde(default = "default_store_failure_retry_ms")]
    pub store_failure_retry_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            plans: default_rate_plans(),
            default_plan: default_rate_plan_name(),
            penalty_enabled: true,
            penalty_base_ms: default_penalty_base_ms(),
            penalty_cap_ms: default_penalty_cap_ms(),
            store_failure_retry_ms: default_store_failure_retry_ms(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures within the window before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Failure counting window in seconds
    #[serde(default = "default_failure_window_secs")]
    pub window_secs: u64,

    /// Cooldown before a half-open trial is admitted, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_failure_window_secs(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl CircuitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds; jitter is
    /// uniform in `[0, base)`
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Minimum useful upstream latency in milliseconds; a retry that
    /// cannot start before `deadline - min_upstream_latency` is abandoned
    #[serde(default = "default_min_upstream_latency_ms")]
    pub min_upstream_latency_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            min_upstream_latency_ms: default_min_upstream_latency_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn min_upstream_latency(&self) -> Duration {
        Duration::from_millis(self.min_upstream_latency_ms)
    }
}

/// Static tool definition loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Unique tool id
    pub tool_id: String,

    /// Base URL of the tool endpoint
    pub base_url: String,

    /// Capabilities the tool advertises
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Selection priority, 1-10, highest first
    #[serde(default = "default_priority")]
    pub priority: u8,
}

/// Tool registry and health prober configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Tools registered at startup
    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    /// Tool id of the orchestrator (the single entry point)
    #[serde(default = "default_orchestrator_id")]
    pub orchestrator_id: String,

    /// Probe interval in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Per-probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive probe failures before healthy becomes degraded
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,

    /// Further consecutive failures before degraded becomes unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Budget for the synchronous first probe pass at startup, in milliseconds
    #[serde(default = "default_startup_probe_budget_ms")]
    pub startup_probe_budget_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            orchestrator_id: default_orchestrator_id(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            degraded_threshold: default_degraded_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            startup_probe_budget_ms: default_startup_probe_budget_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn startup_probe_budget(&self) -> Duration {
        Duration::from_millis(self.startup_probe_budget_ms)
    }
}

/// Orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Maximum nested tool invocations within one request
    #[serde(default = "default_max_hop_depth")]
    pub max_hop_depth: u32,

    /// Default per-call upstream timeout in milliseconds; the effective
    /// deadline of a call is `min(request deadline, now + this)`
    #[serde(default = "default_upstream_timeout_ms")]
    pub default_upstream_timeout_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_hop_depth: default_max_hop_depth(),
            default_upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl OrchestrationConfig {
    pub fn default_upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.default_upstream_timeout_ms)
    }
}

/// Streaming transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a producer waits on a full outgoing queue before the
    /// connection is closed as stalled, in milliseconds
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Frames retained for resume after disconnect
    #[serde(default = "default_resume_buffer_size")]
    pub resume_buffer_size: usize,

    /// Bound of the per-connection outgoing queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Idle session timeout in seconds
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            resume_buffer_size: default_resume_buffer_size(),
            queue_capacity: default_queue_capacity(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

impl StreamingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// External store endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Distributed counter store URL (redis://...)
    #[serde(default)]
    pub counter_store_url: Option<String>,

    /// Session store URL (redis://...)
    #[serde(default)]
    pub session_store_url: Option<String>,
}

/// One feature flag definition from config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDefConfig {
    /// Flag kind: boolean, percentage, schedule, allow-list, kill-switch
    pub kind: String,

    /// Static value for boolean and kill-switch flags
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Threshold in [0,100) for percentage flags
    #[serde(default)]
    pub threshold: Option<u8>,

    /// Window start for schedule flags (RFC 3339)
    #[serde(default)]
    pub start: Option<chrono::DateTime<chrono::Utc>>,

    /// Window end for schedule flags (RFC 3339)
    #[serde(default)]
    pub end: Option<chrono::DateTime<chrono::Utc>>,

    /// Tenant ids for allow-list flags
    #[serde(default)]
    pub tenants: Option<Vec<String>>,

    /// Arbitrary payload (e.g. attribution format string)
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Feature flag configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagsConfig {
    /// Flag definitions by name; unlisted gateway flags use their
    /// compiled defaults
    #[serde(default)]
    pub defs: HashMap<String, FlagDefConfig>,

    /// Flags exposed through `GET /feature-flags/client`
    #[serde(default = "default_client_visible")]
    pub client_visible: Vec<String>,

    /// Reload interval in seconds
    #[serde(default = "default_flag_reload_secs")]
    pub reload_secs: u64,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            defs: HashMap::new(),
            client_visible: default_client_visible(),
            reload_secs: default_flag_reload_secs(),
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain
    pub cert_path: PathBuf,

    /// Path to the PEM private key
    pub key_path: PathBuf,
}

// Default value functions
fn default_service_name() -> String {
    "mcp-gateway".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_body_limit_mb() -> usize {
    10
}

fn default_drain_deadline_ms() -> u64 {
    10_000
}

fn default_rate_plan_name() -> String {
    "standard".to_string()
}

fn default_rate_plans() -> HashMap<String, RatePlanConfig> {
    let mut plans = HashMap::new();
    plans.insert(
        "standard".to_string(),
        RatePlanConfig { capacity: 60.0, refill_per_sec: 1.0 },
    );
    plans.insert(
        "premium".to_string(),
        RatePlanConfig { capacity: 600.0, refill_per_sec: 10.0 },
    );
    plans
}

fn default_true() -> bool {
    true
}

fn default_penalty_base_ms() -> u64 {
    1_000
}

fn default_penalty_cap_ms() -> u64 {
    8_000
}

fn default_store_failure_retry_ms() -> u64 {
    5_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    30
}

fn default_cooldown_ms() -> u64 {
    10_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_min_upstream_latency_ms() -> u64 {
    50
}

fn default_priority() -> u8 {
    5
}

fn default_orchestrator_id() -> String {
    "orchestrator".to_string()
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_degraded_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_startup_probe_budget_ms() -> u64 {
    5_000
}

fn default_max_hop_depth() -> u32 {
    4
}

fn default_upstream_timeout_ms() -> u64 {
    20_000
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_stall_timeout_ms() -> u64 {
    30_000
}

fn default_resume_buffer_size() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    64
}

fn default_session_idle_secs() -> u64 {
    1_800
}

fn default_client_visible() -> Vec<String> {
    vec!["streaming_enabled".to_string(), "enable_direct_tool_access".to_string()]
}

fn default_flag_reload_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/mcp-gateway/config.toml
    /// 3. System directory: /etc/mcp-gateway/config.toml
    ///
    /// Environment variables (GATEWAY_ prefix) override all file-based
    /// configs, and the well-known variables from the deployment contract
    /// (`AUTH_JWT_SECRET`, `COUNTER_STORE_URL`, ...) override everything.
    pub fn load() -> Result<Self> {
        let config_paths = Self::find_config_paths();

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Merge config files in reverse order (lowest priority first)
        // so that higher priority files override lower ones
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("GATEWAY_CFG_").split("__"));

        let mut config: Config = figment.extract()?;
        config.apply_well_known_env();
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing the search path
    pub fn load_from(path: &str) -> Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY_CFG_").split("__"))
            .extract()?;
        config.apply_well_known_env();
        Ok(config)
    }

    fn find_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. Current working directory (highest priority for dev/testing)
        paths.push(PathBuf::from("config.toml"));

        // 2. XDG config directory (~/.config/mcp-gateway/config.toml)
        let xdg_dirs = xdg::BaseDirectories::with_prefix("mcp-gateway");
        if let Ok(path) = xdg_dirs.place_config_file("config.toml") {
            paths.push(path);
        }

        // 3. System-wide directory
        paths.push(PathBuf::from("/etc/mcp-gateway/config.toml"));

        paths
    }

    /// Apply the well-known environment variables from the deployment
    /// contract. Unrecognized variables are ignored.
    fn apply_well_known_env(&mut self) {
        if let Ok(v) = std::env::var("GATEWAY_HOST") {
            self.service.host = v;
        }
        if let Some(v) = env_parse::<u16>("GATEWAY_PORT") {
            self.service.port = v;
        }
        if let (Ok(cert), Ok(key)) =
            (std::env::var("GATEWAY_TLS_CERT"), std::env::var("GATEWAY_TLS_KEY"))
        {
            self.tls = Some(TlsConfig { cert_path: cert.into(), key_path: key.into() });
        }
        if let Ok(v) = std::env::var("AUTH_JWT_SECRET") {
            self.auth.jwt_secret = Some(v);
        }
        if let Ok(v) = std::env::var("COUNTER_STORE_URL") {
            self.stores.counter_store_url = Some(v);
        }
        if let Ok(v) = std::env::var("SESSION_STORE_URL") {
            self.stores.session_store_url = Some(v);
        }
        if let Ok(v) = std::env::var("ALLOWED_ORIGINS") {
            self.auth.allowed_origins =
                v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(v) = env_parse::<u64>("PROBE_INTERVAL_MS") {
            self.registry.probe_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("PROBE_TIMEOUT_MS") {
            self.registry.probe_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u32>("CIRCUIT_FAILURE_THRESHOLD") {
            self.circuit.failure_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("CIRCUIT_COOLDOWN_MS") {
            self.circuit.cooldown_ms = v;
        }
        if let Some(v) = env_parse::<u32>("MAX_HOP_DEPTH") {
            self.orchestration.max_hop_depth = v;
        }
        if let Some(v) = env_parse::<u64>("DEFAULT_UPSTREAM_TIMEOUT_MS") {
            self.orchestration.default_upstream_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("DRAIN_DEADLINE_MS") {
            self.service.drain_deadline_ms = v;
        }
    }

    /// Validate startup requirements. A missing secret in production is a
    /// configuration error that aborts startup.
    pub fn validate(&self) -> Result<()> {
        if self.service.is_production() && self.auth.jwt_secret.is_none() {
            return Err(Error::Internal(
                "AUTH_JWT_SECRET is required in production".to_string(),
            ));
        }
        if self.registry.probe_interval_ms == 0 {
            return Err(Error::Internal("probe_interval_ms must be positive".to_string()));
        }
        for (name, plan) in &self.rate_limit.plans {
            if plan.capacity <= 0.0 || plan.refill_per_sec <= 0.0 {
                return Err(Error::Internal(format!(
                    "rate plan {name} must have positive capacity and refill rate"
                )));
            }
        }
        if !self.rate_limit.plans.contains_key(&self.rate_limit.default_plan) {
            return Err(Error::Internal(format!(
                "default rate plan {} is not defined",
                self.rate_limit.default_plan
            )));
        }
        Ok(())
    }

    /// Look up a named rate plan, falling back to the default plan
    pub fn rate_plan(&self, name: &str) -> &RatePlanConfig {
        self.rate_limit
            .plans
            .get(name)
            .unwrap_or_else(|| &self.rate_limit.plans[&self.rate_limit.default_plan])
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring unparseable value for {}", name);
                None
            }
        },
        Err(_) => None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: default_service_name(),
                host: default_host(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
                body_limit_mb: default_body_limit_mb(),
                drain_deadline_ms: default_drain_deadline_ms(),
            },
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitConfig::default(),
            retry: RetryConfig::default(),
            registry: RegistryConfig::default(),
            orchestration: OrchestrationConfig::default(),
            streaming: StreamingConfig::default(),
            stores: StoreConfig::default(),
            flags: FlagsConfig::default(),
            tls: None,
        }
    }
}
