//! # mcp-gateway
//!
//! Unified HTTP and WebSocket front door for a fleet of specialist
//! agents: authenticates tenants, rate-limits per (tenant, endpoint),
//! funnels traffic through an orchestrator tool with circuit-breaker
//! protected upstream calls, and streams partial responses back with
//! strict per-request ordering, heartbeats and resume-after-disconnect.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_gateway::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config);
//!
//!     let lifecycle = Lifecycle::start(config).await?;
//!     lifecycle.run().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod flags;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod orchestrator;
pub mod ratelimit;
pub mod registry;
pub mod resilience;
pub mod session;
pub mod state;
pub mod streaming;
pub mod upstream;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::flags::{FlagContext, FlagEvaluator, FlagKind, FlagTable};
    pub use crate::handlers::router;
    pub use crate::lifecycle::{exit_code_for, Lifecycle};
    pub use crate::metrics::Metrics;
    pub use crate::middleware::{Claims, TenantContext};
    pub use crate::observability::init_tracing;
    pub use crate::orchestrator::{GatewayRequest, Orchestrator, Route};
    pub use crate::ratelimit::{Admission, CounterStore, EndpointClass, RateLimiter};
    pub use crate::registry::{SelectionPolicy, Tool, ToolRegistry, ToolStatus};
    pub use crate::resilience::{CircuitBreaker, CircuitStateKind, RetryPolicy};
    pub use crate::session::{Session, SessionStore, Transport};
    pub use crate::state::{AppState, AppStateBuilder};
    pub use crate::streaming::{Frame, FrameKind, SharedStream, StreamTracker};
    pub use crate::upstream::{ModelClient, UpstreamEvent, UpstreamRequest};

    pub use axum::Router;
    pub use serde::{Deserialize, Serialize};
    pub use tokio;
    pub use tracing::{debug, error, info, instrument, trace, warn};
    pub use uuid::Uuid;
}
