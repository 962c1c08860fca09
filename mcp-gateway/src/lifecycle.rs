//! Phased startup and shutdown
//!
//! Startup runs strictly ordered phases; any failure aborts with a
//! deterministic exit code. Shutdown reverses: stop admitting, drain
//! active streams within the drain deadline, cancel upstream work, then
//! let the listener close.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flags::FlagTable;
use crate::handlers;
use crate::registry::prober::Prober;
use crate::state::AppState;

/// Process exit codes from the deployment contract
pub mod exit_codes {
    pub const CLEAN: i32 = 0;
    pub const RUNTIME_ERROR: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const STORE_UNREACHABLE: i32 = 3;
}

/// Orchestrates the gateway process
pub struct Lifecycle {
    state: AppState,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Phases 1-3: validate config, open store connections, build the
    /// registry and all process-scoped state.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;

        if config.tls.is_some() {
            tracing::info!(
                "TLS material configured; expecting termination in front of the gateway"
            );
        }

        let counter_configured = config.stores.counter_store_url.is_some();
        let session_configured = config.stores.session_store_url.is_some();

        let state = AppState::builder(config).build()?;

        // Phase 2: verify store connectivity before accepting anything
        if counter_configured {
            state
                .counter_store()
                .ping()
                .await
                .map_err(|e| Error::Store(format!("counter store unreachable: {e}")))?;
            tracing::info!("Counter store connected");
        }
        if session_configured {
            state
                .sessions()
                .ping()
                .await
                .map_err(|e| Error::Store(format!("session store unreachable: {e}")))?;
            tracing::info!("Session store connected");
        }

        tracing::info!(
            tools = state.registry().tools().len(),
            "Tool registry built; all tools start unknown"
        );

        Ok(Self { state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Phases 4-6 and the serve loop: first probe pass, background
    /// tasks, acceptor, readiness. Returns after a clean drain.
    pub async fn run(self) -> Result<()> {
        let state = self.state;
        let config = state.config().clone();

        // Phase 4: synchronous first probe pass, then the loop
        let prober = Prober::new(
            Arc::clone(state.registry()),
            Arc::clone(state.probe()),
            Arc::clone(state.metrics()),
            config.registry.probe_interval(),
        );
        prober.startup_pass(config.registry.startup_probe_budget()).await;
        tokio::spawn(prober.run(state.shutdown_token().child_token()));

        spawn_flag_reloader(&state);

        // Phase 5: acceptor
        let addr: SocketAddr = format!("{}:{}", config.service.host, config.service.port)
            .parse()
            .map_err(|e| Error::Internal(format!("invalid listen address: {e}")))?;
        let listener = TcpListener::bind(&addr).await?;
        let app = crate::middleware::apply_security_headers(
            handlers::router(state.clone()),
            config.tls.is_some(),
        );
        let app = apply_server_layers(app, &config);

        // Phase 6: ready
        state.set_ready(true);
        tracing::info!(%addr, service = %config.service.name, "Gateway ready");

        let drain_state = state.clone();
        let graceful = async move {
            shutdown_signal().await;
            let config = drain_state.config();
            tracing::info!(
                drain_deadline_ms = config.service.drain_deadline_ms,
                "Shutdown requested; refusing new work and draining streams"
            );
            drain_state.set_ready(false);
            drain_state.streams().drain();
            drain_state.streams().await_drained(config.service.drain_deadline()).await;
            drain_state.shutdown_token().cancel();
        };

        axum::serve(listener, app).with_graceful_shutdown(graceful).await?;

        tracing::info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Infrastructure layers applied outside the router: CORS, compression,
/// body limits, tracing, request ids, panic recovery.
fn apply_server_layers(app: axum::Router, config: &Config) -> axum::Router {
    use tower_http::{
        catch_panic::CatchPanicLayer, compression::CompressionLayer, cors::CorsLayer,
        limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors = if config.auth.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .auth
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    app.layer(cors)
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(config.service.body_limit_mb * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(crate::middleware::sensitive_headers_layer())
        .layer(crate::middleware::request_id_propagation_layer())
        .layer(crate::middleware::request_id_layer())
        .layer(CatchPanicLayer::new())
}

/// Periodically rebuild the flag table from config and environment
/// overrides, swapping it in atomically
fn spawn_flag_reloader(state: &AppState) {
    let flags = Arc::clone(state.flags());
    let flags_config = state.config().flags.clone();
    let cancel = state.shutdown_token().child_token();
    let interval = std::time::Duration::from_secs(flags_config.reload_secs.max(1));

    tokio::spawn(async move {
        let mut version = 1u64;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the initial table is already live
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    version += 1;
                    flags.reload(FlagTable::from_config(&flags_config, version));
                }
            }
        }
    });
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}

/// Map a startup/runtime error to the deployment exit code
pub fn exit_code_for(error: &Error) -> i32 {
    match error {
        Error::Config(_) => exit_codes::CONFIG_ERROR,
        Error::Store(_) => exit_codes::STORE_UNREACHABLE,
        Error::Internal(message) if message.contains("required in production") => {
            exit_codes::CONFIG_ERROR
        }
        _ => exit_codes::RUNTIME_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_for(&Error::Store("down".into())), 3);
        assert_eq!(exit_code_for(&Error::Internal("boom".into())), 1);
        assert_eq!(
            exit_code_for(&Error::Internal(
                "AUTH_JWT_SECRET is required in production".into()
            )),
            2
        );
    }

    #[tokio::test]
    async fn test_start_validates_config() {
        let mut config = Config::default();
        config.service.environment = "production".to_string();
        let err = Lifecycle::start(config).await.unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }
}
