//! Client-visible feature flags

use axum::{extract::State, response::IntoResponse, Extension, Json};

use crate::flags::FlagContext;
use crate::middleware::TenantContext;
use crate::state::AppState;

/// GET /feature-flags/client -- the configured client-visible subset,
/// evaluated for the authenticated tenant
pub async fn client_flags(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
) -> impl IntoResponse {
    let ctx = FlagContext::for_tenant(&tenant.tenant_id);
    let flags = state
        .flags()
        .client_visible(&state.config().flags.client_visible, &ctx);
    Json(serde_json::json!({
        "flags": flags,
        "version": state.flags().table_version(),
    }))
}
