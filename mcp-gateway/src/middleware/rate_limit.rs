//! Rate limiting middleware
//!
//! Classifies the request path into an endpoint class, resolves the
//! tenant's rate plan and consults the distributed limiter. Throttled
//! requests answer 429 with a `Retry-After` hint.

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::{Error, Result};
use crate::ratelimit::{Admission, EndpointClass};
use crate::state::AppState;

use super::auth::TenantContext;

/// Endpoint classification for admission. `messages` mutates session
/// state and fails closed; the informational endpoints fail open.
pub fn classify(path: &str) -> (&'static str, EndpointClass) {
    if path.starts_with("/v1/messages") || path.starts_with("/ws") {
        ("messages", EndpointClass::Write)
    } else if path.starts_with("/tools") {
        ("tools", EndpointClass::Read)
    } else if path.starts_with("/feature-flags") {
        ("flags", EndpointClass::Read)
    } else {
        ("info", EndpointClass::Read)
    }
}

/// Middleware enforcing per-tenant rate limits on protected routes
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let tenant = request
        .extensions()
        .get::<TenantContext>()
        .cloned()
        .ok_or_else(|| Error::Internal("rate limiter ran without tenant context".into()))?;

    let (endpoint, class) = classify(request.uri().path());

    match state
        .limiter()
        .admit(&tenant.tenant_id, &tenant.rate_plan, endpoint, class, 1.0)
        .await
    {
        Admission::Admitted => Ok(next.run(request).await),
        Admission::Throttled { retry_after } => {
            state
                .metrics()
                .requests_total
                .with_label_values(&[tenant.tenant_id.as_str(), endpoint, "throttled"])
                .inc();
            tracing::debug!(
                tenant = %tenant.tenant_id,
                endpoint,
                retry_after_ms = retry_after.as_millis() as u64,
                "Request throttled"
            );
            Err(Error::Throttled { retry_after })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(classify("/v1/messages"), ("messages", EndpointClass::Write));
        assert_eq!(classify("/ws"), ("messages", EndpointClass::Write));
        assert_eq!(classify("/tools"), ("tools", EndpointClass::Read));
        assert_eq!(classify("/feature-flags/client"), ("flags", EndpointClass::Read));
        assert_eq!(classify("/"), ("info", EndpointClass::Read));
    }
}
