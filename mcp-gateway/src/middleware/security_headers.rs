//! Security headers middleware
//!
//! Applies the fixed response header set (no-sniff, frame-deny, HSTS,
//! referrer policy, permissions policy, CSP) using
//! `tower_http::set_header::SetResponseHeaderLayer`.

use axum::http::HeaderValue;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

/// Apply the gateway's fixed security headers.
///
/// `tls_enabled` controls whether HSTS is sent -- HSTS over plain HTTP
/// is meaningless and potentially confusing.
pub fn apply_security_headers(mut app: Router, tls_enabled: bool) -> Router {
    if tls_enabled {
        app = app.layer(SetResponseHeaderLayer::overriding(
            http::header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=63072000; includeSubDomains"),
        ));
    }

    app = app.layer(SetResponseHeaderLayer::if_not_present(
        http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    ));

    app = app.layer(SetResponseHeaderLayer::if_not_present(
        http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    ));

    app = app.layer(SetResponseHeaderLayer::if_not_present(
        http::header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    ));

    app = app.layer(SetResponseHeaderLayer::if_not_present(
        http::header::HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    ));

    // The gateway serves JSON and event streams only
    app = app.layer(SetResponseHeaderLayer::if_not_present(
        http::header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    ));

    app
}
