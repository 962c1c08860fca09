//! Authentication and admission
//!
//! Accepts a signed bearer token (`Authorization: Bearer ...`) or a
//! static API key (`X-API-Key`) scoped to a tenant. The resolved
//! `TenantContext` is attached to the request for the rate limiter and
//! the orchestrator. Origin headers are validated against the configured
//! allow-list and fail closed in production.

use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::config::{AuthConfig, ServiceConfig};
use crate::error::{Error, Result};
use crate::state::AppState;

/// Bearer token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the tenant id
    pub sub: String,

    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Named rate plan
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Issuer (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Authenticated caller identity, attached as a request extension
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub scopes: BTreeSet<String>,
    pub rate_plan: String,
}

impl TenantContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Fail with `PermissionDenied` unless the scope is granted
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!("missing scope: {scope}")))
        }
    }
}

struct ApiKeyRecord {
    tenant_id: String,
    scopes: BTreeSet<String>,
    rate_plan: String,
}

/// Validates credentials and origins
pub struct Authenticator {
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    api_keys: HashMap<String, ApiKeyRecord>,
    allowed_origins: Vec<String>,
    production: bool,
    default_plan: String,
}

impl Authenticator {
    pub fn new(auth: &AuthConfig, service: &ServiceConfig, default_plan: &str) -> Self {
        let decoding_key =
            auth.jwt_secret.as_ref().map(|secret| DecodingKey::from_secret(secret.as_bytes()));

        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(ref issuer) = auth.issuer {
            validation.set_issuer(&[issuer]);
        }

        let api_keys = auth
            .api_keys
            .iter()
            .map(|entry| {
                (
                    entry.key.clone(),
                    ApiKeyRecord {
                        tenant_id: entry.tenant_id.clone(),
                        scopes: entry.scopes.iter().cloned().collect(),
                        rate_plan: entry.rate_plan.clone(),
                    },
                )
            })
            .collect();

        Self {
            decoding_key,
            validation,
            api_keys,
            allowed_origins: auth.allowed_origins.clone(),
            production: service.is_production(),
            default_plan: default_plan.to_string(),
        }
    }

    /// Resolve credentials from request headers
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<TenantContext> {
        if let Some(value) = headers.get(http::header::AUTHORIZATION) {
            let raw = value
                .to_str()
                .map_err(|_| Error::Unauthenticated("malformed authorization header".into()))?;
            let token = raw
                .strip_prefix("Bearer ")
                .ok_or_else(|| Error::Unauthenticated("expected a bearer token".into()))?;
            return self.authenticate_bearer(token);
        }

        if let Some(value) = headers.get("x-api-key") {
            let key = value
                .to_str()
                .map_err(|_| Error::Unauthenticated("malformed api key header".into()))?;
            return self.authenticate_api_key(key);
        }

        Err(Error::Unauthenticated("no credentials provided".into()))
    }

    /// Validate a raw bearer token (also used by the socket hello frame,
    /// which carries the credential in-band)
    pub fn authenticate_token(&self, token: &str) -> Result<TenantContext> {
        self.authenticate_bearer(token)
            .or_else(|_| self.authenticate_api_key(token))
    }

    fn authenticate_bearer(&self, token: &str) -> Result<TenantContext> {
        let key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| Error::Unauthenticated("bearer tokens are not configured".into()))?;

        let data = decode::<Claims>(token, key, &self.validation)
            .map_err(|e| Error::Unauthenticated(format!("invalid token: {e}")))?;

        Ok(TenantContext {
            tenant_id: data.claims.sub,
            scopes: data.claims.scopes.into_iter().collect(),
            rate_plan: data.claims.plan.unwrap_or_else(|| self.default_plan.clone()),
        })
    }

    fn authenticate_api_key(&self, key: &str) -> Result<TenantContext> {
        let record = self
            .api_keys
            .get(key)
            .ok_or_else(|| Error::Unauthenticated("unknown api key".into()))?;
        Ok(TenantContext {
            tenant_id: record.tenant_id.clone(),
            scopes: record.scopes.clone(),
            rate_plan: record.rate_plan.clone(),
        })
    }

    /// Validate the Origin header. Absent origins (non-browser clients)
    /// pass; a mismatch fails closed in production and is logged
    /// elsewhere.
    pub fn check_origin(&self, headers: &HeaderMap) -> Result<()> {
        let Some(origin) = headers.get(http::header::ORIGIN) else {
            return Ok(());
        };
        let origin = origin
            .to_str()
            .map_err(|_| Error::PermissionDenied("malformed origin header".into()))?;

        if self.allowed_origins.iter().any(|allowed| allowed == origin || allowed == "*") {
            return Ok(());
        }

        if self.production {
            Err(Error::PermissionDenied(format!("origin not allowed: {origin}")))
        } else {
            tracing::warn!(origin, "Origin not in allow-list; admitted outside production");
            Ok(())
        }
    }
}

/// Admission middleware for protected routes: origin check, credential
/// validation, tenant extraction.
#[tracing::instrument(name = "admission", skip_all)]
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let authenticator = state.authenticator();
    authenticator.check_origin(request.headers())?;
    let tenant = authenticator.authenticate(request.headers())?;

    tracing::debug!(tenant = %tenant.tenant_id, "Request admitted");
    request.extensions_mut().insert(tenant);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyEntry;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn service(environment: &str) -> ServiceConfig {
        let mut config = crate::config::Config::default().service;
        config.environment = environment.to_string();
        config
    }

    fn auth_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: Some("test-secret".to_string()),
            issuer: None,
            api_keys: vec![ApiKeyEntry {
                key: "key-t2".to_string(),
                tenant_id: "t2".to_string(),
                scopes: vec!["messages:write".to_string()],
                rate_plan: "premium".to_string(),
            }],
            allowed_origins: vec!["https://app.example.com".to_string()],
        }
    }

    fn token_for(tenant: &str, scopes: &[&str]) -> String {
        let claims = Claims {
            sub: tenant.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            plan: None,
            exp: chrono::Utc::now().timestamp() + 600,
            iat: None,
            iss: None,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap()
    }

    fn authenticator(environment: &str) -> Authenticator {
        Authenticator::new(&auth_config(), &service(environment), "standard")
    }

    #[test]
    fn test_bearer_token_resolves_tenant() {
        let auth = authenticator("dev");
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {}", token_for("t1", &["messages:write"])).parse().unwrap(),
        );

        let tenant = auth.authenticate(&headers).unwrap();
        assert_eq!(tenant.tenant_id, "t1");
        assert!(tenant.has_scope("messages:write"));
        assert_eq!(tenant.rate_plan, "standard");
    }

    #[test]
    fn test_api_key_resolves_tenant() {
        let auth = authenticator("dev");
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "key-t2".parse().unwrap());

        let tenant = auth.authenticate(&headers).unwrap();
        assert_eq!(tenant.tenant_id, "t2");
        assert_eq!(tenant.rate_plan, "premium");
    }

    #[test]
    fn test_missing_credentials_unauthenticated() {
        let auth = authenticator("dev");
        let err = auth.authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }

    #[test]
    fn test_garbage_token_unauthenticated() {
        let auth = authenticator("dev");
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer not-a-jwt".parse().unwrap());
        let err = auth.authenticate(&headers).unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = authenticator("dev");
        let claims = Claims {
            sub: "t1".to_string(),
            scopes: vec![],
            plan: None,
            exp: chrono::Utc::now().timestamp() - 600,
            iat: None,
            iss: None,
        };
        let token =
            encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test-secret"))
                .unwrap();
        let mut headers = HeaderMap::new();
        headers
            .insert(http::header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        assert!(auth.authenticate(&headers).is_err());
    }

    #[test]
    fn test_scope_enforcement() {
        let auth = authenticator("dev");
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {}", token_for("t1", &[])).parse().unwrap(),
        );
        let tenant = auth.authenticate(&headers).unwrap();
        let err = tenant.require_scope("tools:manage").unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[test]
    fn test_origin_fails_closed_in_production() {
        let auth = authenticator("production");
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ORIGIN, "https://evil.example.com".parse().unwrap());
        assert!(auth.check_origin(&headers).is_err());

        let mut ok_headers = HeaderMap::new();
        ok_headers.insert(http::header::ORIGIN, "https://app.example.com".parse().unwrap());
        assert!(auth.check_origin(&ok_headers).is_ok());
    }

    #[test]
    fn test_origin_open_in_dev() {
        let auth = authenticator("dev");
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ORIGIN, "https://evil.example.com".parse().unwrap());
        assert!(auth.check_origin(&headers).is_ok());
    }
}
