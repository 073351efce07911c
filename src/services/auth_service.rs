use axum::http::{self};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use moka::sync::Cache;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::Identity;

/// A verified identity and the `exp` claim of the token that proved it.
#[derive(Clone, Debug)]
pub struct CachedIdentity {
    pub identity: Identity,
    pub expires_at: i64,
}

static IDENTITY_CACHE: OnceLock<Cache<String, CachedIdentity>> = OnceLock::new();

/// Verified identities keyed by the raw token they were decoded from.
pub fn identity_cache() -> &'static Cache<String, CachedIdentity> {
    IDENTITY_CACHE.get_or_init(|| {
        let ttl = crate::config::get_config().identity_cache_ttl_secs;
        info!("Identity cache initialized (ttl {}s)", ttl);
        Cache::builder()
            .max_capacity(100_000)
            .time_to_live(Duration::from_secs(ttl))
            .build()
    })
}

// Get the auth token from a request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, String> {
    get_auth_token_from_headers(req.headers())
}

pub fn get_auth_token_from_headers(headers: &http::HeaderMap) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header.to_str().map_err(|_| "Invalid Authorization header".to_string())?;
        Ok(auth_str
            .strip_prefix("Bearer ")
            .unwrap_or(auth_str)
            .to_string())
    }
    // 2. Try to get token from cookies
    else {
        let cookie_header = headers.get(http::header::COOKIE)
            .ok_or_else(|| "Missing Authorization header or Cookie".to_string())?
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;

        for cookie in cookie::Cookie::split_parse(cookie_header) {
            if let Ok(c) = cookie {
                if c.name() == "auth_token" {
                    return Ok(c.value().to_string());
                }
            }
        }
        Err("auth_token cookie not found".to_string())
    }
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}

/// Turn a user token into the identity attached to a connection
pub fn resolve_identity(token: &str, secret: &str) -> Result<Identity, String> {
    let cache = identity_cache();
    if let Some(cached) = cache.get(token) {
        if cached.expires_at > chrono::Utc::now().timestamp() {
            return Ok(cached.identity);
        }
        cache.invalidate(token);
        return Err("JWT validation failed: ExpiredSignature".to_string());
    }

    let token_data = validate_jwt(token, secret).map_err(|e| format!("JWT validation failed: {}", e))?;
    let claims = &token_data.claims;

    if let Some(token_type) = claims.get("type").and_then(|v| v.as_str()) {
        if token_type != "user" {
            return Err(format!("Token type '{}' cannot open a workspace connection", token_type));
        }
    }

    let user_id = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "Can't extract a UID from the JWT token".to_string())?;
    let display_name = claims
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(user_id);
    let expires_at = claims
        .get("exp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| "JWT token does not contain an 'exp' claim".to_string())?;

    debug!("JWT token validated successfully for user: {}", user_id);
    let identity = Identity::new(user_id, display_name);
    cache.insert(token.to_string(), CachedIdentity { identity: identity.clone(), expires_at });
    Ok(identity)
}

/// Unverified identity taken from query parameters; development only.
pub fn dev_identity(user: Option<&str>, name: Option<&str>) -> Result<Identity, String> {
    let user_id = user
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| "Missing 'user' query parameter".to_string())?;
    Ok(Identity::new(user_id, name.unwrap_or(user_id)))
}
