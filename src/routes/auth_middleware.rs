use axum::{
    extract::{Extension, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{error, info};
use crate::config::Config;
use crate::services::auth_service::{get_auth_token, validate_jwt};

/// Subject of a validated token, made available to downstream handlers.
#[derive(Clone, Debug)]
pub struct Principal {
    pub subject: String,
    pub token_type: String,
}

pub async fn auth_middleware(
    Extension(config): Extension<&'static Config>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {

    // 1. Get the auth token from the request
    let token = match get_auth_token(&req) {
        Ok(token) => token,
        Err(_) => return Err(StatusCode::UNAUTHORIZED),
    };

    // 2. Validate Token
    let secret = match &config.cloud_auth_jwt_secret {
        Some(secret) => secret,
        None => {
            error!("Cloud auth JWT secret not configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let token_data = match validate_jwt(&token, secret) {
        Ok(token_data) => token_data,
        Err(e) => {
            error!("JWT validation failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    // 3. Determine the type of token (user/service)
    let token_type = token_data.claims.get("type").and_then(|v| v.as_str()).unwrap_or("user");
    if token_type != "user" && token_type != "service" {
        error!("Invalid token type: {}", token_type);
        return Err(StatusCode::UNAUTHORIZED);
    }

    // 4. Extract the subject
    let subject = if let Some(sub) = token_data.claims.get("sub").and_then(|v| v.as_str()) {
        sub.to_string()
    } else {
        error!("JWT token does not contain 'sub' claim");
        return Err(StatusCode::UNAUTHORIZED);
    };
    info!("{} token validated successfully for {}", token_type, subject);

    req.extensions_mut().insert(Principal {
        subject,
        token_type: token_type.to_string(),
    });

    Ok(next.run(req).await)
}
