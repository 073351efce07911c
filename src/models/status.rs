use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// API response for health check
#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

/// API response for readiness check
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ReadyResponse {
    pub status: String,
    pub message: String,
}

impl ReadyResponse {
    pub fn ready() -> Self {
        Self { status: "ok".to_string(), message: "Service is ready".to_string() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self { status: "unavailable".to_string(), message: message.into() }
    }
}

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            status: status.to_string(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_mirrors_status() {
        let body = serde_json::to_value(ErrorResponse::new(StatusCode::SERVICE_UNAVAILABLE, "gone")).unwrap();
        assert_eq!(body["code"], 503);
        assert_eq!(body["status"], "503 Service Unavailable");
        assert_eq!(body["error"], "gone");
    }
}
