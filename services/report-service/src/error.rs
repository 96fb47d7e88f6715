use crate::record_store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Staff authentication failures. The display text is the response body.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown username or wrong password, deliberately indistinguishable
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("missing token")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidOrExpiredToken,

    #[error("admin not found")]
    StaffNotFound,
}

/// Errors surfaced by the report service API
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("not found")]
    NotFound,

    #[error("db commit failed: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::Duplicate(detail) | StoreError::Persistence(detail) => {
                ServiceError::Persistence(detail)
            }
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Auth(_) => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Persistence(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            ServiceError::Validation(message) => ErrorResponse {
                error: message,
                detail: None,
            },
            ServiceError::Auth(err) => ErrorResponse {
                error: err.to_string(),
                detail: None,
            },
            ServiceError::NotFound => ErrorResponse {
                error: "not found".to_string(),
                detail: None,
            },
            ServiceError::Persistence(detail) => {
                error!(detail = %detail, "Database commit failed");
                ErrorResponse {
                    error: "db commit failed".to_string(),
                    detail: Some(detail),
                }
            }
            ServiceError::Internal(err) => {
                error!(error = %err, "Internal error");
                ErrorResponse {
                    error: "internal error".to_string(),
                    detail: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ServiceError::Validation("room_id is required".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::from(AuthError::MissingToken).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ServiceError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ServiceError::Persistence("deadlock".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_store_errors_map_to_service_errors() {
        assert!(matches!(
            ServiceError::from(StoreError::NotFound),
            ServiceError::NotFound
        ));
        assert!(matches!(
            ServiceError::from(StoreError::Persistence("connection reset".into())),
            ServiceError::Persistence(detail) if detail == "connection reset"
        ));
    }

    #[test]
    fn test_auth_messages() {
        assert_eq!(AuthError::InvalidCredentials.to_string(), "invalid credentials");
        assert_eq!(AuthError::StaffNotFound.to_string(), "admin not found");
        assert_eq!(
            AuthError::InvalidOrExpiredToken.to_string(),
            "invalid or expired token"
        );
    }

    async fn rendered(err: ServiceError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_persistence_body_carries_detail() {
        let (status, body) = rendered(ServiceError::Persistence("deadlock".into())).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            serde_json::json!({"error": "db commit failed", "detail": "deadlock"})
        );
    }

    #[tokio::test]
    async fn test_client_error_bodies_have_no_detail() {
        let cases = [
            (
                ServiceError::Validation("room_id is required".into()),
                StatusCode::BAD_REQUEST,
                "room_id is required",
            ),
            (
                ServiceError::from(AuthError::MissingToken),
                StatusCode::UNAUTHORIZED,
                "missing token",
            ),
            (ServiceError::NotFound, StatusCode::NOT_FOUND, "not found"),
            (
                ServiceError::Internal(anyhow::anyhow!("pool exhausted")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
            ),
        ];

        for (err, expected_status, expected_error) in cases {
            let (status, body) = rendered(err).await;
            assert_eq!(status, expected_status);
            assert_eq!(body, serde_json::json!({ "error": expected_error }));
        }
    }
}
