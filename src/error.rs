use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::subscription::SubscriptionError;

/// HTTP-facing error for the subscription routes
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Error body returned by every failing route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
}

impl GateError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message returned to clients.
    ///
    /// Client errors (4xx) carry their message. Server errors (5xx) are reduced
    /// to a generic message; the full error is logged with the error id.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            Self::Forbidden(msg) => format!("Forbidden: {}", msg),
            Self::Conflict(msg) => format!("Conflict: {}", msg),

            Self::Internal(_) => "Internal server error".to_string(),
            Self::BadGateway(_) => {
                "The payment processor could not complete the request. Please try again later."
                    .to_string()
            }
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request rejected"
            );
        }

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
        });
        (status, body).into_response()
    }
}

/// Result type alias for route handlers
pub type Result<T> = std::result::Result<T, GateError>;

impl From<SubscriptionError> for GateError {
    fn from(err: SubscriptionError) -> Self {
        let message = err.to_string();
        match err {
            SubscriptionError::InvalidTenantId { .. }
            | SubscriptionError::InvalidBulkAction { .. }
            | SubscriptionError::InvalidArgument { .. }
            | SubscriptionError::NoProcessorSubscription { .. }
            | SubscriptionError::InvalidWebhook { .. } => GateError::BadRequest(message),
            SubscriptionError::NoSubscription { .. } => GateError::NotFound(message),
            SubscriptionError::PermissionDenied { .. } => GateError::Forbidden(message),
            SubscriptionError::InvalidTransition { .. }
            | SubscriptionError::AlreadyExists { .. }
            | SubscriptionError::ConcurrencyConflict { .. } => GateError::Conflict(message),
            SubscriptionError::ProcessorNotConfigured { .. } => {
                GateError::ServiceUnavailable(message)
            }
            ref processor @ SubscriptionError::Processor { .. } => {
                if processor.is_retryable() {
                    GateError::ServiceUnavailable(message)
                } else {
                    GateError::BadGateway(message)
                }
            }
            SubscriptionError::Storage { .. } | SubscriptionError::Delivery { .. } => {
                GateError::Internal(message)
            }
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            GateError::BadRequest(format!("JSON error: {}", err))
        } else {
            GateError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionStatus;

    #[test]
    fn test_subscription_error_mapping() {
        let cases = [
            (
                SubscriptionError::InvalidBulkAction {
                    kind: "nuke".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                SubscriptionError::NoSubscription {
                    tenant_id: "t".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                SubscriptionError::PermissionDenied {
                    action: "extend trials".to_string(),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                SubscriptionError::InvalidTransition {
                    tenant_id: "t".to_string(),
                    status: SubscriptionStatus::Active,
                    operation: "extend_trial".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                SubscriptionError::from_http_status("retrieve", 404, "missing"),
                StatusCode::BAD_GATEWAY,
            ),
            (
                SubscriptionError::transient("retrieve", "reset"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SubscriptionError::ProcessorNotConfigured {
                    operation: "retrieve".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SubscriptionError::Storage {
                    message: "disk".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(GateError::from(err).status_code(), expected);
        }
    }

    #[test]
    fn test_server_errors_hide_details() {
        let err = GateError::internal("connection string postgres://secret");
        assert_eq!(err.safe_message(), "Internal server error");

        let err = GateError::from(SubscriptionError::from_http_status(
            "update",
            400,
            "No such customer: cus_123",
        ));
        assert!(!err.safe_message().contains("cus_123"));
    }

    #[tokio::test]
    async fn test_response_body_has_error_id() {
        let response = GateError::forbidden("nope").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Forbidden: nope");
        assert!(uuid::Uuid::parse_str(body["error_id"].as_str().unwrap()).is_ok());
    }
}
