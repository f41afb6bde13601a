//! API error mapping
//!
//! Wraps the core error taxonomy and renders the unified error response
//! format: typed code, human-readable message, correlation id.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use trustplane_core::Error;

/// Unified error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub correlation_id: String,
}

/// Core error carried across the API boundary
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self(Error::Validation(message.into()))
    }

    fn error_code(&self) -> &'static str {
        match &self.0 {
            Error::NotFound { .. } => "ERR_NOT_FOUND",
            Error::Conflict { .. } => "ERR_CONFLICT",
            Error::DuplicateMac(_) => "ERR_DUPLICATE_MAC",
            Error::DuplicateDeviceId(_) => "ERR_DUPLICATE_DEVICE_ID",
            Error::AttestationFailed { .. } => "ERR_ATTESTATION",
            Error::SwitchUnavailable => "ERR_SWITCH_UNAVAILABLE",
            Error::SwitchRuleRejected { .. } => "ERR_SWITCH_RULE",
            Error::Storage { .. } => "ERR_STORAGE",
            Error::Config { .. } => "ERR_CONFIG",
            Error::Transient { .. } => "ERR_TRANSIENT",
            Error::PolicyViolation(_) => "ERR_POLICY_VIOLATION",
            Error::Validation(_) => "ERR_VALIDATION",
            Error::Internal(_) => "ERR_INTERNAL",
        }
    }

    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. }
            | Error::DuplicateMac(_)
            | Error::DuplicateDeviceId(_)
            | Error::AttestationFailed { .. } => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::PolicyViolation(_) => StatusCode::FORBIDDEN,
            Error::SwitchUnavailable | Error::SwitchRuleRejected { .. } => StatusCode::BAD_GATEWAY,
            Error::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage { .. } | Error::Config { .. } | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = trustplane_core::types::AuditRecord::new_correlation_id();
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self.0, correlation_id = %correlation_id, "request failed");
        } else {
            tracing::debug!(error = %self.0, correlation_id = %correlation_id, "request rejected");
        }

        let body = ErrorResponse {
            error_code: self.error_code().to_string(),
            message: self.0.to_string(),
            correlation_id,
        };
        (status, Json(body)).into_response()
    }
}
