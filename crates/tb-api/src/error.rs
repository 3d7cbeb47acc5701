use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tb_common::{DataError, DataErrorKind};
use tb_outbox::OutboxError;
use tb_tenancy::TenancyError;
use thiserror::Error;
use tracing::error;

pub const MSG_TENANT_NOT_FOUND: &str = "Tenant not found.";
pub const MSG_TENANT_RESOLUTION_FAILED: &str = "Tenant resolution failed.";
pub const MSG_MISSING_HOST: &str = "Missing host.";
pub const MSG_INTERNAL: &str = "An unexpected error occurred.";

/// Standard API error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Errors returned to HTTP clients.
///
/// `Internal` carries only the public message; details are logged where
/// the error is created.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Internal(&'static str),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<DataError> for ApiError {
    fn from(err: DataError) -> Self {
        match err.kind {
            DataErrorKind::NotFound => Self::NotFound("Resource not found.".to_string()),
            DataErrorKind::Conflict => Self::Conflict("Resource already exists.".to_string()),
            DataErrorKind::Validation => Self::BadRequest("Request violates a data constraint.".to_string()),
            DataErrorKind::Transient | DataErrorKind::Unknown => {
                error!(
                    operation = err.operation,
                    kind = ?err.kind,
                    sql_state = ?err.sql_state,
                    error = %err.source,
                    "Data access failed"
                );
                Self::Internal(MSG_INTERNAL)
            }
        }
    }
}

impl From<TenancyError> for ApiError {
    fn from(err: TenancyError) -> Self {
        match err {
            TenancyError::Unresolved => Self::NotFound(MSG_TENANT_NOT_FOUND.to_string()),
            TenancyError::Data(e) => e.into(),
            other => {
                error!(error = %other, "Tenant routing failed");
                Self::Internal(MSG_INTERNAL)
            }
        }
    }
}

impl From<OutboxError> for ApiError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::Validation(message) => Self::BadRequest(message),
            OutboxError::Data(e) => e.into(),
            OutboxError::Tenancy(e) => e.into(),
            other => {
                error!(error = %other, "Outbox write failed");
                Self::Internal(MSG_INTERNAL)
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        DataError::translate("request query", err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::PayloadTooLarge("x".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Internal(MSG_INTERNAL).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unresolved_tenant_is_not_found() {
        let err = ApiError::from(TenancyError::Unresolved);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), MSG_TENANT_NOT_FOUND);
    }

    #[test]
    fn test_data_errors_map_by_kind() {
        let err = ApiError::from(DataError::translate("load note", sqlx::Error::RowNotFound));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = ApiError::from(DataError::translate("load note", sqlx::Error::PoolTimedOut));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), MSG_INTERNAL);
    }

    #[test]
    fn test_outbox_validation_is_bad_request() {
        let err = ApiError::from(OutboxError::Validation("queue name is required".into()));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
