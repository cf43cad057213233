//! Error types for CareHub services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for tenant, session, authentication and authorization failures
//! - HTTP status code mapping
//! - Structured error responses with machine-readable codes
//! - Generic client messages for internal faults

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request errors
    ValidationError,
    UnrecognizedClient,

    // Tenant errors
    TenantNotFound,
    TenantSuspended,

    // Authentication errors
    Unauthenticated,
    MalformedToken,

    // Authorization errors
    Unauthorized,

    // Database errors
    DatabaseError,

    // Internal errors
    InternalError,
    ConfigurationError,
    SerializationError,

    // Service unavailable
    ServiceUnavailable,
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Request errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Unrecognized client application")]
    UnrecognizedClient,

    // Tenant errors
    #[error("Tenant not found")]
    TenantNotFound,

    #[error("Tenant {tenant_id} is not active")]
    TenantSuspended { tenant_id: Uuid },

    #[error("Schema {schema} for tenant {tenant_id} does not exist")]
    TenantSchemaMissing { tenant_id: Uuid, schema: String },

    #[error("Database unavailable: {message}")]
    DatabaseUnavailable { message: String },

    // Authentication errors
    #[error("Unauthenticated: {message}")]
    Unauthenticated { message: String },

    #[error("Malformed bearer token")]
    MalformedToken,

    // Authorization errors
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database driver error: {0}")]
    Sqlx(#[from] sqlx::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Shorthand for an authentication failure
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        AppError::Unauthenticated {
            message: message.into(),
        }
    }

    /// Shorthand for an authorization failure
    pub fn unauthorized(message: impl Into<String>) -> Self {
        AppError::Unauthorized {
            message: message.into(),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::UnrecognizedClient => ErrorCode::UnrecognizedClient,
            AppError::TenantNotFound => ErrorCode::TenantNotFound,
            AppError::TenantSuspended { .. } => ErrorCode::TenantSuspended,
            AppError::TenantSchemaMissing { .. } => ErrorCode::ServiceUnavailable,
            AppError::DatabaseUnavailable { .. } => ErrorCode::ServiceUnavailable,
            AppError::Unauthenticated { .. } => ErrorCode::Unauthenticated,
            AppError::MalformedToken => ErrorCode::MalformedToken,
            AppError::Unauthorized { .. } => ErrorCode::Unauthorized,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::Sqlx(_) => ErrorCode::DatabaseError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::UnrecognizedClient
            | AppError::TenantNotFound => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::Unauthenticated { .. } | AppError::MalformedToken => {
                StatusCode::UNAUTHORIZED
            }

            // 403 Forbidden
            AppError::TenantSuspended { .. } | AppError::Unauthorized { .. } => {
                StatusCode::FORBIDDEN
            }

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::Sqlx(_)
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 503 Service Unavailable
            AppError::TenantSchemaMissing { .. } | AppError::DatabaseUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Message safe to show to the caller.
    ///
    /// Server faults never expose schema names, connection strings or driver output.
    pub fn public_message(&self) -> String {
        match self {
            AppError::TenantNotFound => "Unknown hospital".to_string(),
            AppError::TenantSuspended { .. } => "This hospital account is not active".to_string(),
            AppError::Unauthenticated { .. } | AppError::MalformedToken => {
                "Please sign in".to_string()
            }
            AppError::Unauthorized { .. } => "You are not permitted to perform this action".to_string(),
            AppError::TenantSchemaMissing { .. } | AppError::DatabaseUnavailable { .. } => {
                "Service temporarily unavailable".to_string()
            }
            _ if self.is_server_error() => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let details = match &self {
            AppError::Validation { field: Some(field), .. } => {
                Some(serde_json::json!({ "field": field }))
            }
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message: self.public_message(),
                details,
                request_id: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_error_codes_are_distinct() {
        let missing = AppError::TenantNotFound;
        let suspended = AppError::TenantSuspended {
            tenant_id: Uuid::new_v4(),
        };
        assert_ne!(missing.code(), suspended.code());
        assert_ne!(missing.status_code(), suspended.status_code());
    }

    #[test]
    fn test_authn_and_authz_statuses() {
        assert_eq!(
            AppError::unauthenticated("no token").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AppError::MalformedToken.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::unauthorized("beds:write").status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_internal_faults_do_not_leak_schema() {
        let err = AppError::TenantSchemaMissing {
            tenant_id: Uuid::new_v4(),
            schema: "tenant_42".into(),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.to_string().contains("tenant_42"));
        assert!(!err.public_message().contains("tenant_42"));
        assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
    }

    #[test]
    fn test_database_unavailable_is_503() {
        let err = AppError::DatabaseUnavailable {
            message: "pool timed out".into(),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_server_error());
        assert!(!err.public_message().contains("pool"));
    }

    #[test]
    fn test_validation_error() {
        let err = AppError::Validation {
            message: "Invalid ward".into(),
            field: Some("ward".into()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.is_server_error());
        assert!(err.is_client_error());
    }
}
