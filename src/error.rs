use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The trust plane's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or weak master secret. Fatal for anything touching encryption.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Tampered or corrupt ciphertext.
    ///
    /// Carries no detail on purpose: every failure mode looks the same to the caller.
    #[error("Decryption failed")]
    Decryption,

    /// An encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store did not answer in time or refused the call.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A database error.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A connection pool error.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// A Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A row was missing a column or held an unexpected value.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// An authorization error.
    #[error("Authorization failed")]
    Unauthorized,

    /// A rate limit exceeded error.
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// An internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this error comes from the backing store rather than the request.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_)
                | AppError::Database(_)
                | AppError::Pool(_)
                | AppError::Redis(_)
                | AppError::MissingData(_)
        )
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report.to_string())
    }
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Configuration(ref msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }

            AppError::Decryption => {
                tracing::error!("Decryption failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }

            AppError::Encryption(ref msg) => {
                tracing::error!("Encryption error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Encryption error".to_string())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::StoreUnavailable(ref msg) => {
                tracing::error!("Store unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable".to_string())
            }

            AppError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Pool(ref e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable".to_string())
            }

            AppError::Redis(ref e) => {
                tracing::error!("Redis error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }

            AppError::MissingData(ref field) => {
                tracing::error!("Missing data: {}", field);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }

            AppError::Unauthorized => {
                tracing::warn!("Authorization failed");
                (StatusCode::FORBIDDEN, "Forbidden".to_string())
            }

            AppError::RateLimitExceeded { retry_after_secs } => {
                tracing::warn!("Rate limit exceeded, retry after {}s", retry_after_secs);
                let body = error_body("Rate limit exceeded");
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(http::header::RETRY_AFTER, retry_after_secs.to_string())],
                    body,
                )
                    .into_response();
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        (status, error_body(&message)).into_response()
    }
}

/// Renders the generic `{"error": ...}` body shared by every blocking response.
pub(crate) fn error_body(message: &str) -> String {
    sonic_rs::to_string(&sonic_rs::json!({
        "error": message
    }))
    .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_error_has_no_detail() {
        assert_eq!(AppError::Decryption.to_string(), "Decryption failed");
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = AppError::RateLimitExceeded { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(http::header::RETRY_AFTER).unwrap(),
            "42"
        );
    }

    #[test]
    fn store_failures_are_classified() {
        assert!(AppError::StoreUnavailable("timeout".into()).is_store_failure());
        assert!(!AppError::Unauthorized.is_store_failure());
    }
}
