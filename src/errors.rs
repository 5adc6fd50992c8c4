use http::StatusCode;
use sea_orm::error::{ConnAcquireErr, DbErr, RuntimeErr};
use sea_orm::sqlx;
use serde::{Deserialize, Serialize};

/// Error body handed to callers that render service failures.
///
/// Only carries the public message; version tokens, row counts and database
/// details never make it in here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// True when the caller may re-read and try again
    pub retryable: bool,
    /// RFC 3339 timestamp when the error was rendered
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    ///
    /// Pool acquisition timeouts are a storage-layer concern and surface as the
    /// transient `ServiceUnavailable` rather than a domain error. Lock contention
    /// between concurrent writers surfaces as `Conflict`.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        match error.into_db_err() {
            err if is_write_contention(&err) => {
                ServiceError::Conflict("Storage is busy with a concurrent update".to_string())
            }
            DbErr::ConnectionAcquire(ConnAcquireErr::Timeout) => {
                ServiceError::ServiceUnavailable("storage timed out".to_string())
            }
            DbErr::ConnectionAcquire(ConnAcquireErr::ConnectionClosed) => {
                ServiceError::ServiceUnavailable("storage connection closed".to_string())
            }
            other => ServiceError::DatabaseError(other),
        }
    }

    /// Whether re-reading state and trying again can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::CapacityExceeded(_) | Self::ServiceUnavailable(_)
        )
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::CapacityExceeded(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for end users.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::Other(_) => "Internal server error".to_string(),
            Self::Conflict(_) => {
                "The resource was modified concurrently, please try again".to_string()
            }
            Self::CapacityExceeded(_) => {
                "Coupon usage limit reached, please try again".to_string()
            }
            Self::ServiceUnavailable(_) => "Service temporarily unavailable".to_string(),
            Self::NotFound(msg) | Self::ValidationError(msg) => msg.clone(),
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let status = self.status_code();
        ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            retryable: self.is_retryable(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Whether the database rejected the statement because another transaction
/// holds or won the lock on the same data.
fn is_write_contention(err: &DbErr) -> bool {
    let runtime = match err {
        DbErr::Conn(e) | DbErr::Exec(e) | DbErr::Query(e) => e,
        _ => return false,
    };
    match runtime {
        RuntimeErr::SqlxError(sqlx::Error::Database(db_err)) => db_err
            .code()
            .map_or(false, |code| is_contention_code(&code)),
        _ => false,
    }
}

/// Postgres: serialization failure, deadlock, lock not available.
/// SQLite: BUSY and LOCKED, including their extended codes.
fn is_contention_code(code: &str) -> bool {
    if matches!(code, "40001" | "40P01" | "55P03") {
        return true;
    }
    // SQLite codes are plain integers; Postgres SQLSTATEs are always five characters
    code.len() < 5
        && code
            .parse::<i32>()
            .map_or(false, |extended| matches!(extended & 0xff, 5 | 6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::CapacityExceeded("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::db_error("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn acquire_timeout_is_transient() {
        let err = ServiceError::db_error(DbErr::ConnectionAcquire(ConnAcquireErr::Timeout));
        assert!(matches!(err, ServiceError::ServiceUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn lock_contention_codes() {
        for code in ["40001", "40P01", "55P03", "5", "6", "517", "262"] {
            assert!(is_contention_code(code), "{} should be contention", code);
        }
        for code in ["23505", "22005", "19", "2067", "1555", "busy"] {
            assert!(!is_contention_code(code), "{} should not be contention", code);
        }
    }

    #[test]
    fn unclassified_database_errors_stay_internal() {
        let err = ServiceError::db_error(DbErr::Exec(RuntimeErr::Internal("boom".into())));
        assert!(matches!(err, ServiceError::DatabaseError(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn response_message_hides_internal_state() {
        let conflict = ServiceError::Conflict("coupon 42 version 7 != 8".into());
        assert!(!conflict.response_message().contains("version"));

        let db = ServiceError::db_error("relation \"coupons\" does not exist");
        assert_eq!(db.response_message(), "Database error");

        let missing = ServiceError::NotFound("Coupon not found or not available".into());
        let body = missing.to_response();
        assert_eq!(body.error, "Not Found");
        assert_eq!(body.message, "Coupon not found or not available");
        assert!(!body.retryable);
    }
}
