//! Error types for the rewards HTTP client.

use pointsync_core::Error as CoreError;
use thiserror::Error;

/// Result type alias for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Retry policy class for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Backend error codes meaning an optional function, table or column does
/// not exist on this deployment.
const MISSING_CAPABILITY_CODES: &[&str] = &[
    "PGRST202", // function not found in schema cache
    "PGRST204", // column not found in schema cache
    "PGRST205", // table not found in schema cache
    "42883",    // undefined_function
    "42703",    // undefined_column
    "42P01",    // undefined_table
];

#[derive(Debug, Error)]
pub enum RemoteError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error response from the backend
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Missing or malformed credentials
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn api(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(err) if err.is_decode() => ApiRetryClass::Permanent,
            Self::Http(_) => ApiRetryClass::Retryable,
            Self::Json(_) => ApiRetryClass::Permanent,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
        }
    }

    /// True when the backend lacks the function, table or column the request
    /// relied on. Only the error code counts; a bare 404 (unknown session,
    /// missing route) is not a capability signal.
    pub fn is_missing_capability(&self) -> bool {
        match self {
            Self::Api {
                code: Some(code), ..
            } => MISSING_CAPABILITY_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

impl From<RemoteError> for CoreError {
    fn from(err: RemoteError) -> Self {
        if err.is_missing_capability() {
            return CoreError::Unsupported(err.to_string());
        }
        match (err.retry_class(), err) {
            (_, RemoteError::Json(source)) => CoreError::Json(source),
            (ApiRetryClass::Retryable, err) => CoreError::Transient(err.to_string()),
            (_, err) => CoreError::Rejected(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_for_auth_error_is_reauth() {
        let err = RemoteError::api(401, None, "JWT expired");
        assert_eq!(err.retry_class(), ApiRetryClass::ReauthRequired);
        assert!(matches!(CoreError::from(err), CoreError::Rejected(_)));
    }

    #[test]
    fn missing_function_maps_to_unsupported() {
        let err = RemoteError::api(
            404,
            Some("PGRST202".to_string()),
            "Could not find the function public.adjust_user_points",
        );
        assert!(err.is_missing_capability());
        assert!(CoreError::from(err).is_capability_mismatch());

        let column = RemoteError::api(400, Some("PGRST204".to_string()), "total_spent");
        assert!(CoreError::from(column).is_capability_mismatch());
    }

    #[test]
    fn bare_not_found_is_a_rejection() {
        let unknown_session = RemoteError::api(404, None, "Not Found");
        assert!(!unknown_session.is_missing_capability());
        let mapped = CoreError::from(unknown_session);
        assert!(matches!(mapped, CoreError::Rejected(_)));
        assert!(!mapped.is_capability_mismatch());
    }

    #[test]
    fn server_errors_are_transient_and_constraints_are_rejections() {
        let busy = RemoteError::api(503, None, "unavailable");
        assert!(CoreError::from(busy).is_transient());

        let constraint = RemoteError::api(
            400,
            Some("23514".to_string()),
            "new row violates check constraint points_non_negative",
        );
        assert_eq!(constraint.retry_class(), ApiRetryClass::Permanent);
        assert!(matches!(
            CoreError::from(constraint),
            CoreError::Rejected(_)
        ));
    }
}
