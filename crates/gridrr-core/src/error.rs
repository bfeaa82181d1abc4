//! Errors surfaced by explicit session operations (login, signup, profile).

use thiserror::Error;

use crate::api::ApiError;
use crate::auth::RefreshError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Your session has expired")]
    AuthExpired,

    #[error("Token refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl AuthError {
    /// Classify a failure from a credential endpoint (login, signup, change-password).
    pub fn from_credentials_call(err: ApiError) -> Self {
        match err.status() {
            Some(400) | Some(422) => AuthError::Validation(
                err.server_message().unwrap_or_else(|| "Invalid request".to_string()),
            ),
            Some(401) | Some(403) | Some(409) => AuthError::InvalidCredentials,
            _ => Self::from_api(err),
        }
    }

    /// Classify a failure from an authenticated call.
    pub fn from_authenticated_call(err: ApiError) -> Self {
        match err.status() {
            Some(400) | Some(422) => AuthError::Validation(
                err.server_message().unwrap_or_else(|| "Invalid request".to_string()),
            ),
            Some(401) | Some(403) => AuthError::AuthExpired,
            _ => Self::from_api(err),
        }
    }

    fn from_api(err: ApiError) -> Self {
        match err {
            ApiError::Network(msg) => AuthError::Network(msg),
            other => AuthError::Unknown(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_call_mapping() {
        assert_eq!(
            AuthError::from_credentials_call(ApiError::from_status(401, "")),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            AuthError::from_credentials_call(ApiError::from_status(409, "")),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            AuthError::from_credentials_call(ApiError::from_status(
                422,
                r#"{"message":"password too short"}"#
            )),
            AuthError::Validation("password too short".to_string())
        );
        assert!(matches!(
            AuthError::from_credentials_call(ApiError::Network("timed out".to_string())),
            AuthError::Network(_)
        ));
        assert!(matches!(
            AuthError::from_credentials_call(ApiError::from_status(500, "boom")),
            AuthError::Unknown(_)
        ));
    }

    #[test]
    fn test_authenticated_call_mapping() {
        assert_eq!(
            AuthError::from_authenticated_call(ApiError::from_status(403, "")),
            AuthError::AuthExpired
        );
        assert_eq!(
            AuthError::from_authenticated_call(ApiError::from_status(400, "")),
            AuthError::Validation("Invalid request".to_string())
        );
    }
}
