use thiserror::Error;

use crate::api::ApiError;

/// Failure of the durable token storage substrate.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Token storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    #[error("Rejected by identity service: {0}")]
    Rejected(String),

    #[error("No refresh credential available")]
    NoRefreshCredential,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Identity service did not respond within {0} seconds")]
    Timeout(u64),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Another session operation is already in progress")]
    SessionOperationInProgress,

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),
}

impl AuthError {
    /// Short message suitable for showing next to a login form.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Rejected(_) => "Invalid email or password".to_string(),
            AuthError::Network(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            AuthError::Timeout(_) => "Connection timed out. Please try again.".to_string(),
            AuthError::SessionOperationInProgress => {
                "Please wait for the current sign-in to finish.".to_string()
            }
            AuthError::InvalidRegistration(reason) => reason.clone(),
            other => format!("Login failed: {}", other),
        }
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Rejected(body) => AuthError::Rejected(body),
            ApiError::Unauthorized => AuthError::Rejected("unauthorized".to_string()),
            ApiError::AccessDenied(body) => AuthError::Rejected(body),
            ApiError::NetworkError(e) => AuthError::Network(e.to_string()),
            ApiError::InvalidResponse(msg) => AuthError::MalformedCredential(msg),
            other => AuthError::Network(other.to_string()),
        }
    }
}
