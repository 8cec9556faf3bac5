//! Binding to the remote identity service.
//!
//! The service issues a JWT access/refresh pair on login, trades a refresh
//! credential for a new access credential, and registers new accounts.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ApiError;

/// Fresh credential pair returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenPair {
    #[serde(rename = "access")]
    pub access_token: String,
    #[serde(rename = "refresh")]
    pub refresh_token: String,
}

/// Result of a refresh. The refresh credential is only present when the
/// service rotates it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedTokens {
    #[serde(rename = "access")]
    pub access_token: String,
    #[serde(rename = "refresh", default)]
    pub refresh_token: Option<String>,
}

/// Profile fields submitted when creating an account.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub password2: String,
    pub is_doctor: bool,
}

impl Registration {
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
        password2: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
            password: password.into(),
            password2: password2.into(),
            is_doctor: true,
        }
    }

    /// Local checks done before anything is sent.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let fields = [
            &self.first_name,
            &self.last_name,
            &self.email,
            &self.password,
            &self.password2,
        ];
        if fields.iter().any(|f| f.trim().is_empty()) {
            return Err("Please enter all fields".to_string());
        }
        if self.password != self.password2 {
            return Err("Passwords do not match".to_string());
        }
        Ok(())
    }
}

/// The remote identity service as seen by the session manager.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn login(&self, identifier: &str, secret: &str) -> Result<TokenPair, ApiError>;

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError>;

    async fn register(&self, registration: &Registration) -> Result<(), ApiError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// HTTP implementation against the `/auth/` endpoints of the API.
#[derive(Clone)]
pub struct HttpIdentityService {
    client: Client,
    base_url: String,
}

impl HttpIdentityService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/{}", self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_auth_status(status, &body))
        }
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn login(&self, identifier: &str, secret: &str) -> Result<TokenPair, ApiError> {
        let url = self.url("token/");
        debug!(url = %url, "Requesting token pair");

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest {
                email: identifier,
                password: secret,
            })
            .send()
            .await?;

        Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse token pair: {e}")))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError> {
        let url = self.url("token/refresh/");
        debug!(url = %url, "Refreshing access token");

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await?;

        Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse refresh response: {e}")))
    }

    async fn register(&self, registration: &Registration) -> Result<(), ApiError> {
        let url = self.url("register/");
        debug!(url = %url, "Registering account");

        let response = self.client.post(&url).json(registration).send().await?;
        Self::check_response(response).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
