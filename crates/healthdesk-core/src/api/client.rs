//! API client for authenticated requests against the health-information API.
//!
//! The client carries a default bearer credential that the session manager
//! sets and clears through `RequestAuthorizer`. Every request made through
//! the client picks up whatever credential is current at send time.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use super::ApiError;

/// Outbound-request collaborator configured by the session manager.
pub trait RequestAuthorizer: Send + Sync {
    /// Attach `raw` to all subsequent requests, or stop attaching anything.
    fn set_default_credential(&self, raw: Option<&str>);
}

/// Account details of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    pub id: serde_json::Value,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_doctor: bool,
}

/// API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling
/// and clones share the default credential.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credential: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: Arc::new(RwLock::new(None)),
        })
    }

    /// The underlying HTTP client, for sharing the connection pool.
    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_credential(&self) -> bool {
        self.default_credential().is_some()
    }

    /// The credential currently attached to requests.
    pub fn default_credential(&self) -> Option<String> {
        match self.credential.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.default_credential() {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// GET a JSON resource relative to the API base URL.
    ///
    /// A 401 comes back as `ApiError::Unauthorized`; callers hand that to
    /// `SessionManager::handle_unauthorized` and retry once if it succeeds.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(ApiError::from)?;

        let response = Self::check_response(response).await?;
        response.json().await.map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
                .into()
        })
    }

    /// Fetch the profile of the signed-in user.
    pub async fn current_user(&self) -> Result<UserProfile> {
        self.get("auth/me/").await
    }
}

impl RequestAuthorizer for ApiClient {
    fn set_default_credential(&self, raw: Option<&str>) {
        match self.credential.write() {
            Ok(mut guard) => *guard = raw.map(str::to_string),
            Err(poisoned) => {
                warn!("Credential lock poisoned, overwriting");
                *poisoned.into_inner() = raw.map(str::to_string);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
