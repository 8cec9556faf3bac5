//! Access credential decoding.
//!
//! Access credentials are JWTs issued by the identity service. Decoding here
//! only extracts the claim set from the payload segment; the signature is
//! never checked. A decoded `Credential` means "the issuer vouched for these
//! claims at some point", nothing more.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Name shown for an authenticated user whose token carries no display name.
const FALLBACK_GREETING: &str = "Doctor";

/// Decoded identity claims of an access credential.
///
/// Only `CredentialCodec::decode` can build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    subject_id: String,
    email: String,
    display_name: Option<String>,
    is_privileged_actor: bool,
    expires_at: i64,
}

impl Credential {
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// True for doctors.
    pub fn is_privileged_actor(&self) -> bool {
        self.is_privileged_actor
    }

    /// Expiry in seconds since the epoch.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    /// Display name for greetings, falling back to "Doctor".
    pub fn greeting_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(FALLBACK_GREETING)
    }
}

/// `user_id` is an integer primary key on most deployments but some issue UUIDs.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubjectClaim {
    Number(i64),
    Text(String),
}

impl SubjectClaim {
    fn into_string(self) -> String {
        match self {
            SubjectClaim::Number(n) => n.to_string(),
            SubjectClaim::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    user_id: SubjectClaim,
    email: String,
    #[serde(default)]
    name: Option<String>,
    is_doctor: bool,
    exp: i64,
}

/// Claim extraction and expiry checks for access credentials. Pure; no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialCodec;

impl CredentialCodec {
    pub fn new() -> Self {
        Self
    }

    /// Decode a raw access credential into its claims.
    pub fn decode(&self, raw: &str) -> Result<Credential, AuthError> {
        let parts: Vec<&str> = raw.trim().split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(AuthError::MalformedCredential(
                "expected three dot-separated segments".into(),
            ));
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(parts[1].trim_end_matches('='))
            .map_err(|err| {
                AuthError::MalformedCredential(format!("failed to decode payload: {err}"))
            })?;

        let claims: Claims = serde_json::from_slice(&payload_bytes).map_err(|err| {
            AuthError::MalformedCredential(format!("failed to parse claims: {err}"))
        })?;

        let subject_id = claims.user_id.into_string();
        if subject_id.is_empty() {
            return Err(AuthError::MalformedCredential("empty subject id".into()));
        }

        Ok(Credential {
            subject_id,
            email: claims.email,
            display_name: claims.name,
            is_privileged_actor: claims.is_doctor,
            expires_at: claims.exp,
        })
    }

    /// A credential is expired once `now` reaches its expiry; there is no skew allowance.
    pub fn is_expired(&self, credential: &Credential, now: i64) -> bool {
        credential.expires_at <= now
    }
}

/// Source of the current time in seconds since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}
