//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `CredentialCodec`: local claim extraction and expiry checks for access credentials
//! - `TokenStore`: durable storage for the raw access/refresh credentials
//!   (file, OS keychain, or in-memory)
//! - `SessionManager`: the session state machine (initialize, login, logout, refresh)
//! - `RouteGuard`: allow/deny/pending verdicts for protected views
//!
//! Access credentials are refreshed reactively only: at startup when the
//! stored one has expired, or when an API call comes back 401.

pub mod credential;
pub mod error;
pub mod guard;
pub mod session;
pub mod store;

pub use credential::{Clock, Credential, CredentialCodec, SystemClock};
pub use error::{AuthError, StorageError};
pub use guard::{RouteAccess, RouteGuard, Verdict, LOGIN_ROUTE};
pub use session::{Phase, SessionManager, SessionSnapshot, DEFAULT_REQUEST_TIMEOUT};
pub use store::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenKey, TokenStore};
