//! Core library for healthdesk.
//!
//! This crate holds everything a healthdesk front end needs to keep a user
//! signed in against the health-information API:
//!
//! - `auth`: credential decoding, token storage, the session state machine
//!   and the route guard
//! - `api`: the identity service binding and the outbound API client
//! - `config`: application configuration

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, HttpIdentityService, IdentityService, RequestAuthorizer};
pub use auth::{
    AuthError, Credential, CredentialCodec, Phase, RouteAccess, RouteGuard, SessionManager,
    SessionSnapshot, TokenKey, TokenStore, Verdict,
};
pub use config::Config;
