//! REST API module for the health-information service.
//!
//! This module provides:
//! - `IdentityService` / `HttpIdentityService`: login, refresh and
//!   registration against the `/auth/` endpoints
//! - `ApiClient`: authenticated requests carrying the session's default
//!   bearer credential
//!
//! The API uses JWT bearer authentication issued by the identity endpoints.

pub mod client;
pub mod error;
pub mod identity;

pub use client::{ApiClient, RequestAuthorizer, UserProfile};
pub use error::ApiError;
pub use identity::{HttpIdentityService, IdentityService, RefreshedTokens, Registration, TokenPair};
