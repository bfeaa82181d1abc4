//! REST API client module for the Gridrr backend.
//!
//! This module provides the `ApiClient` used by every page-level call,
//! the `Transport` seam it sends through, and `AuthApi`, the typed
//! wrapper over the `/auth/*` endpoints.
//!
//! The API uses bearer token authentication; the refresh credential
//! travels as an HTTP-only cookie.

pub mod auth;
pub mod client;
pub mod error;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::AuthApi;
pub use client::ApiClient;
pub use error::ApiError;
pub use transport::{ApiRequest, ApiResponse, HttpMethod, ReqwestTransport, Transport};
