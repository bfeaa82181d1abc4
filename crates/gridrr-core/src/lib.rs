//! Gridrr session core.
//!
//! Client-side authentication lifecycle for the Gridrr API:
//!
//! - `auth`: token storage, single-flight refresh, session lifecycle, toasts
//! - `api`: HTTP transport, the retrying client, typed `/auth/*` endpoints
//! - `cache`: the cached profile of the signed-in user
//! - `models`: wire types shared with the backend
//! - `config`: persisted client configuration

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;

pub use api::{ApiClient, ApiError, AuthApi, ReqwestTransport, Transport};
pub use auth::{
    AccessToken, FileTokenStore, KeyringTokenStore, MemoryTokenStore, Notifier, RefreshCoordinator,
    RefreshError, SessionEvent, SessionManager, SessionPhase, SessionSnapshot, Toast, ToastCenter,
    TokenSlot, TokenStore,
};
pub use config::{Config, TokenBackend};
pub use error::AuthError;
pub use models::{LoginData, PasswordChange, ProfileUpdate, SignupData, UserProfile};
