//! Wire models for the Gridrr `/auth/*` endpoints.
//!
//! - `UserProfile`: the signed-in user's identity record
//! - `SignupData`, `LoginData`: credential payloads
//! - `AuthResponse`, `RefreshResponse`: token-bearing responses
//! - `ProfileUpdate`, `PasswordChange`: account mutations

pub mod user;

pub use user::{
    AuthResponse, LoginData, PasswordChange, ProfileUpdate, RefreshResponse, SignupData,
    UserProfile,
};
