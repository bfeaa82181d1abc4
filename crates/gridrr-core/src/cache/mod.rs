//! In-memory cache for the signed-in user's profile.
//!
//! The profile is considered fresh for 5 minutes. It is dropped on
//! logout and on terminal auth failures, and replaced whenever the
//! backend returns a newer copy (login, signup, profile update).

pub mod profile;

pub use profile::{CachedData, ProfileCache};
