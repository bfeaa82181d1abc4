use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::auth::store::lock;
use crate::models::UserProfile;

/// Profile freshness window.
/// Matches how long the UI may show a profile without asking the backend again.
const PROFILE_STALE_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else {
            format!("{}h ago", minutes / 60)
        }
    }

    pub fn is_stale_after(&self, max_age: Duration) -> bool {
        Utc::now() - self.cached_at > max_age
    }
}

pub struct ProfileCache {
    entry: Mutex<Option<CachedData<UserProfile>>>,
    max_age: Duration,
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::with_max_age(Duration::minutes(PROFILE_STALE_MINUTES))
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            entry: Mutex::new(None),
            max_age,
        }
    }

    /// Cached profile regardless of age.
    pub fn get(&self) -> Option<UserProfile> {
        lock(&self.entry).as_ref().map(|c| c.data.clone())
    }

    /// Cached profile if still inside the freshness window.
    pub fn get_fresh(&self) -> Option<UserProfile> {
        lock(&self.entry)
            .as_ref()
            .filter(|c| !c.is_stale_after(self.max_age))
            .map(|c| c.data.clone())
    }

    pub fn put(&self, user: UserProfile) {
        *lock(&self.entry) = Some(CachedData::new(user));
    }

    pub fn clear(&self) {
        *lock(&self.entry) = None;
    }

    pub fn age_display(&self) -> Option<String> {
        lock(&self.entry).as_ref().map(CachedData::age_display)
    }
}
