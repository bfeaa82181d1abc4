use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::AccessToken;

/// Token file name in the data directory
const TOKEN_FILE: &str = "access_token.json";

/// Keychain service and the fixed key the token lives under
const KEYRING_SERVICE: &str = "gridrr";
const KEYRING_KEY: &str = "accessToken";

/// A single durable slot holding the current access token.
///
/// Pure storage: no validation, no expiry checks.
pub trait TokenStore: Send + Sync {
    fn get(&self) -> Result<Option<String>>;

    /// Overwrites unconditionally.
    fn set(&self, token: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

impl<S: TokenStore + ?Sized> TokenStore for Box<S> {
    fn get(&self) -> Result<Option<String>> {
        (**self).get()
    }

    fn set(&self, token: &str) -> Result<()> {
        (**self).set(token)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

// ============================================================================
// File
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    #[serde(rename = "accessToken")]
    access_token: String,
    stored_at: DateTime<Utc>,
}

/// Token persisted as JSON in the data directory; survives restarts.
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn token_path(&self) -> PathBuf {
        self.dir.join(TOKEN_FILE)
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Result<Option<String>> {
        let path = self.token_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read token file")?;
        let stored: StoredToken =
            serde_json::from_str(&contents).context("Failed to parse token file")?;
        Ok(Some(stored.access_token))
    }

    fn set(&self, token: &str) -> Result<()> {
        let path = self.token_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create token directory")?;
        }
        let stored = StoredToken {
            access_token: token.to_string(),
            stored_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&stored)?;
        std::fs::write(path, contents).context("Failed to write token file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let path = self.token_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove token file")?;
        }
        Ok(())
    }
}

// ============================================================================
// Keyring
// ============================================================================

/// Token kept in the OS keychain.
pub struct KeyringTokenStore;

impl KeyringTokenStore {
    fn entry() -> Result<Entry> {
        Entry::new(KEYRING_SERVICE, KEYRING_KEY).context("Failed to create keyring entry")
    }
}

impl TokenStore for KeyringTokenStore {
    fn get(&self) -> Result<Option<String>> {
        match Self::entry()?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve token from keychain"),
        }
    }

    fn set(&self, token: &str) -> Result<()> {
        Self::entry()?
            .set_password(token)
            .context("Failed to store token in keychain")
    }

    fn clear(&self) -> Result<()> {
        match Self::entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Process-local slot. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Result<Option<String>> {
        Ok(lock(&self.token).clone())
    }

    fn set(&self, token: &str) -> Result<()> {
        *lock(&self.token) = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *lock(&self.token) = None;
        Ok(())
    }
}

// ============================================================================
// Slot
// ============================================================================

/// Shared handle over the injected `TokenStore`.
///
/// Every write bumps a generation counter. A refresh remembers the
/// generation it started under and may only publish its token if no
/// login, logout or terminal failure has written the slot since.
///
/// The slot is also open or closed. Clearing closes it and only an
/// explicit `replace` (login, signup) reopens it, so a refresh can never
/// bring back a session that has ended.
#[derive(Clone)]
pub struct TokenSlot {
    inner: Arc<SlotInner>,
}

struct SlotInner {
    store: Box<dyn TokenStore>,
    state: Mutex<SlotState>,
}

struct SlotState {
    generation: u64,
    open: bool,
}

impl TokenSlot {
    /// Opens the slot if the store already holds a token.
    pub fn new(store: impl TokenStore + 'static) -> Self {
        let slot = Self {
            inner: Arc::new(SlotInner {
                store: Box::new(store),
                state: Mutex::new(SlotState {
                    generation: 0,
                    open: false,
                }),
            }),
        };
        let open = slot.read().is_some();
        lock(&slot.inner.state).open = open;
        slot
    }

    /// The current token. Read failures are logged and read as absent.
    pub fn get(&self) -> Option<AccessToken> {
        let _guard = lock(&self.inner.state);
        self.read()
    }

    pub fn has_token(&self) -> bool {
        self.get().is_some()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.inner.state).generation
    }

    /// Whether a session owns the slot.
    pub fn is_open(&self) -> bool {
        lock(&self.inner.state).open
    }

    /// Token and generation read atomically.
    pub fn current(&self) -> (Option<AccessToken>, u64) {
        let state = lock(&self.inner.state);
        (self.read(), state.generation)
    }

    /// Overwrite the token and open the slot (login, signup).
    pub fn replace(&self, token: &AccessToken) -> Result<()> {
        let mut state = lock(&self.inner.state);
        state.generation += 1;
        state.open = true;
        self.inner.store.set(token.as_str())
    }

    /// Overwrite only if the slot is open and nothing else wrote it since
    /// `expected`. Returns whether the token was accepted.
    pub fn replace_if_current(&self, token: &AccessToken, expected: u64) -> Result<bool> {
        let mut state = lock(&self.inner.state);
        if !state.open || state.generation != expected {
            debug!(
                expected,
                current = state.generation,
                open = state.open,
                "Discarding token from superseded session"
            );
            return Ok(false);
        }
        state.generation += 1;
        self.inner.store.set(token.as_str())?;
        Ok(true)
    }

    /// Remove the token and close the slot.
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        state.generation += 1;
        state.open = false;
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored token");
        }
    }

    /// Clear only if nothing else wrote the slot since `expected`.
    pub fn clear_if_current(&self, expected: u64) -> bool {
        let mut state = lock(&self.inner.state);
        if state.generation != expected {
            return false;
        }
        state.generation += 1;
        state.open = false;
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored token");
        }
        true
    }

    fn read(&self) -> Option<AccessToken> {
        match self.inner.store.get() {
            Ok(token) => token.filter(|t| !t.is_empty()).map(AccessToken::new),
            Err(e) => {
                warn!(error = %e, "Failed to read stored token");
                None
            }
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileTokenStore::new(dir.path().join("nested"));

        assert_eq!(store.get().expect("get"), None);
        store.set("tok-1").expect("set");
        assert_eq!(store.get().expect("get").as_deref(), Some("tok-1"));

        // Survives a fresh handle on the same directory
        let reopened = FileTokenStore::new(dir.path().join("nested"));
        assert_eq!(reopened.get().expect("get").as_deref(), Some("tok-1"));

        store.set("tok-2").expect("overwrite");
        assert_eq!(store.get().expect("get").as_deref(), Some("tok-2"));

        store.clear().expect("clear");
        assert_eq!(store.get().expect("get"), None);
        store.clear().expect("clearing twice is fine");
    }

    #[test]
    fn test_corrupt_token_file_reads_as_absent_through_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(TOKEN_FILE), "{not json").expect("write");
        let slot = TokenSlot::new(FileTokenStore::new(dir.path().to_path_buf()));
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_slot_generation_guards_stale_writes() {
        let slot = TokenSlot::new(MemoryTokenStore::with_token("old"));
        let started = slot.generation();

        slot.replace(&AccessToken::new("relogin")).expect("replace");
        let accepted = slot
            .replace_if_current(&AccessToken::new("late"), started)
            .expect("replace");
        assert!(!accepted);
        assert_eq!(slot.get().map(AccessToken::into_inner).as_deref(), Some("relogin"));

        let (_, now) = slot.current();
        assert!(slot.replace_if_current(&AccessToken::new("fresh"), now).expect("replace"));
        assert_eq!(slot.get().map(AccessToken::into_inner).as_deref(), Some("fresh"));
    }

    #[test]
    fn test_closed_slot_refuses_refreshed_tokens() {
        let slot = TokenSlot::new(MemoryTokenStore::with_token("old"));
        assert!(slot.is_open());

        slot.clear(); // logout
        assert!(!slot.is_open());
        let (_, now) = slot.current();
        assert!(!slot.replace_if_current(&AccessToken::new("late"), now).expect("replace"));
        assert!(!slot.has_token());

        slot.replace(&AccessToken::new("login")).expect("replace");
        assert!(slot.is_open());
    }

    #[test]
    fn test_slot_starts_closed_without_token() {
        let slot = TokenSlot::new(MemoryTokenStore::new());
        assert!(!slot.is_open());
        assert!(!slot.replace_if_current(&AccessToken::new("cookie"), slot.generation()).expect("replace"));
        assert!(!slot.has_token());
    }

    #[test]
    fn test_clear_if_current() {
        let slot = TokenSlot::new(MemoryTokenStore::with_token("a"));
        let started = slot.generation();
        slot.replace(&AccessToken::new("b")).expect("replace");
        assert!(!slot.clear_if_current(started));
        assert!(slot.has_token());
        assert!(slot.clear_if_current(slot.generation()));
        assert!(!slot.has_token());
    }

    #[test]
    fn test_empty_token_is_absent() {
        let slot = TokenSlot::new(MemoryTokenStore::with_token(""));
        assert!(!slot.has_token());
    }
}
