//! Authentication state: the stored access token, the single-flight
//! refresh, and the session lifecycle built on top of them.

pub mod notify;
pub mod refresh;
pub mod session;
pub mod store;
pub mod token;

pub use notify::{Notifier, Toast, ToastCenter};
pub use refresh::{RefreshCoordinator, RefreshError};
pub use session::{
    derive_session, ProfileStatus, SessionEvent, SessionManager, SessionPhase, SessionSnapshot,
    SessionState, SESSION_EXPIRED_MESSAGE,
};
pub use store::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenSlot, TokenStore};
pub use token::AccessToken;
