//! Session lifecycle for the signed-in user.
//!
//! `SessionManager` owns login, signup and logout, the profile fetch that
//! confirms a stored token, the proactive refresh timer, and the reaction
//! to terminal auth failures (forced logout plus one "session expired"
//! toast). Everything the UI needs is published as a `SessionSnapshot`
//! over a watch channel; navigation cues go out as `SessionEvent`s.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::notify::Notifier;
use super::refresh::{AuthSignal, RefreshCoordinator};
use super::store::lock;
use super::{AccessToken, TokenSlot, TokenStore};
use crate::api::{ApiClient, ApiError, AuthApi, ReqwestTransport, Transport};
use crate::cache::ProfileCache;
use crate::config::Config;
use crate::error::AuthError;
use crate::models::{
    AuthResponse, LoginData, PasswordChange, ProfileUpdate, SignupData, UserProfile,
};

pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please log in again.";

/// Default time before expiry at which the token is refreshed
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 120;

/// Retries for a profile fetch that failed for reasons other than auth
const MAX_PROFILE_FETCH_RETRIES: u32 = 3;

/// Initial backoff before retrying a profile fetch
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Buffer size for session events.
/// Subscribers that fall further behind than this see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Anonymous,
    Authenticating,
    Authenticated,
    /// A token refresh is in flight.
    Expiring,
    /// Transient: cleanup after an auth failure, resolves to `Anonymous`.
    Terminated,
}

/// Last outcome of the profile fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProfileStatus {
    #[default]
    Unknown,
    Loading,
    Loaded(UserProfile),
    /// Non-auth failure (network, server error).
    Failed(String),
    /// 401/403 from the backend.
    Rejected,
}

/// Navigation cues for the page layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(UserProfile),
    SignedUp(UserProfile),
    LoggedOut,
    Refreshed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub is_authenticated: bool,
    pub user: Option<UserProfile>,
}

/// Authenticated iff a token is stored and the last profile fetch succeeded.
pub fn derive_session(has_token: bool, profile: &ProfileStatus) -> SessionState {
    match profile {
        ProfileStatus::Loaded(user) if has_token => SessionState {
            is_authenticated: true,
            user: Some(user.clone()),
        },
        _ => SessionState {
            is_authenticated: false,
            user: None,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub is_authenticated: bool,
    pub user: Option<UserProfile>,
    pub is_loading_user: bool,
    pub is_logging_in: bool,
    pub is_signing_up: bool,
    pub is_logging_out: bool,
    /// Display text of the last failed login or signup.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    LoggingIn,
    SigningUp,
}

#[derive(Debug, Default)]
struct SessionCore {
    phase: SessionPhase,
    profile: ProfileStatus,
    pending: Option<Pending>,
    logging_out: bool,
    last_error: Option<String>,
}

impl SessionCore {
    /// A session exists that an auth failure could end.
    fn is_live(&self) -> bool {
        matches!(self.phase, SessionPhase::Authenticated | SessionPhase::Expiring)
    }
}

struct ScheduledRefresh {
    at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Clone is cheap - all state is shared.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    api: ApiClient,
    auth: AuthApi,
    tokens: TokenSlot,
    profile: ProfileCache,
    notifier: Arc<dyn Notifier>,
    refresh_margin: Duration,
    core: Mutex<SessionCore>,
    /// Bumped whenever a session begins or ends; stale async results compare against it.
    epoch: AtomicU64,
    expiry_notified: AtomicBool,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    timer: Mutex<Option<ScheduledRefresh>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Wire a manager over `transport` and `store`.
    ///
    /// Must be called inside a tokio runtime: the manager spawns a task
    /// that reacts to background refresh outcomes. A token already in
    /// `store` starts the session optimistically in `Authenticated`;
    /// call `start` to confirm it with a profile fetch.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: impl TokenStore + 'static,
        notifier: Arc<dyn Notifier>,
        refresh_margin: Duration,
    ) -> Self {
        let tokens = TokenSlot::new(store);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let api = ApiClient::new(transport, tokens.clone(), signals_tx);
        let stored = tokens.get();

        let core = SessionCore {
            phase: if stored.is_some() {
                SessionPhase::Authenticated
            } else {
                SessionPhase::Anonymous
            },
            ..SessionCore::default()
        };
        let initial = build_snapshot(&core, stored.is_some());
        let (snapshot, _rx) = watch::channel(initial);
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(ManagerInner {
            auth: AuthApi::new(api.clone()),
            api,
            tokens,
            profile: ProfileCache::new(),
            notifier,
            refresh_margin,
            core: Mutex::new(core),
            epoch: AtomicU64::new(0),
            expiry_notified: AtomicBool::new(false),
            snapshot,
            events,
            timer: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        let watcher = tokio::spawn(watch_signals(Arc::downgrade(&inner), signals_rx));
        *lock(&inner.watcher) = Some(watcher);

        if let Some(token) = stored {
            if token.is_expired() {
                info!("Stored access token has expired, the first request will refresh it");
            } else {
                info!("Stored access token found, resuming session");
            }
            inner.schedule_refresh(&token);
        }

        Self { inner }
    }

    /// Manager over the real HTTP transport and the configured token store.
    pub fn from_config(config: &Config, notifier: Arc<dyn Notifier>) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config.api_base_url.clone(), config.request_timeout())?;
        let store = config.token_store()?;
        Ok(Self::new(Arc::new(transport), store, notifier, config.refresh_margin()))
    }

    /// Confirm a resumed session by fetching the profile.
    pub async fn start(&self) -> SessionSnapshot {
        if self.inner.tokens.has_token() && self.inner.profile.get().is_none() {
            if let Err(e) = self.inner.fetch_profile().await {
                debug!(error = %e, "Profile fetch at startup failed");
            }
        }
        self.snapshot()
    }

    /// Current state, derived from the token store as it is right now.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.current_snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.snapshot().is_authenticated
    }

    pub fn phase(&self) -> SessionPhase {
        lock(&self.inner.core).phase
    }

    /// Client for every other authenticated call the UI makes.
    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        self.inner.api.refresher()
    }

    /// When the proactive refresh is due, if one is scheduled.
    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.timer)
            .as_ref()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.at)
    }

    /// How long ago the cached profile was fetched ("just now", "3m ago").
    pub fn profile_age(&self) -> Option<String> {
        self.inner.profile.age_display()
    }

    pub async fn login(&self, data: LoginData) -> Result<UserProfile, AuthError> {
        if let Err(e) = data.validate() {
            self.inner.record_error(&e);
            return Err(e);
        }
        let previous = self.inner.begin_attempt(Pending::LoggingIn);
        info!("Logging in");

        match self.inner.auth.login(&data).await {
            Ok(response) => self.inner.establish(response, previous, SessionEvent::LoggedIn),
            Err(err) => Err(self.inner.fail_attempt(previous, AuthError::from_credentials_call(err))),
        }
    }

    pub async fn signup(&self, data: SignupData) -> Result<UserProfile, AuthError> {
        if let Err(e) = data.validate() {
            self.inner.record_error(&e);
            return Err(e);
        }
        let previous = self.inner.begin_attempt(Pending::SigningUp);
        info!("Signing up");

        match self.inner.auth.signup(&data).await {
            Ok(response) => self.inner.establish(response, previous, SessionEvent::SignedUp),
            Err(err) => Err(self.inner.fail_attempt(previous, AuthError::from_credentials_call(err))),
        }
    }

    /// End the session. Local state is cleared first and unconditionally;
    /// the backend call is best-effort.
    pub async fn logout(&self) {
        let token = self.inner.tokens.get();
        info!("Logging out");

        self.inner.cancel_timer();
        self.inner.tokens.clear();
        self.inner.profile.clear();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut core = lock(&self.inner.core);
            core.phase = SessionPhase::Anonymous;
            core.profile = ProfileStatus::Unknown;
            core.pending = None;
            core.logging_out = true;
        }
        self.inner.publish();

        if let Err(e) = self.inner.auth.logout(token).await {
            debug!(error = %e, "Logout request failed, local session already cleared");
        }

        lock(&self.inner.core).logging_out = false;
        self.inner.publish();
        self.inner.emit(SessionEvent::LoggedOut);
    }

    /// The signed-in user: cached if fresh, otherwise fetched.
    pub async fn current_user(&self) -> Result<Option<UserProfile>, AuthError> {
        if !self.inner.tokens.has_token() {
            return Ok(None);
        }
        if let Some(user) = self.inner.profile.get_fresh() {
            return Ok(Some(user));
        }
        self.inner.fetch_profile().await.map(Some)
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile, AuthError> {
        update.validate()?;
        if !self.inner.tokens.has_token() {
            return Err(AuthError::AuthExpired);
        }
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        match self.inner.auth.update_me(&update).await {
            Ok(user) => {
                self.inner.accept_profile(user.clone(), epoch);
                Ok(user)
            }
            Err(err) => {
                if err.is_auth_failure() {
                    self.inner.terminate_if_epoch(epoch, "profile update rejected");
                }
                Err(AuthError::from_authenticated_call(err))
            }
        }
    }

    pub async fn change_password(&self, current: &str, new: &str) -> Result<(), AuthError> {
        let change = PasswordChange {
            current_password: current.to_string(),
            new_password: new.to_string(),
        };
        change.validate()?;
        if !self.inner.tokens.has_token() {
            return Err(AuthError::AuthExpired);
        }
        self.inner
            .auth
            .change_password(&change)
            .await
            .map_err(AuthError::from_credentials_call)
    }
}

impl ManagerInner {
    fn current_snapshot(&self) -> SessionSnapshot {
        let has_token = self.tokens.has_token();
        build_snapshot(&lock(&self.core), has_token)
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.current_snapshot());
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn record_error(&self, err: &AuthError) {
        lock(&self.core).last_error = Some(err.to_string());
        self.publish();
    }

    fn begin_attempt(&self, pending: Pending) -> SessionPhase {
        let previous = {
            let mut core = lock(&self.core);
            let previous = core.phase;
            core.phase = SessionPhase::Authenticating;
            core.pending = Some(pending);
            core.last_error = None;
            previous
        };
        self.publish();
        previous
    }

    /// Back to where the attempt started; token and profile untouched.
    fn fail_attempt(&self, previous: SessionPhase, err: AuthError) -> AuthError {
        warn!(error = %err, "Authentication attempt failed");
        {
            let mut core = lock(&self.core);
            if core.phase == SessionPhase::Authenticating {
                core.phase = previous;
            }
            core.pending = None;
            core.last_error = Some(err.to_string());
        }
        self.publish();
        err
    }

    fn establish(
        self: &Arc<Self>,
        response: AuthResponse,
        previous: SessionPhase,
        event: fn(UserProfile) -> SessionEvent,
    ) -> Result<UserProfile, AuthError> {
        let token = AccessToken::new(response.access_token);
        if let Err(e) = self.tokens.replace(&token) {
            let err = AuthError::Unknown(format!("Failed to store access token: {}", e));
            return Err(self.fail_attempt(previous, err));
        }
        let user = response.user;
        self.profile.put(user.clone());
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.expiry_notified.store(false, Ordering::SeqCst);
        {
            let mut core = lock(&self.core);
            core.phase = SessionPhase::Authenticated;
            core.profile = ProfileStatus::Loaded(user.clone());
            core.pending = None;
            core.last_error = None;
        }
        info!(user_id = user.id, "Session established");
        self.schedule_refresh(&token);
        self.publish();
        self.emit(event(user.clone()));
        Ok(user)
    }

    async fn fetch_profile(self: &Arc<Self>) -> Result<UserProfile, AuthError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        lock(&self.core).profile = ProfileStatus::Loading;
        self.publish();

        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        loop {
            match self.auth.me().await {
                Ok(user) => {
                    self.accept_profile(user.clone(), epoch);
                    return Ok(user);
                }
                Err(err) if err.is_auth_failure() => {
                    warn!(status = ?err.status(), "Profile fetch rejected");
                    self.set_profile_status(ProfileStatus::Rejected, epoch);
                    self.terminate_if_epoch(epoch, "profile fetch rejected");
                    return Err(AuthError::AuthExpired);
                }
                Err(err) if retries < MAX_PROFILE_FETCH_RETRIES && is_retryable(&err) => {
                    retries += 1;
                    warn!(error = %err, retry = retries, backoff_ms, "Profile fetch failed, backing off");
                    tokio::time::sleep(StdDuration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
                Err(err) => {
                    warn!(error = %err, "Profile fetch failed");
                    self.set_profile_status(ProfileStatus::Failed(err.to_string()), epoch);
                    return Err(AuthError::from_authenticated_call(err));
                }
            }
        }
    }

    fn accept_profile(&self, user: UserProfile, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch || !self.tokens.has_token() {
            debug!("Discarding profile from an ended session");
            return;
        }
        self.profile.put(user.clone());
        // A healthy session re-arms the expiry notification
        self.expiry_notified.store(false, Ordering::SeqCst);
        lock(&self.core).profile = ProfileStatus::Loaded(user);
        self.publish();
    }

    fn set_profile_status(&self, status: ProfileStatus, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            lock(&self.core).profile = status;
            self.publish();
        }
    }

    fn handle_signal(self: &Arc<Self>, signal: AuthSignal) {
        match signal {
            AuthSignal::RefreshStarted { generation } => {
                if self.tokens.generation() != generation {
                    debug!("Ignoring refresh start from a superseded session");
                    return;
                }
                let changed = {
                    let mut core = lock(&self.core);
                    if core.phase == SessionPhase::Authenticated {
                        core.phase = SessionPhase::Expiring;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.publish();
                }
            }
            AuthSignal::Refreshed { token, generation } => {
                if self.tokens.generation() != generation {
                    debug!("Ignoring refresh result from a superseded session");
                    return;
                }
                {
                    let mut core = lock(&self.core);
                    if !core.is_live() {
                        return;
                    }
                    core.phase = SessionPhase::Authenticated;
                }
                self.schedule_refresh(&token);
                self.publish();
                self.emit(SessionEvent::Refreshed);
            }
            AuthSignal::RefreshFailed { error, generation } => {
                if self.tokens.generation() == generation {
                    self.terminate(&format!("token refresh failed: {}", error));
                }
            }
            AuthSignal::Rejected { path, generation } => {
                if self.tokens.generation() == generation {
                    self.terminate(&format!("{} rejected the session token", path));
                }
            }
        }
    }

    fn terminate_if_epoch(self: &Arc<Self>, epoch: u64, reason: &str) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.terminate(reason);
        }
    }

    /// Terminal auth failure: clear everything, tell the user once.
    fn terminate(self: &Arc<Self>, reason: &str) {
        {
            let mut core = lock(&self.core);
            if !core.is_live() {
                debug!(reason, phase = ?core.phase, "No live session to terminate");
                let anonymous = core.phase == SessionPhase::Anonymous;
                drop(core);
                // A public page hitting a protected endpoint: drop the token quietly
                if anonymous {
                    self.tokens.clear();
                }
                return;
            }
            core.phase = SessionPhase::Terminated;
        }
        warn!(reason, "Session terminated");
        self.publish();

        self.cancel_timer();
        self.tokens.clear();
        self.profile.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if !self.expiry_notified.swap(true, Ordering::SeqCst) {
            self.notifier.notify(SESSION_EXPIRED_MESSAGE);
        }

        {
            let mut core = lock(&self.core);
            core.phase = SessionPhase::Anonymous;
            if core.profile != ProfileStatus::Rejected {
                core.profile = ProfileStatus::Unknown;
            }
        }
        self.publish();
        self.emit(SessionEvent::Expired);
    }

    /// Replace the proactive refresh timer for `token`.
    fn schedule_refresh(self: &Arc<Self>, token: &AccessToken) {
        self.cancel_timer();

        let Some(at) = token.refresh_at(self.refresh_margin) else {
            debug!("Token carries no expiry, proactive refresh not scheduled");
            return;
        };
        let Ok(delay) = (at - Utc::now()).to_std() else {
            debug!(refresh_at = %at, "Refresh time already passed, not scheduling");
            return;
        };

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(refresher) = weak.upgrade().map(|inner| inner.api.refresher().clone()) else {
                return;
            };
            info!("Proactive refresh timer fired");
            // Failures reach the manager through the signal channel
            if let Err(e) = refresher.ensure_fresh_token().await {
                debug!(error = %e, "Proactive refresh did not produce a token");
            }
        });

        debug!(refresh_at = %at, delay_secs = delay.as_secs(), "Scheduled proactive token refresh");
        *lock(&self.timer) = Some(ScheduledRefresh { at, handle });
    }

    fn cancel_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.handle.abort();
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel_timer();
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

async fn watch_signals(inner: Weak<ManagerInner>, mut signals: mpsc::UnboundedReceiver<AuthSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_signal(signal);
    }
}

fn build_snapshot(core: &SessionCore, has_token: bool) -> SessionSnapshot {
    let state = derive_session(has_token, &core.profile);
    SessionSnapshot {
        phase: core.phase,
        is_authenticated: state.is_authenticated,
        user: state.user,
        is_loading_user: core.profile == ProfileStatus::Loading,
        is_logging_in: core.pending == Some(Pending::LoggingIn),
        is_signing_up: core.pending == Some(Pending::SigningUp),
        is_logging_out: core.logging_out,
        last_error: core.last_error.clone(),
    }
}

fn is_retryable(err: &ApiError) -> bool {
    match err {
        ApiError::Network(_) => true,
        ApiError::Http { status, .. } => *status >= 500 || *status == 429,
        ApiError::InvalidResponse(_) => false,
    }
}
