//! Single-flight access token refresh.
//!
//! However many requests discover an expired token at once, exactly one
//! `POST /auth/refresh` goes out. Late arrivals subscribe to the flight
//! already in progress and all of them observe the same outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::store::lock;
use super::{AccessToken, TokenSlot};
use crate::api::transport::{ApiRequest, Transport};
use crate::api::ApiError;
use crate::models::RefreshResponse;

const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("refresh rejected with status {0}")]
    Rejected(u16),

    #[error("network error during refresh: {0}")]
    Network(String),

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("session ended while the refresh was in flight")]
    Superseded,

    #[error("no session to refresh")]
    NoSession,

    #[error("failed to store refreshed token: {0}")]
    Storage(String),

    #[error("refresh task ended without a result")]
    Aborted,
}

impl From<ApiError> for RefreshError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Http { status, .. } => RefreshError::Rejected(status),
            ApiError::Network(msg) => RefreshError::Network(msg),
            ApiError::InvalidResponse(msg) => RefreshError::InvalidResponse(msg),
        }
    }
}

/// Background auth events, consumed by the session manager.
///
/// Each carries the token slot generation it applies to; the session
/// ignores signals from a generation that is no longer current.
#[derive(Debug, Clone)]
pub enum AuthSignal {
    /// `generation` is the slot generation the refresh started under.
    RefreshStarted { generation: u64 },
    /// `generation` is the token slot generation right after the write.
    Refreshed { token: AccessToken, generation: u64 },
    RefreshFailed { error: RefreshError, generation: u64 },
    /// A request carrying the session's token was refused for good:
    /// 401 after its refresh-and-retry round, or 403.
    Rejected { path: String, generation: u64 },
}

pub type SignalSender = mpsc::UnboundedSender<AuthSignal>;

type RefreshOutcome = Result<AccessToken, RefreshError>;

enum RefreshState {
    Idle,
    Refreshing {
        flight: u64,
        /// Slot generation the flight started under.
        generation: u64,
        waiters: broadcast::Sender<RefreshOutcome>,
    },
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    transport: Arc<dyn Transport>,
    tokens: TokenSlot,
    signals: SignalSender,
    state: Mutex<RefreshState>,
    next_flight: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(transport: Arc<dyn Transport>, tokens: TokenSlot, signals: SignalSender) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                transport,
                tokens,
                signals,
                state: Mutex::new(RefreshState::Idle),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve with a freshly issued token, joining the refresh already
    /// in flight for the current session if there is one.
    pub async fn ensure_fresh_token(&self) -> Result<AccessToken, RefreshError> {
        if !self.inner.tokens.is_open() {
            debug!("No open session, skipping token refresh");
            return Err(RefreshError::NoSession);
        }

        let mut outcome = {
            let mut state = lock(&self.inner.state);
            let (current, generation) = self.inner.tokens.current();
            match &*state {
                RefreshState::Refreshing {
                    flight,
                    generation: started,
                    waiters,
                } if *started == generation => {
                    debug!(flight, "Joining in-flight token refresh");
                    waiters.subscribe()
                }
                stale => {
                    if let RefreshState::Refreshing { flight, .. } = stale {
                        debug!(stale_flight = flight, "In-flight refresh belongs to an ended session");
                    }
                    let flight = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let (waiters, rx) = broadcast::channel(1);
                    let publisher = waiters.clone();
                    *state = RefreshState::Refreshing {
                        flight,
                        generation,
                        waiters,
                    };

                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        let guard = FlightGuard { inner, flight };
                        let _ = guard
                            .inner
                            .signals
                            .send(AuthSignal::RefreshStarted { generation });
                        info!(flight, "Refreshing access token");
                        let response = guard.inner.request_token(current).await;
                        let outcome = guard.inner.complete(flight, generation, response);
                        // A superseded flight still releases its own waiters
                        let _ = publisher.send(outcome);
                    });
                    rx
                }
            }
        };

        outcome.recv().await.unwrap_or(Err(RefreshError::Aborted))
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*lock(&self.inner.state), RefreshState::Refreshing { .. })
    }
}

impl CoordinatorInner {
    async fn request_token(&self, current: Option<AccessToken>) -> RefreshOutcome {
        let mut request = ApiRequest::post(REFRESH_PATH).without_refresh();
        request.bearer = current.map(AccessToken::into_inner);

        let response = self.transport.execute(&request).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body).into());
        }
        let body: RefreshResponse = response.json()?;
        if body.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse("empty accessToken".to_string()));
        }
        Ok(AccessToken::new(body.access_token))
    }

    /// Publish the flight's result to the slot and go back to Idle.
    ///
    /// Runs under the coordinator lock so no caller can join a flight
    /// whose token is already written.
    fn complete(&self, flight: u64, generation: u64, response: RefreshOutcome) -> RefreshOutcome {
        let mut state = lock(&self.state);
        let outcome = self.publish(generation, response);
        if matches!(&*state, RefreshState::Refreshing { flight: f, .. } if *f == flight) {
            *state = RefreshState::Idle;
        }
        outcome
    }

    fn publish(&self, generation: u64, response: RefreshOutcome) -> RefreshOutcome {
        match response {
            Ok(token) => match self.tokens.replace_if_current(&token, generation) {
                Ok(true) => {
                    info!(expires_at = ?token.expires_at(), "Access token refreshed");
                    let _ = self.signals.send(AuthSignal::Refreshed {
                        token: token.clone(),
                        generation: generation + 1,
                    });
                    Ok(token)
                }
                Ok(false) => Err(RefreshError::Superseded),
                Err(e) => {
                    warn!(error = %e, "Failed to persist refreshed token");
                    let err = RefreshError::Storage(e.to_string());
                    self.tokens.clear();
                    let _ = self.signals.send(AuthSignal::RefreshFailed {
                        error: err.clone(),
                        generation: self.tokens.generation(),
                    });
                    Err(err)
                }
            },
            Err(err) => {
                warn!(error = %err, "Token refresh failed");
                // A logout or new login since the start owns the slot now
                if self.tokens.clear_if_current(generation) {
                    let _ = self.signals.send(AuthSignal::RefreshFailed {
                        error: err.clone(),
                        generation: generation + 1,
                    });
                }
                Err(err)
            }
        }
    }
}

/// Returns the coordinator to Idle if the refresh task dies early;
/// dropping the sender wakes every waiter with `Aborted`.
struct FlightGuard {
    inner: Arc<CoordinatorInner>,
    flight: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        if matches!(&*state, RefreshState::Refreshing { flight, .. } if *flight == self.flight) {
            *state = RefreshState::Idle;
        }
    }
}
