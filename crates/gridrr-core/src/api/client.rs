//! API client for the Gridrr REST API.
//!
//! `ApiClient` attaches the stored bearer token to every request and, on a
//! 401, funnels through the `RefreshCoordinator` and resends the request
//! exactly once with the new token.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::transport::{ApiRequest, ApiResponse, Transport};
use super::ApiError;
use crate::auth::refresh::{AuthSignal, SignalSender};
use crate::auth::{AccessToken, RefreshCoordinator, TokenSlot};

/// Clone is cheap - every field is a shared handle.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    tokens: TokenSlot,
    refresher: RefreshCoordinator,
    signals: SignalSender,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, tokens: TokenSlot, signals: SignalSender) -> Self {
        let refresher =
            RefreshCoordinator::new(Arc::clone(&transport), tokens.clone(), signals.clone());
        Self {
            transport,
            tokens,
            refresher,
            signals,
        }
    }

    pub fn tokens(&self) -> &TokenSlot {
        &self.tokens
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    /// Send a request, refreshing the token and retrying once on 401.
    ///
    /// If the refresh fails the caller gets the original 401 back. A 401
    /// that survives the retry, or a 403 on a request carrying the
    /// session's token, is reported to the session as terminal.
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let generation = if request.bearer.is_none() {
            let (token, generation) = self.tokens.current();
            request.bearer = token.map(AccessToken::into_inner);
            generation
        } else {
            self.tokens.generation()
        };

        let original = match self.dispatch(&request).await {
            Err(err) if err.is_unauthorized() && request.may_refresh() => err,
            other => return self.screen(&request, generation, other),
        };

        request.retried = true;
        let token = match self.refresher.ensure_fresh_token().await {
            Ok(token) => token,
            Err(refresh_err) => {
                debug!(path = %request.path, error = %refresh_err, "Refresh failed, returning original 401");
                return Err(original);
            }
        };

        let generation = self.tokens.generation();
        request.bearer = Some(token.into_inner());
        debug!(path = %request.path, "Retrying request with refreshed token");

        let result = self.dispatch(&request).await;
        self.screen(&request, generation, result)
    }

    /// Report final auth rejections of session-authenticated requests.
    fn screen(
        &self,
        request: &ApiRequest,
        generation: u64,
        result: Result<ApiResponse, ApiError>,
    ) -> Result<ApiResponse, ApiError> {
        if let Err(ref err) = result {
            let rejected = match err.status() {
                Some(401) => request.retried,
                Some(403) => !request.skip_refresh && request.bearer.is_some(),
                _ => false,
            };
            if rejected {
                warn!(path = %request.path, status = ?err.status(), "Request rejected with session token");
                let _ = self.signals.send(AuthSignal::Rejected {
                    path: request.path.clone(),
                    generation,
                });
            }
        }
        result
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.transport.execute(request).await?;
        Self::check_response(response)
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).json(body)?).await?.json()
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.send(ApiRequest::put(path).json(body)?).await?.json()
    }
}
