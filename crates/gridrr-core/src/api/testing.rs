//! Scripted in-memory backend for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::sync::Notify;

use super::transport::{ApiRequest, ApiResponse, HttpMethod, Transport};
use super::ApiError;
use crate::auth::store::lock;
use crate::models::UserProfile;

/// Lifetime of tokens the fake issues when none was scripted
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 300;

#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    inner: Arc<FakeState>,
}

#[derive(Default)]
struct FakeState {
    requests: Mutex<Vec<ApiRequest>>,
    scripted: Mutex<HashMap<(String, String), VecDeque<ApiResponse>>>,
    accepted: Mutex<HashSet<String>>,
    reject_all: AtomicBool,
    network_failures: Mutex<HashSet<String>>,
    refresh_calls: AtomicUsize,
    refresh_failure: Mutex<Option<u16>>,
    refresh_token: Mutex<Option<String>>,
    refresh_held: AtomicBool,
    refresh_released: Notify,
    login_token: Mutex<Option<String>>,
    issued: AtomicUsize,
    user: Mutex<Option<UserProfile>>,
}

pub(crate) fn jwt(exp: i64, nonce: usize) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"7","exp":{},"jti":{}}}"#, exp, nonce));
    format!("{}.{}.sig", header, payload)
}

pub(crate) fn sample_user() -> UserProfile {
    UserProfile {
        id: 7,
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        email: "ada@example.com".to_string(),
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_token(&self, token: &str) {
        lock(&self.inner.accepted).insert(token.to_string());
    }

    /// Every bearer token is refused, including freshly refreshed ones.
    pub fn reject_everything(&self) {
        self.inner.reject_all.store(true, Ordering::SeqCst);
    }

    /// Stop accepting every token issued so far.
    pub fn expire_all_tokens(&self) {
        lock(&self.inner.accepted).clear();
    }

    pub fn push_response(&self, method: &str, path: &str, status: u16, body: &str) {
        lock(&self.inner.scripted)
            .entry((method.to_string(), path.to_string()))
            .or_default()
            .push_back(ApiResponse {
                status,
                body: body.to_string(),
            });
    }

    pub fn fail_network(&self, path: &str) {
        lock(&self.inner.network_failures).insert(path.to_string());
    }

    pub fn set_refresh_token(&self, token: &str) {
        *lock(&self.inner.refresh_token) = Some(token.to_string());
    }

    pub fn set_login_token(&self, token: &str) {
        *lock(&self.inner.login_token) = Some(token.to_string());
    }

    pub fn fail_refresh(&self, status: u16) {
        *lock(&self.inner.refresh_failure) = Some(status);
    }

    pub fn hold_refresh(&self) {
        self.inner.refresh_held.store(true, Ordering::SeqCst);
    }

    pub fn release_refresh(&self) {
        self.inner.refresh_held.store(false, Ordering::SeqCst);
        self.inner.refresh_released.notify_waiters();
    }

    pub fn refresh_calls(&self) -> usize {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_refresh_calls(&self, n: usize) {
        while self.refresh_calls() < n {
            tokio::task::yield_now().await;
        }
    }

    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        lock(&self.inner.requests)
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    fn user(&self) -> UserProfile {
        lock(&self.inner.user).clone().unwrap_or_else(sample_user)
    }

    fn issue_token(&self) -> String {
        let nonce = self.inner.issued.fetch_add(1, Ordering::SeqCst);
        let token = jwt(chrono::Utc::now().timestamp() + DEFAULT_TOKEN_LIFETIME_SECS, nonce);
        self.accept_token(&token);
        token
    }

    fn is_authorized(&self, request: &ApiRequest) -> bool {
        if self.inner.reject_all.load(Ordering::SeqCst) {
            return false;
        }
        match request.bearer {
            Some(ref token) => lock(&self.inner.accepted).contains(token),
            None => false,
        }
    }

    async fn refresh(&self) -> ApiResponse {
        self.inner.refresh_calls.fetch_add(1, Ordering::SeqCst);
        while self.inner.refresh_held.load(Ordering::SeqCst) {
            let released = self.inner.refresh_released.notified();
            if !self.inner.refresh_held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        if let Some(status) = *lock(&self.inner.refresh_failure) {
            return respond(status, r#"{"error":"Invalid refresh token"}"#);
        }
        let scripted = lock(&self.inner.refresh_token).clone();
        let token = match scripted {
            Some(token) => {
                self.accept_token(&token);
                token
            }
            None => self.issue_token(),
        };
        respond(200, &serde_json::json!({ "accessToken": token }).to_string())
    }

    fn credentials(&self) -> ApiResponse {
        let scripted = lock(&self.inner.login_token).clone();
        let token = match scripted {
            Some(token) => {
                self.accept_token(&token);
                token
            }
            None => self.issue_token(),
        };
        let body = serde_json::json!({
            "message": "ok",
            "user": self.user(),
            "accessToken": token,
        });
        respond(200, &body.to_string())
    }
}

fn respond(status: u16, body: &str) -> ApiResponse {
    ApiResponse {
        status,
        body: body.to_string(),
    }
}

fn method_name(method: HttpMethod) -> &'static str {
    match method {
        HttpMethod::Get => "GET",
        HttpMethod::Post => "POST",
        HttpMethod::Put => "PUT",
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        lock(&self.inner.requests).push(request.clone());

        if lock(&self.inner.network_failures).contains(&request.path) {
            return Err(ApiError::Network("connection reset".to_string()));
        }

        let method = method_name(request.method);
        let key = (method.to_string(), request.path.clone());
        if let Some(response) = lock(&self.inner.scripted).get_mut(&key).and_then(VecDeque::pop_front) {
            return Ok(response);
        }

        let response = match (method, request.path.as_str()) {
            ("POST", "/auth/refresh") => self.refresh().await,
            ("POST", "/auth/login") | ("POST", "/auth/signup") => self.credentials(),
            ("POST", "/auth/logout") => respond(200, "{}"),
            _ if !self.is_authorized(request) => respond(401, r#"{"error":"Unauthorized"}"#),
            ("GET", "/auth/me") => respond(200, &serde_json::to_string(&self.user()).unwrap_or_default()),
            ("PUT", "/auth/me") => {
                let mut user = serde_json::to_value(self.user()).unwrap_or_default();
                if let (Some(target), Some(serde_json::Value::Object(changes))) =
                    (user.as_object_mut(), request.body.clone())
                {
                    target.extend(changes);
                }
                respond(200, &user.to_string())
            }
            ("POST", "/auth/change-password") => respond(200, r#"{"message":"Password updated"}"#),
            ("GET", _) => respond(200, "[]"),
            _ => respond(200, "{}"),
        };
        Ok(response)
    }
}
