//! Typed wrappers over the `/auth/*` endpoints.
//!
//! These calls only talk to the backend. Writing the returned token and
//! profile into local state is the session manager's job.

use super::transport::ApiRequest;
use super::{ApiClient, ApiError};
use crate::auth::AccessToken;
use crate::models::{AuthResponse, LoginData, PasswordChange, ProfileUpdate, SignupData, UserProfile};

#[derive(Clone)]
pub struct AuthApi {
    api: ApiClient,
}

impl AuthApi {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn signup(&self, data: &SignupData) -> Result<AuthResponse, ApiError> {
        let request = ApiRequest::post("/auth/signup").json(data)?.without_refresh();
        self.api.send(request).await?.json()
    }

    pub async fn login(&self, data: &LoginData) -> Result<AuthResponse, ApiError> {
        let request = ApiRequest::post("/auth/login").json(data)?.without_refresh();
        self.api.send(request).await?.json()
    }

    /// The caller passes the token explicitly: local state is usually
    /// cleared before this goes out.
    pub async fn logout(&self, token: Option<AccessToken>) -> Result<(), ApiError> {
        let mut request = ApiRequest::post("/auth/logout").without_refresh();
        request.bearer = token.map(AccessToken::into_inner);
        self.api.send(request).await.map(|_| ())
    }

    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        self.api.get("/auth/me").await
    }

    pub async fn update_me(&self, update: &ProfileUpdate) -> Result<UserProfile, ApiError> {
        self.api.put("/auth/me", update).await
    }

    /// A 401 here means the current password was wrong, so no refresh round.
    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), ApiError> {
        let request = ApiRequest::post("/auth/change-password")
            .json(change)?
            .without_refresh();
        self.api.send(request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::api::testing::{sample_user, FakeBackend};
    use crate::auth::{MemoryTokenStore, TokenSlot};

    fn auth_api(backend: &FakeBackend, token: Option<&str>) -> AuthApi {
        let store = match token {
            Some(t) => MemoryTokenStore::with_token(t),
            None => MemoryTokenStore::new(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        AuthApi::new(ApiClient::new(Arc::new(backend.clone()), TokenSlot::new(store), tx))
    }

    #[tokio::test]
    async fn test_login_posts_credentials() {
        let backend = FakeBackend::new();
        backend.set_login_token("issued");
        let api = auth_api(&backend, None);

        let resp = api
            .login(&LoginData { email: "ada@example.com".to_string(), password: "pw".to_string() })
            .await
            .expect("login");
        assert_eq!(resp.access_token, "issued");
        assert_eq!(resp.user, sample_user());

        let sent = backend.requests_to("/auth/login");
        let body = sent[0].body.as_ref().expect("body");
        assert_eq!(body["email"], "ada@example.com");
        assert!(sent[0].skip_refresh);
    }

    #[tokio::test]
    async fn test_logout_uses_explicit_token() {
        let backend = FakeBackend::new();
        let api = auth_api(&backend, None);

        api.logout(Some(AccessToken::new("old"))).await.expect("logout");
        assert_eq!(backend.requests_to("/auth/logout")[0].bearer.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_update_me_returns_updated_user() {
        let backend = FakeBackend::new();
        backend.accept_token("good");
        let api = auth_api(&backend, Some("good"));

        let user = api
            .update_me(&ProfileUpdate {
                first_name: "Grace".to_string(),
                last_name: "Hopper".to_string(),
                email: "grace@example.com".to_string(),
            })
            .await
            .expect("update");
        assert_eq!(user.id, 7);
        assert_eq!(user.full_name(), "Grace Hopper");
    }

    #[tokio::test]
    async fn test_change_password_does_not_refresh() {
        let backend = FakeBackend::new();
        backend.push_response("POST", "/auth/change-password", 401, r#"{"error":"wrong password"}"#);
        let api = auth_api(&backend, Some("good"));

        let err = api
            .change_password(&PasswordChange {
                current_password: "nope".to_string(),
                new_password: "better".to_string(),
            })
            .await
            .expect_err("401");
        assert!(err.is_unauthorized());
        assert_eq!(backend.refresh_calls(), 0);
    }
}
