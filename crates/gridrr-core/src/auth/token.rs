use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;

/// Opaque bearer credential issued by `/auth/login`, `/auth/signup`
/// and `/auth/refresh`.
///
/// The token is JWT-shaped; its payload carries an `exp` claim that
/// can be read locally to schedule a proactive refresh. The signature
/// is never checked here, the backend does that.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

impl AccessToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Decode the `exp` claim. `None` if the token is not a JWT or has no expiry.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let payload = self.0.split('.').nth(1)?;
        // Some issuers pad their segments even though JWT forbids it
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;
        Utc.timestamp_opt(claim.exp?, 0).single()
    }

    /// When to refresh: `margin` before expiry.
    pub fn refresh_at(&self, margin: Duration) -> Option<DateTime<Utc>> {
        self.expires_at().map(|exp| exp - margin)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at().map(|exp| Utc::now() >= exp).unwrap_or(false)
    }
}

// Never print the credential itself
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessToken")
            .field(&format_args!("<{} bytes>", self.0.len()))
            .finish()
    }
}

impl From<String> for AccessToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
pub(crate) fn jwt_with_exp(exp: i64) -> AccessToken {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"7","exp":{}}}"#, exp));
    AccessToken::new(format!("{}.{}.signature", header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_at_decodes_exp_claim() {
        let token = jwt_with_exp(1_900_000_000);
        assert_eq!(token.expires_at().map(|t| t.timestamp()), Some(1_900_000_000));
    }

    #[test]
    fn test_refresh_at_subtracts_margin() {
        let token = jwt_with_exp(1_900_000_000);
        let at = token.refresh_at(Duration::minutes(2)).expect("refresh time");
        assert_eq!(at.timestamp(), 1_900_000_000 - 120);
    }

    #[test]
    fn test_opaque_tokens_have_no_expiry() {
        assert_eq!(AccessToken::new("not-a-jwt").expires_at(), None);
        assert_eq!(AccessToken::new("a.%%%.c").expires_at(), None);
        assert!(!AccessToken::new("not-a-jwt").is_expired());
    }

    #[test]
    fn test_payload_without_exp() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"7"}"#);
        let token = AccessToken::new(format!("h.{}.s", payload));
        assert_eq!(token.expires_at(), None);
    }

    #[test]
    fn test_is_expired() {
        let past = jwt_with_exp(Utc::now().timestamp() - 10);
        let future = jwt_with_exp(Utc::now().timestamp() + 600);
        assert!(past.is_expired());
        assert!(!future.is_expired());
    }

    #[test]
    fn test_debug_hides_token() {
        let token = AccessToken::new("secret-value");
        assert!(!format!("{:?}", token).contains("secret"));
    }
}
