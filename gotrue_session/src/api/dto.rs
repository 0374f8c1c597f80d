//! Wire formats of the auth server

use gotrue_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AuthError, ProviderToken, RefreshToken, Session, User};

/// A session as returned by the token endpoint
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// The new access token
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    /// The new refresh token
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    /// Lifetime of the access token
    #[serde(default)]
    pub expires_in: Option<DurationSecs>,
    /// Absolute expiry of the access token
    #[serde(default)]
    pub expires_at: Option<UnixTime>,
    /// Token type, normally `bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Upstream provider access token
    #[serde(default)]
    pub provider_token: Option<ProviderToken>,
    /// Upstream provider refresh token
    #[serde(default)]
    pub provider_refresh_token: Option<ProviderToken>,
    /// The signed-in user
    #[serde(default)]
    pub user: Option<User>,
}

impl TokenResponse {
    /// Converts the response into a session
    ///
    /// A response without both tokens and a lifetime does not describe a
    /// session.
    pub fn into_session(self) -> Result<Session, AuthError> {
        let (Some(access_token), Some(refresh_token), Some(expires_in)) =
            (self.access_token, self.refresh_token, self.expires_in)
        else {
            return Err(AuthError::InvalidTokenResponse);
        };

        let mut session = Session::new(access_token, refresh_token, expires_in)
            .with_provider_tokens(self.provider_token, self.provider_refresh_token);
        if let Some(expires_at) = self.expires_at {
            session = session.with_expires_at(expires_at);
        }
        if let Some(user) = self.user {
            session = session.with_user(user);
        }
        Ok(session)
    }
}

/// Body of the refresh token grant
#[derive(Debug, Serialize)]
pub struct RefreshTokenGrant<'a> {
    /// The refresh token being exchanged
    pub refresh_token: &'a crate::RefreshTokenRef,
}

/// Body of the PKCE grant
#[derive(Debug, Serialize)]
pub struct PkceGrant<'a> {
    /// The code returned to the redirect URL
    pub auth_code: &'a crate::AuthCodeRef,
    /// The verifier generated when the flow started
    pub code_verifier: &'a crate::CodeVerifierRef,
}

/// An error body as sent by the auth server
///
/// Different server versions fill different fields.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (current servers)
    #[serde(default)]
    pub error_code: Option<String>,
    /// Machine-readable code (older servers)
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    /// OAuth style error code
    #[serde(default)]
    pub error: Option<String>,
    /// OAuth style description
    #[serde(default)]
    pub error_description: Option<String>,
    /// Message (older servers)
    #[serde(default)]
    pub msg: Option<String>,
    /// Message (current servers)
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    fn error_code(&self) -> Option<String> {
        self.error_code
            .clone()
            .or_else(|| match &self.code {
                Some(serde_json::Value::String(code)) => Some(code.clone()),
                _ => None,
            })
            .or_else(|| self.error.clone())
    }

    fn message(&self) -> Option<String> {
        self.msg
            .clone()
            .or_else(|| self.message.clone())
            .or_else(|| self.error_description.clone())
            .or_else(|| self.error.clone())
    }
}

/// Classifies a non-success response from the auth server
pub fn classify_error_response(status: u16, body: &str) -> AuthError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.message().unwrap_or_else(|| {
        if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            body.to_owned()
        }
    });

    if status >= 500 {
        return AuthError::RetryableTransport {
            status: Some(status),
            message,
        };
    }

    let code = parsed.error_code();
    if code.as_deref() == Some("session_not_found") {
        return AuthError::SessionMissing;
    }

    AuthError::Api {
        status,
        code,
        message,
    }
}
