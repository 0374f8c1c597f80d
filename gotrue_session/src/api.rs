//! The auth server seam

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::{jwt::Jwks, AccessTokenRef, AuthCodeRef, AuthError, CodeVerifierRef, RefreshTokenRef, Session, User};

pub mod dto;
#[cfg(feature = "http")]
pub mod http;

/// Which sessions a sign-out revokes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignOutScope {
    /// Every session of the user
    #[default]
    Global,
    /// Only the current session
    Local,
    /// Every session except the current one
    Others,
}

impl SignOutScope {
    /// The value sent as the `scope` query parameter
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Local => "local",
            Self::Others => "others",
        }
    }
}

/// Credentials for a password sign-in
#[derive(Clone, Serialize)]
#[serde(untagged)]
pub enum PasswordCredentials {
    /// Sign in by email address
    Email {
        /// The email address
        email: String,
        /// The password
        password: String,
    },
    /// Sign in by phone number
    Phone {
        /// The phone number
        phone: String,
        /// The password
        password: String,
    },
}

impl fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email { email, .. } => f
                .debug_struct("Email")
                .field("email", email)
                .field("password", &"***PASSWORD***")
                .finish(),
            Self::Phone { phone, .. } => f
                .debug_struct("Phone")
                .field("phone", phone)
                .field("password", &"***PASSWORD***")
                .finish(),
        }
    }
}

/// Changes requested to the signed-in user
#[derive(Clone, Default, Serialize)]
pub struct UserAttributes {
    /// New email address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// New phone number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// New password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Reauthentication nonce, required by some password changes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Replacement user metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Debug for UserAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAttributes")
            .field("email", &self.email)
            .field("phone", &self.phone)
            .field("password", &self.password.as_ref().map(|_| "***PASSWORD***"))
            .field("nonce", &self.nonce)
            .field("data", &self.data)
            .finish()
    }
}

/// The calls the session coordinator makes to the auth server
///
/// Implementations classify failures: transport problems and server errors
/// (5xx) as [`AuthError::RetryableTransport`], rejections (4xx) as
/// [`AuthError::Api`], and a rejected JWT whose session no longer exists as
/// [`AuthError::SessionMissing`]. Returned sessions may omit `expires_at`.
#[async_trait]
pub trait AuthApi: Send + Sync + fmt::Debug {
    /// Exchanges a refresh token for a new session
    async fn refresh_token(&self, refresh_token: &RefreshTokenRef) -> Result<Session, AuthError>;

    /// Fetches the user owning `jwt`
    async fn get_user(&self, jwt: &AccessTokenRef) -> Result<User, AuthError>;

    /// Updates the user owning `jwt`
    async fn update_user(
        &self,
        jwt: &AccessTokenRef,
        attributes: &UserAttributes,
    ) -> Result<User, AuthError>;

    /// Revokes the sessions selected by `scope`
    async fn sign_out(&self, jwt: &AccessTokenRef, scope: SignOutScope) -> Result<(), AuthError>;

    /// Signs in with a password
    async fn sign_in_with_password(
        &self,
        credentials: &PasswordCredentials,
    ) -> Result<Session, AuthError>;

    /// Exchanges a PKCE authorization code for a session
    async fn exchange_code_for_session(
        &self,
        auth_code: &AuthCodeRef,
        code_verifier: &CodeVerifierRef,
    ) -> Result<Session, AuthError>;

    /// Fetches the server's signing keys
    async fn fetch_jwks(&self) -> Result<Jwks, AuthError>;
}

#[async_trait]
impl<A: AuthApi + ?Sized> AuthApi for std::sync::Arc<A> {
    async fn refresh_token(&self, refresh_token: &RefreshTokenRef) -> Result<Session, AuthError> {
        (**self).refresh_token(refresh_token).await
    }

    async fn get_user(&self, jwt: &AccessTokenRef) -> Result<User, AuthError> {
        (**self).get_user(jwt).await
    }

    async fn update_user(
        &self,
        jwt: &AccessTokenRef,
        attributes: &UserAttributes,
    ) -> Result<User, AuthError> {
        (**self).update_user(jwt, attributes).await
    }

    async fn sign_out(&self, jwt: &AccessTokenRef, scope: SignOutScope) -> Result<(), AuthError> {
        (**self).sign_out(jwt, scope).await
    }

    async fn sign_in_with_password(
        &self,
        credentials: &PasswordCredentials,
    ) -> Result<Session, AuthError> {
        (**self).sign_in_with_password(credentials).await
    }

    async fn exchange_code_for_session(
        &self,
        auth_code: &AuthCodeRef,
        code_verifier: &CodeVerifierRef,
    ) -> Result<Session, AuthError> {
        (**self)
            .exchange_code_for_session(auth_code, code_verifier)
            .await
    }

    async fn fetch_jwks(&self) -> Result<Jwks, AuthError> {
        (**self).fetch_jwks().await
    }
}
