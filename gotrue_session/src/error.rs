//! Errors surfaced by the session coordinator

use std::{error::Error as StdError, sync::Arc};

use thiserror::Error;

use crate::lock::LockError;

/// A cheaply cloneable, type-erased error
///
/// Refresh results are shared between every caller waiting on the same
/// in-flight refresh, so any error that can travel through that path must be
/// `Clone`.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// An error raised while managing the auth session
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    /// A session was required but none is available
    #[error("auth session missing")]
    SessionMissing,
    /// The session in storage is malformed or partial
    ///
    /// The loader removes such entries instead of surfacing them, so this is
    /// mostly seen from direct decoding helpers.
    #[error("stored session is invalid: {reason}")]
    InvalidSession {
        /// What made the session invalid
        reason: String,
    },
    /// A transient failure talking to the auth server (network error or 5xx)
    ///
    /// Safe to retry; never fatal to the stored session.
    #[error("retryable failure talking to the auth server: {message}")]
    RetryableTransport {
        /// HTTP status, if a response was received at all
        status: Option<u16>,
        /// Human-readable detail
        message: String,
    },
    /// The auth server rejected the request
    ///
    /// For refresh requests this means the refresh token itself is no longer
    /// usable (`invalid_grant` and friends) and the session is discarded.
    #[error("auth server rejected the request ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Machine-readable error code reported by the server
        code: Option<String>,
        /// Human-readable detail
        message: String,
    },
    /// The session lock could not be acquired
    #[error("unable to acquire the session lock")]
    Lock(#[from] LockError),
    /// A JWT could not be decoded or failed validation
    #[error("invalid JWT: {0}")]
    JwtInvalid(String),
    /// The auth server answered with a body that does not describe a session
    #[error("auth server returned an invalid token response")]
    InvalidTokenResponse,
    /// A PKCE exchange was attempted without a stored code verifier
    #[error("no PKCE code verifier found in storage")]
    PkceVerifierMissing,
    /// The storage adapter failed
    #[error("session storage failed")]
    Storage(#[source] SharedError),
    /// An auth state listener returned an error
    #[error("auth state listener failed")]
    Listener(#[source] SharedError),
    /// User data was read before it was loaded
    #[error("user data is not available; fetch it with `get_user`")]
    UserUnavailable,
}

impl AuthError {
    pub(crate) fn storage(err: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Self::Storage(Arc::from(err.into()))
    }

    pub(crate) fn listener(err: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Self::Listener(Arc::from(err.into()))
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableTransport { .. })
    }

    /// Whether this error proves the stored credentials are unusable
    ///
    /// A refresh failing with such an error removes the stored session and
    /// signs the user out.
    pub fn signs_out(&self) -> bool {
        matches!(
            self,
            Self::Api { .. } | Self::SessionMissing | Self::InvalidTokenResponse
        )
    }

    /// Whether this is a lock acquisition failure (busy or timed out)
    pub fn is_lock_acquire_failure(&self) -> bool {
        matches!(self, Self::Lock(err) if err.is_acquire_failure())
    }

    /// HTTP status reported by the auth server, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RetryableTransport { status, .. } => *status,
            _ => None,
        }
    }
}
