//! Session lifecycle management for GoTrue-style auth clients
//!
//! An [`AuthClient`] keeps a user's auth session persisted, fresh, and
//! consistent across everything that shares its storage:
//!
//! * The session lives in pluggable [`AsyncStorage`](storage::AsyncStorage)
//!   under a storage key, and is never cached in memory. Every
//!   read-modify-write happens inside a named exclusive
//!   [lock](lock::LockManager), so several clients (in one process, or in
//!   several processes sharing a directory) never spend the same refresh
//!   token twice.
//! * Reading the session refreshes it first when it is within 90 seconds of
//!   expiring. Concurrent refreshes are coalesced into one request.
//! * A background scheduler wakes every 30 seconds and refreshes the session
//!   once it is within three ticks of expiring. In an interactive
//!   [`Environment`](config::Environment) the scheduler only runs while the
//!   application is visible.
//! * Retryable failures (network errors, 5xx) are retried with exponential
//!   backoff and never discard the session. A refresh token rejected by the
//!   server signs the user out.
//! * Listeners registered with
//!   [`on_auth_state_change`](AuthClient::on_auth_state_change) hear about
//!   every change, and clients sharing a storage key relay changes to each
//!   other.
//!
//! ```
//! use gotrue_session::{api::http::HttpAuthApi, config::ClientConfig, storage::FileStorage, AuthClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let api = HttpAuthApi::new(
//!     reqwest::Client::new(),
//!     reqwest::Url::parse("https://project.supabase.co/auth/v1")?,
//!     "public-anon-key",
//! );
//!
//! let client = AuthClient::new(
//!     api,
//!     ClientConfig::default().with_storage(FileStorage::new(".auth")),
//! );
//!
//! let _subscription = client.on_auth_state_change(|event, session| {
//!     tracing::info!(%event, signed_in = session.is_some(), "auth state changed");
//! });
//!
//! if let Some(session) = client.get_session().await? {
//!     tracing::info!(expires_at = ?session.expires_at(), "using stored session");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `http`: Provides [`HttpAuthApi`](api::http::HttpAuthApi), an implementation of the auth
//!   server seam on top of [reqwest].
//! * `file`: Provides storage and a cross-process lock using the local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod api;
pub mod backoff;
mod braids;
pub mod broadcast;
mod client;
pub mod config;
mod error;
mod events;
pub mod jwt;
pub mod lock;
pub mod pkce;
mod refresh;
pub mod registry;
mod scheduler;
mod session;
pub mod storage;
#[cfg(test)]
mod test_util;

pub use braids::*;
pub use client::{AuthClient, GetClaimsOptions};
pub use error::{AuthError, SharedError};
pub use events::{AuthChangeEvent, AuthStateListener, ListenerError, Subscription};
pub use session::{
    Session, SessionStatus, UntrustedUser, User, UserState, AUTO_REFRESH_TICK_DURATION,
    AUTO_REFRESH_TICK_THRESHOLD, EXPIRY_MARGIN,
};
