//! Exchanging refresh tokens, with retries and coalescing
//!
//! At most one refresh per client is in flight. Callers arriving while a
//! refresh is outstanding wait for the same result instead of spending the
//! refresh token a second time, which the auth server would treat as reuse.

use std::{error, fmt, sync::Arc};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::{
    backoff::RefreshBackoffHandler, client::Inner, AuthChangeEvent, AuthError, RefreshToken,
    RefreshTokenRef, Session,
};

type SharedRefresh = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

/// The outstanding refresh of a client, if any
#[derive(Default)]
pub(crate) struct RefreshSlot(Mutex<Option<SharedRefresh>>);

impl fmt::Debug for RefreshSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshSlot")
            .field("in_flight", &self.0.lock().is_some())
            .finish()
    }
}

impl RefreshSlot {
    /// Joins the outstanding refresh, or starts `start` as the new one
    fn join_or_start(
        &self,
        start: impl FnOnce() -> BoxFuture<'static, Result<Session, AuthError>>,
    ) -> SharedRefresh {
        let mut slot = self.0.lock();
        match &*slot {
            Some(in_flight) => {
                tracing::debug!("joining the refresh already in flight");
                in_flight.clone()
            }
            None => {
                let refresh = start().shared();
                *slot = Some(refresh.clone());
                refresh
            }
        }
    }

    /// Empties the slot if it still holds `finished`
    fn clear(&self, finished: &SharedRefresh) {
        let mut slot = self.0.lock();
        if slot.as_ref().map_or(false, |current| current.ptr_eq(finished)) {
            *slot = None;
        }
    }
}

impl Inner {
    /// Exchanges `refresh_token`, persisting and announcing the new session
    ///
    /// A refresh rejected by the auth server removes the stored session. A
    /// retryable failure leaves it in place.
    pub(crate) async fn call_refresh_token(
        self: &Arc<Self>,
        refresh_token: &RefreshTokenRef,
    ) -> Result<Session, AuthError> {
        if refresh_token.as_str().is_empty() {
            return Err(AuthError::SessionMissing);
        }

        let refresh = self.refreshing.join_or_start(|| {
            let this = self.clone();
            let refresh_token = refresh_token.to_owned();
            async move { this.refresh_and_persist(refresh_token).await }.boxed()
        });

        let result = refresh.clone().await;
        self.refreshing.clear(&refresh);
        result
    }

    async fn refresh_and_persist(
        self: Arc<Self>,
        refresh_token: RefreshToken,
    ) -> Result<Session, AuthError> {
        match self.refresh_access_token(&refresh_token).await {
            Ok(mut session) => {
                self.save_session(&mut session).await?;
                tracing::debug!(expires_at = ?session.expires_at(), "access token refreshed");
                self.notify_quietly(AuthChangeEvent::TokenRefreshed, Some(&session))
                    .await;
                Ok(session)
            }
            Err(err) => {
                if err.signs_out() {
                    tracing::info!(
                        error = (&err as &dyn error::Error),
                        "refresh token rejected, signing out"
                    );
                    if let Err(remove_err) = self.remove_session().await {
                        tracing::warn!(
                            error = (&remove_err as &dyn error::Error),
                            "unable to remove the rejected session"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Calls the auth server, retrying retryable failures with exponential
    /// backoff until the retry budget is spent
    async fn refresh_access_token(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<Session, AuthError> {
        let started = tokio::time::Instant::now();
        let mut backoff = RefreshBackoffHandler::new(self.refresh_backoff.clone());

        loop {
            tracing::trace!(attempt = backoff.attempt(), "requesting new access token");
            match self.api.refresh_token(refresh_token).await {
                Ok(session) => return Ok(session),
                Err(err) if err.is_retryable() => match backoff.error(started.elapsed()) {
                    Some(delay) => {
                        tracing::warn!(
                            error = (&err as &dyn error::Error),
                            retry_in = ?delay,
                            "refresh failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::warn!(
                            error = (&err as &dyn error::Error),
                            attempts = backoff.attempt() + 1,
                            "refresh failed, giving up for now"
                        );
                        return Err(err);
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }
}
