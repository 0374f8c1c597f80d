//! Auth state change notifications

use std::{
    error, fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AuthError, Session};

/// A change in authentication state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChangeEvent {
    /// Delivered once to every new subscriber with the session at that time
    InitialSession,
    /// A new session was established
    SignedIn,
    /// The session was removed
    SignedOut,
    /// The session was replaced by a refreshed one
    TokenRefreshed,
    /// The user attached to the session changed
    UserUpdated,
    /// A session was established through a password recovery link
    PasswordRecovery,
    /// A multi-factor challenge was verified, upgrading the session
    MfaChallengeVerified,
}

impl AuthChangeEvent {
    /// The wire name of the event
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
            Self::PasswordRecovery => "PASSWORD_RECOVERY",
            Self::MfaChallengeVerified => "MFA_CHALLENGE_VERIFIED",
        }
    }
}

impl fmt::Display for AuthChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error a listener may report
pub type ListenerError = Box<dyn error::Error + Send + Sync + 'static>;

/// Receives auth state changes
///
/// Listeners run concurrently with each other. They are invoked while the
/// client holds its session lock, so calling back into the client from a
/// listener is allowed and does not deadlock.
#[async_trait]
pub trait AuthStateListener: Send + Sync + 'static {
    /// Handles a state change
    async fn on_auth_state_change(
        &self,
        event: AuthChangeEvent,
        session: Option<&Session>,
    ) -> Result<(), ListenerError>;
}

#[async_trait]
impl<F> AuthStateListener for F
where
    F: Fn(AuthChangeEvent, Option<&Session>) + Send + Sync + 'static,
{
    async fn on_auth_state_change(
        &self,
        event: AuthChangeEvent,
        session: Option<&Session>,
    ) -> Result<(), ListenerError> {
        (self)(event, session);
        Ok(())
    }
}

type Listeners = Vec<(Uuid, Arc<dyn AuthStateListener>)>;

/// The set of listeners registered with one client
#[derive(Default)]
pub(crate) struct SubscriberBus {
    listeners: Mutex<Listeners>,
}

impl fmt::Debug for SubscriberBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberBus")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl SubscriberBus {
    pub(crate) fn subscribe(self: &Arc<Self>, listener: Arc<dyn AuthStateListener>) -> Subscription {
        let id = Uuid::new_v4();
        self.listeners.lock().push((id, listener));
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    pub(crate) fn get(&self, id: Uuid) -> Option<Arc<dyn AuthStateListener>> {
        self.listeners
            .lock()
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, listener)| listener.clone())
    }

    fn unsubscribe(&self, id: Uuid) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(candidate, _)| *candidate != id);
        listeners.len() != before
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Invokes every listener, returning the first failure once all have run
    ///
    /// A listener that panics counts as failed.
    pub(crate) async fn notify(
        &self,
        event: AuthChangeEvent,
        session: Option<&Session>,
    ) -> Result<(), AuthError> {
        let listeners = self.listeners.lock().clone();
        tracing::debug!(%event, listeners = listeners.len(), "notifying listeners");

        let results = futures::future::join_all(listeners.iter().map(|(id, listener)| async move {
            let result = AssertUnwindSafe(listener.on_auth_state_change(event, session))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err("auth state listener panicked".into()));
            (*id, result)
        }))
        .await;

        let mut first = None;
        for (id, result) in results {
            if let Err(error) = result {
                tracing::warn!(
                    listener = %id,
                    %event,
                    error = (&*error as &dyn error::Error),
                    "auth state listener failed"
                );
                first.get_or_insert(error);
            }
        }

        match first {
            Some(error) => Err(AuthError::listener(error)),
            None => Ok(()),
        }
    }
}

/// A registered listener
///
/// Dropping the subscription does not unsubscribe; call
/// [`unsubscribe`](Subscription::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    bus: Weak<SubscriberBus>,
}

impl Subscription {
    /// The listener's identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Removes the listener
    ///
    /// Returns `false` if it was already removed or the client is gone.
    pub fn unsubscribe(&self) -> bool {
        self.bus
            .upgrade()
            .map_or(false, |bus| bus.unsubscribe(self.id))
    }
}
