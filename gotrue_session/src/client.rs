//! The session coordinator

use std::{
    error, fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::stream::{BoxStream, StreamExt};
use gotrue_clock::Clock;
use parking_lot::Mutex;
use tokio::sync::{watch, OnceCell};
use uuid::Uuid;

use crate::{
    api::{AuthApi, PasswordCredentials, SignOutScope, UserAttributes},
    backoff::RefreshBackoffConfig,
    broadcast::{BroadcastChannel, BroadcastMessage, LastApplied},
    config::{ClientConfig, Environment, Visibility},
    events::{AuthChangeEvent, AuthStateListener, SubscriberBus, Subscription},
    jwt::{self, ClaimsResponse, Jwk, Jwks, JwtVerifier},
    lock::{AcquireTimeout, SessionLock},
    pkce::{self, PkceChallenge, PkceFlow, PkceState},
    refresh::RefreshSlot,
    registry::SharedRegistry,
    scheduler::BackgroundTasks,
    session::StoredUser,
    storage::AsyncStorage,
    AccessToken, AccessTokenRef, AuthCodeRef, AuthError, RefreshToken, RefreshTokenRef, Session,
    User, UserState,
};


const CODE_VERIFIER_SUFFIX: &str = "-code-verifier";
const USER_SUFFIX: &str = "-user";

/// Options for [`AuthClient::get_claims`]
#[derive(Clone, Debug, Default)]
pub struct GetClaimsOptions {
    /// Accept tokens whose `exp` has passed
    pub allow_expired: bool,
    /// Keys to try before the cached or fetched key set
    pub jwks: Option<Jwks>,
}

/// Keeps an auth session persisted, fresh, and consistent
///
/// Every read-modify-write of the stored session runs inside the client's
/// session lock. Clones share the same state.
///
/// The client initializes lazily: the first operation (or an explicit call to
/// [`initialize`](Self::initialize)) recovers the stored session, refreshing
/// it if needed, and starts the background refresh scheduler.
#[derive(Clone, Debug)]
pub struct AuthClient {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) instance_id: u64,
    pub(crate) storage_key: String,
    pub(crate) api: Arc<dyn AuthApi>,
    pub(crate) storage: Arc<dyn AsyncStorage>,
    pub(crate) user_storage: Option<Arc<dyn AsyncStorage>>,
    pub(crate) lock: SessionLock,
    pub(crate) broadcast: Arc<dyn BroadcastChannel>,
    pub(crate) registry: SharedRegistry,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) auto_refresh_token: bool,
    pub(crate) refresh_backoff: RefreshBackoffConfig,
    pub(crate) tick_deadline: Option<Duration>,
    pub(crate) visibility: Option<watch::Receiver<Visibility>>,
    pub(crate) jwt_verifier: Option<Arc<dyn JwtVerifier>>,
    pub(crate) subscribers: Arc<SubscriberBus>,
    pub(crate) last_applied: LastApplied,
    pub(crate) refreshing: RefreshSlot,
    pub(crate) user_warning_suppressed: Arc<AtomicBool>,
    pub(crate) initialized: OnceCell<Result<(), AuthError>>,
    pub(crate) pending_broadcasts: Mutex<Option<BoxStream<'static, BroadcastMessage>>>,
    pub(crate) tasks: BackgroundTasks,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthClient")
            .field("instance_id", &self.instance_id)
            .field("storage_key", &self.storage_key)
            .field("api", &self.api)
            .field("lock", &self.lock)
            .field("broadcast", &self.broadcast)
            .field("auto_refresh_token", &self.auto_refresh_token)
            .field("subscribers", &self.subscribers)
            .field("initialized", &self.initialized.initialized())
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl AuthClient {
    /// Constructs a client talking to `api`
    ///
    /// Nothing is read from storage until the client is first used.
    pub fn new(api: impl AuthApi + 'static, config: ClientConfig) -> Self {
        let config = config.resolve();
        let instance_id = config.registry.next_instance_id();
        let visibility = match config.environment {
            Environment::Interactive { visibility } => Some(visibility),
            Environment::Headless => None,
        };

        tracing::debug!(
            instance = instance_id,
            storage_key = %config.storage_key,
            interactive = visibility.is_some(),
            "auth client created"
        );

        let inner = Inner {
            instance_id,
            lock: SessionLock::new(format!("lock:{}", config.storage_key), config.lock),
            pending_broadcasts: Mutex::new(config.broadcast.subscribe()),
            storage_key: config.storage_key,
            api: Arc::new(api),
            storage: config.storage,
            user_storage: config.user_storage,
            broadcast: config.broadcast,
            registry: config.registry,
            clock: config.clock,
            auto_refresh_token: config.auto_refresh_token,
            refresh_backoff: config.refresh_backoff,
            tick_deadline: config.tick_deadline,
            visibility,
            jwt_verifier: config.jwt_verifier,
            subscribers: Arc::default(),
            last_applied: LastApplied::default(),
            refreshing: RefreshSlot::default(),
            user_warning_suppressed: Arc::new(AtomicBool::new(false)),
            initialized: OnceCell::new(),
            tasks: BackgroundTasks::default(),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Recovers the stored session and starts the refresh scheduler
    ///
    /// Runs once per client; later calls return the first outcome.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        self.inner.ensure_initialized().await
    }

    /// Returns the current session, refreshing it first if it is about to
    /// expire
    #[tracing::instrument(err, skip(self), fields(storage_key = %self.inner.storage_key))]
    pub async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let inner = &self.inner;
        inner.ensure_initialized().await?;
        inner
            .locked(AcquireTimeout::Forever, || inner.load_session())
            .await
    }

    /// Fetches the user from the auth server
    ///
    /// Uses `jwt` when given, otherwise the current session's access token.
    /// If the server reports that the session no longer exists, the local
    /// session is removed.
    #[tracing::instrument(err, skip_all, fields(storage_key = %self.inner.storage_key))]
    pub async fn get_user(&self, jwt: Option<&AccessTokenRef>) -> Result<User, AuthError> {
        let inner = &self.inner;
        if let Some(jwt) = jwt {
            return inner.fetch_user(jwt).await;
        }

        inner.ensure_initialized().await?;
        inner
            .locked(AcquireTimeout::Forever, || async {
                let session = inner
                    .load_session()
                    .await?
                    .ok_or(AuthError::SessionMissing)?;
                inner.fetch_user(session.access_token()).await
            })
            .await
    }

    /// Updates the signed-in user
    #[tracing::instrument(err, skip(self), fields(storage_key = %self.inner.storage_key))]
    pub async fn update_user(&self, attributes: &UserAttributes) -> Result<User, AuthError> {
        let inner = &self.inner;
        inner.ensure_initialized().await?;
        inner
            .locked(AcquireTimeout::Forever, || async {
                let mut session = inner
                    .load_session()
                    .await?
                    .ok_or(AuthError::SessionMissing)?;
                let user = inner
                    .api
                    .update_user(session.access_token(), attributes)
                    .await?;

                session.set_user(UserState::Loaded(user.clone()));
                inner.save_session(&mut session).await?;
                inner
                    .notify_all_subscribers(AuthChangeEvent::UserUpdated, Some(&session), true)
                    .await?;
                Ok(user)
            })
            .await
    }

    /// Replaces the session with one built from an existing token pair
    ///
    /// If the access token has already expired, the refresh token is
    /// exchanged right away.
    #[tracing::instrument(err, skip_all, fields(storage_key = %self.inner.storage_key))]
    pub async fn set_session(
        &self,
        access_token: AccessToken,
        refresh_token: RefreshToken,
    ) -> Result<Session, AuthError> {
        let inner = &self.inner;
        inner.ensure_initialized().await?;
        inner
            .locked(AcquireTimeout::Forever, || async {
                if access_token.as_str().is_empty() || refresh_token.as_str().is_empty() {
                    return Err(AuthError::SessionMissing);
                }

                let now = inner.clock.now();
                let decoded = jwt::decode_jwt(access_token.as_str())?;
                let expires_at = match decoded.claims.exp {
                    Some(exp) if exp > now => exp,
                    _ => {
                        tracing::debug!("access token already expired, refreshing");
                        return inner.call_refresh_token(&refresh_token).await;
                    }
                };

                let user = inner.fetch_user(&access_token).await?;
                let mut session = Session::new(access_token, refresh_token, expires_at - now)
                    .with_expires_at(expires_at)
                    .with_user(user);

                inner.save_session(&mut session).await?;
                inner
                    .notify_all_subscribers(AuthChangeEvent::SignedIn, Some(&session), true)
                    .await?;
                Ok(session)
            })
            .await
    }

    /// Exchanges a refresh token for a new session regardless of expiry
    ///
    /// Uses the stored session's refresh token when none is given.
    #[tracing::instrument(err, skip_all, fields(storage_key = %self.inner.storage_key))]
    pub async fn refresh_session(
        &self,
        refresh_token: Option<&RefreshTokenRef>,
    ) -> Result<Session, AuthError> {
        let inner = &self.inner;
        inner.ensure_initialized().await?;
        inner
            .locked(AcquireTimeout::Forever, || async {
                match refresh_token {
                    Some(refresh_token) => inner.call_refresh_token(refresh_token).await,
                    None => {
                        let session = inner
                            .read_stored_session()
                            .await?
                            .ok_or(AuthError::SessionMissing)?;
                        inner.call_refresh_token(session.refresh_token()).await
                    }
                }
            })
            .await
    }

    /// Signs out
    ///
    /// The server is asked to revoke the sessions selected by `scope`; a
    /// server that no longer knows the session is not an error. Unless
    /// `scope` is [`SignOutScope::Others`], the local session is removed.
    #[tracing::instrument(err, skip(self), fields(storage_key = %self.inner.storage_key))]
    pub async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthError> {
        let inner = &self.inner;
        inner.ensure_initialized().await?;
        inner
            .locked(AcquireTimeout::Forever, || async {
                if let Some(session) = inner.load_session().await? {
                    match inner.api.sign_out(session.access_token(), scope).await {
                        Ok(()) => {}
                        Err(AuthError::SessionMissing) => {}
                        Err(AuthError::Api { status, .. }) if matches!(status, 401 | 403 | 404) => {
                            tracing::debug!(status, "session already gone on the server");
                        }
                        Err(err) => return Err(err),
                    }
                }

                if scope != SignOutScope::Others {
                    inner.remove_session().await?;
                }
                Ok(())
            })
            .await
    }

    /// Registers a callback for auth state changes
    ///
    /// The callback first receives exactly one
    /// [`InitialSession`](AuthChangeEvent::InitialSession) event once the
    /// client is initialized, then every later change.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    pub fn on_auth_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(AuthChangeEvent, Option<&Session>) + Send + Sync + 'static,
    {
        self.subscribe(callback)
    }

    /// Registers a listener for auth state changes
    ///
    /// Like [`on_auth_state_change`](Self::on_auth_state_change), for
    /// listeners that need to await or report failures.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    pub fn subscribe(&self, listener: impl AuthStateListener) -> Subscription {
        let subscription = self.inner.subscribers.subscribe(Arc::new(listener));
        let id = subscription.id();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.ensure_initialized().await {
                tracing::debug!(
                    error = (&err as &dyn error::Error),
                    "initialization failed before the initial session was delivered"
                );
            }
            let delivered = inner
                .lock
                .run(AcquireTimeout::Forever, || inner.emit_initial_session(id))
                .await;
            if let Err(err) = delivered {
                tracing::warn!(
                    error = (&err as &dyn error::Error),
                    "unable to deliver the initial session"
                );
            }
        });

        subscription
    }

    /// Stores a fresh PKCE code verifier and returns its challenge
    pub async fn prepare_pkce(&self, flow: PkceFlow) -> Result<PkceChallenge, AuthError> {
        let verifier = pkce::generate_code_verifier();
        self.inner
            .storage
            .set_item(
                &self.inner.key(CODE_VERIFIER_SUFFIX),
                &pkce::encode_stored(&verifier, flow),
            )
            .await
            .map_err(AuthError::storage)?;

        tracing::debug!(?flow, "pkce code verifier stored");
        Ok(pkce::code_challenge(&verifier))
    }

    /// Reports whether a PKCE flow is waiting for its authorization code
    pub async fn pkce_state(&self) -> Result<PkceState, AuthError> {
        let stored = self
            .inner
            .storage
            .get_item(&self.inner.key(CODE_VERIFIER_SUFFIX))
            .await
            .map_err(AuthError::storage)?;

        Ok(match stored.as_deref().and_then(pkce::decode_stored) {
            Some((_, flow)) => PkceState::CodeIssued { flow },
            None => PkceState::NoFlow,
        })
    }

    /// Completes a PKCE flow
    ///
    /// The stored code verifier is consumed whether or not the exchange
    /// succeeds.
    #[tracing::instrument(err, skip_all, fields(storage_key = %self.inner.storage_key))]
    pub async fn exchange_code_for_session(
        &self,
        auth_code: &AuthCodeRef,
    ) -> Result<Session, AuthError> {
        let inner = &self.inner;
        inner.ensure_initialized().await?;
        inner
            .locked(AcquireTimeout::Forever, || async {
                let key = inner.key(CODE_VERIFIER_SUFFIX);
                let stored = inner
                    .storage
                    .get_item(&key)
                    .await
                    .map_err(AuthError::storage)?;
                let Some((verifier, flow)) = stored.as_deref().and_then(pkce::decode_stored) else {
                    inner.discard_item(&*inner.storage, &key).await;
                    return Err(AuthError::PkceVerifierMissing);
                };

                let exchanged = inner
                    .api
                    .exchange_code_for_session(auth_code, &verifier)
                    .await;
                inner.discard_item(&*inner.storage, &key).await;
                let mut session = exchanged?;

                inner.save_session(&mut session).await?;
                let event = match flow {
                    PkceFlow::PasswordRecovery => AuthChangeEvent::PasswordRecovery,
                    PkceFlow::SignIn => AuthChangeEvent::SignedIn,
                };
                inner
                    .notify_all_subscribers(event, Some(&session), true)
                    .await?;
                Ok(session)
            })
            .await
    }

    /// Signs in with a password
    #[tracing::instrument(err, skip(self), fields(storage_key = %self.inner.storage_key))]
    pub async fn sign_in_with_password(
        &self,
        credentials: &PasswordCredentials,
    ) -> Result<Session, AuthError> {
        let inner = &self.inner;
        inner.ensure_initialized().await?;
        inner
            .locked(AcquireTimeout::Forever, || async {
                let mut session = inner.api.sign_in_with_password(credentials).await?;
                if session.user_state().is_unavailable() {
                    return Err(AuthError::InvalidTokenResponse);
                }

                inner.save_session(&mut session).await?;
                inner
                    .notify_all_subscribers(AuthChangeEvent::SignedIn, Some(&session), true)
                    .await?;
                Ok(session)
            })
            .await
    }

    /// Decodes and validates the claims of `jwt`, or of the current
    /// session's access token
    ///
    /// Asymmetrically signed tokens are verified locally when a
    /// [`JwtVerifier`] is configured and the signing key is known. Every other
    /// token is validated by asking the auth server for its user. Returns
    /// `None` when no token is given and there is no session.
    #[tracing::instrument(err, skip_all, fields(storage_key = %self.inner.storage_key))]
    pub async fn get_claims(
        &self,
        jwt: Option<&str>,
        options: GetClaimsOptions,
    ) -> Result<Option<ClaimsResponse>, AuthError> {
        let token = match jwt {
            Some(jwt) => AccessToken::new(jwt.to_owned()),
            None => match self.get_session().await? {
                Some(session) => session.access_token().to_owned(),
                None => return Ok(None),
            },
        };

        let decoded = jwt::decode_jwt(token.as_str())?;
        if !options.allow_expired {
            jwt::validate_exp(&decoded.claims, self.inner.clock.now())?;
        }

        let signing_key = match (&self.inner.jwt_verifier, &decoded.header.kid) {
            (Some(_), Some(kid)) if !decoded.header.is_symmetric() => {
                self.inner.fetch_jwk(kid, options.jwks.as_ref()).await?
            }
            _ => None,
        };

        match (signing_key, &self.inner.jwt_verifier) {
            (Some(key), Some(verifier)) => verifier.verify(&decoded, &key)?,
            _ => {
                tracing::debug!("validating the token with the auth server");
                self.get_user(Some(&*token)).await?;
            }
        }

        Ok(Some(decoded.into()))
    }
}

impl Inner {
    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.storage_key, suffix)
    }

    pub(crate) async fn ensure_initialized(self: &Arc<Self>) -> Result<(), AuthError> {
        // Nested calls from listeners run while initialization holds the lock.
        if self.lock.is_held_by_current_task() {
            return Ok(());
        }

        self.initialized
            .get_or_init(|| self.run_initialize())
            .await
            .clone()
    }

    async fn run_initialize(self: &Arc<Self>) -> Result<(), AuthError> {
        tracing::debug!(instance = self.instance_id, "initializing");
        self.spawn_broadcast_listener();

        let recovered = self
            .locked(AcquireTimeout::Forever, || self.recover_and_refresh())
            .await;
        if let Err(err) = &recovered {
            tracing::warn!(
                error = (err as &dyn error::Error),
                "unable to recover the stored session"
            );
        }

        self.handle_visibility();
        recovered
    }

    pub(crate) async fn locked<F, Fut, T>(
        &self,
        timeout: AcquireTimeout,
        f: F,
    ) -> Result<T, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
    {
        self.lock.run(timeout, f).await?
    }

    /// Reads and validates the stored session without refreshing it
    ///
    /// Unreadable or invalid entries are removed.
    pub(crate) async fn read_stored_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(raw) = self
            .storage
            .get_item(&self.storage_key)
            .await
            .map_err(AuthError::storage)?
        else {
            return Ok(None);
        };

        let parsed = serde_json::from_str::<Session>(&raw)
            .map_err(|err| AuthError::InvalidSession {
                reason: err.to_string(),
            })
            .and_then(|session| session.validate().map(|()| session));

        match parsed {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                tracing::debug!(
                    error = (&err as &dyn error::Error),
                    "removing unusable stored session"
                );
                self.remove_session().await?;
                Ok(None)
            }
        }
    }

    /// Loads the session, refreshing it when it is within the expiry margin
    ///
    /// Must be called inside the session lock.
    pub(crate) async fn load_session(self: &Arc<Self>) -> Result<Option<Session>, AuthError> {
        let Some(mut session) = self.read_stored_session().await? else {
            return Ok(None);
        };

        if session.needs_refresh_at(self.clock.now_ms()) {
            tracing::debug!("stored session is expiring, refreshing");
            return self
                .call_refresh_token(session.refresh_token())
                .await
                .map(Some);
        }

        if let Some(user_storage) = &self.user_storage {
            let user = self.read_user(&**user_storage).await?;
            session.set_user(user.map_or(UserState::Unavailable, UserState::Loaded));
        }

        if self.storage.is_server() {
            if let UserState::Loaded(user) = session.take_user() {
                session.set_user(UserState::untrusted(
                    user,
                    self.user_warning_suppressed.clone(),
                ));
            }
        }

        Ok(Some(session))
    }

    /// Reconciles storage with the stored session at startup
    ///
    /// Failures talking to the auth server are logged, not returned.
    pub(crate) async fn recover_and_refresh(self: &Arc<Self>) -> Result<(), AuthError> {
        let Some(raw) = self
            .storage
            .get_item(&self.storage_key)
            .await
            .map_err(AuthError::storage)?
        else {
            tracing::debug!("no stored session to recover");
            return Ok(());
        };

        let mut session = match serde_json::from_str::<Session>(&raw) {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(error = %err, "stored session is unreadable");
                return self.remove_session().await;
            }
        };

        if let Some(user_storage) = &self.user_storage {
            let mut user = self.read_user(&**user_storage).await?;
            if user.is_none() && !self.storage.is_server() && self.shares_storage(user_storage) {
                if let Some(colocated) = session.user_state().peek().cloned() {
                    tracing::debug!("moving the user into user storage");
                    self.write_user(&**user_storage, &colocated).await?;
                    user = Some(colocated);
                }
            }
            session.set_user(user.map_or(UserState::Unavailable, UserState::Loaded));
        } else if session.user_state().is_unavailable() {
            if let Some(user) = self.read_user(&*self.storage).await? {
                tracing::debug!("moving the user back into the session");
                session.set_user(UserState::Loaded(user));
                self.storage
                    .remove_item(&self.key(USER_SUFFIX))
                    .await
                    .map_err(AuthError::storage)?;
                let raw = serde_json::to_string(&session).map_err(AuthError::storage)?;
                self.storage
                    .set_item(&self.storage_key, &raw)
                    .await
                    .map_err(AuthError::storage)?;
            }
        }

        if let Err(err) = session.validate() {
            tracing::debug!(
                error = (&err as &dyn error::Error),
                "stored session is invalid"
            );
            return self.remove_session().await;
        }

        if session.needs_refresh_at(self.clock.now_ms()) {
            if self.auto_refresh_token {
                if let Err(err) = self.call_refresh_token(session.refresh_token()).await {
                    tracing::warn!(
                        error = (&err as &dyn error::Error),
                        "unable to refresh the recovered session"
                    );
                }
            }
            return Ok(());
        }

        if session.user_state().is_unavailable() {
            match self.api.get_user(session.access_token()).await {
                Ok(user) => {
                    session.set_user(UserState::Loaded(user));
                    self.save_session(&mut session).await?;
                    self.notify_quietly(AuthChangeEvent::SignedIn, Some(&session))
                        .await;
                }
                Err(err) => {
                    tracing::debug!(
                        error = (&err as &dyn error::Error),
                        "unable to load the user, skipping SIGNED_IN"
                    );
                }
            }
        } else {
            self.notify_quietly(AuthChangeEvent::SignedIn, Some(&session))
                .await;
        }

        Ok(())
    }

    fn shares_storage(&self, user_storage: &Arc<dyn AsyncStorage>) -> bool {
        Arc::as_ptr(&self.storage).cast::<()>() == Arc::as_ptr(user_storage).cast::<()>()
    }

    async fn read_user(&self, storage: &dyn AsyncStorage) -> Result<Option<User>, AuthError> {
        let Some(raw) = storage
            .get_item(&self.key(USER_SUFFIX))
            .await
            .map_err(AuthError::storage)?
        else {
            return Ok(None);
        };

        match serde_json::from_str::<StoredUser>(&raw) {
            Ok(stored) => Ok(stored.user),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring unreadable stored user");
                Ok(None)
            }
        }
    }

    async fn write_user(&self, storage: &dyn AsyncStorage, user: &User) -> Result<(), AuthError> {
        let raw = serde_json::to_string(&StoredUser {
            user: Some(user.clone()),
        })
        .map_err(AuthError::storage)?;
        storage
            .set_item(&self.key(USER_SUFFIX), &raw)
            .await
            .map_err(AuthError::storage)
    }

    /// Persists `session`, filling in its absolute expiry
    pub(crate) async fn save_session(&self, session: &mut Session) -> Result<(), AuthError> {
        session.ensure_expires_at(&*self.clock);
        self.user_warning_suppressed.store(true, Ordering::Relaxed);

        let raw = match &self.user_storage {
            Some(user_storage) => {
                if let Some(user) = session.user_state().peek() {
                    self.write_user(&**user_storage, user).await?;
                }
                let mut without_user = session.clone();
                without_user.take_user();
                serde_json::to_string(&without_user)
            }
            None => serde_json::to_string(&*session),
        }
        .map_err(AuthError::storage)?;

        self.storage
            .set_item(&self.storage_key, &raw)
            .await
            .map_err(AuthError::storage)?;
        tracing::trace!("session saved");
        Ok(())
    }

    /// Deletes every stored entry of the session and announces the sign-out
    pub(crate) async fn remove_session(&self) -> Result<(), AuthError> {
        for suffix in ["", CODE_VERIFIER_SUFFIX, USER_SUFFIX] {
            self.storage
                .remove_item(&self.key(suffix))
                .await
                .map_err(AuthError::storage)?;
        }
        if let Some(user_storage) = &self.user_storage {
            user_storage
                .remove_item(&self.key(USER_SUFFIX))
                .await
                .map_err(AuthError::storage)?;
        }

        tracing::debug!("session removed");
        self.notify_all_subscribers(AuthChangeEvent::SignedOut, None, true)
            .await
    }

    async fn discard_item(&self, storage: &dyn AsyncStorage, key: &str) {
        if let Err(err) = storage.remove_item(key).await {
            tracing::warn!(key, error = (&*err as &dyn error::Error), "unable to remove entry");
        }
    }

    /// Fetches the user owning `jwt`, dropping the local session if the server
    /// no longer knows it
    async fn fetch_user(&self, jwt: &AccessTokenRef) -> Result<User, AuthError> {
        match self.api.get_user(jwt).await {
            Err(AuthError::SessionMissing) => {
                tracing::debug!("server no longer knows the session, removing it");
                self.locked(AcquireTimeout::Forever, || self.remove_session())
                    .await?;
                Err(AuthError::SessionMissing)
            }
            result => result,
        }
    }

    pub(crate) async fn notify_all_subscribers(
        &self,
        event: AuthChangeEvent,
        session: Option<&Session>,
        broadcast: bool,
    ) -> Result<(), AuthError> {
        self.last_applied.record(event, session);
        if broadcast {
            self.broadcast.publish(BroadcastMessage {
                origin: self.instance_id,
                event,
                session: session.cloned(),
            });
        }
        self.subscribers.notify(event, session).await
    }

    /// Notifies subscribers from a background path, where listener failures
    /// have nobody to be returned to
    pub(crate) async fn notify_quietly(&self, event: AuthChangeEvent, session: Option<&Session>) {
        // The bus already logged each failure.
        let _ = self.notify_all_subscribers(event, session, true).await;
    }

    async fn emit_initial_session(self: &Arc<Self>, id: Uuid) {
        let Some(listener) = self.subscribers.get(id) else {
            return;
        };

        let session = match self.load_session().await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(
                    error = (&err as &dyn error::Error),
                    "unable to load the initial session"
                );
                None
            }
        };

        if let Err(err) = listener
            .on_auth_state_change(AuthChangeEvent::InitialSession, session.as_ref())
            .await
        {
            tracing::warn!(
                listener = %id,
                error = (&*err as &dyn error::Error),
                "auth state listener failed"
            );
        }
    }

    fn spawn_broadcast_listener(self: &Arc<Self>) {
        let Some(mut messages) = self.pending_broadcasts.lock().take() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply_broadcast(message).await;
            }
        });
        self.tasks.set_broadcast(handle);
    }

    pub(crate) async fn apply_broadcast(&self, message: BroadcastMessage) {
        if message.origin == self.instance_id {
            return;
        }
        if !self
            .last_applied
            .record(message.event, message.session.as_ref())
        {
            tracing::trace!(event = %message.event, "ignoring repeated broadcast");
            return;
        }

        tracing::debug!(
            event = %message.event,
            origin = message.origin,
            "applying broadcast from another client"
        );
        // The bus already logged each failure.
        let _ = self
            .subscribers
            .notify(message.event, message.session.as_ref())
            .await;
    }

    /// Looks up the signing key `kid`, refetching the key set once the cached
    /// copy is stale
    async fn fetch_jwk(&self, kid: &str, hint: Option<&Jwks>) -> Result<Option<Jwk>, AuthError> {
        if let Some(key) = hint.and_then(|jwks| jwks.find(kid)) {
            return Ok(Some(key.clone()));
        }

        let now = self.clock.now_ms();
        if let Some(cached) = self.registry.cached_jwks(&self.storage_key) {
            if cached.cached_at + jwt::JWKS_TTL > now {
                if let Some(key) = cached.jwks.find(kid) {
                    return Ok(Some(key.clone()));
                }
            }
        }

        let jwks = self.api.fetch_jwks().await?;
        if jwks.keys.is_empty() {
            return Ok(None);
        }

        let found = jwks.find(kid).cloned();
        self.registry
            .store_jwks(&self.storage_key, Arc::new(jwks), now);
        Ok(found)
    }
}
