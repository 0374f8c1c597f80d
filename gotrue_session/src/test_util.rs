use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use gotrue_clock::{DurationSecs, TestClock, UnixTime};
use parking_lot::Mutex;

use crate::{
    api::{AuthApi, PasswordCredentials, SignOutScope, UserAttributes},
    config::{ClientConfig, DEFAULT_STORAGE_KEY},
    jwt::Jwks,
    registry::SharedRegistry,
    storage::{AsyncStorage, MemoryStorage},
    AccessToken, AccessTokenRef, AuthChangeEvent, AuthClient, AuthCodeRef, AuthError,
    CodeVerifier, CodeVerifierRef, RefreshToken, RefreshTokenRef, Session, User,
};

/// The time every harness clock starts at
pub(crate) const NOW: UnixTime = UnixTime(1_700_000_000);

/// Builds an unsigned-looking compact JWT for user `u1` with signature `sig`
pub(crate) fn make_jwt(alg: &str, kid: Option<&str>, exp: UnixTime) -> String {
    let mut header = serde_json::json!({ "alg": alg, "typ": "JWT" });
    if let Some(kid) = kid {
        header["kid"] = kid.into();
    }
    let claims = serde_json::json!({
        "sub": "u1",
        "exp": exp.0,
        "role": "authenticated",
        "session_id": "s1",
    });

    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode(b"sig"),
    )
}

pub(crate) fn test_user() -> User {
    let mut user = User::new("u1");
    user.email = Some("u1@example.com".into());
    user
}

pub(crate) fn session_expiring_at(access: &str, refresh: &str, expires_at: UnixTime) -> Session {
    Session::new(
        AccessToken::new(access.to_owned()),
        RefreshToken::new(refresh.to_owned()),
        DurationSecs(3600),
    )
    .with_expires_at(expires_at)
    .with_user(test_user())
}

pub(crate) fn rejected(status: u16, code: &str) -> AuthError {
    AuthError::Api {
        status,
        code: Some(code.to_owned()),
        message: format!("rejected with {}", code),
    }
}

pub(crate) fn unavailable() -> AuthError {
    AuthError::RetryableTransport {
        status: Some(503),
        message: "service unavailable".into(),
    }
}

/// An auth server answering from scripted responses
///
/// Calls without a scripted response succeed with a plausible default.
#[derive(Debug, Default)]
pub(crate) struct MockAuthApi {
    refresh_responses: Mutex<VecDeque<Result<Session, AuthError>>>,
    refresh_delay: Mutex<Option<Duration>>,
    refresh_log: Mutex<Vec<(RefreshToken, tokio::time::Instant)>>,
    user_responses: Mutex<VecDeque<Result<User, AuthError>>>,
    user_calls: AtomicUsize,
    sign_out_responses: Mutex<VecDeque<Result<(), AuthError>>>,
    sign_out_log: Mutex<Vec<SignOutScope>>,
    exchange_responses: Mutex<VecDeque<Result<Session, AuthError>>>,
    exchange_log: Mutex<Vec<CodeVerifier>>,
    jwks: Mutex<Jwks>,
    jwks_calls: AtomicUsize,
}

impl MockAuthApi {
    pub(crate) fn push_refresh(&self, response: Result<Session, AuthError>) {
        self.refresh_responses.lock().push_back(response);
    }

    pub(crate) fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = Some(delay);
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_log.lock().len()
    }

    pub(crate) fn refreshed_tokens(&self) -> Vec<String> {
        self.refresh_log
            .lock()
            .iter()
            .map(|(token, _)| token.as_str().to_owned())
            .collect()
    }

    pub(crate) fn refresh_times(&self) -> Vec<tokio::time::Instant> {
        self.refresh_log.lock().iter().map(|(_, at)| *at).collect()
    }

    pub(crate) fn push_user(&self, response: Result<User, AuthError>) {
        self.user_responses.lock().push_back(response);
    }

    pub(crate) fn user_calls(&self) -> usize {
        self.user_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn push_sign_out(&self, response: Result<(), AuthError>) {
        self.sign_out_responses.lock().push_back(response);
    }

    pub(crate) fn sign_out_scopes(&self) -> Vec<SignOutScope> {
        self.sign_out_log.lock().clone()
    }

    pub(crate) fn push_exchange(&self, response: Result<Session, AuthError>) {
        self.exchange_responses.lock().push_back(response);
    }

    pub(crate) fn exchanged_verifiers(&self) -> Vec<CodeVerifier> {
        self.exchange_log.lock().clone()
    }

    pub(crate) fn set_jwks(&self, jwks: Jwks) {
        *self.jwks.lock() = jwks;
    }

    pub(crate) fn jwks_calls(&self) -> usize {
        self.jwks_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for MockAuthApi {
    async fn refresh_token(&self, refresh_token: &RefreshTokenRef) -> Result<Session, AuthError> {
        let call = {
            let mut log = self.refresh_log.lock();
            log.push((refresh_token.to_owned(), tokio::time::Instant::now()));
            log.len()
        };

        let delay = *self.refresh_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.refresh_responses.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Session::new(
                AccessToken::new(format!("access-{}", call)),
                RefreshToken::new(format!("refresh-{}", call)),
                DurationSecs(3600),
            )
            .with_user(test_user()))
        })
    }

    async fn get_user(&self, _jwt: &AccessTokenRef) -> Result<User, AuthError> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.user_responses.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(test_user()))
    }

    async fn update_user(
        &self,
        _jwt: &AccessTokenRef,
        attributes: &UserAttributes,
    ) -> Result<User, AuthError> {
        let mut user = test_user();
        if let Some(email) = &attributes.email {
            user.email = Some(email.clone());
        }
        Ok(user)
    }

    async fn sign_out(&self, _jwt: &AccessTokenRef, scope: SignOutScope) -> Result<(), AuthError> {
        self.sign_out_log.lock().push(scope);
        let scripted = self.sign_out_responses.lock().pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn sign_in_with_password(
        &self,
        _credentials: &PasswordCredentials,
    ) -> Result<Session, AuthError> {
        Ok(Session::new(
            AccessToken::from_static("signed-in"),
            RefreshToken::from_static("signed-in-refresh"),
            DurationSecs(3600),
        )
        .with_user(test_user()))
    }

    async fn exchange_code_for_session(
        &self,
        _auth_code: &AuthCodeRef,
        code_verifier: &CodeVerifierRef,
    ) -> Result<Session, AuthError> {
        self.exchange_log.lock().push(code_verifier.to_owned());
        let scripted = self.exchange_responses.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Session::new(
                AccessToken::from_static("exchanged"),
                RefreshToken::from_static("exchanged-refresh"),
                DurationSecs(3600),
            )
            .with_user(test_user()))
        })
    }

    async fn fetch_jwks(&self) -> Result<Jwks, AuthError> {
        self.jwks_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.jwks.lock().clone())
    }
}

/// Records every event a listener receives, with the session's access token
#[derive(Clone, Debug, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<(AuthChangeEvent, Option<String>)>>>);

impl EventLog {
    pub(crate) fn listener(&self) -> impl Fn(AuthChangeEvent, Option<&Session>) + Send + Sync + 'static {
        let log = self.clone();
        move |event, session| {
            log.0.lock().push((
                event,
                session.map(|session| session.access_token().as_str().to_owned()),
            ));
        }
    }

    pub(crate) fn entries(&self) -> Vec<(AuthChangeEvent, Option<String>)> {
        self.0.lock().clone()
    }

    pub(crate) fn events(&self) -> Vec<AuthChangeEvent> {
        self.0.lock().iter().map(|(event, _)| *event).collect()
    }

    pub(crate) fn count(&self, event: AuthChangeEvent) -> usize {
        self.0.lock().iter().filter(|(seen, _)| *seen == event).count()
    }

    pub(crate) async fn wait_for(&self, event: AuthChangeEvent) {
        eventually(|| self.count(event) > 0).await;
    }
}

/// Polls `condition` until it holds, failing the test after five seconds
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition never held");
}

/// A client wired to a mock server, shared memory storage, and a test clock
#[derive(Debug)]
pub(crate) struct Harness {
    pub(crate) api: Arc<MockAuthApi>,
    pub(crate) storage: MemoryStorage,
    pub(crate) clock: TestClock,
    pub(crate) registry: SharedRegistry,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self {
            api: Arc::default(),
            storage: MemoryStorage::new(),
            clock: TestClock::new(NOW),
            registry: SharedRegistry::new(),
        }
    }

    /// Configuration without the background scheduler
    pub(crate) fn config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_storage(self.storage.clone())
            .with_clock(self.clock.clone())
            .with_registry(self.registry.clone())
            .with_auto_refresh_token(false)
    }

    pub(crate) fn client(&self) -> AuthClient {
        AuthClient::new(self.api.clone(), self.config())
    }

    pub(crate) fn client_with(&self, config: ClientConfig) -> AuthClient {
        AuthClient::new(self.api.clone(), config)
    }

    pub(crate) async fn store(&self, session: &Session) {
        let raw = serde_json::to_string(session).unwrap();
        self.storage
            .set_item(DEFAULT_STORAGE_KEY, &raw)
            .await
            .unwrap();
    }

    pub(crate) fn stored(&self) -> Option<Session> {
        self.storage
            .snapshot()
            .get(DEFAULT_STORAGE_KEY)
            .map(|raw| serde_json::from_str(raw).unwrap())
    }

    pub(crate) fn stored_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.storage.snapshot().into_keys().collect();
        keys.sort();
        keys
    }

    /// A session expiring `secs` seconds from now
    pub(crate) fn session_expiring_in(&self, access: &str, refresh: &str, secs: u64) -> Session {
        session_expiring_at(access, refresh, NOW + DurationSecs(secs))
    }
}
