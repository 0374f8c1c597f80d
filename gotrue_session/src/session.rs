use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use gotrue_clock::{Clock, DurationSecs, UnixTime, UnixTimeMs};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{AccessToken, AccessTokenRef, AuthError, ProviderToken, RefreshToken, RefreshTokenRef};

/// How often the auto-refresh scheduler wakes up
pub const AUTO_REFRESH_TICK_DURATION: Duration = Duration::from_secs(30);

/// A session expiring within this many ticks is refreshed by the scheduler
pub const AUTO_REFRESH_TICK_THRESHOLD: u32 = 3;

/// Safety window before the real expiry in which a session already counts as
/// expired
///
/// Eager readers could otherwise hand out a JWT that expires before it reaches
/// the server.
pub const EXPIRY_MARGIN: Duration =
    Duration::from_secs(AUTO_REFRESH_TICK_DURATION.as_secs() * AUTO_REFRESH_TICK_THRESHOLD as u64);

/// A user as described by the auth server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// The user's unique identifier
    pub id: String,
    /// Audience the user belongs to
    #[serde(default)]
    pub aud: String,
    /// Database role of the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Email address, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Phone number, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Metadata only the server may write
    #[serde(default)]
    pub app_metadata: serde_json::Value,
    /// Metadata the user may edit
    #[serde(default)]
    pub user_metadata: serde_json::Value,
    /// Whether the user signed in anonymously
    #[serde(default)]
    pub is_anonymous: bool,
    /// Every other field the server sent, kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl User {
    /// Constructs a minimal user with the given identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aud: String::from("authenticated"),
            role: None,
            email: None,
            phone: None,
            app_metadata: serde_json::Value::Null,
            user_metadata: serde_json::Value::Null,
            is_anonymous: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// A user read from storage whose authenticity cannot be guaranteed
///
/// The first read logs a warning, unless the owning client has since saved a
/// session of its own.
#[derive(Clone, Debug)]
pub struct UntrustedUser {
    user: User,
    warned: Arc<AtomicBool>,
}

/// Whether the user object attached to a session can be read
#[derive(Clone, Debug, Default)]
pub enum UserState {
    /// User data is present and came from the auth server or trusted storage
    Loaded(User),
    /// User data came from storage that may have been tampered with
    Untrusted(UntrustedUser),
    /// User data is stored separately and has not been loaded
    #[default]
    Unavailable,
}

impl UserState {
    pub(crate) fn untrusted(user: User, warned: Arc<AtomicBool>) -> Self {
        Self::Untrusted(UntrustedUser { user, warned })
    }

    /// Reads the user, failing if it was never loaded
    ///
    /// Reading an untrusted user logs a warning once; prefer
    /// [`AuthClient::get_user`](crate::AuthClient::get_user), which asks the
    /// server.
    pub fn get(&self) -> Result<&User, AuthError> {
        match self {
            Self::Loaded(user) => Ok(user),
            Self::Untrusted(untrusted) => {
                if !untrusted.warned.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        "using a user object read straight from session storage; it may not be \
                         authentic, use `get_user` to have the auth server confirm it"
                    );
                }
                Ok(&untrusted.user)
            }
            Self::Unavailable => Err(AuthError::UserUnavailable),
        }
    }

    /// Whether user data is present (trusted or not)
    pub fn is_available(&self) -> bool {
        !self.is_unavailable()
    }

    /// Whether user data still has to be fetched
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    fn as_option(&self) -> Option<&User> {
        match self {
            Self::Loaded(user) => Some(user),
            Self::Untrusted(untrusted) => Some(&untrusted.user),
            Self::Unavailable => None,
        }
    }

    pub(crate) fn peek(&self) -> Option<&User> {
        self.as_option()
    }
}

impl From<User> for UserState {
    fn from(user: User) -> Self {
        Self::Loaded(user)
    }
}

impl Serialize for UserState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_option().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UserState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Option::<User>::deserialize(deserializer)?.map_or(Self::Unavailable, Self::Loaded))
    }
}

/// The access/refresh token pair with its expiry and user
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    access_token: AccessToken,
    refresh_token: RefreshToken,
    #[serde(default)]
    expires_in: DurationSecs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<UnixTime>,
    #[serde(default = "bearer")]
    token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider_token: Option<ProviderToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider_refresh_token: Option<ProviderToken>,
    #[serde(default, skip_serializing_if = "UserState::is_unavailable")]
    user: UserState,
}

fn bearer() -> String {
    String::from("bearer")
}

/// A session's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// The access token is valid beyond the expiry margin
    Fresh,
    /// The access token is still valid but within the expiry margin
    Expiring,
    /// The access token is no longer valid
    Expired,
}

impl Session {
    /// Constructs a session from a freshly issued token pair
    pub fn new(
        access_token: AccessToken,
        refresh_token: RefreshToken,
        expires_in: DurationSecs,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_in,
            expires_at: None,
            token_type: bearer(),
            provider_token: None,
            provider_refresh_token: None,
            user: UserState::Unavailable,
        }
    }

    /// Sets the absolute expiry time
    pub fn with_expires_at(mut self, expires_at: UnixTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Attaches user data
    pub fn with_user(mut self, user: impl Into<UserState>) -> Self {
        self.user = user.into();
        self
    }

    /// Attaches upstream provider tokens
    pub fn with_provider_tokens(
        mut self,
        provider_token: Option<ProviderToken>,
        provider_refresh_token: Option<ProviderToken>,
    ) -> Self {
        self.provider_token = provider_token;
        self.provider_refresh_token = provider_refresh_token;
        self
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the token lifetime reported at issue time
    #[inline]
    pub fn expires_in(&self) -> DurationSecs {
        self.expires_in
    }

    /// Gets the absolute expiry time, if known
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Gets the token type, normally `bearer`
    #[inline]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Gets the upstream OAuth provider's access token, if any
    #[inline]
    pub fn provider_token(&self) -> Option<&ProviderToken> {
        self.provider_token.as_ref()
    }

    /// Gets the upstream OAuth provider's refresh token, if any
    #[inline]
    pub fn provider_refresh_token(&self) -> Option<&ProviderToken> {
        self.provider_refresh_token.as_ref()
    }

    /// Gets the user state attached to the session
    #[inline]
    pub fn user_state(&self) -> &UserState {
        &self.user
    }

    /// Reads the user, failing if user data was never loaded
    pub fn user(&self) -> Result<&User, AuthError> {
        self.user.get()
    }

    pub(crate) fn set_user(&mut self, user: UserState) {
        self.user = user;
    }

    pub(crate) fn take_user(&mut self) -> UserState {
        std::mem::take(&mut self.user)
    }

    /// Fills in `expires_at` from `expires_in` if the server left it out
    pub(crate) fn ensure_expires_at<C: Clock + ?Sized>(&mut self, clock: &C) {
        if self.expires_at.is_none() {
            self.expires_at = Some(clock.now() + self.expires_in);
        }
    }

    /// Checks the invariants every stored session must satisfy
    pub(crate) fn validate(&self) -> Result<(), AuthError> {
        let reason = if self.access_token.as_str().is_empty() {
            "access token is empty"
        } else if self.refresh_token.as_str().is_empty() {
            "refresh token is empty"
        } else if self.expires_at.is_none() {
            "expiry time is missing"
        } else {
            return Ok(());
        };

        Err(AuthError::InvalidSession {
            reason: reason.to_owned(),
        })
    }

    /// Signed milliseconds until the access token expires, as of `now`
    ///
    /// `None` when the expiry time is unknown.
    pub fn millis_until_expiry(&self, now: UnixTimeMs) -> Option<i64> {
        self.expires_at
            .map(|expires_at| now.millis_until(expires_at.into()))
    }

    /// Gets the session's status as of `now`
    ///
    /// A session with no known expiry is always considered fresh.
    pub fn status_at(&self, now: UnixTimeMs) -> SessionStatus {
        match self.millis_until_expiry(now) {
            None => SessionStatus::Fresh,
            Some(remaining) if remaining <= 0 => SessionStatus::Expired,
            Some(remaining) if remaining < margin_millis() => SessionStatus::Expiring,
            Some(_) => SessionStatus::Fresh,
        }
    }

    /// Gets the session's status based on the current time as reported by
    /// the provided clock
    #[inline]
    pub fn status_with_clock<C: Clock + ?Sized>(&self, clock: &C) -> SessionStatus {
        self.status_at(clock.now_ms())
    }

    /// Whether the session must be refreshed before being handed out
    #[inline]
    pub fn needs_refresh_at(&self, now: UnixTimeMs) -> bool {
        self.status_at(now) != SessionStatus::Fresh
    }

    /// Number of whole scheduler ticks left before the access token expires
    ///
    /// Zero or negative when the token already expired.
    pub fn ticks_until_expiry(&self, now: UnixTimeMs, tick: Duration) -> Option<i64> {
        let tick_ms = i64::try_from(tick.as_millis()).unwrap_or(i64::MAX).max(1);
        self.millis_until_expiry(now)
            .map(|remaining| remaining.div_euclid(tick_ms))
    }
}

fn margin_millis() -> i64 {
    i64::try_from(EXPIRY_MARGIN.as_millis()).unwrap_or(i64::MAX)
}

/// The wrapper persisted under `<storage key>-user`
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredUser {
    #[serde(default)]
    pub(crate) user: Option<User>,
}
