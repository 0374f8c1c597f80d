//! Client configuration

use std::{fmt, sync::Arc, time::Duration};

use gotrue_clock::{Clock, System};
use tokio::sync::watch;

use crate::{
    backoff::RefreshBackoffConfig,
    broadcast::{BroadcastChannel, NoBroadcast, ProcessBroadcast},
    jwt::JwtVerifier,
    lock::{LockManager, NoOpLock},
    registry::SharedRegistry,
    storage::{AsyncStorage, MemoryStorage},
};

/// The storage key used when none is configured
pub const DEFAULT_STORAGE_KEY: &str = "supabase.auth.token";

/// Whether the application is currently in the foreground
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Visibility {
    /// In the foreground
    #[default]
    Visible,
    /// In the background
    Hidden,
}

/// Where the client runs
#[derive(Clone, Debug, Default)]
pub enum Environment {
    /// A service or script with no notion of foreground
    ///
    /// The refresh scheduler runs continuously when auto-refresh is enabled.
    #[default]
    Headless,
    /// An interactive application whose foreground state is reported through
    /// a watch channel
    ///
    /// The refresh scheduler only runs while the application is visible, and
    /// other clients of the process sharing the storage key coordinate through
    /// in-process locks and broadcasts.
    Interactive {
        /// Current visibility
        visibility: watch::Receiver<Visibility>,
    },
}

impl Environment {
    /// Whether this is an interactive environment
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive { .. })
    }
}

/// Options for an [`AuthClient`](crate::AuthClient)
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) storage_key: String,
    pub(crate) auto_refresh_token: bool,
    pub(crate) persist_session: bool,
    pub(crate) storage: Option<Arc<dyn AsyncStorage>>,
    pub(crate) user_storage: Option<Arc<dyn AsyncStorage>>,
    pub(crate) lock: Option<Arc<dyn LockManager>>,
    pub(crate) broadcast: Option<Arc<dyn BroadcastChannel>>,
    pub(crate) environment: Environment,
    pub(crate) registry: Option<SharedRegistry>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) refresh_backoff: RefreshBackoffConfig,
    pub(crate) tick_deadline: Option<Duration>,
    pub(crate) jwt_verifier: Option<Arc<dyn JwtVerifier>>,
}

impl Default for ClientConfig {
    /// Headless, persisting to memory, refreshing automatically
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_owned(),
            auto_refresh_token: true,
            persist_session: true,
            storage: None,
            user_storage: None,
            lock: None,
            broadcast: None,
            environment: Environment::Headless,
            registry: None,
            clock: Arc::new(System),
            refresh_backoff: RefreshBackoffConfig::default(),
            tick_deadline: None,
            jwt_verifier: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("storage_key", &self.storage_key)
            .field("auto_refresh_token", &self.auto_refresh_token)
            .field("persist_session", &self.persist_session)
            .field("storage", &self.storage.is_some())
            .field("user_storage", &self.user_storage.is_some())
            .field("lock", &self.lock)
            .field("broadcast", &self.broadcast)
            .field("environment", &self.environment)
            .field("refresh_backoff", &self.refresh_backoff)
            .field("tick_deadline", &self.tick_deadline)
            .field("jwt_verifier", &self.jwt_verifier)
            .finish()
    }
}

impl ClientConfig {
    /// Sets the key the session is stored under
    pub fn with_storage_key(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = storage_key.into();
        self
    }

    /// Enables or disables the background refresh scheduler
    pub fn with_auto_refresh_token(mut self, enabled: bool) -> Self {
        self.auto_refresh_token = enabled;
        self
    }

    /// Whether the session outlives the client
    ///
    /// When disabled, the configured storage is ignored in favor of a private
    /// in-memory store and no broadcasts are sent.
    pub fn with_persist_session(mut self, persist: bool) -> Self {
        self.persist_session = persist;
        self
    }

    /// Sets the primary storage
    pub fn with_storage(mut self, storage: impl AsyncStorage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Sets the primary storage from a shared handle
    pub fn with_shared_storage(mut self, storage: Arc<dyn AsyncStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Stores the user object separately, under `<storage key>-user`
    pub fn with_user_storage(mut self, storage: Arc<dyn AsyncStorage>) -> Self {
        self.user_storage = Some(storage);
        self
    }

    /// Overrides the lock manager chosen from the environment
    pub fn with_lock(mut self, lock: impl LockManager + 'static) -> Self {
        self.lock = Some(Arc::new(lock));
        self
    }

    /// Overrides the broadcast channel chosen from the environment
    pub fn with_broadcast(mut self, broadcast: impl BroadcastChannel + 'static) -> Self {
        self.broadcast = Some(Arc::new(broadcast));
        self
    }

    /// Sets the environment
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Uses `registry` instead of the process-wide registry
    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets the retry schedule for refresh requests
    pub fn with_refresh_backoff(mut self, config: RefreshBackoffConfig) -> Self {
        self.refresh_backoff = config;
        self
    }

    /// Bounds every scheduler tick, lock acquisition included
    pub fn with_tick_deadline(mut self, deadline: Duration) -> Self {
        self.tick_deadline = Some(deadline);
        self
    }

    /// Verifies asymmetric JWT signatures locally in
    /// [`get_claims`](crate::AuthClient::get_claims)
    pub fn with_jwt_verifier(mut self, verifier: impl JwtVerifier + 'static) -> Self {
        self.jwt_verifier = Some(Arc::new(verifier));
        self
    }

    pub(crate) fn resolve(self) -> ResolvedConfig {
        let registry = self.registry.unwrap_or_else(SharedRegistry::global);

        let storage: Arc<dyn AsyncStorage> = match (self.persist_session, self.storage) {
            (true, Some(storage)) => storage,
            _ => Arc::new(MemoryStorage::new()),
        };

        let lock: Arc<dyn LockManager> = match self.lock {
            Some(lock) => lock,
            None if self.environment.is_interactive() => Arc::new(registry.process_lock()),
            None => Arc::new(NoOpLock),
        };

        let broadcast: Arc<dyn BroadcastChannel> = match self.broadcast {
            Some(broadcast) if self.persist_session => broadcast,
            None if self.persist_session && self.environment.is_interactive() => {
                Arc::new(ProcessBroadcast::new(&registry, &self.storage_key))
            }
            _ => Arc::new(NoBroadcast),
        };

        ResolvedConfig {
            storage_key: self.storage_key,
            auto_refresh_token: self.auto_refresh_token,
            storage,
            user_storage: self.user_storage,
            lock,
            broadcast,
            environment: self.environment,
            registry,
            clock: self.clock,
            refresh_backoff: self.refresh_backoff,
            tick_deadline: self.tick_deadline,
            jwt_verifier: self.jwt_verifier,
        }
    }
}

pub(crate) struct ResolvedConfig {
    pub(crate) storage_key: String,
    pub(crate) auto_refresh_token: bool,
    pub(crate) storage: Arc<dyn AsyncStorage>,
    pub(crate) user_storage: Option<Arc<dyn AsyncStorage>>,
    pub(crate) lock: Arc<dyn LockManager>,
    pub(crate) broadcast: Arc<dyn BroadcastChannel>,
    pub(crate) environment: Environment,
    pub(crate) registry: SharedRegistry,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) refresh_backoff: RefreshBackoffConfig,
    pub(crate) tick_deadline: Option<Duration>,
    pub(crate) jwt_verifier: Option<Arc<dyn JwtVerifier>>,
}
