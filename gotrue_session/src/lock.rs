//! Named exclusive locks guarding the stored session
//!
//! Every read-modify-write of the session happens while holding a lock named
//! `lock:<storage key>`. Which kind of lock backs that name depends on how many
//! parties may touch the same storage:
//!
//! * [`NoOpLock`] when the client is the only one (servers, tests).
//! * [`ProcessLock`] when several clients in one process share storage.
//! * [`FileLock`](file::FileLock) when several processes share a storage
//!   directory.
//!
//! On top of whichever manager is configured, each client keeps a
//! [`SessionLock`] so that operations nested inside a critical section do not
//! deadlock on the client's own lock.

use std::{fmt, future::Future, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;

#[cfg(feature = "file")]
pub mod file;
mod process;
mod reentrant;

pub use process::ProcessLock;
pub use reentrant::SessionLock;

/// How long to wait for a lock before giving up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcquireTimeout {
    /// Wait as long as it takes
    #[default]
    Forever,
    /// Fail right away if the lock is held elsewhere
    Immediate,
    /// Fail if the lock is not acquired within the given duration
    Within(Duration),
}

impl AcquireTimeout {
    /// Interprets a signed millisecond timeout
    ///
    /// Negative values wait forever and zero fails immediately.
    pub fn from_millis(ms: i64) -> Self {
        match u64::try_from(ms) {
            Err(_) => Self::Forever,
            Ok(0) => Self::Immediate,
            Ok(ms) => Self::Within(Duration::from_millis(ms)),
        }
    }

    /// Drives `acquire` to completion within this timeout
    ///
    /// `Immediate` polls the future exactly once.
    pub async fn run<F, T>(self, name: &str, acquire: F) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        match self {
            Self::Forever => Ok(acquire.await),
            Self::Immediate => acquire.now_or_never().ok_or_else(|| LockError::Busy {
                name: name.to_owned(),
            }),
            Self::Within(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| LockError::AcquireTimeout {
                    name: name.to_owned(),
                    timeout,
                }),
        }
    }
}

/// An error acquiring a lock
#[derive(Clone, Debug, Error)]
pub enum LockError {
    /// The lock is held elsewhere and the caller asked not to wait
    #[error("lock {name:?} is held elsewhere")]
    Busy {
        /// Name of the lock
        name: String,
    },
    /// The lock was not acquired before the timeout elapsed
    #[error("timed out after {timeout:?} waiting for lock {name:?}")]
    AcquireTimeout {
        /// Name of the lock
        name: String,
        /// How long the caller waited
        timeout: Duration,
    },
    /// The locking mechanism itself could not be used
    #[error("lock {name:?} is unavailable")]
    Unavailable {
        /// Name of the lock
        name: String,
        /// Underlying I/O failure
        #[source]
        source: Arc<io::Error>,
    },
}

impl LockError {
    /// Whether the lock exists but could not be obtained in time
    pub fn is_acquire_failure(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::AcquireTimeout { .. })
    }
}

/// Proof that a lock is held
///
/// The lock is released when the ticket is dropped.
pub struct LockTicket {
    name: String,
    _guard: Option<Box<dyn Send + Sync>>,
}

impl LockTicket {
    /// Creates a ticket that releases `guard` on drop
    pub fn new(name: impl Into<String>, guard: impl Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            _guard: Some(Box::new(guard)),
        }
    }

    /// Creates a ticket that holds nothing
    pub fn unguarded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _guard: None,
        }
    }

    /// Name of the held lock
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LockTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTicket")
            .field("name", &self.name)
            .field("guarded", &self._guard.is_some())
            .finish()
    }
}

/// A provider of named exclusive locks
#[async_trait]
pub trait LockManager: Send + Sync + fmt::Debug {
    /// Acquires the lock called `name`
    async fn acquire(&self, name: &str, timeout: AcquireTimeout) -> Result<LockTicket, LockError>;
}

#[async_trait]
impl<M: LockManager + ?Sized> LockManager for Arc<M> {
    async fn acquire(&self, name: &str, timeout: AcquireTimeout) -> Result<LockTicket, LockError> {
        (**self).acquire(name, timeout).await
    }
}

/// Runs `f` while holding the lock called `name`
///
/// `f` is never invoked if the lock cannot be acquired.
pub async fn with_lock<M, F, Fut, T>(
    manager: &M,
    name: &str,
    timeout: AcquireTimeout,
    f: F,
) -> Result<T, LockError>
where
    M: LockManager + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let ticket = manager.acquire(name, timeout).await?;
    tracing::trace!(lock = ticket.name(), "lock acquired");
    let out = f().await;
    drop(ticket);
    tracing::trace!(lock = name, "lock released");
    Ok(out)
}

/// A lock that is always available
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpLock;

#[async_trait]
impl LockManager for NoOpLock {
    async fn acquire(&self, name: &str, _timeout: AcquireTimeout) -> Result<LockTicket, LockError> {
        Ok(LockTicket::unguarded(name))
    }
}
