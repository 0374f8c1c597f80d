//! Cross-process locks backed by lock files

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use uuid::Uuid;

use super::{AcquireTimeout, LockError, LockManager, LockTicket};
use crate::storage::file::file_stem;

/// What to do when the lock directory itself cannot be used
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnavailablePolicy {
    /// Fail with [`LockError::Unavailable`]
    #[default]
    Fail,
    /// Log a warning and continue without mutual exclusion
    ProceedUnlocked,
}

/// Named locks implemented as `<name>.lock` files in a directory
///
/// A lock is held while its file exists. Each lock file carries a token unique
/// to its holder, and the holder rewrites it periodically while the lock is
/// held. A lock file left untouched for longer than the stale threshold is
/// assumed to belong to a crashed process and is reclaimed.
#[derive(Clone, Debug)]
pub struct FileLock {
    dir: PathBuf,
    poll_interval: Duration,
    stale_after: Option<Duration>,
    policy: UnavailablePolicy,
}

impl FileLock {
    /// Constructs a lock manager keeping its lock files in `dir`
    ///
    /// The directory is created on first use. Defaults to polling every 50 ms,
    /// reclaiming files untouched for 2 minutes and failing when the directory
    /// is unusable.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(50),
            stale_after: Some(Duration::from_secs(120)),
            policy: UnavailablePolicy::Fail,
        }
    }

    /// Sets how often a contended lock file is re-checked
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the age after which an untouched lock file is reclaimed (`None`
    /// never reclaims)
    ///
    /// Holders refresh their lock file four times per threshold.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the behavior when the lock directory cannot be used
    pub fn with_unavailable_policy(mut self, policy: UnavailablePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(name)))
    }

    async fn try_create(path: &Path, token: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(token.as_bytes()).await?;
        file.flush().await
    }

    /// Returns the contents of the lock file at `path` if it has gone stale
    async fn stale_contents(&self, path: &Path) -> Option<String> {
        let stale_after = self.stale_after?;

        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age <= stale_after {
            return None;
        }

        tokio::fs::read_to_string(path).await.ok()
    }

    fn unavailable(&self, name: &str, err: io::Error) -> Result<LockTicket, LockError> {
        match self.policy {
            UnavailablePolicy::Fail => Err(LockError::Unavailable {
                name: name.to_owned(),
                source: Arc::new(err),
            }),
            UnavailablePolicy::ProceedUnlocked => {
                tracing::warn!(
                    lock = name,
                    error = (&err as &dyn std::error::Error),
                    "lock directory unusable, proceeding without the lock"
                );
                Ok(LockTicket::unguarded(name))
            }
        }
    }
}

/// Removes the stale lock file at `path`, unless it no longer holds `observed`
///
/// The file is first moved aside so that only one waiter can claim it. A file
/// that was replaced by a new holder in the meantime is put back.
async fn reclaim(path: &Path, observed: &str) -> io::Result<bool> {
    let aside = path.with_extension(format!("lock.{}", Uuid::new_v4().simple()));
    match tokio::fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    }

    let claimed = tokio::fs::read_to_string(&aside)
        .await
        .map_or(false, |contents| contents == observed);
    if !claimed {
        if let Err(err) = tokio::fs::hard_link(&aside, path).await {
            tracing::warn!(
                path = %path.display(),
                error = (&err as &dyn std::error::Error),
                "unable to restore a live lock file"
            );
        }
    }

    tokio::fs::remove_file(&aside).await?;
    Ok(claimed)
}

/// Rewrites the lock file every `period` for as long as it carries `token`
async fn heartbeat(path: PathBuf, token: String, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents == token => {}
            Ok(_) => {
                tracing::warn!(path = %path.display(), "lock file was taken over");
                return;
            }
            Err(_) => continue,
        }

        let touched: io::Result<()> = async {
            let mut file = OpenOptions::new().write(true).open(&path).await?;
            file.write_all(token.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(err) = touched {
            tracing::warn!(
                path = %path.display(),
                error = (&err as &dyn std::error::Error),
                "unable to refresh lock file"
            );
        }
    }
}

#[async_trait]
impl LockManager for FileLock {
    async fn acquire(&self, name: &str, timeout: AcquireTimeout) -> Result<LockTicket, LockError> {
        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            return self.unavailable(name, err);
        }

        let path = self.path_for(name);
        let token = format!("{} {}", std::process::id(), Uuid::new_v4());
        let deadline = match timeout {
            AcquireTimeout::Within(d) => Some(Instant::now() + d),
            _ => None,
        };

        loop {
            match Self::try_create(&path, &token).await {
                Ok(()) => {
                    tracing::trace!(lock = name, path = %path.display(), "lock file created");
                    let heartbeat = self.stale_after.map(|stale_after| {
                        let period = (stale_after / 4).max(Duration::from_millis(10));
                        tokio::spawn(heartbeat(path.clone(), token.clone(), period))
                    });
                    return Ok(LockTicket::new(
                        name,
                        LockFile {
                            path,
                            token,
                            heartbeat,
                        },
                    ));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(observed) = self.stale_contents(&path).await {
                        match reclaim(&path, &observed).await {
                            Ok(true) => {
                                tracing::debug!(lock = name, "reclaimed stale lock file");
                                continue;
                            }
                            Ok(false) => {}
                            Err(err) => return self.unavailable(name, err),
                        }
                    }
                }
                Err(err) => return self.unavailable(name, err),
            }

            match timeout {
                AcquireTimeout::Immediate => {
                    return Err(LockError::Busy {
                        name: name.to_owned(),
                    })
                }
                AcquireTimeout::Within(d) => {
                    if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                        return Err(LockError::AcquireTimeout {
                            name: name.to_owned(),
                            timeout: d,
                        });
                    }
                }
                AcquireTimeout::Forever => {}
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    token: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }

        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents == self.token => {}
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "lock file was taken over");
                return;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return,
            Err(_) => {}
        }

        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = (&err as &dyn std::error::Error),
                    "unable to remove lock file"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_file_excludes_and_is_removed_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLock::new(dir.path());
        let b = FileLock::new(dir.path());

        let held = a.acquire("lock:k", AcquireTimeout::Forever).await.unwrap();
        assert!(matches!(
            b.acquire("lock:k", AcquireTimeout::Immediate).await,
            Err(LockError::Busy { .. })
        ));

        drop(held);
        assert!(b.acquire("lock:k", AcquireTimeout::Immediate).await.is_ok());
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLock::new(dir.path()).with_poll_interval(Duration::from_millis(5));

        let _held = locks.acquire("k", AcquireTimeout::Forever).await.unwrap();
        let err = locks
            .acquire("k", AcquireTimeout::Within(Duration::from_millis(30)))
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::AcquireTimeout { .. }));
    }

    #[tokio::test]
    async fn stale_lock_files_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLock::new(dir.path()).with_stale_after(Some(Duration::ZERO));

        std::fs::write(dir.path().join("k.lock"), "12345").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(locks.acquire("k", AcquireTimeout::Immediate).await.is_ok());
    }

    #[tokio::test]
    async fn missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLock::new(dir.path().join(".auth"));

        let _held = locks.acquire("lock:k", AcquireTimeout::Forever).await.unwrap();

        assert!(dir.path().join(".auth").is_dir());
    }

    #[tokio::test]
    async fn unusable_directory_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, "").unwrap();
        let unusable = blocker.join("locks");

        let strict = FileLock::new(&unusable);
        assert!(matches!(
            strict.acquire("k", AcquireTimeout::Forever).await,
            Err(LockError::Unavailable { .. })
        ));

        let lenient =
            FileLock::new(&unusable).with_unavailable_policy(UnavailablePolicy::ProceedUnlocked);
        assert!(lenient.acquire("k", AcquireTimeout::Forever).await.is_ok());
    }

    #[tokio::test]
    async fn held_locks_never_go_stale() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLock::new(dir.path()).with_stale_after(Some(Duration::from_millis(100)));

        let held = locks.acquire("k", AcquireTimeout::Forever).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(matches!(
            locks.acquire("k", AcquireTimeout::Immediate).await,
            Err(LockError::Busy { .. })
        ));

        drop(held);
        assert!(locks.acquire("k", AcquireTimeout::Immediate).await.is_ok());
    }

    #[tokio::test]
    async fn reclaim_puts_back_a_replaced_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.lock");
        std::fs::write(&path, "new holder").unwrap();

        assert!(!reclaim(&path, "old holder").await.unwrap());

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new holder");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn release_leaves_a_taken_over_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLock::new(dir.path()).with_stale_after(None);

        let held = locks.acquire("k", AcquireTimeout::Forever).await.unwrap();
        std::fs::write(dir.path().join("k.lock"), "new holder").unwrap();
        drop(held);

        assert_eq!(
            std::fs::read_to_string(dir.path().join("k.lock")).unwrap(),
            "new holder"
        );
    }
}
