use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{AcquireTimeout, LockError, LockManager, LockTicket};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Identifiers of the session locks whose critical section encloses the
    /// current task
    static HELD: Vec<u64>;
}

/// Resolves once an operation and every operation admitted before it are done
type Completion = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct QueueState {
    /// Admitted operations that have not finished yet
    active: usize,
    tail: Option<Completion>,
    ticket: Option<LockTicket>,
}

/// A client's view of its session lock
///
/// Calls made while this client already holds the lock never wait on the
/// underlying [`LockManager`]:
///
/// * from inside the critical section (same task), the operation runs inline;
/// * from another task, the operation is queued behind every operation that
///   is already running or queued, and runs before the lock is released.
///
/// Only when nothing of this client holds the lock is the manager consulted.
/// The underlying ticket is released by whichever admitted operation finishes
/// last, even if the operation that acquired it was cancelled.
pub struct SessionLock {
    id: u64,
    name: String,
    manager: Arc<dyn LockManager>,
    state: Arc<Mutex<QueueState>>,
}

impl fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLock")
            .field("name", &self.name)
            .field("manager", &self.manager)
            .field("held", &(self.state.lock().active > 0))
            .finish()
    }
}

/// An operation's place in the queue
///
/// Dropping it, on completion or cancellation, lets the next operation run.
struct Admission {
    state: Arc<Mutex<QueueState>>,
    _done: oneshot::Sender<()>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        let ticket = {
            let mut state = self.state.lock();
            state.active -= 1;
            if state.active == 0 {
                state.tail = None;
                state.ticket.take()
            } else {
                None
            }
        };

        if let Some(ticket) = ticket {
            tracing::trace!(lock = ticket.name(), "lock released");
        }
    }
}

impl SessionLock {
    /// Wraps `manager`, locking the name `name`
    pub fn new(name: impl Into<String>, manager: Arc<dyn LockManager>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            manager,
            state: Arc::default(),
        }
    }

    /// Name of the underlying lock
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the current task runs inside this lock's critical section
    pub fn is_held_by_current_task(&self) -> bool {
        HELD.try_with(|held| held.contains(&self.id))
            .unwrap_or(false)
    }

    /// Runs `f` inside the critical section
    ///
    /// `timeout` only applies when the underlying lock has to be acquired.
    /// `f` is never invoked if that acquisition fails.
    pub async fn run<F, Fut, T>(&self, timeout: AcquireTimeout, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.is_held_by_current_task() {
            return Ok(f().await);
        }

        let queued = {
            let mut state = self.state.lock();
            (state.active > 0).then(|| self.admit(&mut state))
        };

        let (previous, admission) = match queued {
            Some(queued) => {
                tracing::trace!(lock = %self.name, "queued behind the current holder");
                queued
            }
            None => {
                let ticket = self.manager.acquire(&self.name, timeout).await?;
                tracing::trace!(lock = %self.name, "lock acquired");

                let (admitted, spare) = {
                    let mut state = self.state.lock();
                    let admitted = self.admit(&mut state);
                    let spare = match state.ticket {
                        Some(_) => Some(ticket),
                        None => {
                            state.ticket = Some(ticket);
                            None
                        }
                    };
                    (admitted, spare)
                };
                drop(spare);
                admitted
            }
        };

        if let Some(previous) = previous {
            previous.await;
        }

        let out = self.scoped(f()).await;
        drop(admission);
        Ok(out)
    }

    /// Appends an operation to the queue, returning what it must wait for
    fn admit(&self, state: &mut QueueState) -> (Option<Completion>, Admission) {
        let (done, finished) = oneshot::channel::<()>();
        let previous = state.tail.take();

        let after = previous.clone();
        state.tail = Some(
            async move {
                if let Some(after) = after {
                    after.await;
                }
                let _ = finished.await;
            }
            .boxed()
            .shared(),
        );
        state.active += 1;

        let admission = Admission {
            state: self.state.clone(),
            _done: done,
        };
        (previous, admission)
    }

    async fn scoped<Fut: Future>(&self, fut: Fut) -> Fut::Output {
        let mut held = HELD.try_with(Clone::clone).unwrap_or_default();
        held.push(self.id);
        HELD.scope(held, fut).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };

    use super::*;
    use crate::lock::{NoOpLock, ProcessLock};

    #[tokio::test]
    async fn nested_use_runs_inline() {
        let lock = Arc::new(SessionLock::new("lock:k", Arc::new(ProcessLock::new())));

        let inner = lock.clone();
        let value = lock
            .run(AcquireTimeout::Immediate, || async move {
                assert!(inner.is_held_by_current_task());
                inner
                    .run(AcquireTimeout::Immediate, || async { 41 + 1 })
                    .await
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(value, 42);
        assert!(!lock.is_held_by_current_task());
    }

    #[tokio::test]
    async fn queued_operations_run_in_order_before_release() {
        let manager = ProcessLock::new();
        let lock = Arc::new(SessionLock::new("lock:k", Arc::new(manager.clone())));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let holder = {
            let lock = lock.clone();
            let order = order.clone();
            tokio::spawn(async move {
                lock.run(AcquireTimeout::Forever, || async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    order.lock().push("holder");
                })
                .await
            })
        };
        entered_rx.await.unwrap();

        let mut queued = Vec::new();
        for label in ["first", "second"] {
            let lock = lock.clone();
            let order = order.clone();
            queued.push(tokio::spawn(async move {
                lock.run(AcquireTimeout::Immediate, || async move {
                    order.lock().push(label);
                })
                .await
            }));
            tokio::task::yield_now().await;
        }

        // Queued work does not touch the underlying manager.
        assert!(manager
            .acquire("lock:k", AcquireTimeout::Immediate)
            .await
            .is_err());

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        for task in queued {
            task.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec!["holder", "first", "second"]);
        assert!(manager
            .acquire("lock:k", AcquireTimeout::Immediate)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn acquisition_failure_skips_the_operation() {
        let manager = ProcessLock::new();
        let _other_client = manager
            .acquire("lock:k", AcquireTimeout::Forever)
            .await
            .unwrap();
        let lock = SessionLock::new("lock:k", Arc::new(manager.clone()));

        let ran = AtomicBool::new(false);
        let flag = &ran;
        let result = lock
            .run(AcquireTimeout::Within(Duration::from_millis(10)), || async move {
                flag.store(true, Ordering::SeqCst);
            })
            .await;

        assert!(result.unwrap_err().is_acquire_failure());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn distinct_locks_do_not_count_as_held() {
        let a = Arc::new(SessionLock::new("lock:a", Arc::new(NoOpLock)));
        let b = SessionLock::new("lock:b", Arc::new(NoOpLock));

        let b = &b;
        let held = a
            .run(AcquireTimeout::Forever, || async move {
                b.is_held_by_current_task()
            })
            .await
            .unwrap();

        assert!(!held);
    }

    /// Counts operations inside a critical section, remembering the peak
    #[derive(Clone, Default)]
    struct Occupancy {
        inside: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    impl Occupancy {
        async fn occupy(&self, duration: Duration) {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(duration).await;
            self.inside.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        fn finished(&self) -> usize {
            self.finished.load(Ordering::SeqCst)
        }
    }

    fn occupy_in_background(
        lock: &Arc<SessionLock>,
        occupancy: &Occupancy,
        duration: Duration,
    ) -> tokio::task::JoinHandle<Result<(), LockError>> {
        let lock = lock.clone();
        let occupancy = occupancy.clone();
        tokio::spawn(async move {
            lock.run(AcquireTimeout::Forever, || async move {
                occupancy.occupy(duration).await
            })
            .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn late_arrivals_wait_for_queued_operations() {
        let lock = Arc::new(SessionLock::new("lock:k", Arc::new(NoOpLock)));
        let occupancy = Occupancy::default();

        let first = occupy_in_background(&lock, &occupancy, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = occupy_in_background(&lock, &occupancy, Duration::from_millis(50));

        // Arrives after the first finished, while the second still runs.
        tokio::time::sleep(Duration::from_millis(70)).await;
        let third = occupy_in_background(&lock, &occupancy, Duration::from_millis(50));

        for task in [first, second, third] {
            task.await.unwrap().unwrap();
        }

        assert_eq!(occupancy.finished(), 3);
        assert_eq!(occupancy.peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_holder_keeps_the_lock_until_queued_work_finishes() {
        let manager = ProcessLock::new();
        let lock = Arc::new(SessionLock::new("lock:k", Arc::new(manager.clone())));
        let occupancy = Occupancy::default();
        let (entered_tx, entered_rx) = oneshot::channel();

        let holder = {
            let lock = lock.clone();
            tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_millis(50),
                    lock.run(AcquireTimeout::Forever, || async move {
                        let _ = entered_tx.send(());
                        std::future::pending::<()>().await
                    }),
                )
                .await
            })
        };
        entered_rx.await.unwrap();

        let queued = occupy_in_background(&lock, &occupancy, Duration::from_millis(100));
        assert!(holder.await.unwrap().is_err());

        // The queued operation now runs on its own, still under the lock.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            manager.acquire("lock:k", AcquireTimeout::Immediate).await,
            Err(LockError::Busy { .. })
        ));

        let late = occupy_in_background(&lock, &occupancy, Duration::from_millis(10));
        queued.await.unwrap().unwrap();
        late.await.unwrap().unwrap();

        assert_eq!(occupancy.finished(), 2);
        assert_eq!(occupancy.peak(), 1);
        assert!(manager
            .acquire("lock:k", AcquireTimeout::Immediate)
            .await
            .is_ok());
    }
}
