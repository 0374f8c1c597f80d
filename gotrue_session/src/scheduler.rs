//! Background refresh of the stored session
//!
//! While running, the scheduler wakes up every
//! [`AUTO_REFRESH_TICK_DURATION`] and refreshes the session once it is within
//! [`AUTO_REFRESH_TICK_THRESHOLD`] ticks of expiring. In an interactive
//! environment it only runs while the application is visible.

use std::{error, fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    client::{AuthClient, Inner},
    config::Visibility,
    lock::AcquireTimeout,
    session::{AUTO_REFRESH_TICK_DURATION, AUTO_REFRESH_TICK_THRESHOLD},
    AuthError,
};

/// Handles of the tasks a client runs in the background
///
/// Every task is aborted when the client goes away.
#[derive(Default)]
pub(crate) struct BackgroundTasks {
    ticker: Mutex<Option<JoinHandle<()>>>,
    visibility: Mutex<Option<JoinHandle<()>>>,
    broadcast: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("ticker", &self.ticker.lock().is_some())
            .field("visibility", &self.visibility.lock().is_some())
            .field("broadcast", &self.broadcast.lock().is_some())
            .finish()
    }
}

impl BackgroundTasks {
    pub(crate) fn set_broadcast(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.broadcast.lock().replace(handle) {
            previous.abort();
        }
    }

    fn set_ticker(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_ticker(&self) -> bool {
        match self.ticker.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn is_ticking(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    fn set_visibility(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.visibility.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_visibility(&self) {
        if let Some(handle) = self.visibility.lock().take() {
            tracing::debug!("no longer following application visibility");
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for slot in [&self.ticker, &self.visibility, &self.broadcast] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

impl AuthClient {
    /// Starts the background refresh scheduler
    ///
    /// The scheduler no longer follows application visibility afterwards.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    pub fn start_auto_refresh(&self) {
        self.inner.tasks.stop_visibility();
        self.inner.start_ticker();
    }

    /// Stops the background refresh scheduler
    ///
    /// The scheduler no longer follows application visibility afterwards.
    pub fn stop_auto_refresh(&self) {
        self.inner.tasks.stop_visibility();
        self.inner.stop_ticker();
    }

    /// Whether the background refresh scheduler is running
    pub fn is_auto_refreshing(&self) -> bool {
        self.inner.tasks.is_ticking()
    }
}

impl Inner {
    pub(crate) fn start_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(AUTO_REFRESH_TICK_DURATION);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.ensure_initialized().await.is_ok() {
                    inner.auto_refresh_tick().await;
                }
            }
        });

        self.tasks.set_ticker(handle);
        tracing::debug!("auto refresh started");
    }

    pub(crate) fn stop_ticker(&self) {
        if self.tasks.stop_ticker() {
            tracing::debug!("auto refresh stopped");
        }
    }

    /// Runs one scheduler tick
    ///
    /// Skips the tick if another party holds the session lock.
    pub(crate) async fn auto_refresh_tick(self: &Arc<Self>) {
        let tick = async {
            self.locked(AcquireTimeout::Immediate, || async {
                let now = self.clock.now_ms();
                let Some(session) = self.load_session().await? else {
                    tracing::trace!("no session to refresh");
                    return Ok(());
                };

                let Some(ticks) = session.ticks_until_expiry(now, AUTO_REFRESH_TICK_DURATION)
                else {
                    return Ok(());
                };
                tracing::trace!(ticks, "auto refresh tick");

                if ticks <= i64::from(AUTO_REFRESH_TICK_THRESHOLD) {
                    self.call_refresh_token(session.refresh_token()).await?;
                }
                Ok(())
            })
            .await
        };

        let outcome: Result<(), AuthError> = match self.tick_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, tick).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(?deadline, "auto refresh tick exceeded its deadline");
                    return;
                }
            },
            None => tick.await,
        };

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_lock_acquire_failure() => {
                tracing::debug!("session lock is busy, skipping auto refresh tick");
            }
            Err(err) => {
                tracing::warn!(
                    error = (&err as &dyn error::Error),
                    "auto refresh tick failed"
                );
            }
        }
    }

    /// Starts the scheduler according to the environment
    ///
    /// Called once, at the end of initialization.
    pub(crate) fn handle_visibility(self: &Arc<Self>) {
        let Some(mut visibility) = self.visibility.clone() else {
            if self.auto_refresh_token {
                self.start_ticker();
            }
            return;
        };

        let current = *visibility.borrow_and_update();
        self.apply_visibility(current);

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while visibility.changed().await.is_ok() {
                let current = *visibility.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_visibility_changed(current).await;
            }
        });
        self.tasks.set_visibility(handle);
    }

    fn apply_visibility(self: &Arc<Self>, visibility: Visibility) {
        if !self.auto_refresh_token {
            return;
        }
        match visibility {
            Visibility::Visible => self.start_ticker(),
            Visibility::Hidden => self.stop_ticker(),
        }
    }

    async fn on_visibility_changed(self: &Arc<Self>, visibility: Visibility) {
        tracing::debug!(?visibility, "application visibility changed");
        self.apply_visibility(visibility);
        if visibility != Visibility::Visible || self.ensure_initialized().await.is_err() {
            return;
        }

        let recovered = self
            .locked(AcquireTimeout::Forever, || async {
                if !self.is_visible() {
                    tracing::debug!("hidden again before recovery, skipping");
                    return Ok(());
                }
                self.recover_and_refresh().await
            })
            .await;

        if let Err(err) = recovered {
            tracing::warn!(
                error = (&err as &dyn error::Error),
                "unable to recover the session after becoming visible"
            );
        }
    }

    fn is_visible(&self) -> bool {
        self.visibility
            .as_ref()
            .map_or(true, |visibility| *visibility.borrow() == Visibility::Visible)
    }
}
