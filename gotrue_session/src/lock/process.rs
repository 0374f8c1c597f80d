use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AcquireTimeout, LockError, LockManager, LockTicket};

/// Named locks shared by every client in the current process
///
/// Waiters are served in FIFO order. Clones share the same lock table, so two
/// clients holding clones of one `ProcessLock` exclude each other.
#[derive(Clone, Debug, Default)]
pub struct ProcessLock {
    table: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ProcessLock {
    /// Constructs an empty, isolated lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.table
            .lock()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl LockManager for ProcessLock {
    async fn acquire(&self, name: &str, timeout: AcquireTimeout) -> Result<LockTicket, LockError> {
        let mutex = self.entry(name);
        let guard = match timeout {
            AcquireTimeout::Immediate => mutex.try_lock_owned().map_err(|_| LockError::Busy {
                name: name.to_owned(),
            })?,
            _ => timeout.run(name, mutex.lock_owned()).await?,
        };

        Ok(LockTicket::new(name, guard))
    }
}
