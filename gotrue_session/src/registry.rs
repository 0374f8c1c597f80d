//! State shared by every client of the process
//!
//! Clients configured with the same storage key cooperate through the registry:
//! they share in-process locks, a broadcast channel and the JWKS cache. Tests
//! create isolated registries so they do not observe each other.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use gotrue_clock::UnixTimeMs;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{broadcast::BroadcastMessage, jwt::Jwks, lock::ProcessLock};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub(crate) struct CachedJwks {
    pub(crate) jwks: Arc<Jwks>,
    pub(crate) cached_at: UnixTimeMs,
}

#[derive(Debug, Default)]
struct RegistryInner {
    jwks: Mutex<HashMap<String, CachedJwks>>,
    locks: ProcessLock,
    channels: Mutex<HashMap<String, broadcast::Sender<BroadcastMessage>>>,
    next_instance_id: AtomicU64,
}

/// A handle to process-wide client state
///
/// Clones refer to the same registry.
#[derive(Clone, Debug, Default)]
pub struct SharedRegistry {
    inner: Arc<RegistryInner>,
}

impl SharedRegistry {
    /// Creates a registry isolated from every other one
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by default between all clients of the process
    pub fn global() -> Self {
        static GLOBAL: OnceLock<SharedRegistry> = OnceLock::new();
        GLOBAL.get_or_init(SharedRegistry::new).clone()
    }

    /// Allocates a process-unique client instance identifier
    pub fn next_instance_id(&self) -> u64 {
        self.inner.next_instance_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The in-process lock table
    pub fn process_lock(&self) -> ProcessLock {
        self.inner.locks.clone()
    }

    /// The in-process broadcast channel for `storage_key`, created on first use
    pub(crate) fn channel(&self, storage_key: &str) -> broadcast::Sender<BroadcastMessage> {
        self.inner
            .channels
            .lock()
            .entry(storage_key.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub(crate) fn cached_jwks(&self, storage_key: &str) -> Option<CachedJwks> {
        self.inner.jwks.lock().get(storage_key).cloned()
    }

    pub(crate) fn store_jwks(&self, storage_key: &str, jwks: Arc<Jwks>, cached_at: UnixTimeMs) {
        self.inner
            .jwks
            .lock()
            .insert(storage_key.to_owned(), CachedJwks { jwks, cached_at });
    }
}
