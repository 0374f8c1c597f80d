//! Key/value persistence for sessions

use std::error;

use async_trait::async_trait;

#[cfg(feature = "file")]
pub mod file;
mod memory;

#[cfg(feature = "file")]
pub use file::FileStorage;
pub use memory::MemoryStorage;

/// The error returned by a storage adapter
pub type StorageError = Box<dyn error::Error + Send + Sync + 'static>;

/// An asynchronous string key/value store
///
/// Missing keys read as `None` and removing a missing key succeeds.
#[async_trait]
pub trait AsyncStorage: Send + Sync {
    /// Reads the value stored under `key`
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, replacing any previous value
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes the value stored under `key`
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Whether values read from this storage may have been written by an
    /// untrusted party (for example a cookie sent by a browser to a server)
    fn is_server(&self) -> bool {
        false
    }
}
