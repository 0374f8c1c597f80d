use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AsyncStorage, StorageError};

/// Storage that lives only as long as the process
///
/// Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    items: Arc<Mutex<HashMap<String, String>>>,
    server: bool,
}

impl MemoryStorage {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks values read from this store as untrusted
    pub fn as_server(mut self) -> Self {
        self.server = true;
        self
    }

    /// Copies out every stored entry
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.items.lock().clone()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[async_trait]
impl AsyncStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().remove(key);
        Ok(())
    }

    fn is_server(&self) -> bool {
        self.server
    }
}
