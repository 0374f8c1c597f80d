//! Storage keeping one file per key

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::fs::OpenOptions;

use super::{AsyncStorage, StorageError};

/// Turns a storage key into a file name that is safe on every platform
///
/// Characters outside `[A-Za-z0-9._-]` are percent-encoded so distinct keys
/// never collide.
pub(crate) fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                stem.push(char::from(byte))
            }
            other => stem.push_str(&format!("%{:02X}", other)),
        }
    }
    stem
}

/// Storage backed by a directory on the local filesystem
///
/// Each key is stored in its own file, readable only by the owner on unix.
#[derive(Clone, Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Constructs a store writing into `dir`
    ///
    /// The directory is created on first write if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the entries
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }

    async fn read(&self, key: &str) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write(&self, key: &str, value: &str) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;

        tokio::fs::create_dir_all(&self.dir).await?;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(self.path_for(key)).await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl AsyncStorage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read(key).await?)
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        Ok(self.write(key, value).await?)
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        Ok(self.remove(key).await?)
    }
}
