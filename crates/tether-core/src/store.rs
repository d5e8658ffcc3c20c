//! Persisted per-account artifacts: the sentry file, the login key and the
//! cell identifier.
//!
//! The controller only ever sees these as bytes and fields through
//! [`ArtifactStore`]. [`MemoryStore`] keeps everything in process;
//! [`FileStore`] keeps a small JSON database next to the raw sentry file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Storage for artifacts that survive restarts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Returns the sentry file contents, if one exists.
    async fn read_sentry(&self) -> StoreResult<Option<Vec<u8>>>;

    /// Writes `data` at `offset` into the sentry file, creating it when
    /// missing, and returns the complete file contents afterwards.
    async fn write_sentry(&self, offset: u64, data: &[u8]) -> StoreResult<Vec<u8>>;

    async fn delete_sentry(&self) -> StoreResult<()>;

    async fn login_key(&self) -> Option<String>;

    /// Replaces (or with `None`, removes) the persisted login key.
    async fn set_login_key(&self, key: Option<String>) -> StoreResult<()>;

    /// Last cell identifier reported by the service, or 0.
    async fn cell_id(&self) -> u32;

    async fn set_cell_id(&self, cell_id: u32) -> StoreResult<()>;
}

/// Largest sentry file a store accepts.
pub const MAX_SENTRY_SIZE: u64 = 4 * 1024 * 1024;

/// Writes `data` into `file` at `offset`, zero-filling any gap.
fn splice(file: &mut Vec<u8>, offset: u64, data: &[u8]) -> StoreResult<()> {
    let size = offset.saturating_add(data.len() as u64);
    if size > MAX_SENTRY_SIZE {
        return Err(StoreError::SentryTooLarge { size });
    }

    let start = offset as usize;
    let end = start + data.len();
    if file.len() < end {
        file.resize(end, 0);
    }
    file[start..end].copy_from_slice(data);
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Database {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    login_key: Option<String>,
    #[serde(default)]
    cell_id: u32,
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sentry: Mutex<Option<Vec<u8>>>,
    database: Mutex<Database>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn read_sentry(&self) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.sentry.lock().clone())
    }

    async fn write_sentry(&self, offset: u64, data: &[u8]) -> StoreResult<Vec<u8>> {
        let mut sentry = self.sentry.lock();
        let file = sentry.get_or_insert_with(Vec::new);
        splice(file, offset, data)?;
        Ok(file.clone())
    }

    async fn delete_sentry(&self) -> StoreResult<()> {
        *self.sentry.lock() = None;
        Ok(())
    }

    async fn login_key(&self) -> Option<String> {
        self.database.lock().login_key.clone()
    }

    async fn set_login_key(&self, key: Option<String>) -> StoreResult<()> {
        self.database.lock().login_key = key;
        Ok(())
    }

    async fn cell_id(&self) -> u32 {
        self.database.lock().cell_id
    }

    async fn set_cell_id(&self, cell_id: u32) -> StoreResult<()> {
        self.database.lock().cell_id = cell_id;
        Ok(())
    }
}

// =============================================================================
// File Store
// =============================================================================

/// Store backed by `<dir>/<name>.db` (JSON) and `<dir>/<name>.bin` (sentry).
#[derive(Debug)]
pub struct FileStore {
    database_path: PathBuf,
    sentry_path: PathBuf,
    database: Mutex<Database>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Opens (or prepares) the store for account `name` under `dir`.
    ///
    /// An unreadable database is logged and replaced by an empty one.
    pub async fn open(dir: impl AsRef<Path>, name: &str) -> StoreResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let database_path = dir.join(format!("{name}.db"));
        let sentry_path = dir.join(format!("{name}.bin"));

        let database = match tokio::fs::read(&database_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %database_path.display(), error = %e, "Discarding unreadable database");
                Database::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Database::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %database_path.display(), "Opened artifact store");

        Ok(Self {
            database_path,
            sentry_path,
            database: Mutex::new(database),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn save(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(&*self.database.lock())?;
        tokio::fs::write(&self.database_path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FileStore {
    async fn read_sentry(&self) -> StoreResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.sentry_path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_sentry(&self, offset: u64, data: &[u8]) -> StoreResult<Vec<u8>> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read_sentry().await?.unwrap_or_default();
        splice(&mut file, offset, data)?;
        tokio::fs::write(&self.sentry_path, &file).await?;
        Ok(file)
    }

    async fn delete_sentry(&self) -> StoreResult<()> {
        match tokio::fs::remove_file(&self.sentry_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn login_key(&self) -> Option<String> {
        self.database.lock().login_key.clone()
    }

    async fn set_login_key(&self, key: Option<String>) -> StoreResult<()> {
        {
            let mut database = self.database.lock();
            if database.login_key == key {
                return Ok(());
            }
            database.login_key = key;
        }
        self.save().await
    }

    async fn cell_id(&self) -> u32 {
        self.database.lock().cell_id
    }

    async fn set_cell_id(&self, cell_id: u32) -> StoreResult<()> {
        {
            let mut database = self.database.lock();
            if database.cell_id == cell_id {
                return Ok(());
            }
            database.cell_id = cell_id;
        }
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tether-store-{tag}-{}", std::process::id()))
    }

    #[test]
    fn test_splice_extends_and_overwrites() {
        let mut file = vec![1, 2, 3];
        splice(&mut file, 2, &[9, 9]).unwrap();
        assert_eq!(file, vec![1, 2, 9, 9]);

        splice(&mut file, 6, &[7]).unwrap();
        assert_eq!(file, vec![1, 2, 9, 9, 0, 0, 7]);
    }

    #[tokio::test]
    async fn test_oversized_sentry_write_is_rejected() {
        let store = MemoryStore::new();
        store.write_sentry(0, b"abc").await.unwrap();

        let result = store.write_sentry(u64::MAX - 1, b"xyz").await;
        assert!(matches!(result, Err(StoreError::SentryTooLarge { .. })));

        let result = store.write_sentry(MAX_SENTRY_SIZE, b"x").await;
        assert!(matches!(
            result,
            Err(StoreError::SentryTooLarge { size }) if size == MAX_SENTRY_SIZE + 1
        ));

        assert_eq!(store.read_sentry().await.unwrap().as_deref(), Some(&b"abc"[..]));
    }

    #[tokio::test]
    async fn test_memory_store_sentry_lifecycle() {
        let store = MemoryStore::new();
        assert!(store.read_sentry().await.unwrap().is_none());

        let full = store.write_sentry(0, b"abc").await.unwrap();
        assert_eq!(full, b"abc");

        store.delete_sentry().await.unwrap();
        assert!(store.read_sentry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = temp_dir("reopen");
        let _ = tokio::fs::remove_dir_all(&dir).await;

        {
            let store = FileStore::open(&dir, "account").await.unwrap();
            store.set_login_key(Some("key".into())).await.unwrap();
            store.set_cell_id(42).await.unwrap();
            store.write_sentry(0, b"sentry").await.unwrap();
        }

        let store = FileStore::open(&dir, "account").await.unwrap();
        assert_eq!(store.login_key().await.as_deref(), Some("key"));
        assert_eq!(store.cell_id().await, 42);
        assert_eq!(store.read_sentry().await.unwrap().as_deref(), Some(&b"sentry"[..]));

        store.delete_sentry().await.unwrap();
        store.delete_sentry().await.unwrap();
        assert!(store.read_sentry().await.unwrap().is_none());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_file_store_ignores_corrupt_database() {
        let dir = temp_dir("corrupt");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("account.db"), b"{not json").await.unwrap();

        let store = FileStore::open(&dir, "account").await.unwrap();
        assert!(store.login_key().await.is_none());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
