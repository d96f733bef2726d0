//! Object storage readers.
//!
//! Source files are addressed by [`FileRef`]: a path plus the connection the
//! path belongs to. Bucket URIs (`s3://bucket/key`, `gs://bucket/key`) are
//! resolved relative to the store's base path, so a local directory can
//! stand in for a bucket.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ObjectStoreError;
use crate::warehouse::{ConnectionId, FileRef};

/// Read-only access to source objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Connection identity this store serves.
    fn connection(&self) -> &ConnectionId;

    /// Reads the whole object.
    async fn read(&self, file: &FileRef) -> Result<Vec<u8>, ObjectStoreError>;

    /// Rejects files on other connections.
    fn check_connection(&self, file: &FileRef) -> Result<(), ObjectStoreError> {
        if &file.conn != self.connection() {
            return Err(ObjectStoreError::UnknownConnection {
                expected: self.connection().to_string(),
                actual: file.conn.to_string(),
            });
        }
        Ok(())
    }
}

/// Splits a bucket URI into a relative path: `s3://bucket/a/b.csv` becomes
/// `bucket/a/b.csv`. Plain paths are kept as they are.
///
/// Paths escaping the store root (`..`) or absolute paths are rejected.
pub fn object_key(path: &str) -> Result<PathBuf, ObjectStoreError> {
    let relative = match path.split_once("://") {
        Some((_scheme, rest)) => rest,
        None => path,
    };

    let key = PathBuf::from(relative);
    let escapes = key
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(ObjectStoreError::InvalidPath(path.to_string()));
    }
    Ok(key)
}

/// Object store backed by a local directory.
pub struct LocalObjectStore {
    conn: ConnectionId,
    base_path: PathBuf,
}

impl LocalObjectStore {
    /// Creates a store serving `conn` from files under `base_path`.
    pub fn new(base_path: impl Into<PathBuf>, conn: impl Into<ConnectionId>) -> Self {
        Self {
            conn: conn.into(),
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Location of `file` on disk.
    pub fn resolve(&self, file: &FileRef) -> Result<PathBuf, ObjectStoreError> {
        Ok(self.base_path.join(object_key(&file.path)?))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn connection(&self) -> &ConnectionId {
        &self.conn
    }

    async fn read(&self, file: &FileRef) -> Result<Vec<u8>, ObjectStoreError> {
        self.check_connection(file)?;
        let location = self.resolve(file)?;
        match fs::read(&location).await {
            Ok(bytes) => {
                debug!(path = %location.display(), bytes = bytes.len(), "Read object");
                Ok(bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(file.path.clone()))
            }
            Err(e) => Err(ObjectStoreError::Io(e)),
        }
    }
}

/// Object store holding objects in memory, keyed by path.
pub struct MemoryObjectStore {
    conn: ConnectionId,
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new(conn: impl Into<ConnectionId>) -> Self {
        Self {
            conn: conn.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Stores `bytes` under `path`, replacing any previous object.
    pub async fn put(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.write().await.insert(path.into(), bytes.into());
    }

    pub async fn remove(&self, path: &str) -> bool {
        self.objects.write().await.remove(path).is_some()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn connection(&self) -> &ConnectionId {
        &self.conn
    }

    async fn read(&self, file: &FileRef) -> Result<Vec<u8>, ObjectStoreError> {
        self.check_connection(file)?;
        self.objects
            .read()
            .await
            .get(&file.path)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(file.path.clone()))
    }
}
