//! Where uploaded bytes end up.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{
    path::Path as ObjectPath, Attribute, AttributeValue, Attributes, ObjectStore,
    ObjectStoreExt, PutOptions, PutPayload,
};
use tokio::sync::RwLock;

use crate::{media_type, storage};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("asset {0} not found")]
    NotFound(String),
    #[error("invalid asset key {0:?}")]
    InvalidKey(String),
    #[error(transparent)]
    Storage(#[from] storage::Error),
    #[error("io {0}")]
    Io(#[from] io::Error),
    #[error("object store {0}")]
    Backend(#[from] object_store::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<()>;

    /// Stores a file already on disk. Backends that can avoid buffering it
    /// should override this.
    async fn put_file(&self, key: &str, content_type: &str, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path).await?;
        self.put(key, content_type, Bytes::from(data)).await
    }

    async fn get(&self, key: &str) -> Result<StoredAsset>;

    async fn delete(&self, key: &str) -> Result<()>;
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Process-local store, nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    assets: RwLock<HashMap<String, StoredAsset>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.assets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.assets.read().await.is_empty()
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<()> {
        validate_key(key)?;
        let asset = StoredAsset {
            content_type: Some(content_type.to_string()),
            data,
        };
        self.assets.write().await.insert(key.to_string(), asset);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredAsset> {
        self.assets
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.assets.write().await.remove(key);
        Ok(())
    }
}

/// Files under the assets root, which the HTTP layer serves at `/assets`.
/// Content types aren't persisted; reads derive them from the key's extension.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn prepare(&self, key: &str) -> Result<PathBuf> {
        let path = self.path(key)?;
        storage::ensure_storage_root(&self.root).await?;
        if let Some(parent) = path.parent() {
            if parent != self.root {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl AssetStore for DiskStore {
    async fn put(&self, key: &str, _content_type: &str, data: Bytes) -> Result<()> {
        let path = self.prepare(key).await?;
        tokio::fs::write(&path, &data).await?;
        tracing::debug!(path = %path.display(), size = data.len(), "wrote asset");
        Ok(())
    }

    async fn put_file(&self, key: &str, _content_type: &str, source: &Path) -> Result<()> {
        let path = self.prepare(key).await?;
        let size = tokio::fs::copy(source, &path).await?;
        tracing::debug!(path = %path.display(), size, "copied asset");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredAsset> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(StoredAsset {
                content_type: media_type::known_type_for(key).map(str::to_string),
                data: Bytes::from(data),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// Any `object_store` backend; S3 in production.
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn s3(bucket: &str, region: &str) -> Result<Self> {
        let store = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region)
            .build()?;
        Ok(Self::new(Arc::new(store)))
    }
}

#[async_trait]
impl AssetStore for ObjectStorage {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<()> {
        validate_key(key)?;
        let location = ObjectPath::from(key);
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );
        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        let size = data.len();
        self.store
            .put_opts(&location, PutPayload::from(data), options)
            .await?;
        tracing::debug!(key, size, "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredAsset> {
        let location = ObjectPath::from(key);
        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::NotFound(key.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|value| <AttributeValue as AsRef<str>>::as_ref(value).to_string());
        let data = result.bytes().await?;
        Ok(StoredAsset { content_type, data })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn AssetStore) {
        let key = "landscape/abc123.mp4";
        store
            .put(key, "video/mp4", Bytes::from_static(b"moov"))
            .await
            .unwrap();
        assert_eq!(store.get(key).await.unwrap().data, Bytes::from_static(b"moov"));

        store.delete(key).await.unwrap();
        assert!(matches!(store.get(key).await, Err(Error::NotFound(_))));
        // deleting twice is fine
        store.delete(key).await.unwrap();
    }

    #[tokio::test]
    async fn memory_store() {
        let store = MemoryStore::new();
        exercise(&store).await;
        store
            .put("abc.png", "image/png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        let asset = store.get("abc.png").await.unwrap();
        assert_eq!(asset.content_type.as_deref(), Some("image/png"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("assets");
        let store = DiskStore::new(&root);
        exercise(&store).await;

        store
            .put("abc.jpeg", "image/jpeg", Bytes::from_static(b"jpg"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(root.join("abc.jpeg")).unwrap(), b"jpg");
        let asset = store.get("abc.jpeg").await.unwrap();
        assert_eq!(asset.content_type.as_deref(), Some("image/jpeg"));

        let source = dir.path().join("upload.tmp");
        std::fs::write(&source, b"video bytes").unwrap();
        store.put_file("abc.mp4", "video/mp4", &source).await.unwrap();
        assert_eq!(std::fs::read(root.join("abc.mp4")).unwrap(), b"video bytes");
        let asset = store.get("abc.mp4").await.unwrap();
        assert_eq!(asset.content_type.as_deref(), Some("video/mp4"));

        std::fs::write(root.join("notes.txt"), b"hi").unwrap();
        assert_eq!(store.get("notes.txt").await.unwrap().content_type, None);
    }

    #[tokio::test]
    async fn object_storage() {
        let store = ObjectStorage::new(Arc::new(object_store::memory::InMemory::new()));
        exercise(&store).await;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("upload.tmp");
        std::fs::write(&source, b"video bytes").unwrap();
        store
            .put_file("portrait/xyz.mp4", "video/mp4", &source)
            .await
            .unwrap();
        let asset = store.get("portrait/xyz.mp4").await.unwrap();
        assert_eq!(asset.data, Bytes::from_static(b"video bytes"));
        assert_eq!(asset.content_type.as_deref(), Some("video/mp4"));
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        for key in ["../outside.png", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(
                    store.put(key, "image/png", Bytes::new()).await,
                    Err(Error::InvalidKey(_))
                ),
                "{key}"
            );
        }
    }
}
