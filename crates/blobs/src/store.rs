use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectMeta, ObjectStore, PutOptions, PutPayload,
};
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(Path),
    #[error(transparent)]
    Store(#[from] object_store::Error),
}

/// Construction-time selection of the backing store, per the deployment.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    S3Compatible {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        allow_http: bool,
    },
    Filesystem {
        root: std::path::PathBuf,
    },
    Memory,
}

/// Clonable handle over the durable object store. A `put` acknowledges only
/// once the backing store has durably persisted the bytes, which is what the
/// admission path's receipt ordering relies on.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn ObjectStore>,
    // LocalFileSystem rejects object attributes; skip them there.
    supports_attributes: bool,
}

impl BlobStore {
    pub fn open(config: &StoreConfig) -> Result<Self, BlobError> {
        match config {
            StoreConfig::S3Compatible {
                bucket,
                region,
                endpoint,
                allow_http,
            } => {
                let mut builder = object_store::aws::AmazonS3Builder::from_env()
                    .with_bucket_name(bucket.as_str())
                    .with_allow_http(*allow_http);
                if let Some(region) = region {
                    builder = builder.with_region(region.as_str());
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint.as_str());
                }
                Ok(Self {
                    inner: Arc::new(builder.build()?),
                    supports_attributes: true,
                })
            }
            StoreConfig::Filesystem { root } => {
                let store = object_store::local::LocalFileSystem::new_with_prefix(root)?;
                Ok(Self {
                    inner: Arc::new(store),
                    supports_attributes: false,
                })
            }
            StoreConfig::Memory => Ok(Self::memory()),
        }
    }

    /// An in-memory store, for tests.
    pub fn memory() -> Self {
        Self {
            inner: Arc::new(object_store::memory::InMemory::new()),
            supports_attributes: true,
        }
    }

    fn attributes(&self, content_type: Option<&str>) -> Attributes {
        let mut attributes = Attributes::new();
        if self.supports_attributes {
            if let Some(content_type) = content_type {
                attributes.insert(
                    Attribute::ContentType,
                    AttributeValue::from(content_type.to_string()),
                );
            }
        }
        attributes
    }

    /// Durably write a fully buffered object.
    pub async fn put(
        &self,
        path: &Path,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), BlobError> {
        let opts = PutOptions {
            attributes: self.attributes(content_type),
            ..Default::default()
        };
        self.inner.put_opts(path, PutPayload::from(bytes), opts).await?;
        Ok(())
    }

    /// Open a streaming writer. The write is durable once the returned
    /// writer's `shutdown` completes; dropping it without shutdown aborts.
    pub fn open_writer(&self, path: &Path, content_type: Option<&str>) -> BufWriter {
        let writer = BufWriter::new(self.inner.clone(), path.clone());
        if self.supports_attributes {
            writer.with_attributes(self.attributes(content_type))
        } else {
            writer
        }
    }

    pub async fn get_bytes(&self, path: &Path) -> Result<Bytes, BlobError> {
        let result = self.inner.get(path).await.map_err(|err| wrap(err, path))?;
        Ok(result.bytes().await?)
    }

    pub async fn get_stream(
        &self,
        path: &Path,
    ) -> Result<BoxStream<'static, object_store::Result<Bytes>>, BlobError> {
        let result = self.inner.get(path).await.map_err(|err| wrap(err, path))?;
        Ok(result.into_stream())
    }

    pub async fn get_range(&self, path: &Path, range: Range<u64>) -> Result<Bytes, BlobError> {
        let range = range.start as usize..range.end as usize;
        self.inner
            .get_range(path, range)
            .await
            .map_err(|err| wrap(err, path))
    }

    pub async fn head(&self, path: &Path) -> Result<ObjectMeta, BlobError> {
        self.inner.head(path).await.map_err(|err| wrap(err, path))
    }

    pub async fn exists(&self, path: &Path) -> Result<bool, BlobError> {
        match self.head(path).await {
            Ok(_) => Ok(true),
            Err(BlobError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Atomic move; the destination replaces any prior object.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), BlobError> {
        self.inner.rename(from, to).await.map_err(|err| wrap(err, from))
    }

    pub async fn delete(&self, path: &Path) -> Result<(), BlobError> {
        match self.inner.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// List objects under a prefix. Off the hot path; used by the cleanup
    /// sweep to garbage-collect abandoned staging objects.
    pub async fn list_prefix(&self, prefix: &Path) -> Result<Vec<ObjectMeta>, BlobError> {
        use futures::TryStreamExt;
        let metas = self.inner.list(Some(prefix)).try_collect::<Vec<_>>().await?;
        Ok(metas)
    }

    /// Verify the store accepts writes: put, head, and delete a probe
    /// object. Run at boot when a durable store is required.
    pub async fn probe(&self) -> Result<(), BlobError> {
        let path = crate::keys::healthcheck();
        self.put(&path, Bytes::from_static(b"ok"), None).await?;
        self.head(&path).await?;
        self.delete(&path).await?;
        Ok(())
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlobStore({})", self.inner)
    }
}

fn wrap(err: object_store::Error, path: &Path) -> BlobError {
    match err {
        object_store::Error::NotFound { .. } => BlobError::NotFound(path.clone()),
        other => BlobError::Store(other),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn put_head_get_round_trip() {
        let store = BlobStore::memory();
        let path = Path::from("raw/abc");
        store
            .put(&path, Bytes::from_static(b"hello"), Some("text/plain"))
            .await
            .unwrap();

        let meta = store.head(&path).await.unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(store.get_bytes(&path).await.unwrap().as_ref(), b"hello");
        assert_eq!(store.get_range(&path, 1..3).await.unwrap().as_ref(), b"el");
    }

    #[tokio::test]
    async fn rename_moves_object() {
        let store = BlobStore::memory();
        let from = Path::from("raw/staging/x");
        let to = Path::from("quarantine/raw/x");
        store.put(&from, Bytes::from_static(b"bad"), None).await.unwrap();

        store.rename(&from, &to).await.unwrap();
        assert!(!store.exists(&from).await.unwrap());
        assert_eq!(store.get_bytes(&to).await.unwrap().as_ref(), b"bad");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = BlobStore::memory();
        let path = Path::from("raw/missing");
        assert!(matches!(
            store.get_bytes(&path).await,
            Err(BlobError::NotFound(_))
        ));
        assert!(!store.exists(&path).await.unwrap());
        // Deleting a missing object is not an error.
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn streaming_writer_is_readable_after_shutdown() {
        let store = BlobStore::memory();
        let path = Path::from("bundle/xyz/payload");

        let mut writer = store.open_writer(&path, None);
        writer.write_all(b"part one, ").await.unwrap();
        writer.write_all(b"part two").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(
            store.get_bytes(&path).await.unwrap().as_ref(),
            b"part one, part two"
        );
    }

    #[tokio::test]
    async fn filesystem_variant_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(&StoreConfig::Filesystem {
            root: dir.path().to_path_buf(),
        })
        .unwrap();

        let path = Path::from("raw/on-disk");
        store.put(&path, Bytes::from_static(b"data"), None).await.unwrap();
        assert_eq!(store.get_bytes(&path).await.unwrap().as_ref(), b"data");
        store.probe().await.unwrap();
    }
}
