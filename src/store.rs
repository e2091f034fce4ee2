//! Partition Store: whole-object get/put used for partition data, month
//! indexes and resumption state.
//!
//! Backends only need to tell "not found" apart from every other failure;
//! the sinks build append semantics on top with read-modify-write.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsS3SdkClient;
use bytes::Bytes;
use tracing::info;

use crate::config::S3Settings;
use crate::errors::StoreError;

#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Reads an entire object. Returns `StoreError::NotFound` if it doesn't exist.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Overwrites the object at `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: PartitionStore + ?Sized> PartitionStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        (**self).put(key, data).await
    }
}

/// `get` that maps a missing object to `None`.
pub async fn get_optional<S: PartitionStore + ?Sized>(
    store: &S,
    key: &str,
) -> Result<Option<Bytes>, StoreError> {
    match store.get(key).await {
        Ok(data) => Ok(Some(data)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// S3 (or S3-compatible) bucket backend.
pub struct S3Store {
    client: AwsS3SdkClient,
    bucket: String,
}

impl S3Store {
    pub fn new(client: AwsS3SdkClient, bucket: impl Into<String>) -> Self {
        S3Store {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the default credential chain. A custom endpoint
    /// switches to path-style addressing (MinIO, localstack).
    pub async fn from_settings(settings: &S3Settings) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let Some(endpoint) = &settings.endpoint {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if settings.endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        info!(bucket = %settings.bucket, region = %settings.region, "S3 store configured");
        S3Store::new(
            AwsS3SdkClient::from_conf(s3_config_builder.build()),
            settings.bucket.clone(),
        )
    }
}

#[async_trait]
impl PartitionStore for S3Store {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.into_service_error() {
                GetObjectError::NoSuchKey(_) => StoreError::NotFound(key.to_string()),
                other => StoreError::backend(key, format!("GetObject failed: {other}")),
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::backend(key, format!("failed to read object body: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StoreError::backend(key, format!("PutObject failed: {e}")))?;
        Ok(())
    }
}

/// Objects as files under a root directory; keys are relative paths.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStore { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl PartitionStore for FsStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(StoreError::backend(key, e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::backend(key, e))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| StoreError::backend(key, e))
    }
}

/// In-memory store. Thread-safe via `RwLock`; used for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
    puts: Arc<RwLock<Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording it as a put.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key.to_string(), data.into());
        }
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().ok()?.get(key).cloned()
    }

    /// Keys written through `put`, in call order.
    pub fn puts(&self) -> Vec<String> {
        self.puts.read().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PartitionStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| StoreError::backend(key, "lock poisoned"))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.objects
            .write()
            .map_err(|_| StoreError::backend(key, "lock poisoned"))?
            .insert(key.to_string(), data);
        self.puts
            .write()
            .map_err(|_| StoreError::backend(key, "lock poisoned"))?
            .push(key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_missing_key_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("did/2026/01/index").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(get_optional(&store, "did/2026/01/index").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_tracks_puts_but_not_seeds() {
        let store = MemoryStore::new();
        store.insert("seeded", "a");
        store.put("written", Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(store.puts(), vec!["written".to_string()]);
        assert_eq!(store.get("seeded").await.unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn fs_store_creates_parents_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        assert!(store.get("did/2026/01/02").await.unwrap_err().is_not_found());

        store
            .put("did/2026/01/02", Bytes::from_static(b"{}\n"))
            .await
            .unwrap();
        assert!(dir.path().join("did/2026/01/02").is_file());
        assert_eq!(
            store.get("did/2026/01/02").await.unwrap(),
            Bytes::from_static(b"{}\n")
        );
    }
}
