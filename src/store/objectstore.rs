//! [`RawStore`] adapter over the `object_store` crate, for running the data
//! plane against its backends: per-bucket GCS stores, a local directory tree,
//! or memory.
//!
//! The `object_store` API has no control plane, and its paths cannot carry a
//! trailing delimiter. Bucket administration, compose, metadata patches and
//! custom attributes are therefore `Unsupported` here, and directory
//! placeholders lose their trailing delimiter on this backend. Full-fidelity
//! semantics live in [`crate::store::InMemoryStore`]; this adapter exists for
//! reading and writing plain file objects against real storage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{GetOptions, GetRange, ObjectStore, PutMode, PutOptions, UpdateVersion};

use crate::error::StoreError;
use crate::resource::PATH_DELIMITER;
use crate::store::raw::{
    InsertPrecondition, InsertSpec, RawBucket, RawListing, RawObject, RawStore,
};

#[derive(Debug, Clone)]
pub enum ObjectStoreBackend {
    Memory,
    /// Buckets are directories under the base path.
    Local(PathBuf),
    /// One GCS store per bucket, configured from the environment.
    Gcs,
}

pub struct ObjectStoreAdapter {
    backend: ObjectStoreBackend,
    stores: RwLock<HashMap<String, std::sync::Arc<dyn ObjectStore>>>,
}

impl ObjectStoreAdapter {
    pub fn new(backend: ObjectStoreBackend) -> ObjectStoreAdapter {
        ObjectStoreAdapter { backend, stores: RwLock::new(HashMap::new()) }
    }

    pub fn memory() -> ObjectStoreAdapter {
        ObjectStoreAdapter::new(ObjectStoreBackend::Memory)
    }

    pub fn local(base: impl Into<PathBuf>) -> ObjectStoreAdapter {
        ObjectStoreAdapter::new(ObjectStoreBackend::Local(base.into()))
    }

    pub fn gcs() -> ObjectStoreAdapter {
        ObjectStoreAdapter::new(ObjectStoreBackend::Gcs)
    }

    fn store_for(&self, bucket: &str) -> Result<std::sync::Arc<dyn ObjectStore>, StoreError> {
        if let Some(store) = self.stores.read().expect("adapter lock").get(bucket) {
            return Ok(std::sync::Arc::clone(store));
        }
        let store: std::sync::Arc<dyn ObjectStore> = match &self.backend {
            ObjectStoreBackend::Memory => std::sync::Arc::new(InMemory::new()),
            ObjectStoreBackend::Local(base) => {
                let root = base.join(bucket);
                std::fs::create_dir_all(&root)?;
                std::sync::Arc::new(LocalFileSystem::new_with_prefix(&root)?)
            }
            ObjectStoreBackend::Gcs => std::sync::Arc::new(
                GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket).build()?,
            ),
        };
        let mut stores = self.stores.write().expect("adapter lock");
        Ok(std::sync::Arc::clone(stores.entry(bucket.to_string()).or_insert(store)))
    }

    fn bucket_known(&self, bucket: &str) -> Result<bool, StoreError> {
        match &self.backend {
            ObjectStoreBackend::Memory => {
                Ok(self.stores.read().expect("adapter lock").contains_key(bucket))
            }
            ObjectStoreBackend::Local(base) => Ok(base.join(bucket).is_dir()),
            ObjectStoreBackend::Gcs => {
                Err(StoreError::Unsupported("bucket lookup on the object_store backend"))
            }
        }
    }

    fn object_path(name: &str) -> Result<Path, StoreError> {
        Path::parse(name.trim_end_matches(PATH_DELIMITER))
            .map_err(|error| StoreError::Fatal(format!("unrepresentable object name: {error}")))
    }

    fn raw_object(bucket: &str, meta: &object_store::ObjectMeta) -> RawObject {
        RawObject {
            bucket: bucket.to_string(),
            name: meta.location.as_ref().to_string(),
            size: meta.size as u64,
            generation: meta
                .version
                .as_deref()
                .and_then(|version| version.parse().ok())
                .unwrap_or(0),
            creation_time: meta.last_modified,
            content_type: None,
            content_encoding: None,
            storage_class: None,
            metadata: HashMap::new(),
        }
    }
}

impl From<object_store::Error> for StoreError {
    fn from(error: object_store::Error) -> StoreError {
        match error {
            object_store::Error::NotFound { .. } => StoreError::NotFound(error.to_string()),
            object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. } => {
                StoreError::PreconditionFailed(error.to_string())
            }
            object_store::Error::NotImplemented => {
                StoreError::Unsupported("operation not implemented by the object_store backend")
            }
            object_store::Error::Generic { .. } => StoreError::Transient(error.to_string()),
            other => StoreError::Fatal(other.to_string()),
        }
    }
}

#[async_trait]
impl RawStore for ObjectStoreAdapter {
    async fn get_object(&self, bucket: &str, name: &str) -> Result<Option<RawObject>, StoreError> {
        let store = self.store_for(bucket)?;
        match store.head(&Self::object_path(name)?).await {
            Ok(meta) => Ok(Some(Self::raw_object(bucket, &meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn insert_object(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
        spec: &InsertSpec,
    ) -> Result<RawObject, StoreError> {
        let store = self.store_for(bucket)?;
        let mode = match spec.precondition {
            InsertPrecondition::None => PutMode::Overwrite,
            InsertPrecondition::DoesNotExist => PutMode::Create,
            InsertPrecondition::GenerationMatches(generation) => PutMode::Update(UpdateVersion {
                e_tag: None,
                version: Some(generation.to_string()),
            }),
        };
        let size = data.len() as u64;
        let result = store
            .put_opts(
                &Self::object_path(name)?,
                data.into(),
                PutOptions { mode, ..Default::default() },
            )
            .await?;
        Ok(RawObject {
            bucket: bucket.to_string(),
            name: name.to_string(),
            size,
            generation: result
                .version
                .as_deref()
                .and_then(|version| version.parse().ok())
                .unwrap_or(0),
            creation_time: Utc::now(),
            content_type: spec.content_type.clone(),
            content_encoding: None,
            storage_class: None,
            metadata: spec.metadata.clone(),
        })
    }

    async fn read_object(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes, StoreError> {
        let store = self.store_for(bucket)?;
        let path = Self::object_path(name)?;
        match length {
            Some(length) => {
                let range = offset as usize..(offset + length) as usize;
                Ok(store.get_range(&path, range).await?)
            }
            None => {
                let options = GetOptions {
                    range: (offset > 0).then_some(GetRange::Offset(offset as usize)),
                    ..Default::default()
                };
                Ok(store.get_opts(&path, options).await?.bytes().await?)
            }
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<RawListing, StoreError> {
        if delimiter.is_some_and(|delim| delim != PATH_DELIMITER) {
            return Err(StoreError::Unsupported(
                "non-'/' delimiters on the object_store backend",
            ));
        }
        let store = self.store_for(bucket)?;
        let prefix_path = if prefix.is_empty() {
            None
        } else {
            Some(Self::object_path(prefix)?)
        };

        let mut listing = RawListing::default();
        if delimiter.is_some() {
            let result = store.list_with_delimiter(prefix_path.as_ref()).await?;
            for meta in &result.objects {
                if meta.location.as_ref().starts_with(prefix) {
                    listing.objects.push(Self::raw_object(bucket, meta));
                }
            }
            listing.prefixes = result
                .common_prefixes
                .iter()
                .map(|path| format!("{}{PATH_DELIMITER}", path.as_ref()))
                .filter(|name| name.starts_with(prefix))
                .collect();
        } else {
            let mut stream = store.list(prefix_path.as_ref());
            while let Some(meta) = stream.next().await {
                let meta = meta?;
                if meta.location.as_ref().starts_with(prefix) {
                    listing.objects.push(Self::raw_object(bucket, &meta));
                }
                if let Some(max) = max_results
                    && listing.objects.len() >= max
                {
                    break;
                }
            }
        }
        if let Some(max) = max_results {
            listing.objects.truncate(max);
            listing.prefixes.truncate(max.saturating_sub(listing.objects.len()));
        }
        Ok(listing)
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
        precondition: InsertPrecondition,
    ) -> Result<RawObject, StoreError> {
        if src_bucket != dst_bucket {
            return Err(StoreError::Unsupported(
                "cross-bucket copy on the object_store backend",
            ));
        }
        let store = self.store_for(src_bucket)?;
        let from = Self::object_path(src_name)?;
        let to = Self::object_path(dst_name)?;
        match precondition {
            InsertPrecondition::DoesNotExist => store.copy_if_not_exists(&from, &to).await?,
            InsertPrecondition::None => store.copy(&from, &to).await?,
            InsertPrecondition::GenerationMatches(_) => {
                return Err(StoreError::Unsupported(
                    "generation-conditional copy on the object_store backend",
                ));
            }
        }
        let meta = store.head(&to).await?;
        Ok(Self::raw_object(dst_bucket, &meta))
    }

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<u64>,
    ) -> Result<(), StoreError> {
        if generation.is_some() {
            // The object_store API has no conditional delete.
            log::debug!(
                "[store] dropping generation precondition for delete of \
                 'gs://{bucket}/{name}' on the object_store backend"
            );
        }
        let store = self.store_for(bucket)?;
        store.delete(&Self::object_path(name)?).await?;
        Ok(())
    }

    async fn compose_objects(
        &self,
        _bucket: &str,
        _sources: &[String],
        _dest: &str,
        _content_type: Option<&str>,
    ) -> Result<RawObject, StoreError> {
        Err(StoreError::Unsupported("compose on the object_store backend"))
    }

    async fn patch_object_metadata(
        &self,
        _bucket: &str,
        _name: &str,
        _delta: &HashMap<String, Option<Vec<u8>>>,
        _generation: Option<u64>,
    ) -> Result<RawObject, StoreError> {
        Err(StoreError::Unsupported("metadata patch on the object_store backend"))
    }

    async fn get_bucket(&self, name: &str) -> Result<Option<RawBucket>, StoreError> {
        Ok(self.bucket_known(name)?.then(|| RawBucket {
            name: name.to_string(),
            creation_time: Utc::now(),
            location: None,
            storage_class: None,
        }))
    }

    async fn list_buckets(&self) -> Result<Vec<RawBucket>, StoreError> {
        let names: Vec<String> = match &self.backend {
            ObjectStoreBackend::Memory => {
                self.stores.read().expect("adapter lock").keys().cloned().collect()
            }
            ObjectStoreBackend::Local(base) => {
                let mut names = Vec::new();
                for entry in std::fs::read_dir(base)? {
                    let entry = entry?;
                    if entry.file_type()?.is_dir() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                names
            }
            ObjectStoreBackend::Gcs => {
                return Err(StoreError::Unsupported(
                    "bucket listing on the object_store backend",
                ));
            }
        };
        Ok(names
            .into_iter()
            .map(|name| RawBucket {
                name,
                creation_time: Utc::now(),
                location: None,
                storage_class: None,
            })
            .collect())
    }

    async fn insert_bucket(&self, name: &str) -> Result<RawBucket, StoreError> {
        match &self.backend {
            ObjectStoreBackend::Gcs => {
                Err(StoreError::Unsupported("bucket creation on the object_store backend"))
            }
            _ => {
                if self.bucket_known(name)? {
                    return Err(StoreError::PreconditionFailed(format!(
                        "bucket '{name}' already exists"
                    )));
                }
                self.store_for(name)?;
                Ok(RawBucket {
                    name: name.to_string(),
                    creation_time: Utc::now(),
                    location: None,
                    storage_class: None,
                })
            }
        }
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        match &self.backend {
            ObjectStoreBackend::Gcs => {
                Err(StoreError::Unsupported("bucket deletion on the object_store backend"))
            }
            ObjectStoreBackend::Memory => {
                let listing = self.list_objects(name, "", None, Some(1)).await?;
                if !listing.objects.is_empty() {
                    return Err(StoreError::PreconditionFailed(format!(
                        "bucket '{name}' is not empty"
                    )));
                }
                self.stores.write().expect("adapter lock").remove(name);
                Ok(())
            }
            ObjectStoreBackend::Local(base) => {
                self.stores.write().expect("adapter lock").remove(name);
                match std::fs::remove_dir(base.join(name)) {
                    Ok(()) => Ok(()),
                    Err(error) if error.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                        Err(StoreError::PreconditionFailed(format!(
                            "bucket '{name}' is not empty"
                        )))
                    }
                    Err(error) => Err(error.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_round_trip() {
        let adapter = ObjectStoreAdapter::memory();
        adapter.insert_bucket("b").await.unwrap();
        adapter
            .insert_object("b", "docs/a.txt", Bytes::from("hello"), &InsertSpec::default())
            .await
            .unwrap();

        let meta = adapter.get_object("b", "docs/a.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        let data = adapter.read_object("b", "docs/a.txt", 1, Some(3)).await.unwrap();
        assert_eq!(&data[..], b"ell");

        let listing = adapter.list_objects("b", "docs/", Some('/'), None).await.unwrap();
        assert_eq!(listing.objects.len(), 1);

        adapter.delete_object("b", "docs/a.txt", None).await.unwrap();
        assert!(adapter.get_object("b", "docs/a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_precondition_maps_to_put_mode() {
        let adapter = ObjectStoreAdapter::memory();
        adapter.insert_bucket("b").await.unwrap();
        let spec = InsertSpec {
            precondition: InsertPrecondition::DoesNotExist,
            ..InsertSpec::default()
        };
        adapter.insert_object("b", "x", Bytes::from("one"), &spec).await.unwrap();
        let err = adapter.insert_object("b", "x", Bytes::from("two"), &spec).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn control_plane_is_unsupported_on_gcs() {
        let adapter = ObjectStoreAdapter::gcs();
        assert!(matches!(
            adapter.insert_bucket("b").await.unwrap_err(),
            StoreError::Unsupported(_)
        ));
        assert!(matches!(
            adapter.compose_objects("b", &[], "out", None).await.unwrap_err(),
            StoreError::Unsupported(_)
        ));
    }
}
