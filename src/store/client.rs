//! Typed operations over the flat store, with retries, write preconditions
//! and idempotent reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RetryOptions;
use crate::error::StoreError;
use crate::model::{CreateFileOptions, ItemInfo, ReadOptions};
use crate::resource::ResourceId;
use crate::store::raw::{InsertPrecondition, InsertSpec, RawBucket, RawObject, RawStore};
use crate::store::reader::StorageReader;
use crate::store::writer::StorageWriter;
use crate::store::{MAX_BATCH_CONCURRENCY, with_retries};

const BUCKET_EMPTY_MAX_POLLS: u32 = 10;
const BUCKET_EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A metadata merge for one object: `Some` sets a key, `None` removes it.
#[derive(Debug, Clone)]
pub struct MetadataUpdate {
    pub id: ResourceId,
    pub delta: HashMap<String, Option<Vec<u8>>>,
}

/// The seam between the typed store client and its consumers. Implemented by
/// [`GcsClient`] and by [`crate::store::CachedStorage`], which layers the
/// directory list cache on top of it.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Never fails on a missing entity; returns a not-found-marked info.
    async fn get_info(&self, id: &ResourceId) -> Result<ItemInfo, StoreError>;

    /// Positional batch variant of [`Storage::get_info`].
    async fn get_infos(&self, ids: &[ResourceId]) -> Result<Vec<ItemInfo>, StoreError>;

    async fn list_bucket_names(&self) -> Result<Vec<String>, StoreError>;

    async fn list_bucket_infos(&self) -> Result<Vec<ItemInfo>, StoreError>;

    /// With a delimiter, returned names have depth 1 relative to the prefix
    /// (synthetic prefix names end with the delimiter); without one the
    /// listing is fully recursive.
    async fn list_object_names(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    async fn list_object_infos(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<Vec<ItemInfo>, StoreError>;

    /// Idempotent creation of a zero-byte object. Racing creators converge:
    /// when the insert is rejected but the live object already is zero-sized
    /// with the intended metadata, the call succeeds silently.
    async fn create_empty(&self, id: &ResourceId) -> Result<(), StoreError>;

    async fn create_empty_batch(&self, ids: &[ResourceId]) -> Result<(), StoreError>;

    /// Idempotent bucket creation, reconciled the same way as
    /// [`Storage::create_empty`].
    async fn create_bucket(&self, name: &str) -> Result<(), StoreError>;

    /// `precondition_override` replaces the precondition implied by
    /// `options.overwrite` (used for marker-file generation matching).
    async fn create_writer(
        &self,
        id: &ResourceId,
        options: &CreateFileOptions,
        precondition_override: Option<InsertPrecondition>,
    ) -> Result<StorageWriter, StoreError>;

    async fn open_reader(
        &self,
        id: &ResourceId,
        options: &ReadOptions,
    ) -> Result<StorageReader, StoreError>;

    /// Positional copy. Pairs are issued in input order, batched; every copy
    /// carries a "destination must not exist" precondition. Failures
    /// aggregate into [`StoreError::Partial`].
    async fn copy(
        &self,
        src_bucket: &str,
        src_names: &[String],
        dst_bucket: &str,
        dst_names: &[String],
    ) -> Result<(), StoreError>;

    /// Deletes with a generation-match precondition taken from the most
    /// recent info, so a concurrent overwrite is never clobbered. Objects
    /// already gone count as deleted.
    async fn delete_objects(&self, ids: &[ResourceId]) -> Result<(), StoreError>;

    async fn delete_buckets(&self, names: &[String]) -> Result<(), StoreError>;

    async fn wait_for_bucket_empty(&self, name: &str) -> Result<(), StoreError>;

    async fn update_items(&self, updates: &[MetadataUpdate]) -> Result<(), StoreError>;

    async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<(), StoreError>;
}

pub(crate) fn item_info_from_object(meta: RawObject) -> ItemInfo {
    ItemInfo {
        resource_id: ResourceId::Object { bucket: meta.bucket, name: meta.name },
        exists: true,
        size: meta.size,
        creation_time_ms: meta.creation_time.timestamp_millis().max(0) as u64,
        content_type: meta.content_type,
        content_encoding: meta.content_encoding,
        metadata: meta.metadata,
        bucket_location: None,
        storage_class: meta.storage_class,
        generation: Some(meta.generation),
        inferred: false,
    }
}

pub(crate) fn item_info_from_bucket(meta: RawBucket) -> ItemInfo {
    ItemInfo {
        resource_id: ResourceId::Bucket(meta.name),
        exists: true,
        size: 0,
        creation_time_ms: meta.creation_time.timestamp_millis().max(0) as u64,
        content_type: None,
        content_encoding: None,
        metadata: HashMap::new(),
        bucket_location: meta.location,
        storage_class: meta.storage_class,
        generation: None,
        inferred: false,
    }
}

/// The store client: one retrying, precondition-carrying layer over the raw
/// wire seam.
pub struct GcsClient {
    raw: Arc<dyn RawStore>,
    retry: RetryOptions,
    infer_implicit_directories: bool,
    write_chunk_size: usize,
}

impl GcsClient {
    pub fn new(
        raw: Arc<dyn RawStore>,
        retry: RetryOptions,
        infer_implicit_directories: bool,
        write_chunk_size: usize,
    ) -> GcsClient {
        GcsClient { raw, retry, infer_implicit_directories, write_chunk_size }
    }

    fn object_parts<'a>(id: &'a ResourceId, what: &str) -> Result<(&'a str, &'a str), StoreError> {
        match id {
            ResourceId::Object { bucket, name } => Ok((bucket, name)),
            other => Err(StoreError::Fatal(format!("{what} requires an object id, got '{other}'"))),
        }
    }

    /// Reconciliation path for idempotent creates: the insert was rejected,
    /// but if the live object is exactly what we meant to write the create
    /// already happened (our own retried request, or an identical racer).
    async fn reconcile_empty_create(
        &self,
        bucket: &str,
        name: &str,
        spec: &InsertSpec,
        original: StoreError,
    ) -> Result<(), StoreError> {
        let live = with_retries(&self.retry, "get_object", || async {
            self.raw.get_object(bucket, name).await
        })
        .await?;
        match live {
            Some(meta) if meta.size == 0 && meta.metadata == spec.metadata => {
                log::debug!(
                    "[store] create of 'gs://{bucket}/{name}' was rejected ({original}) but the \
                     object already matches; treating as success"
                );
                Ok(())
            }
            _ => Err(original),
        }
    }
}

#[async_trait]
impl Storage for GcsClient {
    async fn get_info(&self, id: &ResourceId) -> Result<ItemInfo, StoreError> {
        match id {
            ResourceId::Root => Ok(ItemInfo::root()),
            ResourceId::Bucket(name) => {
                let bucket = with_retries(&self.retry, "get_bucket", || async {
                    self.raw.get_bucket(name).await
                })
                .await?;
                Ok(bucket
                    .map(item_info_from_bucket)
                    .unwrap_or_else(|| ItemInfo::not_found(id.clone())))
            }
            ResourceId::Object { bucket, name } => {
                let object = with_retries(&self.retry, "get_object", || async {
                    self.raw.get_object(bucket, name).await
                })
                .await?;
                Ok(object
                    .map(item_info_from_object)
                    .unwrap_or_else(|| ItemInfo::not_found(id.clone())))
            }
        }
    }

    async fn get_infos(&self, ids: &[ResourceId]) -> Result<Vec<ItemInfo>, StoreError> {
        let mut infos = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BATCH_CONCURRENCY) {
            let results = futures_util::future::join_all(
                chunk.iter().map(|id| async move { self.get_info(id).await }),
            )
            .await;
            for result in results {
                infos.push(result?);
            }
        }
        Ok(infos)
    }

    async fn list_bucket_names(&self) -> Result<Vec<String>, StoreError> {
        let buckets =
            with_retries(&self.retry, "list_buckets", || async { self.raw.list_buckets().await })
                .await?;
        Ok(buckets.into_iter().map(|bucket| bucket.name).collect())
    }

    async fn list_bucket_infos(&self) -> Result<Vec<ItemInfo>, StoreError> {
        let buckets =
            with_retries(&self.retry, "list_buckets", || async { self.raw.list_buckets().await })
                .await?;
        Ok(buckets.into_iter().map(item_info_from_bucket).collect())
    }

    async fn list_object_names(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let listing = with_retries(&self.retry, "list_objects", || async {
            self.raw.list_objects(bucket, prefix, delimiter, max_results).await
        })
        .await?;
        let mut names: Vec<String> =
            listing.objects.into_iter().map(|object| object.name).collect();
        names.extend(listing.prefixes);
        names.sort_unstable();
        Ok(names)
    }

    async fn list_object_infos(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<Vec<ItemInfo>, StoreError> {
        let listing = with_retries(&self.retry, "list_objects", || async {
            self.raw.list_objects(bucket, prefix, delimiter, max_results).await
        })
        .await?;
        let mut infos: Vec<ItemInfo> =
            listing.objects.into_iter().map(item_info_from_object).collect();

        // Depth-1 prefixes are names, not entities. Resolve them to real
        // placeholders where those exist, or synthesize inferred directories.
        let prefix_ids: Vec<ResourceId> = listing
            .prefixes
            .into_iter()
            .map(|name| ResourceId::Object { bucket: bucket.to_string(), name })
            .collect();
        for info in self.get_infos(&prefix_ids).await? {
            if info.exists {
                infos.push(info);
            } else if self.infer_implicit_directories {
                infos.push(ItemInfo::inferred_directory(info.resource_id));
            }
        }
        infos.sort_by(|a, b| {
            a.resource_id.object_name().cmp(&b.resource_id.object_name())
        });
        Ok(infos)
    }

    async fn create_empty(&self, id: &ResourceId) -> Result<(), StoreError> {
        let (bucket, name) = Self::object_parts(id, "create_empty")?;
        let spec = InsertSpec {
            precondition: InsertPrecondition::DoesNotExist,
            ..InsertSpec::default()
        };
        let result = with_retries(&self.retry, "insert_object", || async {
            self.raw.insert_object(bucket, name, bytes::Bytes::new(), &spec).await
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(error @ (StoreError::RateLimited(_) | StoreError::PreconditionFailed(_))) => {
                self.reconcile_empty_create(bucket, name, &spec, error).await
            }
            Err(error) => Err(error),
        }
    }

    async fn create_empty_batch(&self, ids: &[ResourceId]) -> Result<(), StoreError> {
        let mut failures = Vec::new();
        for chunk in ids.chunks(MAX_BATCH_CONCURRENCY) {
            let results = futures_util::future::join_all(
                chunk.iter().map(|id| async move { self.create_empty(id).await }),
            )
            .await;
            failures.extend(results.into_iter().filter_map(Result::err));
        }
        aggregate(ids.len(), failures)
    }

    async fn create_bucket(&self, name: &str) -> Result<(), StoreError> {
        let result = with_retries(&self.retry, "insert_bucket", || async {
            self.raw.insert_bucket(name).await
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(error @ (StoreError::RateLimited(_) | StoreError::PreconditionFailed(_))) => {
                let live = with_retries(&self.retry, "get_bucket", || async {
                    self.raw.get_bucket(name).await
                })
                .await?;
                if live.is_some() { Ok(()) } else { Err(error) }
            }
            Err(error) => Err(error),
        }
    }

    async fn create_writer(
        &self,
        id: &ResourceId,
        options: &CreateFileOptions,
        precondition_override: Option<InsertPrecondition>,
    ) -> Result<StorageWriter, StoreError> {
        let (bucket, name) = Self::object_parts(id, "create_writer")?;
        let precondition = precondition_override.unwrap_or(if options.overwrite {
            InsertPrecondition::None
        } else {
            InsertPrecondition::DoesNotExist
        });
        let spec = InsertSpec {
            precondition,
            content_type: options.content_type.clone(),
            content_encoding: None,
            metadata: options.attributes.clone(),
        };
        Ok(StorageWriter::new(
            Arc::clone(&self.raw),
            self.retry.clone(),
            bucket.to_string(),
            name.to_string(),
            spec,
            self.write_chunk_size,
            options.use_direct_upload,
        ))
    }

    async fn open_reader(
        &self,
        id: &ResourceId,
        options: &ReadOptions,
    ) -> Result<StorageReader, StoreError> {
        let (bucket, name) = Self::object_parts(id, "open_reader")?;
        let info = if options.fast_fail_on_not_found {
            let info = self.get_info(id).await?;
            if !info.exists {
                return Err(StoreError::NotFound(format!("object '{id}'")));
            }
            Some(info)
        } else {
            None
        };
        StorageReader::new(
            Arc::clone(&self.raw),
            self.retry.clone(),
            bucket.to_string(),
            name.to_string(),
            options.clone(),
            info,
        )
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_names: &[String],
        dst_bucket: &str,
        dst_names: &[String],
    ) -> Result<(), StoreError> {
        if src_names.len() != dst_names.len() {
            return Err(StoreError::Fatal(format!(
                "copy given {} sources but {} destinations",
                src_names.len(),
                dst_names.len()
            )));
        }
        // Batches run in input order so ancestor placeholders land before
        // their descendants; items within a batch are concurrent.
        let pairs: Vec<(&String, &String)> = src_names.iter().zip(dst_names.iter()).collect();
        let mut failures = Vec::new();
        for chunk in pairs.chunks(MAX_BATCH_CONCURRENCY) {
            let results = futures_util::future::join_all(chunk.iter().map(|(src, dst)| {
                with_retries(&self.retry, "copy_object", || async {
                    self.raw
                        .copy_object(
                            src_bucket,
                            src,
                            dst_bucket,
                            dst,
                            InsertPrecondition::DoesNotExist,
                        )
                        .await
                        .map(|_| ())
                })
            }))
            .await;
            failures.extend(results.into_iter().filter_map(Result::err));
        }
        aggregate(src_names.len(), failures)
    }

    async fn delete_objects(&self, ids: &[ResourceId]) -> Result<(), StoreError> {
        let mut failures = Vec::new();
        // Caller-supplied order (descendants before ancestors) is preserved
        // across batches.
        for chunk in ids.chunks(MAX_BATCH_CONCURRENCY) {
            let results = futures_util::future::join_all(chunk.iter().map(|id| async move {
                let (bucket, name) = Self::object_parts(id, "delete_objects")?;
                let live = with_retries(&self.retry, "get_object", || async {
                    self.raw.get_object(bucket, name).await
                })
                .await?;
                let Some(meta) = live else {
                    return Ok(());
                };
                let result = with_retries(&self.retry, "delete_object", || async {
                    self.raw.delete_object(bucket, name, Some(meta.generation)).await
                })
                .await;
                match result {
                    Err(error) if error.is_not_found() => Ok(()),
                    other => other,
                }
            }))
            .await;
            failures.extend(results.into_iter().filter_map(Result::err));
        }
        aggregate(ids.len(), failures)
    }

    async fn delete_buckets(&self, names: &[String]) -> Result<(), StoreError> {
        let mut failures = Vec::new();
        for name in names {
            let result = with_retries(&self.retry, "delete_bucket", || async {
                self.raw.delete_bucket(name).await
            })
            .await;
            match result {
                Err(error) if error.is_not_found() => {}
                Err(error) => failures.push(error),
                Ok(()) => {}
            }
        }
        aggregate(names.len(), failures)
    }

    async fn wait_for_bucket_empty(&self, name: &str) -> Result<(), StoreError> {
        for _ in 0..BUCKET_EMPTY_MAX_POLLS {
            let listing = with_retries(&self.retry, "list_objects", || async {
                self.raw.list_objects(name, "", None, Some(1)).await
            })
            .await?;
            if listing.objects.is_empty() && listing.prefixes.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(BUCKET_EMPTY_POLL_INTERVAL).await;
        }
        Err(StoreError::Fatal(format!("bucket '{name}' still not empty after deletes")))
    }

    async fn update_items(&self, updates: &[MetadataUpdate]) -> Result<(), StoreError> {
        let mut failures = Vec::new();
        for chunk in updates.chunks(MAX_BATCH_CONCURRENCY) {
            let results = futures_util::future::join_all(chunk.iter().map(|update| async move {
                let (bucket, name) = Self::object_parts(&update.id, "update_items")?;
                let live = with_retries(&self.retry, "get_object", || async {
                    self.raw.get_object(bucket, name).await
                })
                .await?;
                let Some(meta) = live else {
                    return Err(StoreError::NotFound(format!("object '{}'", update.id)));
                };
                with_retries(&self.retry, "patch_object_metadata", || async {
                    self.raw
                        .patch_object_metadata(bucket, name, &update.delta, Some(meta.generation))
                        .await
                })
                .await
                .map(|_| ())
            }))
            .await;
            failures.extend(results.into_iter().filter_map(Result::err));
        }
        aggregate(updates.len(), failures)
    }

    async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<(), StoreError> {
        with_retries(&self.retry, "compose_objects", || async {
            self.raw.compose_objects(bucket, sources, dest, content_type).await
        })
        .await
        .map(|_| ())
    }
}

fn aggregate(total: usize, mut failures: Vec<StoreError>) -> Result<(), StoreError> {
    if failures.is_empty() {
        return Ok(());
    }
    let failed = failures.len();
    let first = failures.remove(0);
    if failed == 1 && total == 1 {
        return Err(first);
    }
    Err(StoreError::Partial { total, failed, first: Box::new(first) })
}
