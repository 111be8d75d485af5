//! Fault-injecting wrappers around a raw store, for exercising retry,
//! reconciliation and resume paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;
use crate::store::{InsertPrecondition, InsertSpec, RawBucket, RawListing, RawObject, RawStore};

/// What the next intercepted read should do.
pub enum ReadFault {
    Error(StoreError),
    /// Deliver only the first `n` bytes of the real response (a premature
    /// end of stream).
    Truncate(usize),
}

/// Delegates to an inner store, consuming scripted faults first.
pub struct FlakyStore {
    inner: Arc<dyn RawStore>,
    insert_faults: Mutex<VecDeque<StoreError>>,
    read_faults: Mutex<VecDeque<ReadFault>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn RawStore>) -> FlakyStore {
        FlakyStore {
            inner,
            insert_faults: Mutex::new(VecDeque::new()),
            read_faults: Mutex::new(VecDeque::new()),
        }
    }

    pub fn fail_next_insert(&self, error: StoreError) {
        self.insert_faults.lock().unwrap().push_back(error);
    }

    pub fn fault_next_read(&self, fault: ReadFault) {
        self.read_faults.lock().unwrap().push_back(fault);
    }
}

#[async_trait]
impl RawStore for FlakyStore {
    async fn get_object(&self, bucket: &str, name: &str) -> Result<Option<RawObject>, StoreError> {
        self.inner.get_object(bucket, name).await
    }

    async fn insert_object(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
        spec: &InsertSpec,
    ) -> Result<RawObject, StoreError> {
        if let Some(error) = self.insert_faults.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.inner.insert_object(bucket, name, data, spec).await
    }

    async fn read_object(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes, StoreError> {
        let fault = self.read_faults.lock().unwrap().pop_front();
        match fault {
            Some(ReadFault::Error(error)) => Err(error),
            Some(ReadFault::Truncate(keep)) => {
                let data = self.inner.read_object(bucket, name, offset, length).await?;
                Ok(data.slice(0..keep.min(data.len())))
            }
            None => self.inner.read_object(bucket, name, offset, length).await,
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<RawListing, StoreError> {
        self.inner.list_objects(bucket, prefix, delimiter, max_results).await
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
        precondition: InsertPrecondition,
    ) -> Result<RawObject, StoreError> {
        self.inner.copy_object(src_bucket, src_name, dst_bucket, dst_name, precondition).await
    }

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<u64>,
    ) -> Result<(), StoreError> {
        self.inner.delete_object(bucket, name, generation).await
    }

    async fn compose_objects(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<RawObject, StoreError> {
        self.inner.compose_objects(bucket, sources, dest, content_type).await
    }

    async fn patch_object_metadata(
        &self,
        bucket: &str,
        name: &str,
        delta: &HashMap<String, Option<Vec<u8>>>,
        generation: Option<u64>,
    ) -> Result<RawObject, StoreError> {
        self.inner.patch_object_metadata(bucket, name, delta, generation).await
    }

    async fn get_bucket(&self, name: &str) -> Result<Option<RawBucket>, StoreError> {
        self.inner.get_bucket(name).await
    }

    async fn list_buckets(&self) -> Result<Vec<RawBucket>, StoreError> {
        self.inner.list_buckets().await
    }

    async fn insert_bucket(&self, name: &str) -> Result<RawBucket, StoreError> {
        self.inner.insert_bucket(name).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete_bucket(name).await
    }
}

/// Simulates listing lag of an eventually-consistent store: hidden objects
/// resolve through `get_object` but never appear in listings.
pub struct LaggingStore {
    inner: Arc<dyn RawStore>,
    hidden: Mutex<HashSet<(String, String)>>,
}

impl LaggingStore {
    pub fn new(inner: Arc<dyn RawStore>) -> LaggingStore {
        LaggingStore { inner, hidden: Mutex::new(HashSet::new()) }
    }

    pub fn hide_from_listings(&self, bucket: &str, name: &str) {
        self.hidden.lock().unwrap().insert((bucket.to_string(), name.to_string()));
    }
}

#[async_trait]
impl RawStore for LaggingStore {
    async fn get_object(&self, bucket: &str, name: &str) -> Result<Option<RawObject>, StoreError> {
        self.inner.get_object(bucket, name).await
    }

    async fn insert_object(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
        spec: &InsertSpec,
    ) -> Result<RawObject, StoreError> {
        self.inner.insert_object(bucket, name, data, spec).await
    }

    async fn read_object(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes, StoreError> {
        self.inner.read_object(bucket, name, offset, length).await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<RawListing, StoreError> {
        let mut listing = self.inner.list_objects(bucket, prefix, delimiter, max_results).await?;
        let hidden = self.hidden.lock().unwrap();
        listing
            .objects
            .retain(|object| !hidden.contains(&(bucket.to_string(), object.name.clone())));
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
        self.inner.copy_object(src_bucket, src_name, dst_bucket, dst_name, precondition).await
    }

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<u64>,
    ) -> Result<(), StoreError> {
        self.inner.delete_object(bucket, name, generation).await
    }

    async fn compose_objects(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<RawObject, StoreError> {
        self.inner.compose_objects(bucket, sources, dest, content_type).await
    }

    async fn patch_object_metadata(
        &self,
        bucket: &str,
        name: &str,
        delta: &HashMap<String, Option<Vec<u8>>>,
        generation: Option<u64>,
    ) -> Result<RawObject, StoreError> {
        self.inner.patch_object_metadata(bucket, name, delta, generation).await
    }

    async fn get_bucket(&self, name: &str) -> Result<Option<RawBucket>, StoreError> {
        self.inner.get_bucket(name).await
    }

    async fn list_buckets(&self) -> Result<Vec<RawBucket>, StoreError> {
        self.inner.list_buckets().await
    }

    async fn insert_bucket(&self, name: &str) -> Result<RawBucket, StoreError> {
        self.inner.insert_bucket(name).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete_bucket(name).await
    }
}
