//! The wire seam: everything the core consumes from the underlying service.
//!
//! Transport selection, authentication and wire encoding live behind this
//! trait. Implementations: [`crate::store::InMemoryStore`] (full fidelity,
//! used by the test suite) and [`crate::store::ObjectStoreAdapter`]
//! (data-plane operations over the `object_store` crate).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// One object as the service reports it.
#[derive(Debug, Clone)]
pub struct RawObject {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    pub generation: u64,
    pub creation_time: DateTime<Utc>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub storage_class: Option<String>,
    pub metadata: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct RawBucket {
    pub name: String,
    pub creation_time: DateTime<Utc>,
    pub location: Option<String>,
    pub storage_class: Option<String>,
}

/// Write precondition attached to inserts and copies. Every mutation carries
/// either "must not exist" or "generation must match"; unconditional writes
/// are reserved for explicit overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPrecondition {
    None,
    DoesNotExist,
    GenerationMatches(u64),
}

#[derive(Debug, Clone)]
pub struct InsertSpec {
    pub precondition: InsertPrecondition,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub metadata: HashMap<String, Vec<u8>>,
}

impl Default for InsertSpec {
    fn default() -> InsertSpec {
        InsertSpec {
            precondition: InsertPrecondition::None,
            content_type: None,
            content_encoding: None,
            metadata: HashMap::new(),
        }
    }
}

/// Result of a listing call: objects at the requested depth plus, when a
/// delimiter was given, the depth-1 name prefixes below it.
#[derive(Debug, Clone, Default)]
pub struct RawListing {
    pub objects: Vec<RawObject>,
    pub prefixes: Vec<String>,
}

#[async_trait]
pub trait RawStore: Send + Sync {
    /// `Ok(None)` for an absent object; errors are reserved for failures.
    async fn get_object(&self, bucket: &str, name: &str) -> Result<Option<RawObject>, StoreError>;

    async fn insert_object(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
        spec: &InsertSpec,
    ) -> Result<RawObject, StoreError>;

    /// Reads `length` bytes from `offset` (or to the end when `None`). A
    /// result shorter than requested while more bytes remain is a premature
    /// end of stream; callers resume from the last delivered offset.
    async fn read_object(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes, StoreError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<RawListing, StoreError>;

    /// Metadata-level copy; content is not rewritten. The destination gets a
    /// fresh generation.
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
        precondition: InsertPrecondition,
    ) -> Result<RawObject, StoreError>;

    /// With a generation, fails `PreconditionFailed` when the live object has
    /// moved on. A missing object is `NotFound`.
    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Server-side composition of `sources` into `dest`, overwriting it.
    async fn compose_objects(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<RawObject, StoreError>;

    /// Merges `delta` into the object's metadata map: `Some` sets a key,
    /// `None` removes it.
    async fn patch_object_metadata(
        &self,
        bucket: &str,
        name: &str,
        delta: &HashMap<String, Option<Vec<u8>>>,
        generation: Option<u64>,
    ) -> Result<RawObject, StoreError>;

    async fn get_bucket(&self, name: &str) -> Result<Option<RawBucket>, StoreError>;

    async fn list_buckets(&self) -> Result<Vec<RawBucket>, StoreError>;

    async fn insert_bucket(&self, name: &str) -> Result<RawBucket, StoreError>;

    /// Fails `PreconditionFailed` on a non-empty bucket.
    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError>;
}
