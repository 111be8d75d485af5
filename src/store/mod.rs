//! The object store layer: the raw wire seam, the typed client with retries
//! and write preconditions, read/write channels, and the cache-supplemented
//! wrapper.

pub mod cached;
pub mod client;
pub mod memory;
pub mod objectstore;
pub mod raw;
pub mod reader;
pub mod writer;

pub use cached::CachedStorage;
pub use client::{GcsClient, MetadataUpdate, Storage};
pub use memory::InMemoryStore;
pub use objectstore::ObjectStoreAdapter;
pub use raw::{InsertPrecondition, InsertSpec, RawBucket, RawListing, RawObject, RawStore};
pub use reader::StorageReader;
pub use writer::StorageWriter;

use crate::config::RetryOptions;
use crate::error::StoreError;

/// Upper bound on concurrently in-flight RPCs within one batched operation.
pub(crate) const MAX_BATCH_CONCURRENCY: usize = 16;

/// Runs `operation` under truncated exponential backoff, retrying while the
/// error is transient and attempts remain.
pub(crate) async fn with_retries<T, F>(
    retry: &RetryOptions,
    what: &str,
    mut operation: impl FnMut() -> F,
) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt + 1 < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                log::debug!("[store] {what} failed ({error}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
