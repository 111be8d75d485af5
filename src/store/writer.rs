//! Write channel: buffers payloads and commits them as a single insert,
//! carrying the write precondition, on close.

use std::sync::Arc;

use bytes::Bytes;

use crate::cache::DirectoryListCache;
use crate::config::RetryOptions;
use crate::error::StoreError;
use crate::model::ItemInfo;
use crate::resource::ResourceId;
use crate::store::client::item_info_from_object;
use crate::store::raw::{InsertSpec, RawStore};
use crate::store::with_retries;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
    Aborted,
}

pub struct StorageWriter {
    raw: Arc<dyn RawStore>,
    retry: RetryOptions,
    bucket: String,
    name: String,
    spec: InsertSpec,
    chunk_size: usize,
    direct_upload: bool,
    buffer: Vec<u8>,
    state: WriterState,
    committed: Option<ItemInfo>,
    /// Installed by the cache-supplemented client so a successful commit is
    /// visible to listings before the caller observes it.
    cache: Option<Arc<dyn DirectoryListCache>>,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter")
            .field("bucket", &self.bucket)
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("chunk_size", &self.chunk_size)
            .field("direct_upload", &self.direct_upload)
            .field("buffer_len", &self.buffer.len())
            .field("state", &self.state)
            .field("committed", &self.committed)
            .finish()
    }
}

impl StorageWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        raw: Arc<dyn RawStore>,
        retry: RetryOptions,
        bucket: String,
        name: String,
        spec: InsertSpec,
        chunk_size: usize,
        direct_upload: bool,
    ) -> StorageWriter {
        StorageWriter {
            raw,
            retry,
            bucket,
            name,
            spec,
            chunk_size,
            direct_upload,
            buffer: Vec::new(),
            state: WriterState::Open,
            committed: None,
            cache: None,
        }
    }

    pub(crate) fn attach_cache(&mut self, cache: Arc<dyn DirectoryListCache>) {
        self.cache = Some(cache);
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::Object { bucket: self.bucket.clone(), name: self.name.clone() }
    }

    pub fn bytes_buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if self.state != WriterState::Open {
            return Err(StoreError::Fatal("writer is closed".to_string()));
        }
        if !self.direct_upload {
            let needed = self.buffer.len() + data.len();
            if needed > self.buffer.capacity() {
                let chunks = needed.div_ceil(self.chunk_size);
                self.buffer.reserve(chunks * self.chunk_size - self.buffer.len());
            }
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Commits the buffered payload. Idempotent: a second close returns the
    /// first close's result without another RPC.
    pub async fn close(&mut self) -> Result<ItemInfo, StoreError> {
        match self.state {
            WriterState::Closed => {
                return self
                    .committed
                    .clone()
                    .ok_or_else(|| StoreError::Fatal("writer closed without commit".to_string()));
            }
            WriterState::Aborted => {
                return Err(StoreError::Fatal("writer was aborted".to_string()));
            }
            WriterState::Open => {}
        }
        // The buffer survives a failed commit so the caller can close again.
        let payload = Bytes::copy_from_slice(&self.buffer);
        let meta = with_retries(&self.retry, "insert_object", || async {
            self.raw.insert_object(&self.bucket, &self.name, payload.clone(), &self.spec).await
        })
        .await?;
        let info = item_info_from_object(meta);
        self.buffer = Vec::new();
        self.state = WriterState::Closed;
        self.committed = Some(info.clone());
        if let Some(cache) = &self.cache
            && let Err(error) = cache.put_resource_info(&info.resource_id, &info).await
        {
            log::warn!("[cache] failed to record committed write '{}': {error}", info.resource_id);
        }
        Ok(info)
    }

    /// Drops the buffered payload without writing anything.
    pub fn abort(&mut self) {
        if self.state == WriterState::Open {
            self.state = WriterState::Aborted;
            self.buffer = Vec::new();
        }
    }
}
