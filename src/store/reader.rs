//! Seek-able read channel over one object.
//!
//! Reads are served from a prefetch window; a seek inside the window costs
//! nothing, a seek outside it triggers a new ranged request. A premature end
//! of stream is a recoverable event, not a channel teardown: the reader moves
//! `Open -> Broken -> Reopening -> Open`, resuming from the last successfully
//! delivered offset.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::RetryOptions;
use crate::error::StoreError;
use crate::model::{ItemInfo, ReadOptions};
use crate::store::raw::RawStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Open,
    Broken,
    Reopening,
    Closed,
}

pub struct StorageReader {
    raw: Arc<dyn RawStore>,
    retry: RetryOptions,
    bucket: String,
    name: String,
    options: ReadOptions,
    state: ReaderState,
    /// Unknown until metadata is fetched (lazily, when
    /// `fast_fail_on_not_found` is off). Unreliable for gzip-encoded objects
    /// until the stream has been read.
    size: Option<u64>,
    gzip_encoded: Option<bool>,
    gzip_loaded: bool,
    position: u64,
    window: Bytes,
    window_start: u64,
}

impl std::fmt::Debug for StorageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageReader")
            .field("bucket", &self.bucket)
            .field("name", &self.name)
            .field("options", &self.options)
            .field("state", &self.state)
            .field("size", &self.size)
            .field("gzip_encoded", &self.gzip_encoded)
            .field("gzip_loaded", &self.gzip_loaded)
            .field("position", &self.position)
            .field("window_start", &self.window_start)
            .finish()
    }
}

impl StorageReader {
    pub(crate) fn new(
        raw: Arc<dyn RawStore>,
        retry: RetryOptions,
        bucket: String,
        name: String,
        options: ReadOptions,
        info: Option<ItemInfo>,
    ) -> Result<StorageReader, StoreError> {
        let mut reader = StorageReader {
            raw,
            retry,
            bucket,
            name,
            options,
            state: ReaderState::Open,
            size: None,
            gzip_encoded: None,
            gzip_loaded: false,
            position: 0,
            window: Bytes::new(),
            window_start: 0,
        };
        if let Some(info) = info {
            reader.apply_info(info.size, info.content_encoding.as_deref())?;
        }
        Ok(reader)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Object size, once known. For gzip-encoded objects this becomes the
    /// decoded length after the first read and may disagree with the stored
    /// object size.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Absolute seek. Within the current window no request is issued.
    pub fn seek(&mut self, position: u64) -> Result<(), StoreError> {
        if self.state == ReaderState::Closed {
            return Err(StoreError::Fatal("reader is closed".to_string()));
        }
        if let (Some(size), Some(false)) = (self.size, self.gzip_encoded)
            && position > size
        {
            return Err(StoreError::Fatal(format!(
                "seek to {position} past end of object ({size} bytes)"
            )));
        }
        self.position = position;
        Ok(())
    }

    /// Reads into `dst`, returning the number of bytes delivered; zero means
    /// end of stream.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, StoreError> {
        if self.state == ReaderState::Closed {
            return Err(StoreError::Fatal("reader is closed".to_string()));
        }
        if dst.is_empty() {
            return Ok(0);
        }
        self.ensure_metadata().await?;

        loop {
            if self.window_covers(self.position) {
                return Ok(self.serve_from_window(dst));
            }
            if self.gzip_encoded == Some(true) {
                if self.gzip_loaded {
                    return Ok(0);
                }
                self.fill_gzip().await?;
                continue;
            }
            if let Some(size) = self.size
                && self.position >= size
            {
                return Ok(0);
            }
            self.fill_ranged(dst.len() as u64).await?;
        }
    }

    /// Idempotent; a second close is a no-op.
    pub fn close(&mut self) {
        self.state = ReaderState::Closed;
        self.window = Bytes::new();
    }

    fn window_covers(&self, position: u64) -> bool {
        position >= self.window_start
            && position < self.window_start + self.window.len() as u64
    }

    fn serve_from_window(&mut self, dst: &mut [u8]) -> usize {
        let offset = (self.position - self.window_start) as usize;
        let available = self.window.len() - offset;
        let count = available.min(dst.len());
        dst[..count].copy_from_slice(&self.window[offset..offset + count]);
        self.position += count as u64;
        count
    }

    async fn ensure_metadata(&mut self) -> Result<(), StoreError> {
        if self.gzip_encoded.is_some() {
            return Ok(());
        }
        let meta = crate::store::with_retries(&self.retry, "get_object", || async {
            self.raw.get_object(&self.bucket, &self.name).await
        })
        .await?
        .ok_or_else(|| {
            StoreError::NotFound(format!("object 'gs://{}/{}'", self.bucket, self.name))
        })?;
        self.apply_info(meta.size, meta.content_encoding.as_deref())
    }

    fn apply_info(&mut self, size: u64, content_encoding: Option<&str>) -> Result<(), StoreError> {
        let gzip = content_encoding.is_some_and(|encoding| encoding.contains("gzip"));
        if gzip && !self.options.support_gzip_encoding {
            return Err(StoreError::Fatal(format!(
                "object 'gs://{}/{}' is gzip-content-encoded; enable support_gzip_encoding to \
                 read it",
                self.bucket, self.name
            )));
        }
        self.size = Some(size);
        self.gzip_encoded = Some(gzip);
        Ok(())
    }

    /// Fetches a window starting at (or shortly before) the current
    /// position. A short or failed response marks the channel broken and
    /// reopens from the last delivered offset with backoff.
    async fn fill_ranged(&mut self, hint: u64) -> Result<(), StoreError> {
        // A small forward gap is read through, mirroring how a streaming
        // connection would discard bytes instead of reconnecting.
        let window_end = self.window_start + self.window.len() as u64;
        let start = if self.position > window_end
            && !self.window.is_empty()
            && self.position - window_end <= self.options.inplace_seek_limit
        {
            window_end
        } else {
            self.position
        };
        let size = self.size.unwrap_or(u64::MAX);
        let want = (self.options.buffer_size as u64)
            .max(hint + (self.position - start))
            .min(size.saturating_sub(start));

        let mut attempt = 0;
        loop {
            match self.raw.read_object(&self.bucket, &self.name, start, Some(want)).await {
                Ok(data) if data.is_empty() && want > 0 => {
                    self.state = ReaderState::Broken;
                    log::debug!(
                        "[store] premature end of stream at {start} for 'gs://{}/{}'",
                        self.bucket,
                        self.name
                    );
                }
                Ok(data) => {
                    if (data.len() as u64) < want {
                        // Partial delivery is still progress; the next fill
                        // resumes from the new offset.
                        log::debug!(
                            "[store] short read ({} of {want} bytes) for 'gs://{}/{}', will \
                             resume from {}",
                            data.len(),
                            self.bucket,
                            self.name,
                            start + data.len() as u64
                        );
                    }
                    self.window = data;
                    self.window_start = start;
                    self.state = ReaderState::Open;
                    return Ok(());
                }
                Err(error) if error.is_transient() => {
                    self.state = ReaderState::Broken;
                    log::debug!(
                        "[store] read of 'gs://{}/{}' broke at {start}: {error}",
                        self.bucket,
                        self.name
                    );
                }
                Err(error) => {
                    self.state = ReaderState::Open;
                    return Err(error);
                }
            }
            if attempt + 1 >= self.retry.max_attempts {
                self.state = ReaderState::Open;
                return Err(StoreError::Transient(format!(
                    "read of 'gs://{}/{}' failed after {} attempts",
                    self.bucket, self.name, self.retry.max_attempts
                )));
            }
            let delay = self.retry.delay_for(attempt);
            attempt += 1;
            self.state = ReaderState::Reopening;
            tokio::time::sleep(delay).await;
        }
    }

    /// Ranged resume is impossible for gzip-encoded content: read the whole
    /// decoded stream from offset zero and serve (and re-serve) from it.
    async fn fill_gzip(&mut self) -> Result<(), StoreError> {
        let data = crate::store::with_retries(&self.retry, "read_object", || async {
            self.raw.read_object(&self.bucket, &self.name, 0, None).await
        })
        .await?;
        self.size = Some(data.len() as u64);
        self.gzip_loaded = true;
        self.window = data;
        self.window_start = 0;
        self.state = ReaderState::Open;
        Ok(())
    }
}
