use thiserror::Error;

/// Errors raised by the store layer (raw transport and typed client).
///
/// Resource-lookup routines never raise `NotFound` themselves; they return a
/// not-found-marked [`crate::model::ItemInfo`]. `NotFound` here means an RPC
/// whose contract requires the entity hit a missing one (read, copy source,
/// conditional delete).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{failed} of {total} operations failed; first error: {first}")]
    Partial {
        total: usize,
        failed: usize,
        #[source]
        first: Box<StoreError>,
    },
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Transient(_) | StoreError::RateLimited(_) | StoreError::Io(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Errors surfaced by [`crate::fs::GcsFileSystem`] operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type FsResult<T> = Result<T, FsError>;
