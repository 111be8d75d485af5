//! `gcsfs` projects POSIX-like hierarchical file system semantics onto a flat
//! {bucket, object-name} store.
//!
//! The store has no directories: they are synthesized from object-name
//! prefixes, materialized as zero-byte placeholder objects, or inferred when
//! absent. [`fs::GcsFileSystem`] is the public surface; it composes a typed
//! store client (with retries and write preconditions), a directory list
//! cache that masks eventual consistency, and a best-effort background
//! updater for parent-directory modification times.
//!
//! Transport, authentication and wire encoding live behind the
//! [`store::RawStore`] trait. The crate ships a full-fidelity in-memory
//! implementation ([`store::InMemoryStore`]) and an adapter over the
//! `object_store` crate for the data plane.

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod model;
pub mod paths;
pub mod resource;
pub mod store;
pub mod test;
pub mod timestamps;

pub use config::{CacheBackendKind, GcsFsOptions, RetryOptions, TimestampUpdateOptions};
pub use error::{FsError, StoreError};
pub use fs::GcsFileSystem;
pub use model::{CreateFileOptions, FileInfo, ItemInfo, ReadOptions};
pub use resource::ResourceId;
