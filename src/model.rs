//! Snapshots of store entities and the path-level view layered over them.

use std::collections::HashMap;

use crate::paths;
use crate::resource::ResourceId;

/// Metadata key carrying the directory/file modification time as an 8-byte
/// big-endian integer of milliseconds since the epoch.
pub const MTIME_ATTRIBUTE: &str = "gcs_mtime_millis";

pub fn encode_mtime(millis: u64) -> Vec<u8> {
    millis.to_be_bytes().to_vec()
}

pub fn decode_mtime(raw: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Point-in-time snapshot of one store entity.
///
/// Two synthetic forms exist: [`ItemInfo::not_found`] (a lookup that resolved
/// to nothing) and [`ItemInfo::inferred_directory`] (a directory that exists
/// only as a prefix of other objects).
#[derive(Debug, Clone, PartialEq)]
pub struct ItemInfo {
    pub resource_id: ResourceId,
    pub exists: bool,
    pub size: u64,
    pub creation_time_ms: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub metadata: HashMap<String, Vec<u8>>,
    pub bucket_location: Option<String>,
    pub storage_class: Option<String>,
    /// Per-object version used in write preconditions. `None` for buckets,
    /// the root, and synthetic infos.
    pub generation: Option<u64>,
    /// True when this directory was synthesized from child listings rather
    /// than read from the store.
    pub inferred: bool,
}

impl ItemInfo {
    pub fn not_found(resource_id: ResourceId) -> ItemInfo {
        ItemInfo {
            resource_id,
            exists: false,
            size: 0,
            creation_time_ms: 0,
            content_type: None,
            content_encoding: None,
            metadata: HashMap::new(),
            bucket_location: None,
            storage_class: None,
            generation: None,
            inferred: false,
        }
    }

    /// An in-memory directory status with no corresponding stored object.
    pub fn inferred_directory(resource_id: ResourceId) -> ItemInfo {
        let dir = paths::to_directory_path(&resource_id);
        ItemInfo { exists: true, inferred: true, ..ItemInfo::not_found(dir) }
    }

    /// The root of the namespace always exists.
    pub fn root() -> ItemInfo {
        ItemInfo { exists: true, ..ItemInfo::not_found(ResourceId::Root) }
    }

    pub fn is_directory(&self) -> bool {
        self.resource_id.is_directory()
    }

    /// Modification time from the [`MTIME_ATTRIBUTE`] metadata entry, falling
    /// back to the creation time when absent or malformed.
    pub fn modification_time_ms(&self) -> u64 {
        self.metadata
            .get(MTIME_ATTRIBUTE)
            .and_then(|raw| decode_mtime(raw))
            .unwrap_or(self.creation_time_ms)
    }
}

/// Path-level view of an [`ItemInfo`], addressed by `gs://` URI.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub path: String,
    pub item: ItemInfo,
    /// Advisory POSIX permission bits reported to callers; never enforced.
    pub permissions: u32,
}

impl FileInfo {
    pub fn from_item(item: ItemInfo, permissions: u32) -> FileInfo {
        FileInfo { path: item.resource_id.to_string(), item, permissions }
    }

    pub fn exists(&self) -> bool {
        self.item.exists
    }

    pub fn is_directory(&self) -> bool {
        self.item.is_directory()
    }

    pub fn size(&self) -> u64 {
        self.item.size
    }

    pub fn modification_time_ms(&self) -> u64 {
        self.item.modification_time_ms()
    }
}

/// Options for creating a file through the facade or the store client.
#[derive(Debug, Clone, Default)]
pub struct CreateFileOptions {
    /// When false, creation carries an "object must not exist" precondition.
    pub overwrite: bool,
    pub content_type: Option<String>,
    pub attributes: HashMap<String, Vec<u8>>,
    /// Hint that the payload should be sent without resumable-upload
    /// buffering.
    pub use_direct_upload: bool,
}

/// Options for opening a read channel.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Verify existence at open time instead of on the first read.
    pub fast_fail_on_not_found: bool,
    /// Forward seeks up to this many bytes are served by reading through the
    /// current window instead of issuing a new ranged request.
    pub inplace_seek_limit: u64,
    /// Prefetch window size for ranged reads.
    pub buffer_size: usize,
    /// Allow reading gzip-content-encoded objects. Ranged resume is
    /// impossible for those; recovery re-reads from the start and the
    /// delivered length may disagree with the stored object size.
    pub support_gzip_encoding: bool,
}

impl Default for ReadOptions {
    fn default() -> ReadOptions {
        ReadOptions {
            fast_fail_on_not_found: true,
            inplace_seek_limit: 8 * 1024 * 1024,
            buffer_size: 2 * 1024 * 1024,
            support_gzip_encoding: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtime_codec_round_trip() {
        let encoded = encode_mtime(1_722_000_000_123);
        assert_eq!(encoded.len(), 8);
        assert_eq!(decode_mtime(&encoded), Some(1_722_000_000_123));
        assert_eq!(decode_mtime(&[1, 2, 3]), None);
    }

    #[test]
    fn modification_time_falls_back_to_creation() {
        let id = ResourceId::parse("gs://b/x", false).unwrap();
        let mut info = ItemInfo::not_found(id);
        info.creation_time_ms = 42;
        assert_eq!(info.modification_time_ms(), 42);
        info.metadata.insert(MTIME_ATTRIBUTE.to_string(), encode_mtime(99));
        assert_eq!(info.modification_time_ms(), 99);
    }

    #[test]
    fn inferred_directory_is_synthetic() {
        let id = ResourceId::parse("gs://b/d", false).unwrap();
        let info = ItemInfo::inferred_directory(id);
        assert!(info.exists);
        assert!(info.inferred);
        assert!(info.is_directory());
        assert_eq!(info.size, 0);
        assert_eq!(info.resource_id.object_name(), Some("d/"));
    }
}
