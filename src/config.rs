use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::error::FsError;

pub const DEFAULT_MAX_ENTRY_AGE_MS: u64 = 4 * 60 * 60 * 1000;
pub const DEFAULT_MAX_INFO_AGE_MS: u64 = 5 * 1000;
pub const MIN_WRITE_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Which directory list cache backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheBackendKind {
    #[default]
    InMemory,
    /// Mirrors entries as empty files on a shared mount so a cluster of
    /// processes agrees on which just-written objects must appear in
    /// listings.
    FilesystemBacked,
}

/// Truncated exponential backoff applied to every retriable RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> RetryOptions {
        RetryOptions {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

impl RetryOptions {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(raw.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Controls the background parent-directory timestamp updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampUpdateOptions {
    pub enabled: bool,
    /// Substring filters over the parent URI. Excludes win; an empty include
    /// list means "everything".
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

impl Default for TimestampUpdateOptions {
    fn default() -> TimestampUpdateOptions {
        TimestampUpdateOptions { enabled: true, includes: Vec::new(), excludes: Vec::new() }
    }
}

impl TimestampUpdateOptions {
    pub fn should_update(&self, uri: &str) -> bool {
        if self.excludes.iter().any(|pattern| uri.contains(pattern.as_str())) {
            return false;
        }
        self.includes.is_empty()
            || self.includes.iter().any(|pattern| uri.contains(pattern.as_str()))
    }
}

/// Options recognized by [`crate::fs::GcsFileSystem`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsFsOptions {
    pub metadata_cache_enabled: bool,
    pub metadata_cache_type: CacheBackendKind,
    /// Required when the cache is filesystem-backed.
    pub metadata_cache_base_path: Option<PathBuf>,
    /// Entry eligible for eviction past this age.
    pub metadata_cache_max_entry_age_ms: u64,
    /// Stale item info must be refetched before being trusted for
    /// negative-existence decisions.
    pub metadata_cache_max_info_age_ms: u64,
    pub infer_implicit_directories: bool,
    /// Materialize missing directory placeholders found during listing.
    pub auto_repair_implicit_directories: bool,
    /// Materialize a zero-byte placeholder before returning a writer, to
    /// fail fast on create conflicts.
    pub create_marker_files: bool,
    pub timestamp_updates: TimestampUpdateOptions,
    /// Advisory permission bits attached to every reported file status.
    pub reported_permissions: u32,
    pub write_chunk_size: usize,
    pub retry: RetryOptions,
}

impl Default for GcsFsOptions {
    fn default() -> GcsFsOptions {
        GcsFsOptions {
            metadata_cache_enabled: true,
            metadata_cache_type: CacheBackendKind::InMemory,
            metadata_cache_base_path: None,
            metadata_cache_max_entry_age_ms: DEFAULT_MAX_ENTRY_AGE_MS,
            metadata_cache_max_info_age_ms: DEFAULT_MAX_INFO_AGE_MS,
            infer_implicit_directories: true,
            auto_repair_implicit_directories: false,
            create_marker_files: false,
            timestamp_updates: TimestampUpdateOptions::default(),
            reported_permissions: 0o700,
            write_chunk_size: MIN_WRITE_CHUNK_SIZE,
            retry: RetryOptions::default(),
        }
    }
}

impl GcsFsOptions {
    /// Reads options from `GCSFS_*` environment variables, loading a `.env`
    /// file first if one exists. Unset variables keep their defaults.
    pub fn from_env() -> Result<GcsFsOptions, FsError> {
        dotenv().ok();
        let defaults = GcsFsOptions::default();

        let metadata_cache_enabled = env_bool("GCSFS_METADATA_CACHE_ENABLED")
            .unwrap_or(defaults.metadata_cache_enabled);

        let metadata_cache_type = match env::var("GCSFS_METADATA_CACHE_TYPE") {
            Ok(value) if value.eq_ignore_ascii_case("filesystem_backed") => {
                CacheBackendKind::FilesystemBacked
            }
            Ok(value) if value.eq_ignore_ascii_case("in_memory") => CacheBackendKind::InMemory,
            Ok(value) => {
                return Err(FsError::Config(format!("unknown metadata cache type '{value}'")));
            }
            Err(_) => defaults.metadata_cache_type,
        };

        let metadata_cache_base_path =
            env::var("GCSFS_METADATA_CACHE_BASE_PATH").ok().map(PathBuf::from);

        let options = GcsFsOptions {
            metadata_cache_enabled,
            metadata_cache_type,
            metadata_cache_base_path,
            metadata_cache_max_entry_age_ms: env_u64(
                "GCSFS_METADATA_CACHE_MAX_ENTRY_AGE_MS",
                defaults.metadata_cache_max_entry_age_ms,
            )?,
            metadata_cache_max_info_age_ms: env_u64(
                "GCSFS_METADATA_CACHE_MAX_INFO_AGE_MS",
                defaults.metadata_cache_max_info_age_ms,
            )?,
            infer_implicit_directories: env_bool("GCSFS_INFER_IMPLICIT_DIRECTORIES")
                .unwrap_or(defaults.infer_implicit_directories),
            auto_repair_implicit_directories: env_bool("GCSFS_AUTO_REPAIR_IMPLICIT_DIRECTORIES")
                .unwrap_or(defaults.auto_repair_implicit_directories),
            create_marker_files: env_bool("GCSFS_CREATE_MARKER_FILES")
                .unwrap_or(defaults.create_marker_files),
            timestamp_updates: TimestampUpdateOptions {
                enabled: env_bool("GCSFS_TIMESTAMP_UPDATES_ENABLED")
                    .unwrap_or(defaults.timestamp_updates.enabled),
                includes: env_list("GCSFS_TIMESTAMP_UPDATES_INCLUDES"),
                excludes: env_list("GCSFS_TIMESTAMP_UPDATES_EXCLUDES"),
            },
            reported_permissions: defaults.reported_permissions,
            write_chunk_size: env_u64("GCSFS_WRITE_CHUNK_SIZE", defaults.write_chunk_size as u64)?
                as usize,
            retry: RetryOptions {
                max_attempts: env_u64("GCSFS_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts as u64)?
                    as u32,
                initial_backoff_ms: env_u64(
                    "GCSFS_RETRY_INITIAL_BACKOFF_MS",
                    defaults.retry.initial_backoff_ms,
                )?,
                max_backoff_ms: env_u64("GCSFS_RETRY_MAX_BACKOFF_MS", defaults.retry.max_backoff_ms)?,
                multiplier: defaults.retry.multiplier,
            },
        };
        options.validated()
    }

    /// Checks cross-field constraints and normalizes the write chunk size.
    pub fn validated(mut self) -> Result<GcsFsOptions, FsError> {
        if self.metadata_cache_enabled
            && self.metadata_cache_type == CacheBackendKind::FilesystemBacked
            && self.metadata_cache_base_path.is_none()
        {
            return Err(FsError::Config(
                "filesystem-backed metadata cache requires a base path".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(FsError::Config("retry max_attempts must be at least 1".to_string()));
        }
        self.write_chunk_size = normalize_write_chunk_size(self.write_chunk_size);
        Ok(self)
    }
}

/// Rounds up to the minimum chunk size, then up to the next multiple of it.
fn normalize_write_chunk_size(requested: usize) -> usize {
    if requested < MIN_WRITE_CHUNK_SIZE {
        log::warn!(
            "[config] write chunk size {requested} below minimum, rounding up to {MIN_WRITE_CHUNK_SIZE}"
        );
        return MIN_WRITE_CHUNK_SIZE;
    }
    if !requested.is_multiple_of(MIN_WRITE_CHUNK_SIZE) {
        let rounded = requested.div_ceil(MIN_WRITE_CHUNK_SIZE) * MIN_WRITE_CHUNK_SIZE;
        log::warn!(
            "[config] write chunk size {requested} is not a multiple of {MIN_WRITE_CHUNK_SIZE}, rounding up to {rounded}"
        );
        return rounded;
    }
    requested
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| value.to_lowercase().contains("true"))
}

fn env_u64(key: &str, default: u64) -> Result<u64, FsError> {
    match env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map_err(|_| FsError::Config(format!("{key} must be an integer, got '{value}'"))),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| String::new())
        .split(',')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn chunk_size_normalization() {
        assert_eq!(normalize_write_chunk_size(1), MIN_WRITE_CHUNK_SIZE);
        assert_eq!(normalize_write_chunk_size(MIN_WRITE_CHUNK_SIZE), MIN_WRITE_CHUNK_SIZE);
        assert_eq!(
            normalize_write_chunk_size(MIN_WRITE_CHUNK_SIZE + 1),
            2 * MIN_WRITE_CHUNK_SIZE
        );
    }

    #[test]
    fn backoff_curve_is_truncated() {
        let retry = RetryOptions::default();
        assert_eq!(retry.delay_for(0), Duration::from_millis(250));
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(10), Duration::from_millis(8_000));
    }

    #[test]
    fn timestamp_filters() {
        let options = TimestampUpdateOptions {
            enabled: true,
            includes: vec!["data/".to_string()],
            excludes: vec!["tmp".to_string()],
        };
        assert!(options.should_update("gs://b/data/x/"));
        assert!(!options.should_update("gs://b/data/tmp/"));
        assert!(!options.should_update("gs://b/other/"));
    }

    #[test]
    fn filesystem_cache_requires_base_path() {
        let options = GcsFsOptions {
            metadata_cache_type: CacheBackendKind::FilesystemBacked,
            ..GcsFsOptions::default()
        };
        assert!(options.validated().is_err());
    }

    #[test]
    #[serial]
    fn from_env_overrides_defaults() {
        unsafe {
            env::set_var("GCSFS_INFER_IMPLICIT_DIRECTORIES", "false");
            env::set_var("GCSFS_RETRY_MAX_ATTEMPTS", "2");
        }
        let options = GcsFsOptions::from_env().unwrap();
        assert!(!options.infer_implicit_directories);
        assert_eq!(options.retry.max_attempts, 2);
        unsafe {
            env::remove_var("GCSFS_INFER_IMPLICIT_DIRECTORIES");
            env::remove_var("GCSFS_RETRY_MAX_ATTEMPTS");
        }
    }

    #[test]
    #[serial]
    fn from_env_rejects_garbage_numbers() {
        unsafe {
            env::set_var("GCSFS_RETRY_MAX_BACKOFF_MS", "soon");
        }
        assert!(GcsFsOptions::from_env().is_err());
        unsafe {
            env::remove_var("GCSFS_RETRY_MAX_BACKOFF_MS");
        }
    }
}
