//! End-to-end facade scenarios against the in-memory store.

use std::sync::Arc;

use crate::config::{GcsFsOptions, RetryOptions, TimestampUpdateOptions};
use crate::error::{FsError, StoreError};
use crate::fs::GcsFileSystem;
use crate::model::{CreateFileOptions, ReadOptions};
use crate::store::{InMemoryStore, RawStore};

fn test_options() -> GcsFsOptions {
    GcsFsOptions {
        timestamp_updates: TimestampUpdateOptions { enabled: false, ..Default::default() },
        retry: RetryOptions {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            multiplier: 2.0,
        },
        ..GcsFsOptions::default()
    }
}

fn filesystem(raw: Arc<InMemoryStore>) -> GcsFileSystem {
    GcsFileSystem::new(raw, test_options()).unwrap()
}

async fn object_exists(raw: &InMemoryStore, bucket: &str, name: &str) -> bool {
    raw.get_object(bucket, name).await.unwrap().is_some()
}

async fn write_file(fs: &GcsFileSystem, path: &str, data: &[u8]) {
    let mut writer = fs.create(path, CreateFileOptions::default()).await.unwrap();
    writer.write(data).unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn mkdirs_materializes_every_prefix() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());

    fs.mkdirs("gs://b/a/b/c").await.unwrap();

    for placeholder in ["a/", "a/b/", "a/b/c/"] {
        assert!(object_exists(&raw, "b", placeholder).await, "missing {placeholder}");
    }
    // No file-named siblings were materialized.
    for sibling in ["a", "a/b", "a/b/c"] {
        assert!(!object_exists(&raw, "b", sibling).await, "unexpected {sibling}");
    }
}

#[tokio::test]
async fn mkdirs_fails_on_file_at_prefix_without_creating_anything() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/x", b"data").await;

    let err = fs.mkdirs("gs://b/x/y").await.unwrap_err();
    assert!(matches!(err, FsError::InvalidArgument(_)), "got {err}");
    assert!(!object_exists(&raw, "b", "x/").await);
    assert!(!object_exists(&raw, "b", "x/y/").await);
}

#[tokio::test]
async fn mkdirs_creates_missing_bucket() {
    let raw = Arc::new(InMemoryStore::new());
    let fs = filesystem(raw.clone());
    fs.mkdirs("gs://fresh/dir").await.unwrap();
    assert!(raw.get_bucket("fresh").await.unwrap().is_some());
    assert!(object_exists(&raw, "fresh", "dir/").await);
}

#[tokio::test]
async fn list_status_infers_implicit_directory() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/d/1", b"one").await;
    write_file(&fs, "gs://b/d/2", b"two").await;
    // The files were created through the facade, which made "d/" real; drop
    // it to leave a purely implicit directory.
    raw.delete_object("b", "d/", None).await.unwrap();

    let children = fs.list_status("gs://b/d").await.unwrap();
    let mut paths: Vec<&str> = children.iter().map(|info| info.path.as_str()).collect();
    paths.sort_unstable();
    assert_eq!(paths, vec!["gs://b/d/1", "gs://b/d/2"]);

    let status = fs.get_status("gs://b/d").await.unwrap();
    assert!(status.is_directory());
    assert!(status.item.inferred);
    assert_eq!(status.path, "gs://b/d/");
}

#[tokio::test]
async fn inference_disabled_means_not_found() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = GcsFileSystem::new(
        raw.clone(),
        GcsFsOptions { infer_implicit_directories: false, ..test_options() },
    )
    .unwrap();
    write_file(&fs, "gs://b/d/1", b"one").await;
    raw.delete_object("b", "d/", None).await.unwrap();

    assert!(matches!(fs.get_status("gs://b/d").await, Err(FsError::NotFound(_))));
    assert!(matches!(fs.list_status("gs://b/d").await, Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn non_recursive_delete_of_non_empty_directory_fails() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/dir/f", b"payload").await;

    let err = fs.delete("gs://b/dir", false).await.unwrap_err();
    assert!(matches!(err, FsError::DirectoryNotEmpty(_)), "got {err}");
    assert!(object_exists(&raw, "b", "dir/f").await);
    assert!(object_exists(&raw, "b", "dir/").await);
}

#[tokio::test]
async fn recursive_delete_removes_subtree_children_first() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/dir/f", b"x").await;
    write_file(&fs, "gs://b/dir/sub/g", b"y").await;

    fs.delete("gs://b/dir", true).await.unwrap();
    for name in ["dir/", "dir/f", "dir/sub/", "dir/sub/g"] {
        assert!(!object_exists(&raw, "b", name).await, "survived: {name}");
    }
}

#[tokio::test]
async fn delete_of_missing_path_is_not_found() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw);
    assert!(matches!(fs.delete("gs://b/nope", false).await, Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn recursive_delete_of_bucket_removes_it() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/a/f", b"x").await;

    fs.delete("gs://b", true).await.unwrap();
    assert!(raw.get_bucket("b").await.unwrap().is_none());
}

#[tokio::test]
async fn rename_directory_moves_subtree() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/src/a", b"a").await;
    write_file(&fs, "gs://b/src/b/c", b"c").await;

    fs.rename("gs://b/src", "gs://b/dst").await.unwrap();

    for name in ["dst/", "dst/a", "dst/b/", "dst/b/c"] {
        assert!(object_exists(&raw, "b", name).await, "missing {name}");
    }
    for name in ["src/", "src/a", "src/b/", "src/b/c"] {
        assert!(!object_exists(&raw, "b", name).await, "survived: {name}");
    }
    assert!(!fs.exists("gs://b/src").await.unwrap());
    assert!(fs.exists("gs://b/dst").await.unwrap());
}

#[tokio::test]
async fn rename_directory_into_existing_directory_appends_leaf() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/src/f", b"f").await;
    fs.mkdirs("gs://b/dst").await.unwrap();

    fs.rename("gs://b/src", "gs://b/dst").await.unwrap();
    assert!(object_exists(&raw, "b", "dst/src/").await);
    assert!(object_exists(&raw, "b", "dst/src/f").await);
    assert!(!object_exists(&raw, "b", "src/f").await);
}

#[tokio::test]
async fn rename_file_into_existing_directory_appends_leaf() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/f.txt", b"payload").await;
    fs.mkdirs("gs://b/dir").await.unwrap();

    fs.rename("gs://b/f.txt", "gs://b/dir").await.unwrap();
    assert!(object_exists(&raw, "b", "dir/f.txt").await);
    assert!(!object_exists(&raw, "b", "f.txt").await);
}

#[tokio::test]
async fn rename_rejections() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/f", b"f").await;
    write_file(&fs, "gs://b/g", b"g").await;

    assert!(matches!(
        fs.rename("gs:/", "gs://b/x").await,
        Err(FsError::InvalidArgument(_))
    ));
    assert!(matches!(
        fs.rename("gs://b/f", "gs:/").await,
        Err(FsError::InvalidArgument(_))
    ));
    assert!(matches!(
        fs.rename("gs://b/missing", "gs://b/x").await,
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        fs.rename("gs://b/f", "gs://b/g").await,
        Err(FsError::AlreadyExists(_))
    ));
    assert!(matches!(
        fs.rename("gs://b/f", "gs://b/no/such/parent/x").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn rename_file_round_trips_content() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/old", b"the payload").await;

    fs.rename("gs://b/old", "gs://b/new").await.unwrap();
    let mut reader = fs.open("gs://b/new", ReadOptions::default()).await.unwrap();
    let mut buffer = [0u8; 64];
    let read = reader.read(&mut buffer).await.unwrap();
    assert_eq!(&buffer[..read], b"the payload");
}

#[tokio::test]
async fn create_conflicts_with_marker_files() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = GcsFileSystem::new(
        raw.clone(),
        GcsFsOptions { create_marker_files: true, ..test_options() },
    )
    .unwrap();

    let mut winner = fs.create("gs://b/f.txt", CreateFileOptions::default()).await.unwrap();
    let err = fs.create("gs://b/f.txt", CreateFileOptions::default()).await.unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)), "got {err}");

    winner.write(b"content").unwrap();
    winner.close().await.unwrap();
    let status = fs.get_status("gs://b/f.txt").await.unwrap();
    assert_eq!(status.size(), 7);
}

#[tokio::test]
async fn create_conflicts_without_marker_files_fail_at_close() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());

    let mut first = fs.create("gs://b/f.txt", CreateFileOptions::default()).await.unwrap();
    let mut second = fs.create("gs://b/f.txt", CreateFileOptions::default()).await.unwrap();
    first.write(b"first").unwrap();
    second.write(b"second").unwrap();

    first.close().await.unwrap();
    let err = second.close().await.unwrap_err();
    assert!(matches!(err, StoreError::PreconditionFailed(_)), "got {err}");
}

#[tokio::test]
async fn create_rejects_directory_shaped_targets() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    fs.mkdirs("gs://b/d").await.unwrap();

    assert!(matches!(
        fs.create("gs://b/d/", CreateFileOptions::default()).await,
        Err(FsError::InvalidArgument(_))
    ));
    assert!(matches!(
        fs.create("gs://b/d", CreateFileOptions::default()).await,
        Err(FsError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn create_builds_parent_directories() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/deep/tree/f", b"x").await;
    assert!(object_exists(&raw, "b", "deep/").await);
    assert!(object_exists(&raw, "b", "deep/tree/").await);
}

#[tokio::test]
async fn repair_materializes_implicit_directory() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw.clone());
    write_file(&fs, "gs://b/d/1", b"x").await;
    raw.delete_object("b", "d/", None).await.unwrap();

    assert!(fs.repair_possible_implicit_directory("gs://b/d").await.unwrap());
    assert!(object_exists(&raw, "b", "d/").await);

    // Nothing under the prefix: nothing to repair.
    assert!(!fs.repair_possible_implicit_directory("gs://b/empty").await.unwrap());
    assert!(!object_exists(&raw, "b", "empty/").await);
}

#[tokio::test]
async fn list_status_of_file_returns_single_entry() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw);
    write_file(&fs, "gs://b/d/f", b"x").await;

    let listed = fs.list_status("gs://b/d/f").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, "gs://b/d/f");
    assert!(!listed[0].is_directory());
}

#[tokio::test]
async fn list_status_of_root_lists_buckets() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["alpha", "beta"]));
    let fs = filesystem(raw);
    let mut paths: Vec<String> =
        fs.list_status("gs:/").await.unwrap().into_iter().map(|info| info.path).collect();
    paths.sort();
    assert_eq!(paths, vec!["gs://alpha/", "gs://beta/"]);
}

#[tokio::test]
async fn list_file_names_recursive_and_flat() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw);
    write_file(&fs, "gs://b/d/f", b"x").await;
    write_file(&fs, "gs://b/d/sub/g", b"y").await;

    let status = fs.get_status("gs://b/d").await.unwrap();
    let mut flat = fs.list_file_names(&status, false).await.unwrap();
    flat.sort();
    assert_eq!(flat, vec!["gs://b/d/f", "gs://b/d/sub/"]);

    let mut recursive = fs.list_file_names(&status, true).await.unwrap();
    recursive.sort();
    assert_eq!(recursive, vec!["gs://b/d/f", "gs://b/d/sub/", "gs://b/d/sub/g"]);
}

#[tokio::test]
async fn exists_and_status_agree() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let fs = filesystem(raw);
    write_file(&fs, "gs://b/present", b"x").await;

    assert!(fs.exists("gs://b/present").await.unwrap());
    assert!(!fs.exists("gs://b/absent").await.unwrap());
    assert!(fs.exists("gs://b").await.unwrap());
    assert!(fs.exists("gs:/").await.unwrap());
    assert!(matches!(fs.get_status("gs://b/absent").await, Err(FsError::NotFound(_))));

    let infos = fs.get_file_infos(&["gs://b/present", "gs://b/absent"]).await.unwrap();
    assert!(infos[0].exists());
    assert!(!infos[1].exists());
}
