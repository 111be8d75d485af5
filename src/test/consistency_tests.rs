//! The cache-supplemented client: read-your-writes over lagging listings,
//! merge dedup, and stale-info refresh.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{CacheConfig, DirectoryListCache, InMemoryListCache};
use crate::config::RetryOptions;
use crate::model::CreateFileOptions;
use crate::resource::ResourceId;
use crate::store::{CachedStorage, GcsClient, InMemoryStore, RawStore, Storage};
use crate::test::fault::LaggingStore;

const CHUNK: usize = 8 * 1024 * 1024;

fn retry() -> RetryOptions {
    RetryOptions { max_attempts: 2, initial_backoff_ms: 1, max_backoff_ms: 2, multiplier: 2.0 }
}

fn cache_config(max_info_age_ms: u64) -> CacheConfig {
    CacheConfig { max_entry_age_ms: 60_000, max_info_age_ms }
}

fn stack(
    raw: Arc<dyn RawStore>,
    max_info_age_ms: u64,
) -> (Arc<dyn DirectoryListCache>, CachedStorage) {
    let cache: Arc<dyn DirectoryListCache> =
        Arc::new(InMemoryListCache::new(cache_config(max_info_age_ms)));
    let client = Arc::new(GcsClient::new(raw, retry(), true, CHUNK));
    (Arc::clone(&cache), CachedStorage::new(client, cache))
}

fn object(name: &str) -> ResourceId {
    ResourceId::Object { bucket: "b".to_string(), name: name.to_string() }
}

#[tokio::test]
async fn writes_show_up_in_lagging_listings() {
    let lagging = Arc::new(LaggingStore::new(Arc::new(InMemoryStore::with_buckets(&["b"]))));
    let (_, storage) = stack(lagging.clone() as Arc<dyn RawStore>, 60_000);

    let id = object("d/just-written");
    let mut writer = storage
        .create_writer(&id, &CreateFileOptions::default(), None)
        .await
        .unwrap();
    writer.write(b"payload").unwrap();
    writer.close().await.unwrap();
    // The store lags: listings no longer report the object even though a
    // point lookup finds it.
    lagging.hide_from_listings("b", "d/just-written");

    let names = storage.list_object_names("b", "d/", None, None).await.unwrap();
    assert!(names.contains(&"d/just-written".to_string()), "cache did not mask the lag: {names:?}");

    let infos = storage.list_object_infos("b", "d/", None, None).await.unwrap();
    assert!(infos.iter().any(|info| info.resource_id == id));
}

#[tokio::test]
async fn merged_listing_has_no_duplicates() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let (_, storage) = stack(raw as Arc<dyn RawStore>, 60_000);

    // The object is both in the store listing and freshly cached.
    storage.create_empty(&object("d/x")).await.unwrap();

    let infos = storage.list_object_infos("b", "d/", None, None).await.unwrap();
    let ids: Vec<&ResourceId> = infos.iter().map(|info| &info.resource_id).collect();
    let unique: HashSet<&ResourceId> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len(), "duplicates in {ids:?}");
}

#[tokio::test]
async fn stale_cache_entries_are_refetched_and_dropped() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let (cache, storage) = stack(raw as Arc<dyn RawStore>, 0);

    // An entry for an object the store never heard of, with no attached
    // info: the supplement path must refetch and then discard it.
    cache.put_resource(&object("d/phantom")).await.unwrap();
    let names = storage.list_object_names("b", "d/", None, None).await.unwrap();
    assert!(!names.contains(&"d/phantom".to_string()));
    assert!(cache.get_entry(&object("d/phantom")).await.unwrap().is_none());
}

#[tokio::test]
async fn deletes_purge_cache_entries() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let (cache, storage) = stack(raw as Arc<dyn RawStore>, 60_000);

    let id = object("f");
    storage.create_empty(&id).await.unwrap();
    assert!(cache.get_entry(&id).await.unwrap().is_some());

    storage.delete_objects(std::slice::from_ref(&id)).await.unwrap();
    assert!(cache.get_entry(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn copies_record_destinations() {
    let raw = Arc::new(InMemoryStore::with_buckets(&["b"]));
    let (cache, storage) = stack(raw as Arc<dyn RawStore>, 60_000);

    storage.create_empty(&object("src")).await.unwrap();
    storage
        .copy("b", &["src".to_string()], "b", &["dst".to_string()])
        .await
        .unwrap();
    assert!(cache.get_entry(&object("dst")).await.unwrap().is_some());
}

#[tokio::test]
async fn bucket_listing_supplemented_from_cache() {
    let raw = Arc::new(InMemoryStore::new());
    let (_, storage) = stack(raw as Arc<dyn RawStore>, 60_000);

    storage.create_bucket("cached-bucket").await.unwrap();
    let names = storage.list_bucket_names().await.unwrap();
    assert!(names.contains(&"cached-bucket".to_string()));
}
