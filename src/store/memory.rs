//! Full-fidelity in-memory [`RawStore`]: buckets, generations, delimiter
//! listings, compose, metadata patches. Listing order matches the service's
//! lexicographic ordering. Used by the test suite and usable as a test
//! double by downstream crates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use crate::error::StoreError;
use crate::store::raw::{
    InsertPrecondition, InsertSpec, RawBucket, RawListing, RawObject, RawStore,
};

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, BucketState>,
    generation_counter: u64,
}

struct BucketState {
    info: RawBucket,
    objects: BTreeMap<String, ObjectState>,
}

#[derive(Clone)]
struct ObjectState {
    data: Bytes,
    meta: RawObject,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> InMemoryStore {
        InMemoryStore::default()
    }

    /// Convenience for tests: a store with the given buckets pre-created.
    pub fn with_buckets(names: &[&str]) -> InMemoryStore {
        let store = InMemoryStore::new();
        {
            let mut state = store.state.lock().expect("store lock");
            for name in names {
                state.buckets.insert((*name).to_string(), BucketState::new(name));
            }
        }
        store
    }

    fn check_precondition(
        existing: Option<&ObjectState>,
        precondition: InsertPrecondition,
        name: &str,
    ) -> Result<(), StoreError> {
        match (precondition, existing) {
            (InsertPrecondition::None, _) => Ok(()),
            (InsertPrecondition::DoesNotExist, None) => Ok(()),
            (InsertPrecondition::DoesNotExist, Some(_)) => {
                Err(StoreError::PreconditionFailed(format!("object '{name}' already exists")))
            }
            (InsertPrecondition::GenerationMatches(generation), Some(object))
                if object.meta.generation == generation =>
            {
                Ok(())
            }
            (InsertPrecondition::GenerationMatches(generation), current) => {
                Err(StoreError::PreconditionFailed(format!(
                    "object '{name}' generation {:?} does not match required {generation}",
                    current.map(|object| object.meta.generation)
                )))
            }
        }
    }
}

impl BucketState {
    fn new(name: &str) -> BucketState {
        BucketState {
            info: RawBucket {
                name: name.to_string(),
                creation_time: Utc::now(),
                location: Some("US".to_string()),
                storage_class: Some("STANDARD".to_string()),
            },
            objects: BTreeMap::new(),
        }
    }
}

fn bucket_not_found(bucket: &str) -> StoreError {
    StoreError::NotFound(format!("bucket '{bucket}'"))
}

fn object_not_found(bucket: &str, name: &str) -> StoreError {
    StoreError::NotFound(format!("object 'gs://{bucket}/{name}'"))
}

#[async_trait]
impl RawStore for InMemoryStore {
    async fn get_object(&self, bucket: &str, name: &str) -> Result<Option<RawObject>, StoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(name))
            .map(|object| object.meta.clone()))
    }

    async fn insert_object(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
        spec: &InsertSpec,
    ) -> Result<RawObject, StoreError> {
        let mut state = self.state.lock().expect("store lock");
        state.generation_counter += 1;
        let generation = state.generation_counter;
        let bucket_state = state.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        Self::check_precondition(bucket_state.objects.get(name), spec.precondition, name)?;

        let meta = RawObject {
            bucket: bucket.to_string(),
            name: name.to_string(),
            size: data.len() as u64,
            generation,
            creation_time: Utc::now(),
            content_type: spec.content_type.clone(),
            content_encoding: spec.content_encoding.clone(),
            storage_class: Some("STANDARD".to_string()),
            metadata: spec.metadata.clone(),
        };
        bucket_state.objects.insert(name.to_string(), ObjectState { data, meta: meta.clone() });
        Ok(meta)
    }

    async fn read_object(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes, StoreError> {
        let state = self.state.lock().expect("store lock");
        let object = state
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(name))
            .ok_or_else(|| object_not_found(bucket, name))?;
        let total = object.data.len() as u64;
        if offset > total {
            return Err(StoreError::Fatal(format!(
                "read offset {offset} past end of object ({total} bytes)"
            )));
        }
        let end = match length {
            Some(length) => total.min(offset + length),
            None => total,
        };
        Ok(object.data.slice(offset as usize..end as usize))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<RawListing, StoreError> {
        let state = self.state.lock().expect("store lock");
        let bucket_state = state.buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;

        let mut listing = RawListing::default();
        let mut prefixes = BTreeSet::new();
        for (name, object) in bucket_state.objects.range(prefix.to_string()..) {
            if !name.starts_with(prefix) {
                break;
            }
            let rest = &name[prefix.len()..];
            match delimiter.and_then(|delim| rest.find(delim)) {
                Some(idx) => {
                    prefixes.insert(format!("{prefix}{}", &rest[..=idx]));
                }
                None => listing.objects.push(object.meta.clone()),
            }
            if let Some(max) = max_results
                && listing.objects.len() + prefixes.len() >= max
            {
                break;
            }
        }
        listing.prefixes = prefixes.into_iter().collect();
        Ok(listing)
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
        precondition: InsertPrecondition,
    ) -> Result<RawObject, StoreError> {
        let mut state = self.state.lock().expect("store lock");
        state.generation_counter += 1;
        let generation = state.generation_counter;

        let source = state
            .buckets
            .get(src_bucket)
            .and_then(|b| b.objects.get(src_name))
            .cloned()
            .ok_or_else(|| object_not_found(src_bucket, src_name))?;
        let destination =
            state.buckets.get_mut(dst_bucket).ok_or_else(|| bucket_not_found(dst_bucket))?;
        Self::check_precondition(destination.objects.get(dst_name), precondition, dst_name)?;

        let meta = RawObject {
            bucket: dst_bucket.to_string(),
            name: dst_name.to_string(),
            generation,
            creation_time: Utc::now(),
            ..source.meta
        };
        destination
            .objects
            .insert(dst_name.to_string(), ObjectState { data: source.data, meta: meta.clone() });
        Ok(meta)
    }

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store lock");
        let bucket_state = state.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        let existing =
            bucket_state.objects.get(name).ok_or_else(|| object_not_found(bucket, name))?;
        if let Some(generation) = generation
            && existing.meta.generation != generation
        {
            return Err(StoreError::PreconditionFailed(format!(
                "object '{name}' generation {} does not match required {generation}",
                existing.meta.generation
            )));
        }
        bucket_state.objects.remove(name);
        Ok(())
    }

    async fn compose_objects(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<RawObject, StoreError> {
        let mut state = self.state.lock().expect("store lock");
        state.generation_counter += 1;
        let generation = state.generation_counter;
        let bucket_state = state.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;

        let mut combined = Vec::new();
        for source in sources {
            let object =
                bucket_state.objects.get(source).ok_or_else(|| object_not_found(bucket, source))?;
            combined.extend_from_slice(&object.data);
        }
        let data = Bytes::from(combined);
        let meta = RawObject {
            bucket: bucket.to_string(),
            name: dest.to_string(),
            size: data.len() as u64,
            generation,
            creation_time: Utc::now(),
            content_type: content_type.map(str::to_owned),
            content_encoding: None,
            storage_class: Some("STANDARD".to_string()),
            metadata: HashMap::new(),
        };
        bucket_state.objects.insert(dest.to_string(), ObjectState { data, meta: meta.clone() });
        Ok(meta)
    }

    async fn patch_object_metadata(
        &self,
        bucket: &str,
        name: &str,
        delta: &HashMap<String, Option<Vec<u8>>>,
        generation: Option<u64>,
    ) -> Result<RawObject, StoreError> {
        let mut state = self.state.lock().expect("store lock");
        let bucket_state = state.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        let object =
            bucket_state.objects.get_mut(name).ok_or_else(|| object_not_found(bucket, name))?;
        if let Some(generation) = generation
            && object.meta.generation != generation
        {
            return Err(StoreError::PreconditionFailed(format!(
                "object '{name}' generation {} does not match required {generation}",
                object.meta.generation
            )));
        }
        for (key, value) in delta {
            match value {
                Some(value) => {
                    object.meta.metadata.insert(key.clone(), value.clone());
                }
                None => {
                    object.meta.metadata.remove(key);
                }
            }
        }
        Ok(object.meta.clone())
    }

    async fn get_bucket(&self, name: &str) -> Result<Option<RawBucket>, StoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.buckets.get(name).map(|b| b.info.clone()))
    }

    async fn list_buckets(&self) -> Result<Vec<RawBucket>, StoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.buckets.values().map(|b| b.info.clone()).collect())
    }

    async fn insert_bucket(&self, name: &str) -> Result<RawBucket, StoreError> {
        let mut state = self.state.lock().expect("store lock");
        if state.buckets.contains_key(name) {
            return Err(StoreError::PreconditionFailed(format!("bucket '{name}' already exists")));
        }
        let bucket = BucketState::new(name);
        let info = bucket.info.clone();
        state.buckets.insert(name.to_string(), bucket);
        Ok(info)
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store lock");
        let bucket = state.buckets.get(name).ok_or_else(|| bucket_not_found(name))?;
        if !bucket.objects.is_empty() {
            return Err(StoreError::PreconditionFailed(format!("bucket '{name}' is not empty")));
        }
        state.buckets.remove(name);
        Ok(())
    }
}
