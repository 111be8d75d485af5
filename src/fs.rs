//! The file-system facade: POSIX-style operations composed from the typed
//! store client, path semantics, the directory list cache and the background
//! timestamp updater.
//!
//! Every operation is safe to call concurrently. Multi-object operations
//! (`mkdirs`, `rename`, recursive `delete`) are sequences of per-object RPCs
//! with no cross-object atomicity: a cancelled or failed call leaves a
//! partially-applied state that an idempotent retry completes.

use std::sync::Arc;

use crate::cache::{CacheConfig, DirectoryListCache, FilesystemListCache, InMemoryListCache};
use crate::config::{CacheBackendKind, GcsFsOptions};
use crate::error::{FsError, FsResult, StoreError};
use crate::model::{CreateFileOptions, FileInfo, ItemInfo, ReadOptions};
use crate::paths;
use crate::resource::{PATH_DELIMITER, ResourceId};
use crate::store::{
    CachedStorage, GcsClient, InsertPrecondition, RawStore, Storage, StorageReader, StorageWriter,
};
use crate::timestamps::{TimestampUpdater, UpdateTask};

pub struct GcsFileSystem {
    storage: Arc<dyn Storage>,
    options: GcsFsOptions,
    timestamps: Option<TimestampUpdater>,
}

impl GcsFileSystem {
    /// Builds the full stack over a raw store: typed client, optional cache
    /// layer, optional timestamp updater. Must be called from within a tokio
    /// runtime (the updater spawns workers).
    pub fn new(raw: Arc<dyn RawStore>, options: GcsFsOptions) -> FsResult<GcsFileSystem> {
        let options = options.validated()?;
        let client = GcsClient::new(
            raw,
            options.retry.clone(),
            options.infer_implicit_directories,
            options.write_chunk_size,
        );
        let storage: Arc<dyn Storage> = if options.metadata_cache_enabled {
            let config = CacheConfig {
                max_entry_age_ms: options.metadata_cache_max_entry_age_ms,
                max_info_age_ms: options.metadata_cache_max_info_age_ms,
            };
            let cache: Arc<dyn DirectoryListCache> = match options.metadata_cache_type {
                CacheBackendKind::InMemory => Arc::new(InMemoryListCache::new(config)),
                CacheBackendKind::FilesystemBacked => {
                    let base = options.metadata_cache_base_path.clone().ok_or_else(|| {
                        FsError::Config(
                            "filesystem-backed metadata cache requires a base path".to_string(),
                        )
                    })?;
                    Arc::new(FilesystemListCache::new(config, base))
                }
            };
            Arc::new(CachedStorage::new(Arc::new(client), cache))
        } else {
            Arc::new(client)
        };
        Ok(Self::assemble(storage, options))
    }

    /// Wires the facade over an already-built storage stack.
    pub fn with_storage(storage: Arc<dyn Storage>, options: GcsFsOptions) -> FsResult<GcsFileSystem> {
        let options = options.validated()?;
        Ok(Self::assemble(storage, options))
    }

    fn assemble(storage: Arc<dyn Storage>, options: GcsFsOptions) -> GcsFileSystem {
        let timestamps = options
            .timestamp_updates
            .enabled
            .then(|| TimestampUpdater::new(Arc::clone(&storage), options.timestamp_updates.clone()));
        GcsFileSystem { storage, options, timestamps }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn options(&self) -> &GcsFsOptions {
        &self.options
    }

    /// Shuts down the background timestamp pool, draining queued updates for
    /// up to ten seconds.
    pub async fn close(&self) {
        if let Some(updater) = &self.timestamps {
            updater.shutdown().await;
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub async fn exists(&self, path: &str) -> FsResult<bool> {
        let id = ResourceId::parse(path, true)?;
        Ok(self.resolve(&id).await?.exists)
    }

    /// Status of `path`, raising `NotFound` when nothing resolves even after
    /// implicit-directory inference.
    pub async fn get_status(&self, path: &str) -> FsResult<FileInfo> {
        let id = ResourceId::parse(path, true)?;
        let info = self.resolve(&id).await?;
        if !info.exists {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(self.file_info(info))
    }

    /// Batch variant of [`GcsFileSystem::get_status`]: positional, with
    /// not-found entries marked rather than raised.
    pub async fn get_file_infos(&self, paths: &[&str]) -> FsResult<Vec<FileInfo>> {
        let mut infos = Vec::with_capacity(paths.len());
        for path in paths {
            let id = ResourceId::parse(path, true)?;
            infos.push(self.file_info(self.resolve(&id).await?));
        }
        Ok(infos)
    }

    /// Resolves a path against both of its forms: the exact one, then the
    /// directory form. A materialized entry always wins over an inferred
    /// one; inference only runs when neither form exists.
    async fn resolve(&self, id: &ResourceId) -> FsResult<ItemInfo> {
        if id.is_root() {
            return Ok(ItemInfo::root());
        }
        let dir_form = paths::to_directory_path(id);
        let ids = if *id == dir_form {
            vec![dir_form.clone()]
        } else {
            vec![id.clone(), dir_form.clone()]
        };
        let infos = self.storage.get_infos(&ids).await?;
        if let Some(found) = infos.into_iter().find(|info| info.exists) {
            return Ok(found);
        }
        if self.options.infer_implicit_directories
            && let Some(info) = self.infer_directory(&dir_form).await
        {
            return Ok(info);
        }
        Ok(ItemInfo::not_found(id.clone()))
    }

    /// A directory exists implicitly when any object lives under its prefix.
    /// Listing failures are tolerated: inference is an optimization, not a
    /// source of truth.
    async fn infer_directory(&self, dir_form: &ResourceId) -> Option<ItemInfo> {
        let ResourceId::Object { bucket, name } = dir_form else {
            return None;
        };
        match self.storage.list_object_names(bucket, name, Some(PATH_DELIMITER), Some(1)).await {
            Ok(children) if !children.is_empty() => {
                Some(ItemInfo::inferred_directory(dir_form.clone()))
            }
            Ok(_) => None,
            Err(error) => {
                log::debug!("[fs] inference listing under '{dir_form}' failed: {error}");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------

    /// Children of a directory, or the file itself for a file path.
    pub async fn list_status(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let id = ResourceId::parse(path, true)?;
        if id.is_root() {
            let buckets = self.storage.list_bucket_infos().await?;
            return Ok(buckets.into_iter().map(|info| self.file_info(info)).collect());
        }
        let dir_form = paths::to_directory_path(&id);
        let ids = if id == dir_form {
            vec![dir_form.clone()]
        } else {
            vec![id.clone(), dir_form.clone()]
        };
        let mut infos = self.storage.get_infos(&ids).await?;
        let dir_info = infos.pop().unwrap_or_else(|| ItemInfo::not_found(dir_form.clone()));
        if let Some(file_info) = infos.pop()
            && file_info.exists
            && !file_info.is_directory()
        {
            return Ok(vec![self.file_info(file_info)]);
        }

        let mut dir_exists = dir_info.exists;
        if !dir_exists && self.options.auto_repair_implicit_directories {
            dir_exists = self.repair_implicit(&dir_form).await?;
        }
        if !dir_exists
            && !(self.options.infer_implicit_directories
                && self.infer_directory(&dir_form).await.is_some())
        {
            return Err(FsError::NotFound(path.to_string()));
        }

        match &dir_form {
            ResourceId::Bucket(bucket) => self.list_children(bucket, "").await,
            ResourceId::Object { bucket, name } => self.list_children(bucket, name).await,
            ResourceId::Root => unreachable!("handled above"),
        }
    }

    async fn list_children(&self, bucket: &str, prefix: &str) -> FsResult<Vec<FileInfo>> {
        let children = self
            .storage
            .list_object_infos(bucket, prefix, Some(PATH_DELIMITER), None)
            .await?;
        Ok(children
            .into_iter()
            .filter(|info| info.resource_id.object_name() != Some(prefix))
            .map(|info| self.file_info(info))
            .collect())
    }

    /// URIs of the entries under `info` (depth-1, or the whole subtree with
    /// `recursive`). A file yields just itself.
    pub async fn list_file_names(&self, info: &FileInfo, recursive: bool) -> FsResult<Vec<String>> {
        match &info.item.resource_id {
            ResourceId::Root => {
                let buckets = self.storage.list_bucket_names().await?;
                Ok(buckets.into_iter().map(|name| format!("gs://{name}/")).collect())
            }
            ResourceId::Bucket(bucket) => {
                self.list_child_names(bucket, "", recursive).await
            }
            ResourceId::Object { bucket, name } => {
                if !info.is_directory() {
                    return Ok(vec![info.path.clone()]);
                }
                self.list_child_names(bucket, name, recursive).await
            }
        }
    }

    async fn list_child_names(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> FsResult<Vec<String>> {
        let delimiter = if recursive { None } else { Some(PATH_DELIMITER) };
        let names = self.storage.list_object_names(bucket, prefix, delimiter, None).await?;
        Ok(names
            .into_iter()
            .filter(|name| name != prefix)
            .map(|name| format!("gs://{bucket}/{name}"))
            .collect())
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    pub async fn mkdirs(&self, path: &str) -> FsResult<()> {
        let id = ResourceId::parse(path, true)?;
        self.mkdirs_id(&id).await
    }

    async fn mkdirs_id(&self, id: &ResourceId) -> FsResult<()> {
        if id.is_root() {
            return Ok(());
        }
        let dir_form = paths::to_directory_path(id);
        let mut dirs = paths::directory_prefixes(&dir_form);
        dirs.push(dir_form);

        // Check every prefix in both forms in one batch: the file-path
        // sibling detects file/directory collisions before anything is
        // created.
        let mut to_check = Vec::new();
        for dir in &dirs {
            match dir {
                ResourceId::Root => {}
                ResourceId::Bucket(_) => to_check.push(dir.clone()),
                ResourceId::Object { .. } => {
                    to_check.push(paths::to_file_path(dir));
                    to_check.push(dir.clone());
                }
            }
        }
        let infos = self.storage.get_infos(&to_check).await?;
        for info in &infos {
            if info.exists && !info.is_directory() {
                return Err(FsError::InvalidArgument(format!(
                    "cannot create directories: a file already exists at '{}'",
                    info.resource_id
                )));
            }
        }

        let mut created = Vec::new();
        let mut placeholders = Vec::new();
        for info in infos {
            if info.exists || !info.resource_id.is_directory() {
                continue;
            }
            match info.resource_id {
                ResourceId::Bucket(ref name) => {
                    self.storage.create_bucket(name).await?;
                    created.push(info.resource_id);
                }
                id @ ResourceId::Object { .. } => placeholders.push(id),
                ResourceId::Root => {}
            }
        }
        self.storage.create_empty_batch(&placeholders).await?;
        created.extend(placeholders);

        // Parents we just created must not get a timestamp for children we
        // also just created.
        self.enqueue_timestamps(created.clone(), created);
        Ok(())
    }

    /// Materializes a placeholder for a directory that exists only as a
    /// prefix of other objects. Returns whether the path resolves to an
    /// existing entity afterwards; the materialization itself is best-effort.
    pub async fn repair_possible_implicit_directory(&self, path: &str) -> FsResult<bool> {
        let id = ResourceId::parse(path, true)?;
        self.repair_implicit(&paths::to_directory_path(&id)).await
    }

    async fn repair_implicit(&self, dir_form: &ResourceId) -> FsResult<bool> {
        let ResourceId::Object { .. } = dir_form else {
            return Ok(false);
        };
        if self.infer_directory(dir_form).await.is_none() {
            return Ok(false);
        }
        if let Err(error) = self.storage.create_empty(dir_form).await {
            log::warn!("[fs] failed to repair implicit directory '{dir_form}': {error}");
        }
        Ok(self.storage.get_info(dir_form).await?.exists)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Opens a write channel for a new file, creating parent directories.
    /// The returned writer commits on `close`; with marker files enabled a
    /// zero-byte placeholder is written first so a losing racer fails here
    /// instead of at close.
    pub async fn create(
        &self,
        path: &str,
        options: CreateFileOptions,
    ) -> FsResult<StorageWriter> {
        let id = ResourceId::parse(path, false)?;
        if id.is_directory() {
            return Err(FsError::InvalidArgument(format!(
                "cannot create a file with a directory name: '{path}'"
            )));
        }
        let dir_form = paths::to_directory_path(&id);
        if self.storage.get_info(&dir_form).await?.exists {
            return Err(FsError::AlreadyExists(format!(
                "a directory already exists at '{path}'"
            )));
        }
        self.mkdirs_id(&paths::parent(&id)).await?;

        let precondition = if self.options.create_marker_files {
            let mut marker = self.storage.create_writer(&id, &options, None).await?;
            let info = marker.close().await.map_err(|error| match error {
                StoreError::PreconditionFailed(_) => FsError::AlreadyExists(path.to_string()),
                other => FsError::Store(other),
            })?;
            info.generation.map(InsertPrecondition::GenerationMatches)
        } else {
            None
        };
        let writer = self.storage.create_writer(&id, &options, precondition).await?;
        self.enqueue_timestamps(vec![id], Vec::new());
        Ok(writer)
    }

    /// Opens a read channel. With `fast_fail_on_not_found` unset, a missing
    /// object surfaces on the first read instead.
    pub async fn open(&self, path: &str, options: ReadOptions) -> FsResult<StorageReader> {
        let id = ResourceId::parse(path, false)?;
        if id.is_directory() {
            return Err(FsError::InvalidArgument(format!("cannot open a directory: '{path}'")));
        }
        self.storage.open_reader(&id, &options).await.map_err(|error| match error {
            StoreError::NotFound(_) => FsError::NotFound(path.to_string()),
            other => FsError::Store(other),
        })
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub async fn delete(&self, path: &str, recursive: bool) -> FsResult<()> {
        let id = ResourceId::parse(path, true)?;
        if id.is_root() {
            return Err(FsError::InvalidArgument("cannot delete the root".to_string()));
        }
        let info = self.resolve(&id).await?;
        if !info.exists {
            return Err(FsError::NotFound(path.to_string()));
        }

        let mut object_ids: Vec<ResourceId> = Vec::new();
        let mut bucket_names: Vec<String> = Vec::new();
        if info.is_directory() {
            let bucket = info
                .resource_id
                .bucket_name()
                .expect("directories below the root always carry a bucket")
                .to_string();
            let prefix = info.resource_id.object_name().unwrap_or_default().to_string();

            if !recursive {
                let children = self
                    .storage
                    .list_object_names(&bucket, &prefix, Some(PATH_DELIMITER), Some(2))
                    .await?;
                if children.iter().any(|name| name != &prefix) {
                    return Err(FsError::DirectoryNotEmpty(path.to_string()));
                }
            }
            let mut names =
                self.storage.list_object_names(&bucket, &prefix, None, None).await?;
            // Children first, ancestors last.
            names.sort_by(|a, b| paths::compare_length_then_lex(b, a));
            object_ids.extend(
                names
                    .into_iter()
                    .map(|name| ResourceId::Object { bucket: bucket.clone(), name }),
            );
            if info.resource_id.is_bucket() {
                bucket_names.push(bucket);
            }
        } else {
            object_ids.push(info.resource_id.clone());
        }

        self.storage.delete_objects(&object_ids).await.map_err(store_to_fs)?;
        for bucket in &bucket_names {
            self.storage.wait_for_bucket_empty(bucket).await?;
        }
        if !bucket_names.is_empty() {
            self.storage.delete_buckets(&bucket_names).await.map_err(store_to_fs)?;
        }

        // Deleted paths are excluded: their parents may be among them.
        let mut modified = object_ids;
        modified.push(info.resource_id);
        self.enqueue_timestamps(modified.clone(), modified);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rename
    // ------------------------------------------------------------------

    /// Renames a file or a directory tree. Directory rename is a copy of
    /// every descendant (ancestors first) followed by source deletes
    /// (descendants first); it is not atomic. If the source tree changes
    /// mid-operation the result may be partial — retrying the rename
    /// completes the remainder, since copies and deletes are idempotent at
    /// the object level.
    pub async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        let src_id = ResourceId::parse(src, true)?;
        let dst_id = ResourceId::parse(dst, true)?;
        if src_id.is_root() {
            return Err(FsError::InvalidArgument("cannot rename the root".to_string()));
        }
        let src_info = self.resolve(&src_id).await?;
        if !src_info.exists {
            return Err(FsError::NotFound(src.to_string()));
        }
        let dst_info = self.resolve(&dst_id).await?;

        if src_info.is_directory() {
            self.rename_directory(src, dst, &src_info, &dst_info, dst_id).await
        } else {
            self.rename_file(dst, &src_info, &dst_info, dst_id).await
        }
    }

    async fn rename_file(
        &self,
        dst: &str,
        src_info: &ItemInfo,
        dst_info: &ItemInfo,
        dst_id: ResourceId,
    ) -> FsResult<()> {
        if dst_id.is_root() {
            return Err(FsError::InvalidArgument(
                "cannot rename a file onto the root".to_string(),
            ));
        }
        let leaf = paths::leaf_name(&src_info.resource_id)
            .expect("files always have a leaf name");
        let target = if dst_info.exists {
            if !dst_info.is_directory() {
                return Err(FsError::AlreadyExists(dst.to_string()));
            }
            let target = child_of(&dst_info.resource_id, &leaf, false)?;
            // The slot inside the destination directory must itself be free.
            let slot = self.storage.get_info(&target).await?;
            if slot.exists && !slot.is_directory() {
                return Err(FsError::AlreadyExists(target.to_string()));
            }
            target
        } else {
            if dst_id.is_directory() {
                return Err(FsError::NotFound(format!(
                    "destination directory '{dst}' does not exist"
                )));
            }
            if !self.resolve(&paths::parent(&dst_id)).await?.exists {
                return Err(FsError::NotFound(format!(
                    "parent of destination '{dst}' does not exist"
                )));
            }
            dst_id
        };
        if target == src_info.resource_id {
            return Ok(());
        }

        let (bucket, name) = object_parts(&src_info.resource_id)?;
        let (dst_bucket, dst_name) = object_parts(&target)?;
        self.storage
            .copy(bucket, &[name.to_string()], dst_bucket, &[dst_name.to_string()])
            .await
            .map_err(store_to_fs)?;
        self.storage
            .delete_objects(std::slice::from_ref(&src_info.resource_id))
            .await
            .map_err(store_to_fs)?;
        self.enqueue_timestamps(vec![target], Vec::new());
        Ok(())
    }

    async fn rename_directory(
        &self,
        src: &str,
        dst: &str,
        src_info: &ItemInfo,
        dst_info: &ItemInfo,
        dst_id: ResourceId,
    ) -> FsResult<()> {
        let src_dir = paths::to_directory_path(&src_info.resource_id);
        let target_dir = if dst_info.exists {
            if !dst_info.is_directory() {
                return Err(FsError::AlreadyExists(format!(
                    "cannot rename directory '{src}' onto file '{dst}'"
                )));
            }
            // An existing directory receives the source as a child.
            let leaf =
                paths::leaf_name(&src_dir).expect("non-root directories have a leaf name");
            child_of(&dst_info.resource_id, &leaf, true)?
        } else {
            if !self.resolve(&paths::parent(&dst_id)).await?.exists {
                return Err(FsError::NotFound(format!(
                    "parent of destination '{dst}' does not exist"
                )));
            }
            paths::to_directory_path(&dst_id)
        };
        if target_dir == src_dir {
            return Ok(());
        }

        let (src_bucket, src_prefix) = match &src_dir {
            ResourceId::Bucket(name) => (name.clone(), String::new()),
            ResourceId::Object { bucket, name } => (bucket.clone(), name.clone()),
            ResourceId::Root => unreachable!("root rename rejected earlier"),
        };
        let (dst_bucket, dst_prefix) = match &target_dir {
            ResourceId::Bucket(name) => (name.clone(), String::new()),
            ResourceId::Object { bucket, name } => (bucket.clone(), name.clone()),
            ResourceId::Root => {
                return Err(FsError::InvalidArgument(
                    "cannot rename a directory onto the root".to_string(),
                ));
            }
        };

        // Snapshot of the subtree, ancestors first so placeholders land
        // before their children.
        let mut names =
            self.storage.list_object_names(&src_bucket, &src_prefix, None, None).await?;
        names.sort_by(|a, b| paths::compare_length_then_lex(a, b));

        match &target_dir {
            ResourceId::Bucket(name) => self.storage.create_bucket(name).await?,
            ResourceId::Object { .. } => {
                self.storage.create_empty(&target_dir).await.map_err(store_to_fs)?
            }
            ResourceId::Root => unreachable!("rejected above"),
        }

        // The source placeholder itself maps onto the placeholder just
        // created; copying it again would trip the if-not-exists guard.
        let copy_names: Vec<String> =
            names.iter().filter(|name| *name != &src_prefix).cloned().collect();
        let copy_dsts: Vec<String> = copy_names
            .iter()
            .map(|name| format!("{dst_prefix}{}", &name[src_prefix.len()..]))
            .collect();
        self.storage
            .copy(&src_bucket, &copy_names, &dst_bucket, &copy_dsts)
            .await
            .map_err(store_to_fs)?;

        // Delete sources, descendants before ancestors.
        names.sort_by(|a, b| paths::compare_length_then_lex(b, a));
        let delete_ids: Vec<ResourceId> = names
            .into_iter()
            .map(|name| ResourceId::Object { bucket: src_bucket.clone(), name })
            .collect();
        self.storage.delete_objects(&delete_ids).await.map_err(store_to_fs)?;
        if src_dir.is_bucket() {
            self.storage.wait_for_bucket_empty(&src_bucket).await?;
            self.storage.delete_buckets(std::slice::from_ref(&src_bucket)).await.map_err(store_to_fs)?;
        }

        self.enqueue_timestamps(vec![target_dir], Vec::new());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn file_info(&self, info: ItemInfo) -> FileInfo {
        FileInfo::from_item(info, self.options.reported_permissions)
    }

    fn enqueue_timestamps(&self, modified: Vec<ResourceId>, excluded: Vec<ResourceId>) {
        if modified.is_empty() {
            return;
        }
        if let Some(updater) = &self.timestamps {
            updater.enqueue(UpdateTask { modified, excluded });
        }
    }
}

fn store_to_fs(error: StoreError) -> FsError {
    match error {
        StoreError::PreconditionFailed(message) => FsError::FailedPrecondition(message),
        other => FsError::Store(other),
    }
}

fn object_parts(id: &ResourceId) -> FsResult<(&str, &str)> {
    match id {
        ResourceId::Object { bucket, name } => Ok((bucket, name)),
        other => Err(FsError::InvalidArgument(format!("expected an object path, got '{other}'"))),
    }
}

/// The child named `leaf` inside a directory id.
fn child_of(dir: &ResourceId, leaf: &str, as_directory: bool) -> FsResult<ResourceId> {
    let suffix = if as_directory { "/" } else { "" };
    match dir {
        ResourceId::Root => ResourceId::bucket(leaf),
        ResourceId::Bucket(bucket) => ResourceId::object(bucket.clone(), format!("{leaf}{suffix}")),
        ResourceId::Object { .. } => {
            let ResourceId::Object { bucket, name } = paths::to_directory_path(dir) else {
                unreachable!("directory form of an object is an object");
            };
            ResourceId::object(bucket, format!("{name}{leaf}{suffix}"))
        }
    }
}
