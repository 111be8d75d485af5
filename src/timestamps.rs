//! Background, best-effort updates of parent-directory modification times.
//!
//! Mutating facade operations enqueue the paths they touched; a small worker
//! pool patches the `gcs_mtime_millis` attribute on the affected parent
//! placeholders. Nothing here ever propagates an error to the caller: a full
//! queue drops the task with a log line, and worker failures are logged at
//! debug level.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::now_ms;
use crate::config::TimestampUpdateOptions;
use crate::model::{MTIME_ATTRIBUTE, encode_mtime};
use crate::paths;
use crate::resource::ResourceId;
use crate::store::{MetadataUpdate, Storage};

const QUEUE_CAPACITY: usize = 1000;
const WORKER_COUNT: usize = 2;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One unit of work: the paths a mutation touched, and parents that must not
/// be stamped (typically because the same operation just created them).
#[derive(Debug)]
pub struct UpdateTask {
    pub modified: Vec<ResourceId>,
    pub excluded: Vec<ResourceId>,
}

pub struct TimestampUpdater {
    sender: Mutex<Option<mpsc::Sender<UpdateTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TimestampUpdater {
    pub fn new(storage: Arc<dyn Storage>, options: TimestampUpdateOptions) -> TimestampUpdater {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let options = Arc::new(options);
        let workers = (0..WORKER_COUNT)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let storage = Arc::clone(&storage);
                let options = Arc::clone(&options);
                tokio::spawn(async move {
                    loop {
                        let task = { receiver.lock().await.recv().await };
                        let Some(task) = task else {
                            break;
                        };
                        run_task(&*storage, &options, task).await;
                    }
                    log::debug!("[timestamps] worker {worker} drained");
                })
            })
            .collect();
        TimestampUpdater { sender: Mutex::new(Some(sender)), workers: Mutex::new(workers) }
    }

    /// Never blocks: a saturated queue drops the task.
    pub fn enqueue(&self, task: UpdateTask) {
        let sender = self.sender.lock().expect("updater lock").clone();
        let Some(sender) = sender else {
            log::debug!("[timestamps] updater is shut down, dropping task");
            return;
        };
        if let Err(error) = sender.try_send(task) {
            log::warn!("[timestamps] queue saturated, dropping update: {error}");
        }
    }

    /// Orderly drain: stop accepting work, wait for in-flight tasks up to the
    /// drain timeout, then force-terminate.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().expect("updater lock").take());
        let workers = std::mem::take(&mut *self.workers.lock().expect("updater lock"));
        for worker in workers {
            let abort = worker.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, worker).await.is_err() {
                log::warn!("[timestamps] worker did not drain in time, aborting");
                abort.abort();
            }
        }
    }
}

async fn run_task(storage: &dyn Storage, options: &TimestampUpdateOptions, task: UpdateTask) {
    let excluded: HashSet<ResourceId> = task.excluded.into_iter().collect();
    let mut parents: Vec<ResourceId> = Vec::new();
    let mut seen = HashSet::new();
    for id in &task.modified {
        let parent = paths::parent(id);
        // Only object-typed parents carry metadata to stamp.
        if !parent.is_object() || excluded.contains(&parent) {
            continue;
        }
        if !options.should_update(&parent.to_string()) {
            continue;
        }
        if seen.insert(parent.clone()) {
            parents.push(parent);
        }
    }
    if parents.is_empty() {
        return;
    }

    let stamp = encode_mtime(now_ms());
    let updates: Vec<MetadataUpdate> = parents
        .into_iter()
        .map(|id| MetadataUpdate {
            id,
            delta: [(MTIME_ATTRIBUTE.to_string(), Some(stamp.clone()))].into_iter().collect(),
        })
        .collect();
    if let Err(error) = storage.update_items(&updates).await {
        log::debug!("[timestamps] update of {} parents failed: {error}", updates.len());
    }
}
