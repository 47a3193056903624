// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use hashing::Digest;
use remexec::{
    ActionResult, Directory, DispatchedOperation, ExecuteEntry, Operation, QueueEntry, Stage,
    Status,
};

use crate::{
    now_millis, operation_channel, Backplane, BackplaneConfig, OperationChange,
    OperationSubscription,
};

/// How long an empty-queue pop blocks before reporting None.
const EMPTY_POP_TIMEOUT: Duration = Duration::from_millis(1000);

const PUBSUB_CAPACITY: usize = 4096;

#[derive(Default)]
struct State {
    workers: BTreeSet<String>,
    action_cache: BTreeMap<Digest, ActionResult>,
    blob_locations: HashMap<Digest, BTreeSet<String>>,
    operations: HashMap<String, Operation>,
    prequeue: VecDeque<ExecuteEntry>,
    queued: VecDeque<QueueEntry>,
    dispatched: HashMap<String, DispatchedOperation>,
    completed: VecDeque<String>,
    trees: HashMap<Digest, Vec<(Digest, Directory)>>,
    streams: HashMap<String, Vec<u8>>,
}

///
/// The in-process Backplane. Every mutation takes the single state lock, which is what makes
/// `put_operation`'s move-and-publish and `dispatch_operation`'s pop-and-claim atomic.
///
pub struct MemoryBackplane {
    config: BackplaneConfig,
    state: Mutex<State>,
    prequeue_added: Notify,
    queue_added: Notify,
    publisher: broadcast::Sender<(String, OperationChange)>,
    worker_cache: Mutex<Option<(Instant, Vec<String>)>>,
}

impl MemoryBackplane {
    pub fn new(config: BackplaneConfig) -> MemoryBackplane {
        let (publisher, _) = broadcast::channel(PUBSUB_CAPACITY);
        MemoryBackplane {
            config,
            state: Mutex::default(),
            prequeue_added: Notify::new(),
            queue_added: Notify::new(),
            publisher,
            worker_cache: Mutex::new(None),
        }
    }

    fn publish(&self, operation: &Operation) {
        let channel = operation_channel(&operation.name);
        // A send error just means nobody is subscribed right now.
        let _ = self
            .publisher
            .send((channel, OperationChange::Operation(Box::new(operation.stripped()))));
    }

    ///
    /// Writes the operation and, when it is terminal, moves its name out of every queue
    /// structure onto the completed list. Must be called with the state lock held; publishes
    /// before the lock is released so that a watcher observing stage X can rely on the
    /// backplane being in the corresponding state.
    ///
    fn put_operation_locked(&self, state: &mut State, operation: &Operation) {
        state
            .operations
            .insert(operation.name.clone(), operation.clone());
        if operation.done {
            let name = operation.name.as_str();
            state
                .prequeue
                .retain(|entry| entry.operation_name != name);
            state
                .queued
                .retain(|entry| entry.execute_entry.operation_name != name);
            state.dispatched.remove(name);
            if !state.completed.iter().any(|completed| completed == name) {
                state.completed.push_back(name.to_owned());
            }
            while state.completed.len() > self.config.max_completed_operations {
                if let Some(trimmed) = state.completed.pop_front() {
                    state.operations.remove(&trimmed);
                }
            }
        }
        self.publish(operation);
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn add_worker(&self, name: &str) -> Result<(), Status> {
        self.state.lock().workers.insert(name.to_owned());
        *self.worker_cache.lock() = None;
        Ok(())
    }

    async fn remove_worker(&self, name: &str) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.workers.remove(name);
        state.blob_locations.retain(|_, locations| {
            locations.remove(name);
            !locations.is_empty()
        });
        drop(state);
        *self.worker_cache.lock() = None;
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<String>, Status> {
        let ttl = Duration::from_millis(self.config.worker_set_cache_ttl_ms);
        {
            let cache = self.worker_cache.lock();
            if let Some((read_at, ref workers)) = *cache {
                if read_at.elapsed() < ttl {
                    return Ok(workers.clone());
                }
            }
        }
        let workers = self
            .state
            .lock()
            .workers
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        *self.worker_cache.lock() = Some((Instant::now(), workers.clone()));
        Ok(workers)
    }

    async fn get_action_result(&self, action_key: Digest) -> Result<Option<ActionResult>, Status> {
        Ok(self.state.lock().action_cache.get(&action_key).cloned())
    }

    async fn put_action_result(
        &self,
        action_key: Digest,
        result: ActionResult,
    ) -> Result<(), Status> {
        self.state.lock().action_cache.insert(action_key, result);
        Ok(())
    }

    async fn remove_action_results(&self, action_keys: &[Digest]) -> Result<(), Status> {
        let mut state = self.state.lock();
        for action_key in action_keys {
            state.action_cache.remove(action_key);
        }
        Ok(())
    }

    async fn scan_action_cache(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<(Vec<Digest>, Option<u64>), Status> {
        let state = self.state.lock();
        let keys = state
            .action_cache
            .keys()
            .skip(cursor as usize)
            .take(page_size)
            .copied()
            .collect::<Vec<_>>();
        let next_cursor = cursor + keys.len() as u64;
        let more = (next_cursor as usize) < state.action_cache.len();
        Ok((keys, if more { Some(next_cursor) } else { None }))
    }

    async fn adjust_blob_locations(
        &self,
        digest: Digest,
        to_add: &[String],
        to_remove: &[String],
    ) -> Result<(), Status> {
        let mut state = self.state.lock();
        let locations = state.blob_locations.entry(digest).or_default();
        for worker in to_add {
            locations.insert(worker.clone());
        }
        for worker in to_remove {
            locations.remove(worker);
        }
        if locations.is_empty() {
            state.blob_locations.remove(&digest);
        }
        Ok(())
    }

    async fn blob_locations(&self, digest: Digest) -> Result<BTreeSet<String>, Status> {
        Ok(self
            .state
            .lock()
            .blob_locations
            .get(&digest)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_operation(&self, name: &str) -> Result<Option<Operation>, Status> {
        Ok(self.state.lock().operations.get(name).cloned())
    }

    async fn put_operation(&self, operation: &Operation) -> Result<(), Status> {
        let mut state = self.state.lock();
        self.put_operation_locked(&mut state, operation);
        Ok(())
    }

    async fn delete_operation(&self, name: &str) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.operations.remove(name);
        state.prequeue.retain(|entry| entry.operation_name != name);
        state
            .queued
            .retain(|entry| entry.execute_entry.operation_name != name);
        state.dispatched.remove(name);
        state.completed.retain(|completed| completed != name);
        Ok(())
    }

    async fn can_prequeue(&self) -> Result<bool, Status> {
        Ok(self.state.lock().prequeue.len() < self.config.prequeue_capacity)
    }

    async fn can_queue(&self) -> Result<bool, Status> {
        Ok(self.state.lock().queued.len() < self.config.queue_capacity)
    }

    async fn prequeue(&self, entry: ExecuteEntry, operation: &Operation) -> Result<(), Status> {
        {
            let mut state = self.state.lock();
            state.prequeue.push_back(entry);
            self.put_operation_locked(&mut state, operation);
        }
        self.prequeue_added.notify_one();
        Ok(())
    }

    async fn deprequeue_operation(&self) -> Result<Option<ExecuteEntry>, Status> {
        if let Some(entry) = self.state.lock().prequeue.pop_front() {
            return Ok(Some(entry));
        }
        let _ = tokio::time::timeout(EMPTY_POP_TIMEOUT, self.prequeue_added.notified()).await;
        Ok(self.state.lock().prequeue.pop_front())
    }

    async fn queue(&self, entry: QueueEntry, operation: &Operation) -> Result<(), Status> {
        {
            let mut state = self.state.lock();
            let name = entry.execute_entry.operation_name.clone();
            state.dispatched.remove(&name);
            let already_queued = state
                .queued
                .iter()
                .any(|queued| queued.execute_entry.operation_name == name);
            if !already_queued {
                state.queued.push_back(entry);
            }
            self.put_operation_locked(&mut state, operation);
        }
        self.queue_added.notify_one();
        Ok(())
    }

    async fn dispatch_operation(&self) -> Result<Option<QueueEntry>, Status> {
        let mut waited = false;
        loop {
            {
                let mut state = self.state.lock();
                while let Some(entry) = state.queued.pop_front() {
                    let name = entry.execute_entry.operation_name.clone();
                    if state.dispatched.contains_key(&name) {
                        // Set-if-absent: a name can be claimed at most once at a time.
                        log::warn!("Dropping duplicate queue entry for dispatched {name}");
                    } else {
                        let dispatched = DispatchedOperation {
                            name: name.clone(),
                            requeue_at_ms: now_millis() + self.config.dispatch_deadline_ms,
                            queue_entry: entry.clone(),
                        };
                        state.dispatched.insert(name, dispatched);
                        return Ok(Some(entry));
                    }
                }
            }
            if waited {
                return Ok(None);
            }
            let _ = tokio::time::timeout(EMPTY_POP_TIMEOUT, self.queue_added.notified()).await;
            waited = true;
        }
    }

    async fn poll_operation(
        &self,
        name: &str,
        stage: Stage,
        requeue_at_ms: u64,
    ) -> Result<bool, Status> {
        let mut state = self.state.lock();
        let current_stage = state.operations.get(name).map(|operation| operation.stage);
        match state.dispatched.get_mut(name) {
            Some(dispatched) => {
                // A claimant behind the published stage lost the operation to someone who
                // advanced it. The claimant itself may run ahead of the publish briefly.
                if let Some(current_stage) = current_stage {
                    if stage != Stage::Unknown && stage < current_stage {
                        return Ok(false);
                    }
                }
                dispatched.requeue_at_ms = requeue_at_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reset_dispatched_deadline(
        &self,
        name: &str,
        requeue_at_ms: u64,
    ) -> Result<(), Status> {
        if let Some(dispatched) = self.state.lock().dispatched.get_mut(name) {
            dispatched.requeue_at_ms = requeue_at_ms;
        }
        Ok(())
    }

    async fn requeue_dispatched_operation(&self, name: &str) -> Result<bool, Status> {
        let requeued = {
            let mut state = self.state.lock();
            let already_queued = state
                .queued
                .iter()
                .any(|queued| queued.execute_entry.operation_name == name);
            if already_queued {
                state.dispatched.remove(name);
                false
            } else if let Some(dispatched) = state.dispatched.remove(name) {
                state.queued.push_back(dispatched.queue_entry);
                true
            } else {
                false
            }
        };
        if requeued {
            self.queue_added.notify_one();
        }
        Ok(requeued)
    }

    async fn complete_operation(&self, name: &str) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.dispatched.remove(name);
        if !state.completed.iter().any(|completed| completed == name) {
            state.completed.push_back(name.to_owned());
        }
        while state.completed.len() > self.config.max_completed_operations {
            if let Some(trimmed) = state.completed.pop_front() {
                state.operations.remove(&trimmed);
            }
        }
        Ok(())
    }

    async fn dispatched_operations(&self) -> Result<Vec<DispatchedOperation>, Status> {
        Ok(self.state.lock().dispatched.values().cloned().collect())
    }

    async fn subscribe(&self) -> Result<OperationSubscription, Status> {
        Ok(OperationSubscription::new(self.publisher.subscribe()))
    }

    async fn publish_expire(&self, channel: &str) -> Result<(), Status> {
        let _ = self
            .publisher
            .send((channel.to_owned(), OperationChange::Expire));
        Ok(())
    }

    async fn put_tree(
        &self,
        root: Digest,
        directories: Vec<(Digest, Directory)>,
    ) -> Result<(), Status> {
        self.state.lock().trees.insert(root, directories);
        Ok(())
    }

    async fn get_tree(&self, root: Digest) -> Result<Option<Vec<(Digest, Directory)>>, Status> {
        Ok(self.state.lock().trees.get(&root).cloned())
    }

    async fn append_operation_stream(
        &self,
        resource_name: &str,
        data: Bytes,
    ) -> Result<(), Status> {
        self.state
            .lock()
            .streams
            .entry(resource_name.to_owned())
            .or_default()
            .extend_from_slice(&data);
        Ok(())
    }

    async fn read_operation_stream(&self, resource_name: &str) -> Result<Option<Bytes>, Status> {
        Ok(self
            .state
            .lock()
            .streams
            .get(resource_name)
            .map(|data| Bytes::from(data.clone())))
    }
}
