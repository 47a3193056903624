// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! The coordination backplane: the shared state every frontend shard and every worker observes.
//!
//! The `Backplane` trait carries the whole contract — worker membership, the action cache, the
//! blob-location index, the operations hash, the queue discipline (prequeue, ready queue,
//! dispatched map, completed list), liveness polling, the operation pub/sub channel, and the
//! tree cache. `MemoryBackplane` is the in-tree implementation; a networked store plugs in
//! behind the same trait, and nothing above the trait may assume locality.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use hashing::Digest;
use remexec::{
    ActionResult, Directory, DispatchedOperation, ExecuteEntry, Operation, QueueEntry, Stage,
    Status,
};

mod cas;
mod memory;
mod retry;

pub use crate::cas::{CasNode, CasResolver, StaticCasResolver};
pub use crate::memory::MemoryBackplane;
pub use crate::retry::with_retries;

/// Milliseconds since the unix epoch; the timestamp representation used in shared state.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

///
/// Tuning knobs for a backplane instance. Depth limits back the `can_prequeue`/`can_queue`
/// admission checks; the dispatch deadline is how long a worker may sit on a claimed operation
/// between polls before the DispatchedMonitor may reclaim it.
///
#[derive(Clone, Debug)]
pub struct BackplaneConfig {
    pub prequeue_capacity: usize,
    pub queue_capacity: usize,
    pub dispatch_deadline_ms: u64,
    pub max_completed_operations: usize,
    pub worker_set_cache_ttl_ms: u64,
}

impl Default for BackplaneConfig {
    fn default() -> BackplaneConfig {
        BackplaneConfig {
            prequeue_capacity: 1024,
            queue_capacity: 1024,
            dispatch_deadline_ms: 30_000,
            max_completed_operations: 1024,
            worker_set_cache_ttl_ms: 3_000,
        }
    }
}

///
/// A message observed on the operation channel.
///
#[derive(Clone, Debug)]
pub enum OperationChange {
    /// Watchers should re-evaluate their deadlines; expired ones observe a terminal `None`.
    Expire,
    /// A state transition, carried as a stripped Operation.
    Operation(Box<Operation>),
}

///
/// Why an operation subscription ended or skipped messages.
///
#[derive(Debug, Eq, PartialEq)]
pub enum SubscriptionError {
    /// The subscriber fell behind and `skipped` messages were dropped. The subscriber must
    /// re-read the operations hash to re-resolve watcher state before continuing.
    Lagged(u64),
    /// The backplane side of the channel went away.
    Closed,
}

///
/// A live subscription to the operation channel. Messages are `(channel, change)` pairs, where
/// the channel is the operation channel name (see `operation_channel`).
///
pub struct OperationSubscription {
    receiver: tokio::sync::broadcast::Receiver<(String, OperationChange)>,
}

impl OperationSubscription {
    pub fn new(
        receiver: tokio::sync::broadcast::Receiver<(String, OperationChange)>,
    ) -> OperationSubscription {
        OperationSubscription { receiver }
    }

    pub async fn next(&mut self) -> Result<(String, OperationChange), SubscriptionError> {
        use tokio::sync::broadcast::error::RecvError;
        match self.receiver.recv().await {
            Ok(message) => Ok(message),
            Err(RecvError::Lagged(skipped)) => Err(SubscriptionError::Lagged(skipped)),
            Err(RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }
}

/// The pub/sub channel name for one operation.
pub fn operation_channel(operation_name: &str) -> String {
    format!("operation:{operation_name}")
}

/// The inverse of `operation_channel`.
pub fn channel_operation_name(channel: &str) -> Option<&str> {
    channel.strip_prefix("operation:")
}

///
/// The shared-state contract. All methods are atomic with respect to one another; in particular
/// `put_operation` performs its queue-state move and its publish as one step, and
/// `dispatch_operation` has set-if-absent semantics so two workers can never claim one entry.
///
#[async_trait]
pub trait Backplane: Send + Sync + 'static {
    // Worker set.

    async fn add_worker(&self, name: &str) -> Result<(), Status>;

    /// Removes the worker from the active set and from every blob-location set it appears in.
    async fn remove_worker(&self, name: &str) -> Result<(), Status>;

    /// The active worker set. Reads may be served from a bounded-stale local cache.
    async fn workers(&self) -> Result<Vec<String>, Status>;

    // Action cache.

    async fn get_action_result(&self, action_key: Digest) -> Result<Option<ActionResult>, Status>;

    async fn put_action_result(
        &self,
        action_key: Digest,
        result: ActionResult,
    ) -> Result<(), Status>;

    async fn remove_action_results(&self, action_keys: &[Digest]) -> Result<(), Status>;

    /// Cursor-based scan of action-cache keys. A `None` next-cursor means the scan is complete.
    async fn scan_action_cache(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<(Vec<Digest>, Option<u64>), Status>;

    // Blob-location index.

    /// Atomically applies `(to_add, to_remove)` to the location set of a single digest.
    async fn adjust_blob_locations(
        &self,
        digest: Digest,
        to_add: &[String],
        to_remove: &[String],
    ) -> Result<(), Status>;

    async fn blob_locations(&self, digest: Digest) -> Result<BTreeSet<String>, Status>;

    // Operations hash.

    async fn get_operation(&self, name: &str) -> Result<Option<Operation>, Status>;

    /// Writes the operation, moves its name across the queue structures if it is done, and
    /// publishes the stripped form on its channel — atomically.
    async fn put_operation(&self, operation: &Operation) -> Result<(), Status>;

    async fn delete_operation(&self, name: &str) -> Result<(), Status>;

    // Queue discipline.

    async fn can_prequeue(&self) -> Result<bool, Status>;

    async fn can_queue(&self) -> Result<bool, Status>;

    /// Pushes a client request onto the prequeue and records its initial Operation.
    async fn prequeue(&self, entry: ExecuteEntry, operation: &Operation) -> Result<(), Status>;

    /// Pops the oldest prequeued request, blocking briefly if the prequeue is empty.
    async fn deprequeue_operation(&self) -> Result<Option<ExecuteEntry>, Status>;

    /// Pushes a promoted entry onto the ready queue. The entry's `queued_operation_digest` must
    /// already exist in the CAS.
    async fn queue(&self, entry: QueueEntry, operation: &Operation) -> Result<(), Status>;

    /// Atomically pops the ready queue and inserts into the dispatched map with a fresh requeue
    /// deadline. Blocks briefly if the queue is empty.
    async fn dispatch_operation(&self) -> Result<Option<QueueEntry>, Status>;

    /// Renews the requeue deadline iff the operation is still dispatched at the given stage.
    /// Returns false if the claim was lost.
    async fn poll_operation(
        &self,
        name: &str,
        stage: Stage,
        requeue_at_ms: u64,
    ) -> Result<bool, Status>;

    /// Overwrites the requeue deadline of a dispatched operation without any stage check; used
    /// by workers abandoning a claim so the DispatchedMonitor reclaims it promptly.
    async fn reset_dispatched_deadline(&self, name: &str, requeue_at_ms: u64)
        -> Result<(), Status>;

    /// Moves a dispatched operation back onto the ready queue. A no-op (returning false) if the
    /// operation is already queued or cannot be found in the dispatched map.
    async fn requeue_dispatched_operation(&self, name: &str) -> Result<bool, Status>;

    /// Removes from the dispatched map and records on the (size-trimmed) completed list.
    async fn complete_operation(&self, name: &str) -> Result<(), Status>;

    async fn dispatched_operations(&self) -> Result<Vec<DispatchedOperation>, Status>;

    // Pub/sub.

    async fn subscribe(&self) -> Result<OperationSubscription, Status>;

    /// Publishes an `expire` message on the given operation channel.
    async fn publish_expire(&self, channel: &str) -> Result<(), Status>;

    // Tree cache.

    async fn put_tree(
        &self,
        root: Digest,
        directories: Vec<(Digest, Directory)>,
    ) -> Result<(), Status>;

    async fn get_tree(&self, root: Digest) -> Result<Option<Vec<(Digest, Directory)>>, Status>;

    // Operation streams (stdout/stderr of live operations).

    async fn append_operation_stream(&self, resource_name: &str, data: Bytes)
        -> Result<(), Status>;

    async fn read_operation_stream(&self, resource_name: &str) -> Result<Option<Bytes>, Status>;
}
