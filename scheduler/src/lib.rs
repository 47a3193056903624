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

//! The frontend shard: validates and transforms client execute requests, serves cached
//! results, fans blob reads out over the worker fleet, and keeps watchers fed with operation
//! state transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use backplane::{now_millis, operation_channel, with_retries, Backplane, CasResolver};
use hashing::Digest;
use remexec::{ExecuteEntry, Operation, RequestMetadata, Status};
use task_executor::Executor;
use watchers::{Observer, WatchHandle, WatcherHub};

mod fetch;
mod monitor;
mod queuer;
mod subscriber;

#[derive(Clone, Debug)]
pub struct InstanceOptions {
    pub instance_name: String,
    /// Concurrency cap on in-flight prequeue transforms.
    pub transform_tokens: usize,
    /// Deadline on the whole cache-check step.
    pub cache_check_deadline: Duration,
    /// Period of the keep-alive poll run while an operation sits in the transform.
    pub queueing_poll_period: Duration,
    /// Ceiling on one prequeue transform before its keep-alive gives up.
    pub max_transform_duration: Duration,
    /// How long an identical resubmission is forced to skip the action cache.
    pub retry_cache_ttl: Duration,
    /// Watcher deadline policy fed to the WatcherHub.
    pub watcher_ttl: Duration,
    /// How often expired watcher channels are swept with `expire` publishes.
    pub expire_sweep_interval: Duration,
    /// How often the DispatchedMonitor scans for requeue-able operations.
    pub monitor_interval: Duration,
    /// Requeue attempts before an operation is error-completed.
    pub requeue_attempt_budget: usize,
    /// Location-correction passes get_blob runs after a fully NOT_FOUND attempt.
    pub get_blob_correction_attempts: usize,
}

impl Default for InstanceOptions {
    fn default() -> InstanceOptions {
        InstanceOptions {
            instance_name: "main".to_owned(),
            transform_tokens: 256,
            cache_check_deadline: Duration::from_secs(60),
            queueing_poll_period: Duration::from_secs(5),
            max_transform_duration: Duration::from_secs(600),
            retry_cache_ttl: Duration::from_secs(60),
            watcher_ttl: Duration::from_secs(10),
            expire_sweep_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(1),
            requeue_attempt_budget: 5,
            get_blob_correction_attempts: 1,
        }
    }
}

pub(crate) struct InstanceInner {
    pub(crate) backplane: Arc<dyn Backplane>,
    pub(crate) resolver: Arc<dyn CasResolver>,
    pub(crate) executor: Executor,
    pub(crate) hub: WatcherHub,
    pub(crate) options: InstanceOptions,
    /// Request-metadata keys recently served from the action cache, with the instant the entry
    /// expires. Retries hitting this cache are forced to execute rather than observe the same
    /// cached outcome again.
    pub(crate) recent_cache_served: Mutex<HashMap<RequestMetadata, Instant>>,
    pub(crate) requeue_failures: Mutex<HashMap<String, usize>>,
    pub(crate) stopped: watch::Receiver<bool>,
}

impl InstanceInner {
    pub(crate) fn record_cache_served(&self, request_metadata: &RequestMetadata) {
        let expires_at = Instant::now() + self.options.retry_cache_ttl;
        let mut recent = self.recent_cache_served.lock();
        recent.retain(|_, entry_expires| *entry_expires > Instant::now());
        recent.insert(request_metadata.clone(), expires_at);
    }

    pub(crate) fn was_recently_cache_served(&self, request_metadata: &RequestMetadata) -> bool {
        let recent = self.recent_cache_served.lock();
        recent
            .get(request_metadata)
            .map(|expires_at| *expires_at > Instant::now())
            .unwrap_or(false)
    }
}

///
/// One frontend shard of the farm.
///
#[derive(Clone)]
pub struct Instance {
    pub(crate) inner: Arc<InstanceInner>,
    stop: Arc<watch::Sender<bool>>,
}

impl Instance {
    pub fn new(
        backplane: Arc<dyn Backplane>,
        resolver: Arc<dyn CasResolver>,
        executor: Executor,
        options: InstanceOptions,
    ) -> Instance {
        let hub = WatcherHub::new(executor.clone(), options.watcher_ttl);
        let (stop, stopped) = watch::channel(false);
        Instance {
            inner: Arc::new(InstanceInner {
                backplane,
                resolver,
                executor,
                hub,
                options,
                recent_cache_served: Mutex::default(),
                requeue_failures: Mutex::default(),
                stopped,
            }),
            stop: Arc::new(stop),
        }
    }

    ///
    /// Starts the background machinery: the operation queuer, the dispatched monitor, the
    /// pub/sub subscriber, and the watcher-expiry sweeper. The operation subscription is
    /// established before this returns, so no transition published after start is missed.
    ///
    pub async fn start(&self) {
        let initial_subscription = match self.inner.backplane.subscribe().await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                log::warn!("Initial operation subscription failed; will retry: {e}");
                None
            }
        };
        queuer::spawn_operation_queuer(self.inner.clone());
        monitor::spawn_dispatched_monitor(self.inner.clone());
        subscriber::spawn_subscriber(self.inner.clone(), initial_subscription);
        subscriber::spawn_expire_sweeper(self.inner.clone());
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    ///
    /// Submits an action for execution: admission-check, prequeue, and watch. Returns the new
    /// operation's name and the watch registration.
    ///
    /// An execute retried with request metadata that was recently served from the action cache
    /// is forced to skip the cache lookup, so a client re-running a cached failure actually
    /// executes instead of looping on the same cached result.
    ///
    pub async fn execute(
        &self,
        action_digest: Digest,
        skip_cache_lookup: bool,
        request_metadata: RequestMetadata,
        watcher: Observer,
    ) -> Result<(String, WatchHandle), Status> {
        let inner = &self.inner;
        if !with_retries("can_prequeue", || inner.backplane.can_prequeue()).await? {
            return Err(Status::unavailable("The prequeue is full"));
        }

        let skip_cache_lookup =
            skip_cache_lookup || inner.was_recently_cache_served(&request_metadata);

        let operation_name = Uuid::new_v4().to_string();
        let entry = ExecuteEntry {
            operation_name: operation_name.clone(),
            action_digest,
            skip_cache_lookup,
            request_metadata,
            stdout_stream_name: format!("{operation_name}/streams/stdout"),
            stderr_stream_name: format!("{operation_name}/streams/stderr"),
            queued_at_ms: now_millis(),
        };
        let operation = Operation::new(operation_name.as_str());

        let handle = inner
            .hub
            .watch(&operation_channel(&operation_name), watcher);
        if let Err(e) = with_retries("prequeue", || {
            inner.backplane.prequeue(entry.clone(), &operation)
        })
        .await
        {
            // The watcher never gets a transition for an operation that was never admitted.
            inner.hub.unwatch(&handle);
            return Err(e);
        }
        log::debug!("Prequeued {operation_name} for {action_digest}");
        Ok((operation_name, handle))
    }

    ///
    /// Returns the current stripped operation, registering the watcher for the transitions
    /// still to come when the operation is not done.
    ///
    pub async fn watch_operation(
        &self,
        operation_name: &str,
        watcher: Observer,
    ) -> Result<(Operation, Option<WatchHandle>), Status> {
        let operation = with_retries("get_operation", || {
            self.inner.backplane.get_operation(operation_name)
        })
        .await?
        .ok_or_else(|| Status::not_found(format!("No operation named {operation_name}")))?;

        if operation.done {
            return Ok((operation.stripped(), None));
        }
        let handle = self
            .inner
            .hub
            .watch(&operation_channel(operation_name), watcher);
        Ok((operation.stripped(), Some(handle)))
    }

    pub async fn get_operation(&self, operation_name: &str) -> Result<Option<Operation>, Status> {
        with_retries("get_operation", || {
            self.inner.backplane.get_operation(operation_name)
        })
        .await
    }

    ///
    /// The subset of `digests` not held by any worker; see `fetch`.
    ///
    pub async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, Status> {
        fetch::find_missing_blobs(&self.inner, digests).await
    }

    ///
    /// Reads a blob range from whichever worker holds it; see `fetch`.
    ///
    pub async fn get_blob(
        &self,
        digest: Digest,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<bytes::Bytes, Status> {
        fetch::get_blob(&self.inner, digest, offset, limit).await
    }

    ///
    /// Stores verified content (the tail of a ByteStream upload) onto a worker and records its
    /// location.
    ///
    pub async fn put_blob(&self, digest: Digest, bytes: bytes::Bytes) -> Result<(), Status> {
        fetch::store_blob(&self.inner, digest, bytes).await
    }

    /// Test-facing view of the hub.
    pub fn watcher_hub(&self) -> &WatcherHub {
        &self.inner.hub
    }
}

#[cfg(test)]
mod tests;
