// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use backplane::{operation_channel, with_retries};
use hashing::Digest;
use poller::Poller;
use remexec::{
    Action, Code, Command, Directory, ExecuteEntry, ExecuteResponse, Operation,
    PreconditionViolation, QueueEntry, QueuedOperation, Stage, Status,
};

use crate::fetch;
use crate::InstanceInner;

///
/// The background loop that promotes prequeued requests to the ready queue: cache check,
/// action/command/tree resolution, validation, upload, queue. In-flight transforms are capped
/// by a token queue.
///
pub(crate) fn spawn_operation_queuer(inner: Arc<InstanceInner>) {
    let executor = inner.executor.clone();
    executor.clone().native_spawn(async move {
        let tokens = Arc::new(Semaphore::new(inner.options.transform_tokens));
        let mut stopped = inner.stopped.clone();
        loop {
            if *stopped.borrow() {
                break;
            }
            let entry = tokio::select! {
                _ = stopped.changed() => break,
                entry = with_retries("deprequeue_operation", || {
                    inner.backplane.deprequeue_operation()
                }) => entry,
            };
            let entry = match entry {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Failed to pull from the prequeue: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            // Admission to the ready queue, before spending any transform work.
            loop {
                if *stopped.borrow() {
                    return;
                }
                match inner.backplane.can_queue().await {
                    Ok(true) => break,
                    Ok(false) => tokio::time::sleep(Duration::from_millis(100)).await,
                    Err(e) => {
                        log::warn!("can_queue failed: {e}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }

            let permit = match tokens.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let inner = inner.clone();
            executor.native_spawn(async move {
                let name = entry.operation_name.clone();
                transform_and_queue(&inner, entry).await;
                drop(permit);
                log::debug!("Transform of {name} finished");
            });
        }
    });
}

///
/// Runs one prequeue transform under a keep-alive poll that extends the operation's watcher
/// deadlines while the work is in flight.
///
async fn transform_and_queue(inner: &Arc<InstanceInner>, entry: ExecuteEntry) {
    let name = entry.operation_name.clone();
    let keep_alive = Poller::new(inner.executor.clone());
    let poll_inner = inner.clone();
    let poll_name = name.clone();
    let resume_result = keep_alive.resume(
        inner.options.queueing_poll_period,
        Instant::now() + inner.options.max_transform_duration,
        move || {
            let inner = poll_inner.clone();
            let name = poll_name.clone();
            async move {
                queueing(&inner, &name);
                true
            }
        },
        Box::new(|| {}),
        Box::new(move || log::error!("Transform keep-alive expired")),
    );
    if let Err(e) = resume_result {
        log::error!("Failed to start the keep-alive poll for {name}: {e}");
    }

    match transform(inner, &entry).await {
        Ok(TransformOutcome::Queued) | Ok(TransformOutcome::CacheServed) => {}
        Err(status) => {
            log::warn!("Transform of {name} failed: {status}");
            let operation = Operation::completed_with_error(name.as_str(), status);
            if let Err(e) =
                with_retries("put_operation", || inner.backplane.put_operation(&operation)).await
            {
                log::error!("Failed to record the terminal error for {name}: {e}");
            }
        }
    }
    keep_alive.pause();
}

/// Extends the deadlines of this operation's watchers while it sits in the transform.
fn queueing(inner: &Arc<InstanceInner>, operation_name: &str) {
    let channel = operation_channel(operation_name);
    inner
        .hub
        .reset_watchers(&channel, inner.hub.next_expires_at());
}

enum TransformOutcome {
    Queued,
    CacheServed,
}

async fn transform(
    inner: &Arc<InstanceInner>,
    entry: &ExecuteEntry,
) -> Result<TransformOutcome, Status> {
    let name = &entry.operation_name;
    let started = Instant::now();

    // Cache check.
    if !entry.skip_cache_lookup && check_action_cache(inner, entry).await? {
        return Ok(TransformOutcome::CacheServed);
    }
    let cache_checked = Instant::now();

    // Resolve the action.
    let action: Action = fetch_message(inner, entry.action_digest)
        .await
        .map_err(|status| missing_if_not_found(status, entry.action_digest))?;
    let action_fetched = Instant::now();

    // Resolve the input tree through the tree cache.
    let directories = fetch_tree(inner, action.input_root_digest).await?;
    let tree_fetched = Instant::now();

    // Resolve the command.
    let command: Command = fetch_message(inner, action.command_digest)
        .await
        .map_err(|status| missing_if_not_found(status, action.command_digest))?;
    let command_fetched = Instant::now();

    // Build and validate.
    let queued_operation = QueuedOperation {
        action: action.clone(),
        command,
        directories,
    };
    validate_queued_operation(&queued_operation)?;
    let validated = Instant::now();

    // Upload the bundle as one CAS blob.
    let (digest, bytes) = remexec::encode_with_digest(&queued_operation)?;
    fetch::store_blob(inner, digest, bytes).await?;
    let uploaded = Instant::now();

    // Atomically move to the ready queue and publish QUEUED.
    let queue_entry = QueueEntry {
        execute_entry: entry.clone(),
        queued_operation_digest: digest,
        platform: action.platform.clone(),
    };
    let operation = Operation::new(name.as_str()).with_stage(Stage::Queued);
    with_retries("queue", || {
        inner.backplane.queue(queue_entry.clone(), &operation)
    })
    .await?;

    log::debug!(
        "Queued {name}: cache-check {:?}, action {:?}, tree {:?}, command {:?}, validate {:?}, upload {:?}, queue {:?}",
        cache_checked - started,
        action_fetched - cache_checked,
        tree_fetched - action_fetched,
        command_fetched - tree_fetched,
        validated - command_fetched,
        uploaded - validated,
        Instant::now() - uploaded,
    );
    Ok(TransformOutcome::Queued)
}

///
/// Serves the operation from the action cache if a result exists. The whole step runs under
/// the cache-check deadline.
///
async fn check_action_cache(
    inner: &Arc<InstanceInner>,
    entry: &ExecuteEntry,
) -> Result<bool, Status> {
    let name = &entry.operation_name;
    let checking = Operation::new(name.as_str()).with_stage(Stage::CacheCheck);
    with_retries("put_operation", || inner.backplane.put_operation(&checking)).await?;

    let lookup = with_retries("get_action_result", || {
        inner.backplane.get_action_result(entry.action_digest)
    });
    let result = tokio::time::timeout(inner.options.cache_check_deadline, lookup)
        .await
        .map_err(|_| Status::deadline_exceeded("Action cache check timed out"))??;

    let Some(result) = result else {
        return Ok(false);
    };

    // Record the retry key before the terminal state is visible, so a client that reacts to
    // the completion by resubmitting immediately is already forced past the cache.
    inner.record_cache_served(&entry.request_metadata);

    let response = ExecuteResponse {
        result,
        cached_result: true,
        status: Status::ok(),
    };
    let operation = Operation::completed(name.as_str(), response);
    with_retries("put_operation", || inner.backplane.put_operation(&operation)).await?;
    log::debug!("Served {name} from the action cache");
    Ok(true)
}

async fn fetch_message<T: serde::de::DeserializeOwned>(
    inner: &Arc<InstanceInner>,
    digest: Digest,
) -> Result<T, Status> {
    let bytes = fetch::fetch_blob(inner, digest).await?;
    remexec::decode(&bytes)
}

///
/// Fetches the full directory list of an input root, preferring the backplane's tree cache and
/// filling it on a miss.
///
async fn fetch_tree(
    inner: &Arc<InstanceInner>,
    input_root: Digest,
) -> Result<Vec<(Digest, Directory)>, Status> {
    if let Some(directories) =
        with_retries("get_tree", || inner.backplane.get_tree(input_root)).await?
    {
        return Ok(directories);
    }

    let mut directories = Vec::new();
    let mut pending = vec![input_root];
    let mut seen = std::collections::HashSet::new();
    while let Some(digest) = pending.pop() {
        if !seen.insert(digest) {
            continue;
        }
        let directory: Directory = fetch_message(inner, digest)
            .await
            .map_err(|status| missing_if_not_found(status, digest))?;
        for subdir in &directory.directories {
            pending.push(subdir.digest);
        }
        directories.push((digest, directory));
    }

    with_retries("put_tree", || {
        inner.backplane.put_tree(input_root, directories.clone())
    })
    .await?;
    Ok(directories)
}

/// A blob nobody holds is a missing input from the client's point of view.
fn missing_if_not_found(status: Status, digest: Digest) -> Status {
    if status.code == Code::NotFound {
        Status::missing_blobs([digest])
    } else {
        status
    }
}

///
/// The validate-before-queue contract: a QueuedOperation reaches the ready queue only if its
/// command is runnable and its directory closure is complete.
///
pub(crate) fn validate_queued_operation(queued_operation: &QueuedOperation) -> Result<(), Status> {
    if queued_operation.command.arguments.is_empty() {
        return Err(Status::invalid_argument("Command has no arguments"));
    }

    let index: HashMap<Digest, &Directory> = queued_operation
        .directories
        .iter()
        .map(|(digest, directory)| (*digest, directory))
        .collect();
    let mut violations = Vec::new();
    let mut pending = vec![queued_operation.action.input_root_digest];
    let mut seen = std::collections::HashSet::new();
    while let Some(digest) = pending.pop() {
        if !seen.insert(digest) {
            continue;
        }
        match index.get(&digest) {
            Some(directory) => {
                for subdir in &directory.directories {
                    pending.push(subdir.digest);
                }
            }
            None => violations.push(PreconditionViolation::missing_blob(digest)),
        }
    }
    if !violations.is_empty() {
        return Err(Status::failed_precondition(
            "The input tree is incomplete",
            violations,
        ));
    }
    Ok(())
}
