// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::future;
use rand::seq::SliceRandom;
use rand::thread_rng;

use backplane::with_retries;
use hashing::Digest;
use remexec::{Code, Status};

use crate::InstanceInner;

/// How many times an individual worker may be re-queued to the tail of a fan-out before the
/// hop sequence gives up on it.
const MAX_WORKER_REQUEUES: usize = 2;

///
/// Narrows the missing set one worker at a time over a shuffled worker set, short-circuiting
/// as soon as everything is accounted for.
///
/// Per-hop failure policy: UNAVAILABLE and UNIMPLEMENTED remove the worker from the farm;
/// retriable codes re-queue the worker at the tail; DEADLINE_EXCEEDED surfaces with the
/// diagnostics of every hop taken so far.
///
pub async fn find_missing_blobs(
    inner: &Arc<InstanceInner>,
    digests: Vec<Digest>,
) -> Result<Vec<Digest>, Status> {
    let mut missing = digests;
    if missing.is_empty() {
        return Ok(missing);
    }

    let mut workers = {
        let mut workers = with_retries("workers", || inner.backplane.workers()).await?;
        workers.shuffle(&mut thread_rng());
        workers
            .into_iter()
            .map(|worker| (worker, 0))
            .collect::<VecDeque<(String, usize)>>()
    };

    let mut hops: Vec<String> = Vec::new();
    while let Some((worker, requeues)) = workers.pop_front() {
        if missing.is_empty() {
            break;
        }
        let Some(node) = inner.resolver.resolve(&worker) else {
            log::warn!("No route to worker {worker}; removing from the set");
            let _ = inner.backplane.remove_worker(&worker).await;
            continue;
        };
        match node.find_missing_blobs(&missing).await {
            Ok(still_missing) => {
                hops.push(format!("{worker}: {} still missing", still_missing.len()));
                missing = still_missing;
            }
            Err(status) if matches!(status.code, Code::Unavailable | Code::Unimplemented) => {
                log::warn!("Removing worker {worker}: {status}");
                let _ = inner.backplane.remove_worker(&worker).await;
                hops.push(format!("{worker}: removed ({status})"));
            }
            Err(status) if status.code == Code::DeadlineExceeded => {
                return Err(Status::deadline_exceeded(format!(
                    "findMissingBlobs deadline exceeded at {worker}; hops: [{}]",
                    hops.join(", ")
                )));
            }
            Err(status) if status.is_retryable() && requeues < MAX_WORKER_REQUEUES => {
                hops.push(format!("{worker}: requeued ({status})"));
                workers.push_back((worker, requeues + 1));
            }
            Err(status) => {
                hops.push(format!("{worker}: dropped ({status})"));
                log::warn!("Dropping worker {worker} from the sweep: {status}");
            }
        }
    }
    Ok(missing)
}

///
/// Reads a blob from a worker that holds it, per the blob-location index.
///
/// Candidates are the intersection of the live worker set and the location set. An empty
/// candidate set — or a full pass in which every candidate reported NOT_FOUND — triggers a
/// location-correction pass (capped by `get_blob_correction_attempts`) before failing.
///
pub async fn get_blob(
    inner: &Arc<InstanceInner>,
    digest: Digest,
    offset: usize,
    limit: Option<usize>,
) -> Result<Bytes, Status> {
    let mut corrections_left = inner.options.get_blob_correction_attempts;
    loop {
        let workers = with_retries("workers", || inner.backplane.workers()).await?;
        let locations =
            with_retries("blob_locations", || inner.backplane.blob_locations(digest)).await?;
        let mut candidates = workers
            .iter()
            .filter(|worker| locations.contains(*worker))
            .cloned()
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            if corrections_left == 0 {
                return Err(Status::not_found(format!(
                    "Blob {digest} is not present on any worker"
                )));
            }
            corrections_left -= 1;
            correct_missing_blob(inner, digest).await?;
            continue;
        }
        candidates.shuffle(&mut thread_rng());

        for worker in candidates {
            let Some(node) = inner.resolver.resolve(&worker) else {
                continue;
            };
            match node.get_blob(digest, offset, limit).await {
                Ok(bytes) => return Ok(bytes),
                Err(status) if status.code == Code::NotFound => {
                    log::info!("Worker {worker} no longer holds {digest}");
                    let _ = inner
                        .backplane
                        .adjust_blob_locations(digest, &[], &[worker.clone()])
                        .await;
                }
                Err(status) if status.code == Code::Unavailable => {
                    log::warn!("Removing worker {worker}: {status}");
                    let _ = inner.backplane.remove_worker(&worker).await;
                }
                Err(status) if status.is_retryable() => {
                    log::debug!("Read of {digest} from {worker} failed transiently: {status}");
                }
                Err(status) => return Err(status),
            }
        }

        // Every candidate came up empty; correct the index once and retry before failing.
        if corrections_left == 0 {
            return Err(Status::not_found(format!(
                "Blob {digest} was absent from every candidate worker"
            )));
        }
        corrections_left -= 1;
        correct_missing_blob(inner, digest).await?;
    }
}

/// Convenience wrapper: a full blob read.
pub async fn fetch_blob(inner: &Arc<InstanceInner>, digest: Digest) -> Result<Bytes, Status> {
    get_blob(inner, digest, 0, None).await
}

///
/// Polls every worker in parallel for one digest and writes the observed truth back into the
/// blob-location index.
///
pub async fn correct_missing_blob(
    inner: &Arc<InstanceInner>,
    digest: Digest,
) -> Result<(), Status> {
    let workers = with_retries("workers", || inner.backplane.workers()).await?;
    let polls = workers.into_iter().map(|worker| {
        let inner = inner.clone();
        async move {
            let node = inner.resolver.resolve(&worker)?;
            match node.find_missing_blobs(&[digest]).await {
                Ok(missing) => Some((worker, missing.is_empty())),
                Err(status) => {
                    log::debug!("Correction poll of {worker} failed: {status}");
                    None
                }
            }
        }
    });
    let observations = future::join_all(polls).await;

    let mut to_add = Vec::new();
    let mut to_remove = Vec::new();
    for (worker, holds) in observations.into_iter().flatten() {
        if holds {
            to_add.push(worker);
        } else {
            to_remove.push(worker);
        }
    }
    log::debug!(
        "Corrected locations of {digest}: {} holders, {} stale",
        to_add.len(),
        to_remove.len()
    );
    inner
        .backplane
        .adjust_blob_locations(digest, &to_add, &to_remove)
        .await
}

///
/// Stores a blob onto some worker and records its location; the transform's upload path.
///
pub async fn store_blob(
    inner: &Arc<InstanceInner>,
    digest: Digest,
    bytes: Bytes,
) -> Result<(), Status> {
    let mut workers = with_retries("workers", || inner.backplane.workers()).await?;
    workers.shuffle(&mut thread_rng());
    let mut last_error = Status::unavailable("No workers available to store a blob");
    for worker in workers {
        let Some(node) = inner.resolver.resolve(&worker) else {
            continue;
        };
        match node.put_blob(digest, bytes.clone()).await {
            Ok(()) => {
                inner
                    .backplane
                    .adjust_blob_locations(digest, &[worker], &[])
                    .await?;
                return Ok(());
            }
            Err(status) => {
                log::warn!("Failed to store {digest} on {worker}: {status}");
                last_error = status;
            }
        }
    }
    Err(last_error)
}
