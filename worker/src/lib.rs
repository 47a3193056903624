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

//! The worker side of the farm: match an operation from the backplane, stage its inputs from
//! the CAS cache, run the subprocess, and report the result — all under a continuous liveness
//! poll renewing the dispatch deadline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use backplane::{with_retries, Backplane, CasNode, CasResolver};
use cas_cache::{BlobSource, CacheOptions, CasFileCache, LocalBlobSource, OnExpire, OnPut};
use hashing::Digest;
use remexec::Status;
use task_executor::Executor;

pub mod exec_fs;
pub mod execute;
pub mod pipeline;

pub use crate::exec_fs::ExecFileSystem;
pub use crate::execute::{CollectedOutputs, ExecutionOutcome};

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// The worker's name in the worker set, typically host:port.
    pub name: String,
    pub input_fetch_width: usize,
    pub execute_width: usize,
    pub report_width: usize,
    /// How often the liveness poll renews the dispatch deadline.
    pub poll_period: Duration,
    /// The deadline written on each renewal; mirrors the backplane's dispatch deadline.
    pub dispatch_deadline: Duration,
    /// Applied to actions that do not carry their own timeout.
    pub default_timeout: Duration,
    /// Hard ceiling on how long one claimed operation may live on this worker.
    pub max_operation_lifetime: Duration,
    pub link_input_directories: bool,
}

impl Default for WorkerOptions {
    fn default() -> WorkerOptions {
        WorkerOptions {
            name: "localhost:8981".to_owned(),
            input_fetch_width: 4,
            execute_width: 2,
            report_width: 4,
            poll_period: Duration::from_secs(10),
            dispatch_deadline: Duration::from_secs(30),
            default_timeout: Duration::from_secs(60),
            max_operation_lifetime: Duration::from_secs(60 * 60),
            link_input_directories: true,
        }
    }
}

pub(crate) struct WorkerInner {
    pub(crate) backplane: Arc<dyn Backplane>,
    pub(crate) cache: CasFileCache,
    pub(crate) exec_fs: Arc<ExecFileSystem>,
    pub(crate) remote_source: Arc<RemoteBlobSource>,
    pub(crate) executor: Executor,
    pub(crate) options: WorkerOptions,
    pub(crate) stopped: watch::Receiver<bool>,
}

impl WorkerInner {
    ///
    /// Stores verified content into the local CAS, leaving it unreferenced (present and
    /// evictable). The cache's on-put hook announces the location.
    ///
    pub(crate) async fn store_blob(&self, digest: Digest, bytes: Bytes) -> Result<(), Status> {
        if Digest::of_bytes(&bytes) != digest {
            return Err(Status::invalid_argument(format!(
                "Content does not match digest {digest}"
            )));
        }
        if self.cache.contains(digest) {
            return Ok(());
        }
        let source = LocalBlobSource::new([(digest, bytes)].into_iter().collect());
        self.cache.put(digest, false, None, &source).await?;
        self.cache.decrement_references(&[(digest, false)], &[]);
        Ok(())
    }
}

///
/// A long-lived worker process: a CAS cache, an exec filesystem, and the four-stage pipeline.
///
pub struct Worker {
    pub(crate) inner: Arc<WorkerInner>,
    stop: watch::Sender<bool>,
}

impl Worker {
    pub async fn new(
        backplane: Arc<dyn Backplane>,
        resolver: Arc<dyn CasResolver>,
        executor: Executor,
        cache_root: PathBuf,
        exec_root: PathBuf,
        cache_options: CacheOptions,
        options: WorkerOptions,
    ) -> Result<Worker, String> {
        // The cache announces content changes to the blob-location index as they happen.
        let worker_name = options.name.clone();
        let hook_backplane = backplane.clone();
        let hook_executor = executor.clone();
        let on_put: OnPut = Arc::new(move |digest| {
            let backplane = hook_backplane.clone();
            let worker_name = worker_name.clone();
            hook_executor.native_spawn(async move {
                if let Err(e) = backplane
                    .adjust_blob_locations(digest, &[worker_name], &[])
                    .await
                {
                    log::warn!("Failed to announce {digest}: {e}");
                }
            });
        });
        let worker_name = options.name.clone();
        let hook_backplane = backplane.clone();
        let hook_executor = executor.clone();
        let on_expire: OnExpire = Arc::new(move |digests| {
            for digest in digests {
                let digest = *digest;
                let backplane = hook_backplane.clone();
                let worker_name = worker_name.clone();
                hook_executor.native_spawn(async move {
                    if let Err(e) = backplane
                        .adjust_blob_locations(digest, &[], &[worker_name])
                        .await
                    {
                        log::warn!("Failed to retract {digest}: {e}");
                    }
                });
            }
        });

        let cache = CasFileCache::new(
            cache_root,
            cache_options,
            executor.clone(),
            vec![on_put],
            vec![on_expire],
        )
        .await?;
        let exec_fs =
            ExecFileSystem::new(exec_root, cache.clone(), options.link_input_directories).await?;
        let remote_source = Arc::new(RemoteBlobSource {
            worker_name: options.name.clone(),
            backplane: backplane.clone(),
            resolver,
        });
        let (stop, stopped) = watch::channel(false);
        Ok(Worker {
            inner: Arc::new(WorkerInner {
                backplane,
                cache,
                exec_fs,
                remote_source,
                executor,
                options,
                stopped,
            }),
            stop,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn cache(&self) -> &CasFileCache {
        &self.inner.cache
    }

    /// The CAS surface this worker exposes to its peers.
    pub fn cas_node(&self) -> Arc<dyn CasNode> {
        Arc::new(WorkerCasNode {
            inner: self.inner.clone(),
        })
    }

    ///
    /// Joins the worker set, announces recovered cache contents to the blob-location index, and
    /// starts the pipeline.
    ///
    pub async fn start(&self) -> Result<(), Status> {
        let name = self.inner.options.name.clone();
        with_retries("add_worker", || self.inner.backplane.add_worker(&name)).await?;

        let contents = self.inner.cache.contained_digests();
        log::info!("Worker {name} announcing {} recovered blobs", contents.len());
        for digest in contents {
            self.inner
                .backplane
                .adjust_blob_locations(digest, &[name.clone()], &[])
                .await?;
        }

        pipeline::spawn_pipeline(self);
        Ok(())
    }

    ///
    /// Stops matching new work and leaves the worker set.
    ///
    pub async fn stop(&self) -> Result<(), Status> {
        let _ = self.stop.send(true);
        let name = self.inner.options.name.clone();
        with_retries("remove_worker", || self.inner.backplane.remove_worker(&name)).await
    }
}

///
/// The worker's peer-facing CAS node.
///
struct WorkerCasNode {
    inner: Arc<WorkerInner>,
}

#[async_trait]
impl CasNode for WorkerCasNode {
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, Status> {
        Ok(digests
            .iter()
            .filter(|digest| !self.inner.cache.contains(**digest))
            .copied()
            .collect())
    }

    async fn get_blob(
        &self,
        digest: Digest,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Bytes, Status> {
        self.inner.cache.read_blob(digest, offset, limit).await
    }

    async fn put_blob(&self, digest: Digest, bytes: Bytes) -> Result<(), Status> {
        self.inner.store_blob(digest, bytes).await
    }
}

///
/// The worker's fetch path for inputs its local cache is missing: consult the blob-location
/// index and read from a peer that holds the blob, correcting the index when a location turns
/// out to be stale.
///
pub struct RemoteBlobSource {
    worker_name: String,
    backplane: Arc<dyn Backplane>,
    resolver: Arc<dyn CasResolver>,
}

#[async_trait]
impl BlobSource for RemoteBlobSource {
    async fn load(&self, digest: Digest) -> Result<Bytes, Status> {
        let locations =
            with_retries("blob_locations", || self.backplane.blob_locations(digest)).await?;
        for location in locations {
            if location == self.worker_name {
                continue;
            }
            let Some(node) = self.resolver.resolve(&location) else {
                log::debug!("No route to worker {location}");
                continue;
            };
            match node.get_blob(digest, 0, None).await {
                Ok(bytes) if Digest::of_bytes(&bytes) == digest => return Ok(bytes),
                Ok(_) => {
                    log::warn!("Worker {location} served corrupt content for {digest}");
                }
                Err(status) if status.code == remexec::Code::NotFound => {
                    // The index was stale; record the observed truth.
                    let _ = self
                        .backplane
                        .adjust_blob_locations(digest, &[], &[location.clone()])
                        .await;
                }
                Err(status) => {
                    log::debug!("Fetch of {digest} from {location} failed: {status}");
                }
            }
        }
        Err(Status::not_found(format!(
            "Blob {digest} not available from any peer"
        )))
    }
}
