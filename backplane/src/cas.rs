// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use hashing::Digest;
use remexec::Status;

///
/// The CAS surface of a single worker, as seen by its peers: the calls the frontend fans out
/// over the worker set, and the calls a worker makes to fetch inputs its local cache is missing.
///
/// The transport that would carry these calls between machines is out of scope; tests and the
/// single-host assembly use in-process implementations.
///
#[async_trait]
pub trait CasNode: Send + Sync + 'static {
    /// The subset of `digests` this node does not hold.
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, Status>;

    /// Reads `limit` bytes (or to the end) starting at `offset`. OUT_OF_RANGE if the offset is
    /// past the end; NOT_FOUND if the node does not hold the blob.
    async fn get_blob(
        &self,
        digest: Digest,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Bytes, Status>;

    /// Stores verified content. INVALID_ARGUMENT if the bytes do not match the digest.
    async fn put_blob(&self, digest: Digest, bytes: Bytes) -> Result<(), Status>;
}

///
/// Resolves a worker name from the worker set to its CAS surface.
///
pub trait CasResolver: Send + Sync + 'static {
    fn resolve(&self, worker_name: &str) -> Option<Arc<dyn CasNode>>;
}

///
/// A fixed name → node table. The resolver used by tests and the single-host farm.
///
#[derive(Clone, Default)]
pub struct StaticCasResolver {
    nodes: Arc<Mutex<HashMap<String, Arc<dyn CasNode>>>>,
}

impl StaticCasResolver {
    pub fn new() -> StaticCasResolver {
        StaticCasResolver {
            nodes: Arc::default(),
        }
    }

    pub fn register(&self, worker_name: &str, node: Arc<dyn CasNode>) {
        self.nodes.lock().insert(worker_name.to_owned(), node);
    }

    pub fn deregister(&self, worker_name: &str) {
        self.nodes.lock().remove(worker_name);
    }
}

impl CasResolver for StaticCasResolver {
    fn resolve(&self, worker_name: &str) -> Option<Arc<dyn CasNode>> {
        self.nodes.lock().get(worker_name).cloned()
    }
}
