// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use backplane::CasNode;
use hashing::Digest;
use remexec::{Code, Status};

///
/// An in-process CAS node for tests: canned blobs, call counting, and optional fault
/// injection.
///
pub struct StubCas {
    blobs: Mutex<HashMap<Digest, Bytes>>,
    request_count: AtomicUsize,
    always_fail_with: Mutex<Option<Code>>,
}

impl StubCas {
    pub fn new(blobs: HashMap<Digest, Bytes>) -> Arc<StubCas> {
        Arc::new(StubCas {
            blobs: Mutex::new(blobs),
            request_count: AtomicUsize::new(0),
            always_fail_with: Mutex::new(None),
        })
    }

    pub fn empty() -> Arc<StubCas> {
        StubCas::new(HashMap::new())
    }

    pub fn insert(&self, digest: Digest, bytes: Bytes) {
        self.blobs.lock().insert(digest, bytes);
    }

    pub fn remove(&self, digest: Digest) {
        self.blobs.lock().remove(&digest);
    }

    pub fn contains(&self, digest: Digest) -> bool {
        self.blobs.lock().contains_key(&digest)
    }

    /// The number of CAS calls served (or failed) so far.
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Makes every subsequent call fail with the given code.
    pub fn fail_with(&self, code: Code) {
        *self.always_fail_with.lock() = Some(code);
    }

    pub fn recover(&self) {
        *self.always_fail_with.lock() = None;
    }

    fn check_fault(&self) -> Result<(), Status> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        match *self.always_fail_with.lock() {
            Some(code) => Err(Status::new(code, "injected fault")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CasNode for StubCas {
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, Status> {
        self.check_fault()?;
        let blobs = self.blobs.lock();
        Ok(digests
            .iter()
            .filter(|digest| !blobs.contains_key(digest))
            .copied()
            .collect())
    }

    async fn get_blob(
        &self,
        digest: Digest,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Bytes, Status> {
        self.check_fault()?;
        let blobs = self.blobs.lock();
        let bytes = blobs
            .get(&digest)
            .ok_or_else(|| Status::not_found(format!("Blob {digest} not in stub CAS")))?;
        if offset > bytes.len() {
            return Err(Status::out_of_range(format!(
                "Offset {offset} past the end of {digest}"
            )));
        }
        let end = limit
            .map(|limit| (offset + limit).min(bytes.len()))
            .unwrap_or(bytes.len());
        Ok(bytes.slice(offset..end))
    }

    async fn put_blob(&self, digest: Digest, bytes: Bytes) -> Result<(), Status> {
        self.check_fault()?;
        if Digest::of_bytes(&bytes) != digest {
            return Err(Status::invalid_argument(format!(
                "Content does not match digest {digest}"
            )));
        }
        self.blobs.lock().insert(digest, bytes);
        Ok(())
    }
}
