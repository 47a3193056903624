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

//! The local content-addressed file cache: a reference-counted LRU over a flat on-disk root.
//!
//! Blobs live as `<hash>_<size>` (or `<hash>_<size>_exec`) files that exec dirs hard-link;
//! whole input directories are materialized once as `<hash>_<size>_dir/` trees of hard links
//! and consumed by symlink. Entries carry reference counts; only entries at zero references
//! are eviction candidates, ordered by their release sequence. Evicting a file that
//! participates in a materialized directory expires the whole directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use uuid::Uuid;

use hashing::Digest;
use remexec::{Directory, Status};
use task_executor::Executor;

/// How long a positive disk-existence check is trusted before re-statting.
const EXISTS_DEADLINE: Duration = Duration::from_secs(10);

///
/// Sizing and patience knobs for a cache instance.
///
#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub max_size_bytes: usize,
    /// How long a put waits for referenced space to be released before giving up.
    pub space_wait_timeout: Duration,
}

impl Default for CacheOptions {
    fn default() -> CacheOptions {
        CacheOptions {
            max_size_bytes: 16 * 1024 * 1024 * 1024,
            space_wait_timeout: Duration::from_secs(10),
        }
    }
}

///
/// Provides blob content for cache misses. The worker's implementation fetches from peers over
/// the blob-location index; tests use canned maps.
///
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn load(&self, digest: Digest) -> Result<Bytes, Status>;
}

///
/// A BlobSource over a fixed set of blobs, for seeding and tests.
///
pub struct LocalBlobSource {
    blobs: HashMap<Digest, Bytes>,
}

impl LocalBlobSource {
    pub fn new(blobs: HashMap<Digest, Bytes>) -> LocalBlobSource {
        LocalBlobSource { blobs }
    }
}

#[async_trait]
impl BlobSource for LocalBlobSource {
    async fn load(&self, digest: Digest) -> Result<Bytes, Status> {
        self.blobs
            .get(&digest)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("Blob {digest} not available")))
    }
}

pub type OnPut = Arc<dyn Fn(Digest) + Send + Sync>;
pub type OnExpire = Arc<dyn Fn(&[Digest]) + Send + Sync>;

struct Entry {
    digest: Digest,
    #[allow(dead_code)]
    is_executable: bool,
    refs: usize,
    containing_directories: HashSet<Digest>,
    exists_checked_at: Instant,
    // Present iff refs == 0: the entry's position in the LRU index.
    release_seq: Option<u64>,
}

struct DirectoryEntry {
    digest: Digest,
    refs: usize,
    // Keys of the file entries this materialization holds references on, one reference per
    // directory reference.
    inputs: Vec<String>,
}

#[derive(Default)]
struct State {
    storage: HashMap<String, Entry>,
    directories: HashMap<String, DirectoryEntry>,
    // release_seq -> entry key; contains exactly the entries whose refs are zero, oldest
    // release first.
    lru: BTreeMap<u64, String>,
    next_seq: u64,
    size: usize,
}

impl State {
    fn unlink_from_lru(&mut self, key: &str) {
        if let Some(entry) = self.storage.get_mut(key) {
            if let Some(seq) = entry.release_seq.take() {
                self.lru.remove(&seq);
            }
        }
    }

    fn link_to_lru(&mut self, key: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.storage.get_mut(key) {
            entry.release_seq = Some(seq);
            self.lru.insert(seq, key.to_owned());
        }
    }

    fn increment(&mut self, key: &str) {
        self.unlink_from_lru(key);
        if let Some(entry) = self.storage.get_mut(key) {
            entry.refs += 1;
        }
    }

    /// Returns true if the entry reached zero references.
    fn decrement(&mut self, key: &str) -> bool {
        let released = match self.storage.get_mut(key) {
            Some(entry) => {
                if entry.refs == 0 {
                    log::error!("Reference count underflow for {key}");
                    return false;
                }
                entry.refs -= 1;
                entry.refs == 0
            }
            None => {
                log::error!("Decrement of unknown cache entry {key}");
                return false;
            }
        };
        if released {
            self.link_to_lru(key);
        }
        released
    }
}

struct Inner {
    root: PathBuf,
    options: CacheOptions,
    executor: Executor,
    state: Mutex<State>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    space_released: Notify,
    on_put: Vec<OnPut>,
    on_expire: Vec<OnExpire>,
}

#[derive(Clone)]
pub struct CasFileCache {
    inner: Arc<Inner>,
}

fn entry_key(digest: Digest, is_executable: bool) -> String {
    if is_executable {
        format!("{digest}_exec")
    } else {
        digest.to_entry_name()
    }
}

fn directory_key(digest: Digest) -> String {
    format!("{digest}_dir")
}

impl CasFileCache {
    ///
    /// Opens (or creates) a cache root, recovering any blobs already present from a previous
    /// run at zero references. Stale temporary files and directory materializations are
    /// removed: blobs are cheap to re-link, and a recovered link tree cannot be trusted
    /// without a full walk.
    ///
    pub async fn new(
        root: PathBuf,
        options: CacheOptions,
        executor: Executor,
        on_put: Vec<OnPut>,
        on_expire: Vec<OnExpire>,
    ) -> Result<CasFileCache, String> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| format!("Failed to create cache root {root:?}: {e}"))?;

        let mut state = State::default();
        let mut read_dir = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| format!("Failed to walk cache root {root:?}: {e}"))?;
        while let Some(dir_entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| format!("Failed to walk cache root {root:?}: {e}"))?
        {
            let file_name = dir_entry.file_name().to_string_lossy().into_owned();
            let path = dir_entry.path();
            if file_name.starts_with(".tmp.") || file_name.ends_with("_dir") {
                let file_type = dir_entry
                    .file_type()
                    .await
                    .map_err(|e| format!("Failed to stat {path:?}: {e}"))?;
                if file_type.is_dir() {
                    let _ = tokio::fs::remove_dir_all(&path).await;
                } else {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                continue;
            }

            let (entry_name, is_executable) = match file_name.strip_suffix("_exec") {
                Some(prefix) => (prefix, true),
                None => (file_name.as_str(), false),
            };
            match Digest::from_entry_name(entry_name) {
                Ok(digest) => {
                    state.storage.insert(
                        file_name.clone(),
                        Entry {
                            digest,
                            is_executable,
                            refs: 0,
                            containing_directories: HashSet::new(),
                            exists_checked_at: Instant::now(),
                            release_seq: None,
                        },
                    );
                    state.size += digest.size_bytes;
                    state.link_to_lru(&file_name);
                }
                Err(e) => {
                    log::warn!("Removing unrecognized cache file {path:?}: {e}");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }

        log::info!(
            "Recovered {} cache entries ({} bytes) under {root:?}",
            state.storage.len(),
            state.size
        );
        Ok(CasFileCache {
            inner: Arc::new(Inner {
                root,
                options,
                executor,
                state: Mutex::new(state),
                key_locks: Mutex::default(),
                space_released: Notify::new(),
                on_put,
                on_expire,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().size
    }

    pub fn contains(&self, digest: Digest) -> bool {
        let state = self.inner.state.lock();
        state.storage.contains_key(&entry_key(digest, false))
            || state.storage.contains_key(&entry_key(digest, true))
    }

    /// The digests of every blob currently held, for announcing this worker's content set.
    pub fn contained_digests(&self) -> Vec<Digest> {
        let state = self.inner.state.lock();
        state
            .storage
            .values()
            .map(|entry| entry.digest)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.inner.root.join(key)
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .key_locks
            .lock()
            .entry(key.to_owned())
            .or_default()
            .clone()
    }

    ///
    /// Returns a hard-linkable path for the blob, fetching and writing it if absent.
    ///
    /// A present entry has its reference count incremented (and is unlinked from the LRU); a
    /// new entry is written to a `.tmp` sibling, given its final permissions, synced, renamed
    /// into place, and registered at one reference. `containing_directory` records that the
    /// reference is held on behalf of a materialized directory.
    ///
    pub async fn put(
        &self,
        digest: Digest,
        is_executable: bool,
        containing_directory: Option<Digest>,
        source: &dyn BlobSource,
    ) -> Result<PathBuf, Status> {
        let key = entry_key(digest, is_executable);
        let key_lock = self.key_lock(&key);
        let _guard = key_lock.lock().await;

        // Fast path: the entry is present; take a reference without touching other keys.
        let needs_exists_check = {
            let mut state = self.inner.state.lock();
            match state.storage.get_mut(&key) {
                Some(entry) => {
                    let stale = entry.exists_checked_at.elapsed() > EXISTS_DEADLINE;
                    if !stale {
                        state.increment(&key);
                        if let (Some(dir), Some(entry)) =
                            (containing_directory, state.storage.get_mut(&key))
                        {
                            entry.containing_directories.insert(dir);
                        }
                        return Ok(self.entry_path(&key));
                    }
                    true
                }
                None => false,
            }
        };

        if needs_exists_check {
            let path = self.entry_path(&key);
            if tokio::fs::metadata(&path).await.is_ok() {
                let mut state = self.inner.state.lock();
                if let Some(entry) = state.storage.get_mut(&key) {
                    entry.exists_checked_at = Instant::now();
                }
                state.increment(&key);
                if let (Some(dir), Some(entry)) =
                    (containing_directory, state.storage.get_mut(&key))
                {
                    entry.containing_directories.insert(dir);
                }
                return Ok(path);
            }
            // The backing file vanished underneath us; drop the stale entry and re-create.
            log::warn!("Cache entry {key} lost its backing file; re-fetching");
            self.remove_stale_entry(&key);
        }

        if digest.size_bytes > self.inner.options.max_size_bytes {
            return Err(Status::new(
                remexec::Code::ResourceExhausted,
                format!(
                    "Blob {digest} exceeds the cache size limit of {} bytes",
                    self.inner.options.max_size_bytes
                ),
            ));
        }

        let bytes = source.load(digest).await?;
        if Digest::of_bytes(&bytes) != digest {
            return Err(Status::internal(format!(
                "Fetched content for {digest} did not match its digest"
            )));
        }

        self.reserve_space(digest.size_bytes).await?;

        let path = self.entry_path(&key);
        if let Err(e) = self.write_entry_file(&path, bytes, is_executable).await {
            self.release_reservation(digest.size_bytes);
            return Err(e);
        }

        {
            // The reservation already accounted this entry's bytes.
            let mut state = self.inner.state.lock();
            let mut containing_directories = HashSet::new();
            if let Some(dir) = containing_directory {
                containing_directories.insert(dir);
            }
            state.storage.insert(
                key.clone(),
                Entry {
                    digest,
                    is_executable,
                    refs: 1,
                    containing_directories,
                    exists_checked_at: Instant::now(),
                    release_seq: None,
                },
            );
        }
        for hook in &self.inner.on_put {
            hook(digest);
        }
        Ok(path)
    }

    async fn write_entry_file(
        &self,
        path: &Path,
        bytes: Bytes,
        is_executable: bool,
    ) -> Result<(), Status> {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let tmp_path = self.inner.root.join(format!(".tmp.{}", Uuid::new_v4()));
        let target = path.to_owned();
        self.inner
            .executor
            .spawn_blocking(
                move || {
                    let mut file = std::fs::File::create(&tmp_path)
                        .map_err(|e| format!("Failed to create {tmp_path:?}: {e}"))?;
                    file.write_all(&bytes)
                        .map_err(|e| format!("Failed to write {tmp_path:?}: {e}"))?;
                    let mode = if is_executable { 0o555 } else { 0o444 };
                    file.set_permissions(std::fs::Permissions::from_mode(mode))
                        .map_err(|e| format!("Failed to set permissions on {tmp_path:?}: {e}"))?;
                    // Sync so the rename (and later hard links) can't observe a file whose
                    // metadata hasn't reached disk.
                    file.sync_all()
                        .map_err(|e| format!("Failed to sync {tmp_path:?}: {e}"))?;
                    std::fs::rename(&tmp_path, &target).map_err(|e| {
                        let _ = std::fs::remove_file(&tmp_path);
                        format!("Failed to rename {tmp_path:?} into place: {e}")
                    })?;
                    Ok(())
                },
                |e| Err(format!("Cache write task failed: {e}")),
            )
            .await
            .map_err(Status::internal)
    }

    ///
    /// Drops an entry whose backing file disappeared. Size and LRU bookkeeping are corrected;
    /// directory materializations over it are expired.
    ///
    fn remove_stale_entry(&self, key: &str) {
        let (to_delete, expired_digests) = {
            let mut state = self.inner.state.lock();
            self.evict_key_locked(&mut state, key)
        };
        self.finish_expiry(to_delete, expired_digests);
    }

    ///
    /// Waits for (evicting as needed) `needed` bytes of headroom, and debits them from the
    /// accounted size under the monitor so concurrent puts cannot over-commit. Eviction
    /// victims come from the LRU oldest-release-first; when everything is referenced, waits
    /// for a release. The caller must either register an entry of exactly `needed` bytes or
    /// call `release_reservation`.
    ///
    async fn reserve_space(&self, needed: usize) -> Result<(), Status> {
        let give_up_at = Instant::now() + self.inner.options.space_wait_timeout;
        loop {
            let (to_delete, expired_digests, reserved) = {
                let mut state = self.inner.state.lock();
                let mut to_delete = Vec::new();
                let mut expired_digests = Vec::new();
                // Keep evicting while we would land at or above the limit; an exact fit is
                // tolerated only once no unreferenced victim remains.
                while state.size + needed >= self.inner.options.max_size_bytes {
                    let Some(victim_key) = state.lru.values().next().cloned() else {
                        break;
                    };
                    let (paths, digests) = self.evict_key_locked(&mut state, &victim_key);
                    to_delete.extend(paths);
                    expired_digests.extend(digests);
                }
                let reserved = state.size + needed <= self.inner.options.max_size_bytes;
                if reserved {
                    state.size += needed;
                }
                (to_delete, expired_digests, reserved)
            };
            self.finish_expiry(to_delete, expired_digests);
            if reserved {
                return Ok(());
            }
            if Instant::now() >= give_up_at {
                return Err(Status::new(
                    remexec::Code::ResourceExhausted,
                    format!("No unreferenced cache space available for {needed} bytes"),
                ));
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(100),
                self.inner.space_released.notified(),
            )
            .await;
        }
    }

    fn release_reservation(&self, needed: usize) {
        self.inner.state.lock().size -= needed;
        self.inner.space_released.notify_waiters();
    }

    ///
    /// Removes one file entry (and any directory materializations it participates in) from the
    /// cache state, renaming the on-disk artifacts to deferred-delete temporaries under the
    /// monitor so a concurrent put of the same key cannot race the unlink. Returns the
    /// temporary paths to delete and the digests expired.
    ///
    fn evict_key_locked(&self, state: &mut State, key: &str) -> (Vec<PathBuf>, Vec<Digest>) {
        let mut to_delete = Vec::new();
        let mut expired_digests = Vec::new();

        let Some(entry) = state.storage.remove(key) else {
            return (to_delete, expired_digests);
        };
        if entry.refs > 0 {
            // Referenced entries are never victims; this is only reachable for stale-entry
            // removal after the backing file vanished.
            log::error!("Removing cache entry {key} holding {} references", entry.refs);
        }
        if let Some(seq) = entry.release_seq {
            state.lru.remove(&seq);
        }
        state.size -= entry.digest.size_bytes;
        expired_digests.push(entry.digest);
        to_delete.push(self.defer_delete(self.entry_path(key)));

        for dir_digest in entry.containing_directories {
            let dir_key = directory_key(dir_digest);
            let Some(dir_entry) = state.directories.remove(&dir_key) else {
                continue;
            };
            expired_digests.push(dir_entry.digest);
            to_delete.push(self.defer_delete(self.entry_path(&dir_key)));
            // Release whatever references the directory still held on its other inputs, and
            // unlink their back-pointers.
            for input_key in dir_entry.inputs {
                if input_key == key {
                    continue;
                }
                if let Some(input) = state.storage.get_mut(&input_key) {
                    input.containing_directories.remove(&dir_digest);
                }
                for _ in 0..dir_entry.refs {
                    state.decrement(&input_key);
                }
            }
        }
        (to_delete, expired_digests)
    }

    /// Renames an artifact to a temporary sibling for deletion outside the monitor.
    fn defer_delete(&self, path: PathBuf) -> PathBuf {
        let tmp_path = self.inner.root.join(format!(".tmp.{}", Uuid::new_v4()));
        match std::fs::rename(&path, &tmp_path) {
            Ok(()) => tmp_path,
            Err(_) => path,
        }
    }

    fn finish_expiry(&self, to_delete: Vec<PathBuf>, expired_digests: Vec<Digest>) {
        if !expired_digests.is_empty() {
            for hook in &self.inner.on_expire {
                hook(&expired_digests);
            }
        }
        if to_delete.is_empty() {
            return;
        }
        self.inner.executor.native_spawn(async move {
            for path in to_delete {
                let result = if tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false)
                {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                if let Err(e) = result {
                    log::debug!("Failed to delete expired cache artifact {path:?}: {e}");
                }
            }
        });
    }

    ///
    /// Materializes a directory tree under `<root>/<hash>_<size>_dir` by recursively putting
    /// its files and hard-linking them into place. Holds one reference on the materialization
    /// (and, transitively, on every contained file) per call; concurrent calls for one digest
    /// share the work through the per-key lock.
    ///
    pub async fn put_directory(
        &self,
        digest: Digest,
        index: &HashMap<Digest, Directory>,
        source: &dyn BlobSource,
    ) -> Result<PathBuf, Status> {
        let dir_key = directory_key(digest);
        let dir_lock = self.key_lock(&dir_key);
        let _guard = dir_lock.lock().await;
        let dir_path = self.entry_path(&dir_key);

        // Reuse an existing materialization if its on-disk root is still verifiable.
        let reusable = {
            let state = self.inner.state.lock();
            state.directories.contains_key(&dir_key)
        };
        if reusable {
            if tokio::fs::metadata(&dir_path).await.is_ok() {
                let input_keys = {
                    let state = self.inner.state.lock();
                    state.directories.get(&dir_key).map(|d| d.inputs.clone())
                };
                if let Some(input_keys) = input_keys {
                    let mut state = self.inner.state.lock();
                    if let Some(dir_entry) = state.directories.get_mut(&dir_key) {
                        dir_entry.refs += 1;
                    }
                    for input_key in &input_keys {
                        state.increment(input_key);
                    }
                    return Ok(dir_path);
                }
            } else {
                log::warn!("Materialized directory {dir_key} failed verification; rebuilding");
                self.remove_directory_entry(&dir_key);
            }
        }

        // Materialize fresh. Files are put first (taking one reference each), then linked.
        let files = collect_tree_files(digest, index)?;
        let mut input_keys = Vec::with_capacity(files.len());
        let mut linked = Vec::with_capacity(files.len());
        let result: Result<(), Status> = async {
            for (relative_path, file) in &files {
                let cached = self
                    .put(file.digest, file.is_executable, Some(digest), source)
                    .await?;
                input_keys.push(entry_key(file.digest, file.is_executable));
                linked.push((relative_path.clone(), cached));
            }

            let staging = self.inner.root.join(format!(".tmp.{}", Uuid::new_v4()));
            build_link_tree(&staging, digest, index, &linked).await?;
            tokio::fs::rename(&staging, &dir_path).await.map_err(|e| {
                Status::internal(format!("Failed to move directory {dir_key} into place: {e}"))
            })?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            // Release the references taken before the failure.
            let mut state = self.inner.state.lock();
            let mut released = false;
            for input_key in &input_keys {
                if let Some(entry) = state.storage.get_mut(input_key) {
                    entry.containing_directories.remove(&digest);
                }
                released |= state.decrement(input_key);
            }
            drop(state);
            if released {
                self.inner.space_released.notify_waiters();
            }
            return Err(e);
        }

        self.inner.state.lock().directories.insert(
            dir_key,
            DirectoryEntry {
                digest,
                refs: 1,
                inputs: input_keys,
            },
        );
        Ok(dir_path)
    }

    fn remove_directory_entry(&self, dir_key: &str) {
        let mut state = self.inner.state.lock();
        if let Some(dir_entry) = state.directories.remove(dir_key) {
            let mut released = false;
            for input_key in dir_entry.inputs {
                if let Some(entry) = state.storage.get_mut(&input_key) {
                    entry.containing_directories.remove(&dir_entry.digest);
                }
                for _ in 0..dir_entry.refs {
                    released |= state.decrement(&input_key);
                }
            }
            drop(state);
            if released {
                self.inner.space_released.notify_waiters();
            }
        }
    }

    ///
    /// Releases references taken by `put` and `put_directory`. Entries reaching zero
    /// references join the LRU tail-first and wake any put waiting on space.
    ///
    pub fn decrement_references(&self, files: &[(Digest, bool)], directories: &[Digest]) {
        let mut released = false;
        {
            let mut state = self.inner.state.lock();
            for (digest, is_executable) in files {
                released |= state.decrement(&entry_key(*digest, *is_executable));
            }
            for dir_digest in directories {
                let dir_key = directory_key(*dir_digest);
                let input_keys = match state.directories.get_mut(&dir_key) {
                    Some(dir_entry) => {
                        if dir_entry.refs == 0 {
                            log::error!("Reference count underflow for directory {dir_key}");
                            continue;
                        }
                        dir_entry.refs -= 1;
                        dir_entry.inputs.clone()
                    }
                    None => {
                        log::error!("Decrement of unknown directory entry {dir_key}");
                        continue;
                    }
                };
                for input_key in input_keys {
                    released |= state.decrement(&input_key);
                }
            }
        }
        if released {
            self.inner.space_released.notify_waiters();
        }
    }

    ///
    /// Opens the backing file of a blob at the given offset. A vanished backing file removes
    /// the stale entry and reports NOT_FOUND so callers can fall through to a remote fetch.
    ///
    pub async fn new_input(&self, digest: Digest, offset: usize) -> Result<tokio::fs::File, Status> {
        let key = {
            let state = self.inner.state.lock();
            [entry_key(digest, false), entry_key(digest, true)]
                .into_iter()
                .find(|key| state.storage.contains_key(key))
        };
        let Some(key) = key else {
            return Err(Status::not_found(format!("Blob {digest} not in cache")));
        };
        if offset > digest.size_bytes {
            return Err(Status::out_of_range(format!(
                "Read offset {offset} exceeds size of {digest}"
            )));
        }

        let path = self.entry_path(&key);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.remove_stale_entry(&key);
                return Err(Status::not_found(format!(
                    "Blob {digest} lost its backing file"
                )));
            }
            Err(e) => {
                return Err(Status::internal(format!("Failed to open {path:?}: {e}")));
            }
        };
        {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.storage.get_mut(&key) {
                entry.exists_checked_at = Instant::now();
            }
        }
        file.seek(std::io::SeekFrom::Start(offset as u64))
            .await
            .map_err(|e| Status::internal(format!("Failed to seek {path:?}: {e}")))?;
        Ok(file)
    }

    ///
    /// Reads a blob range into memory; the worker's serving path for peer reads.
    ///
    pub async fn read_blob(
        &self,
        digest: Digest,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Bytes, Status> {
        let mut file = self.new_input(digest, offset).await?;
        let to_read = match limit {
            Some(limit) => limit.min(digest.size_bytes - offset),
            None => digest.size_bytes - offset,
        };
        let mut buffer = vec![0; to_read];
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| Status::internal(format!("Failed to read {digest}: {e}")))?;
        Ok(Bytes::from(buffer))
    }

    #[cfg(test)]
    fn reference_count(&self, digest: Digest, is_executable: bool) -> Option<usize> {
        self.inner
            .state
            .lock()
            .storage
            .get(&entry_key(digest, is_executable))
            .map(|entry| entry.refs)
    }

    #[cfg(test)]
    fn lru_keys(&self) -> Vec<String> {
        self.inner.state.lock().lru.values().cloned().collect()
    }
}

///
/// Flattens the tree rooted at `digest` into (relative path, file) pairs, failing with a
/// MISSING violation if any directory of the tree is absent from the index.
///
fn collect_tree_files(
    digest: Digest,
    index: &HashMap<Digest, Directory>,
) -> Result<Vec<(PathBuf, remexec::FileNode)>, Status> {
    fn recurse(
        digest: Digest,
        prefix: &Path,
        index: &HashMap<Digest, Directory>,
        out: &mut Vec<(PathBuf, remexec::FileNode)>,
    ) -> Result<(), Status> {
        let directory = index
            .get(&digest)
            .ok_or_else(|| Status::missing_blobs([digest]))?;
        for file in &directory.files {
            out.push((prefix.join(&file.name), file.clone()));
        }
        for subdir in &directory.directories {
            recurse(subdir.digest, &prefix.join(&subdir.name), index, out)?;
        }
        Ok(())
    }

    let mut files = Vec::new();
    recurse(digest, Path::new(""), index, &mut files)?;
    Ok(files)
}

///
/// Creates the directory skeleton under `staging` and hard-links every file into it.
///
async fn build_link_tree(
    staging: &Path,
    digest: Digest,
    index: &HashMap<Digest, Directory>,
    linked: &[(PathBuf, PathBuf)],
) -> Result<(), Status> {
    fn create_dirs(
        digest: Digest,
        target: &Path,
        index: &HashMap<Digest, Directory>,
    ) -> Result<(), Status> {
        std::fs::create_dir_all(target)
            .map_err(|e| Status::internal(format!("Failed to create {target:?}: {e}")))?;
        let directory = index
            .get(&digest)
            .ok_or_else(|| Status::missing_blobs([digest]))?;
        for subdir in &directory.directories {
            create_dirs(subdir.digest, &target.join(&subdir.name), index)?;
        }
        Ok(())
    }

    create_dirs(digest, staging, index)?;
    for (relative_path, cached) in linked {
        let link_path = staging.join(relative_path);
        tokio::fs::hard_link(cached, &link_path).await.map_err(|e| {
            Status::internal(format!("Failed to hard link {cached:?} -> {link_path:?}: {e}"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
