// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{BlobSource, CacheOptions, CasFileCache, LocalBlobSource, OnExpire, OnPut};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;

use hashing::Digest;
use remexec::Code;
use task_executor::Executor;
use testutil::{TestData, TestDirectory};

async fn new_cache(dir: &TempDir, max_size_bytes: usize) -> CasFileCache {
    new_cache_with_hooks(dir, max_size_bytes, vec![], vec![]).await
}

async fn new_cache_with_hooks(
    dir: &TempDir,
    max_size_bytes: usize,
    on_put: Vec<OnPut>,
    on_expire: Vec<OnExpire>,
) -> CasFileCache {
    CasFileCache::new(
        dir.path().join("cache"),
        CacheOptions {
            max_size_bytes,
            space_wait_timeout: Duration::from_millis(200),
        },
        Executor::new(),
        on_put,
        on_expire,
    )
    .await
    .unwrap()
}

fn source_of(datas: &[TestData]) -> LocalBlobSource {
    LocalBlobSource::new(
        datas
            .iter()
            .map(|data| (data.digest(), data.bytes()))
            .collect(),
    )
}

fn sized_data(byte: u8, len: usize) -> TestData {
    TestData::new(&String::from_utf8(vec![byte; len]).unwrap())
}

#[tokio::test]
async fn put_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let roland = TestData::roland();

    let path = cache
        .put(roland.digest(), false, None, &source_of(&[roland.clone()]))
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), roland.bytes());
    assert_eq!(cache.size(), roland.len());
    assert_eq!(cache.reference_count(roland.digest(), false), Some(1));
    assert!(cache.contains(roland.digest()));
    // Referenced entries are not in the LRU.
    assert!(cache.lru_keys().is_empty());
}

#[tokio::test]
async fn executable_blobs_get_exec_suffix_and_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let script = TestData::new("#!/bin/sh\nexit 0\n");

    let path = cache
        .put(script.digest(), true, None, &source_of(&[script.clone()]))
        .await
        .unwrap();
    assert!(path.to_string_lossy().ends_with("_exec"));
    let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
}

#[tokio::test]
async fn repeat_put_takes_another_reference() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let roland = TestData::roland();
    let source = source_of(&[roland.clone()]);

    cache.put(roland.digest(), false, None, &source).await.unwrap();
    cache.put(roland.digest(), false, None, &source).await.unwrap();
    assert_eq!(cache.reference_count(roland.digest(), false), Some(2));
    // Size is unchanged: the second put found the entry.
    assert_eq!(cache.size(), roland.len());
}

#[tokio::test]
async fn balanced_put_and_release_keeps_size() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let roland = TestData::roland();

    cache
        .put(roland.digest(), false, None, &source_of(&[roland.clone()]))
        .await
        .unwrap();
    let size_before = cache.size();
    cache.decrement_references(&[(roland.digest(), false)], &[]);
    assert_eq!(cache.size(), size_before);
    assert_eq!(cache.reference_count(roland.digest(), false), Some(0));
    // Released entries join the LRU.
    assert_eq!(cache.lru_keys().len(), 1);
}

#[tokio::test]
async fn eviction_takes_oldest_released_first() {
    let dir = TempDir::new().unwrap();
    // S5: max 10 bytes, A(4, refs=0), B(3, refs=0), C(3, refs=1); put(D, 4) evicts A then B.
    let cache = new_cache(&dir, 10).await;
    let a = sized_data(b'a', 4);
    let b = sized_data(b'b', 3);
    let c = sized_data(b'c', 3);
    let d = sized_data(b'd', 4);
    let source = source_of(&[a.clone(), b.clone(), c.clone(), d.clone()]);

    cache.put(a.digest(), false, None, &source).await.unwrap();
    cache.put(b.digest(), false, None, &source).await.unwrap();
    cache.put(c.digest(), false, None, &source).await.unwrap();
    // Release A before B, so A is the LRU head.
    cache.decrement_references(&[(a.digest(), false)], &[]);
    cache.decrement_references(&[(b.digest(), false)], &[]);

    cache.put(d.digest(), false, None, &source).await.unwrap();
    assert!(!cache.contains(a.digest()));
    assert!(!cache.contains(b.digest()));
    assert!(cache.contains(c.digest()));
    assert!(cache.contains(d.digest()));
    assert_eq!(cache.size(), 7);
}

#[tokio::test]
async fn referenced_entries_are_never_evicted() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 8).await;
    let held = sized_data(b'h', 5);
    let incoming = sized_data(b'i', 5);
    let source = source_of(&[held.clone(), incoming.clone()]);

    cache.put(held.digest(), false, None, &source).await.unwrap();
    let err = cache
        .put(incoming.digest(), false, None, &source)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);
    assert!(cache.contains(held.digest()));
    assert_eq!(cache.size(), 5);
}

#[tokio::test]
async fn put_waits_for_a_release() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 8).await;
    let held = sized_data(b'h', 5);
    let incoming = sized_data(b'i', 5);
    let source = source_of(&[held.clone(), incoming.clone()]);

    cache.put(held.digest(), false, None, &source).await.unwrap();

    let release_cache = cache.clone();
    let release_digest = held.digest();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_cache.decrement_references(&[(release_digest, false)], &[]);
    });

    cache
        .put(incoming.digest(), false, None, &source)
        .await
        .unwrap();
    assert!(cache.contains(incoming.digest()));
}

#[tokio::test]
async fn oversized_blob_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 4).await;
    let big = sized_data(b'x', 5);
    let err = cache
        .put(big.digest(), false, None, &source_of(&[big.clone()]))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);
}

struct LyingBlobSource;

#[async_trait]
impl BlobSource for LyingBlobSource {
    async fn load(&self, _digest: Digest) -> Result<Bytes, remexec::Status> {
        Ok(Bytes::from_static(b"not what you asked for"))
    }
}

#[tokio::test]
async fn mismatched_content_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let roland = TestData::roland();
    let err = cache
        .put(roland.digest(), false, None, &LyingBlobSource)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Internal);
    assert!(!cache.contains(roland.digest()));
}

#[tokio::test]
async fn on_put_hook_fires() {
    let dir = TempDir::new().unwrap();
    let observed: Arc<Mutex<Vec<Digest>>> = Arc::default();
    let sink = observed.clone();
    let hook: OnPut = Arc::new(move |digest| sink.lock().push(digest));
    let cache = new_cache_with_hooks(&dir, 1024, vec![hook], vec![]).await;
    let roland = TestData::roland();

    cache
        .put(roland.digest(), false, None, &source_of(&[roland.clone()]))
        .await
        .unwrap();
    // A repeat put of a present entry does not re-announce.
    cache
        .put(roland.digest(), false, None, &source_of(&[roland.clone()]))
        .await
        .unwrap();
    assert_eq!(*observed.lock(), vec![roland.digest()]);
}

#[tokio::test]
async fn put_directory_links_and_references_all_files() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let tree = TestDirectory::recursive();
    let source = LocalBlobSource::new(tree.file_blobs());

    let path = cache
        .put_directory(tree.digest(), &tree.index(), &source)
        .await
        .unwrap();
    assert!(path.to_string_lossy().ends_with("_dir"));
    assert_eq!(
        tokio::fs::read(path.join("robin")).await.unwrap(),
        TestData::robin().bytes()
    );
    assert_eq!(
        tokio::fs::read(path.join("cats").join("roland")).await.unwrap(),
        TestData::roland().bytes()
    );
    for (digest, is_executable) in tree.file_references() {
        assert_eq!(cache.reference_count(digest, is_executable), Some(1));
    }
}

#[tokio::test]
async fn put_directory_reuses_existing_materialization() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let tree = TestDirectory::containing_roland();
    let source = LocalBlobSource::new(tree.file_blobs());

    let first = cache
        .put_directory(tree.digest(), &tree.index(), &source)
        .await
        .unwrap();
    let second = cache
        .put_directory(tree.digest(), &tree.index(), &source)
        .await
        .unwrap();
    assert_eq!(first, second);
    // Two directory references, so two references per contained file.
    assert_eq!(cache.reference_count(TestData::roland().digest(), false), Some(2));
}

#[tokio::test]
async fn destroying_a_directory_releases_every_input() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let tree = TestDirectory::recursive();
    let source = LocalBlobSource::new(tree.file_blobs());

    cache
        .put_directory(tree.digest(), &tree.index(), &source)
        .await
        .unwrap();
    cache.decrement_references(&[], &[tree.digest()]);
    for (digest, is_executable) in tree.file_references() {
        assert_eq!(cache.reference_count(digest, is_executable), Some(0));
    }
}

#[tokio::test]
async fn evicting_a_file_expires_its_directory() {
    let dir = TempDir::new().unwrap();
    let expired: Arc<Mutex<Vec<Digest>>> = Arc::default();
    let sink = expired.clone();
    let hook: OnExpire = Arc::new(move |digests| sink.lock().extend_from_slice(digests));
    // Sized so that putting "filler" forces the eviction of the directory's file.
    let cache = new_cache_with_hooks(&dir, 40, vec![], vec![hook]).await;
    let tree = TestDirectory::containing_roland();
    let source = LocalBlobSource::new(tree.file_blobs());

    let dir_path = cache
        .put_directory(tree.digest(), &tree.index(), &source)
        .await
        .unwrap();
    cache.decrement_references(&[], &[tree.digest()]);

    let filler = sized_data(b'f', 30);
    cache
        .put(filler.digest(), false, None, &source_of(&[filler.clone()]))
        .await
        .unwrap();

    assert!(!cache.contains(TestData::roland().digest()));
    {
        let expired = expired.lock();
        assert!(expired.contains(&TestData::roland().digest()));
        assert!(expired.contains(&tree.digest()));
    }
    // The materialized tree is gone (possibly asynchronously).
    for _ in 0..100 {
        if tokio::fs::metadata(&dir_path).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("materialized directory survived expiry");
}

#[tokio::test]
async fn missing_tree_directory_is_a_precondition_failure() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let tree = TestDirectory::nested();
    let source = LocalBlobSource::new(tree.file_blobs());

    // Drop the child directory from the index.
    let mut index = tree.index();
    index.retain(|digest, _| *digest == tree.digest());
    let err = cache
        .put_directory(tree.digest(), &index, &source)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
}

#[tokio::test]
async fn new_input_reads_at_offset() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let data = TestData::fourty_chars();
    cache
        .put(data.digest(), false, None, &source_of(&[data.clone()]))
        .await
        .unwrap();

    let bytes = cache.read_blob(data.digest(), 10, Some(5)).await.unwrap();
    assert_eq!(&bytes[..], &data.bytes()[10..15]);
    let bytes = cache.read_blob(data.digest(), 35, None).await.unwrap();
    assert_eq!(&bytes[..], &data.bytes()[35..]);
}

#[tokio::test]
async fn reads_of_absent_blobs_are_not_found() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let err = cache
        .read_blob(TestData::roland().digest(), 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn read_past_end_is_out_of_range() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let roland = TestData::roland();
    cache
        .put(roland.digest(), false, None, &source_of(&[roland.clone()]))
        .await
        .unwrap();
    let err = cache
        .read_blob(roland.digest(), roland.len() + 1, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::OutOfRange);
}

#[tokio::test]
async fn vanished_backing_file_reports_not_found_once() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir, 1024).await;
    let roland = TestData::roland();
    let path = cache
        .put(roland.digest(), false, None, &source_of(&[roland.clone()]))
        .await
        .unwrap();
    cache.decrement_references(&[(roland.digest(), false)], &[]);

    tokio::fs::remove_file(&path).await.unwrap();
    let err = cache.read_blob(roland.digest(), 0, None).await.unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    // The stale entry was dropped, so a fall-through re-fetch can repopulate.
    assert!(!cache.contains(roland.digest()));
    cache
        .put(roland.digest(), false, None, &source_of(&[roland.clone()]))
        .await
        .unwrap();
    assert!(cache.contains(roland.digest()));
}

#[tokio::test]
async fn recovery_walk_restores_entries() {
    let dir = TempDir::new().unwrap();
    let roland = TestData::roland();
    let catnip = TestData::catnip();
    {
        let cache = new_cache(&dir, 1024).await;
        let source = source_of(&[roland.clone(), catnip.clone()]);
        cache.put(roland.digest(), false, None, &source).await.unwrap();
        cache.put(catnip.digest(), true, None, &source).await.unwrap();
    }

    let recovered = new_cache(&dir, 1024).await;
    assert!(recovered.contains(roland.digest()));
    assert!(recovered.contains(catnip.digest()));
    assert_eq!(recovered.size(), roland.len() + catnip.len());
    // Recovered entries hold no references and are immediately evictable.
    assert_eq!(recovered.lru_keys().len(), 2);
    assert_eq!(
        recovered.read_blob(roland.digest(), 0, None).await.unwrap(),
        roland.bytes()
    );
}

#[tokio::test]
async fn recovery_discards_temporaries_and_unrecognized_files() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cache");
    tokio::fs::create_dir_all(&root).await.unwrap();
    tokio::fs::write(root.join(".tmp.abc"), b"partial").await.unwrap();
    tokio::fs::write(root.join("junk"), b"junk").await.unwrap();

    let cache = CasFileCache::new(
        root.clone(),
        CacheOptions::default(),
        Executor::new(),
        vec![],
        vec![],
    )
    .await
    .unwrap();
    assert_eq!(cache.size(), 0);
    assert!(tokio::fs::metadata(root.join(".tmp.abc")).await.is_err());
    assert!(tokio::fs::metadata(root.join("junk")).await.is_err());
}
