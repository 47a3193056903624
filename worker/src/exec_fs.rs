// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use cas_cache::{BlobSource, CasFileCache};
use hashing::Digest;
use remexec::{Directory, Status};

///
/// Stages per-operation exec directories from the CAS cache.
///
/// Files are hard links into the cache. Subdirectories that will hold outputs (or all of them,
/// when `link_input_directories` is off) are created real and recursed into; any other input
/// directory is staged as a single symlink to the cache's `_dir` materialization, which is what
/// lets repeated actions over an unchanged dependency graph skip the per-action directory walk.
///
/// Every acquired reference is tracked per exec dir so `destroy_exec_dir` can release them in
/// one call before removing the tree; a failure mid-staging releases whatever was acquired and
/// destroys the partial tree before surfacing.
///
pub struct ExecFileSystem {
    root: PathBuf,
    cache: CasFileCache,
    link_input_directories: bool,
    active: Mutex<HashMap<String, ExecDirResources>>,
}

#[derive(Default)]
struct ExecDirResources {
    files: Vec<(Digest, bool)>,
    directories: Vec<Digest>,
}

impl ExecFileSystem {
    pub async fn new(
        root: PathBuf,
        cache: CasFileCache,
        link_input_directories: bool,
    ) -> Result<Arc<ExecFileSystem>, String> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| format!("Failed to create exec root {root:?}: {e}"))?;
        Ok(Arc::new(ExecFileSystem {
            root,
            cache,
            link_input_directories,
            active: Mutex::default(),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn exec_dir_path(&self, operation_name: &str) -> PathBuf {
        self.root.join(operation_name.replace('/', "_"))
    }

    ///
    /// Creates the exec dir for an operation, staging the input root and pre-creating any
    /// directories the command will write outputs into.
    ///
    pub async fn create_exec_dir(
        &self,
        operation_name: &str,
        input_root: Digest,
        index: &HashMap<Digest, Directory>,
        output_files: &[String],
        output_directories: &[String],
        source: &dyn BlobSource,
    ) -> Result<PathBuf, Status> {
        let exec_dir = self.exec_dir_path(operation_name);
        // Destroy any stale tree left by a previous attempt at this operation.
        if tokio::fs::metadata(&exec_dir).await.is_ok() {
            log::warn!("Removing stale exec dir {exec_dir:?}");
            tokio::fs::remove_dir_all(&exec_dir)
                .await
                .map_err(|e| Status::internal(format!("Failed to remove {exec_dir:?}: {e}")))?;
        }
        tokio::fs::create_dir_all(&exec_dir)
            .await
            .map_err(|e| Status::internal(format!("Failed to create {exec_dir:?}: {e}")))?;

        let output_ancestors = output_ancestor_dirs(output_files, output_directories);
        let mut resources = ExecDirResources::default();
        let result = self
            .stage_directory(
                &exec_dir,
                Path::new(""),
                input_root,
                index,
                &output_ancestors,
                source,
                &mut resources,
            )
            .await;

        let result = match result {
            Ok(()) => self.create_output_parents(&exec_dir, &output_ancestors).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.active
                    .lock()
                    .insert(operation_name.to_owned(), resources);
                Ok(exec_dir)
            }
            Err(e) => {
                // Release the partial acquisition and tree before surfacing.
                self.cache
                    .decrement_references(&resources.files, &resources.directories);
                let _ = tokio::fs::remove_dir_all(&exec_dir).await;
                Err(e)
            }
        }
    }

    fn stage_directory<'a>(
        &'a self,
        exec_dir: &'a Path,
        relative: &'a Path,
        digest: Digest,
        index: &'a HashMap<Digest, Directory>,
        output_ancestors: &'a HashSet<PathBuf>,
        source: &'a dyn BlobSource,
        resources: &'a mut ExecDirResources,
    ) -> futures::future::BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            let directory = index
                .get(&digest)
                .ok_or_else(|| Status::missing_blobs([digest]))?;

            for file in &directory.files {
                let cached = self
                    .cache
                    .put(file.digest, file.is_executable, None, source)
                    .await?;
                resources.files.push((file.digest, file.is_executable));
                let link_path = exec_dir.join(relative).join(&file.name);
                tokio::fs::hard_link(&cached, &link_path).await.map_err(|e| {
                    Status::internal(format!(
                        "Failed to hard link {cached:?} -> {link_path:?}: {e}"
                    ))
                })?;
            }

            for subdir in &directory.directories {
                let sub_relative = relative.join(&subdir.name);
                let sub_path = exec_dir.join(&sub_relative);
                let must_be_real =
                    !self.link_input_directories || output_ancestors.contains(&sub_relative);
                if must_be_real {
                    tokio::fs::create_dir_all(&sub_path).await.map_err(|e| {
                        Status::internal(format!("Failed to create {sub_path:?}: {e}"))
                    })?;
                    self.stage_directory(
                        exec_dir,
                        &sub_relative,
                        subdir.digest,
                        index,
                        output_ancestors,
                        source,
                        resources,
                    )
                    .await?;
                } else {
                    let materialized =
                        self.cache.put_directory(subdir.digest, index, source).await?;
                    resources.directories.push(subdir.digest);
                    tokio::fs::symlink(&materialized, &sub_path).await.map_err(|e| {
                        Status::internal(format!(
                            "Failed to symlink {materialized:?} -> {sub_path:?}: {e}"
                        ))
                    })?;
                }
            }
            Ok(())
        })
    }

    async fn create_output_parents(
        &self,
        exec_dir: &Path,
        output_ancestors: &HashSet<PathBuf>,
    ) -> Result<(), Status> {
        for ancestor in output_ancestors {
            let path = exec_dir.join(ancestor);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| Status::internal(format!("Failed to create {path:?}: {e}")))?;
        }
        Ok(())
    }

    ///
    /// Tears down an exec dir, releasing every cache reference it acquired in one call.
    ///
    pub async fn destroy_exec_dir(&self, operation_name: &str) -> Result<(), Status> {
        if let Some(resources) = self.active.lock().remove(operation_name) {
            self.cache
                .decrement_references(&resources.files, &resources.directories);
        }
        let exec_dir = self.exec_dir_path(operation_name);
        match tokio::fs::remove_dir_all(&exec_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Status::internal(format!(
                "Failed to remove exec dir {exec_dir:?}: {e}"
            ))),
        }
    }
}

///
/// The set of relative directory paths that must exist as real directories because outputs will
/// be written somewhere beneath them.
///
fn output_ancestor_dirs(output_files: &[String], output_directories: &[String]) -> HashSet<PathBuf> {
    let mut ancestors = HashSet::new();
    for output_file in output_files {
        for ancestor in Path::new(output_file).ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() {
                ancestors.insert(ancestor.to_owned());
            }
        }
    }
    for output_directory in output_directories {
        for ancestor in Path::new(output_directory).ancestors() {
            if !ancestor.as_os_str().is_empty() {
                ancestors.insert(ancestor.to_owned());
            }
        }
    }
    ancestors
}

#[cfg(test)]
mod exec_fs_tests {
    use super::*;

    use maplit::hashset;
    use tempfile::TempDir;

    use cas_cache::{CacheOptions, LocalBlobSource};
    use task_executor::Executor;
    use testutil::{TestData, TestDirectory};

    async fn new_fixture(dir: &TempDir, link_input_directories: bool) -> Arc<ExecFileSystem> {
        let cache = CasFileCache::new(
            dir.path().join("cache"),
            CacheOptions::default(),
            Executor::new(),
            vec![],
            vec![],
        )
        .await
        .unwrap();
        ExecFileSystem::new(dir.path().join("exec"), cache, link_input_directories)
            .await
            .unwrap()
    }

    fn cache_of(exec_fs: &ExecFileSystem) -> &CasFileCache {
        &exec_fs.cache
    }

    #[tokio::test]
    async fn stages_files_as_hard_links() {
        let dir = TempDir::new().unwrap();
        let exec_fs = new_fixture(&dir, true).await;
        let tree = TestDirectory::containing_roland_and_catnip();
        let source = LocalBlobSource::new(tree.file_blobs());

        let exec_dir = exec_fs
            .create_exec_dir("op-1", tree.digest(), &tree.index(), &[], &[], &source)
            .await
            .unwrap();
        assert_eq!(
            tokio::fs::read(exec_dir.join("roland")).await.unwrap(),
            TestData::roland().bytes()
        );
        assert_eq!(
            tokio::fs::read(exec_dir.join("catnip")).await.unwrap(),
            TestData::catnip().bytes()
        );
        // Hard links, not copies.
        let metadata = tokio::fs::metadata(exec_dir.join("roland")).await.unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(metadata.nlink(), 2);
    }

    #[tokio::test]
    async fn input_only_directories_are_symlinked() {
        let dir = TempDir::new().unwrap();
        let exec_fs = new_fixture(&dir, true).await;
        let tree = TestDirectory::nested();
        let source = LocalBlobSource::new(tree.file_blobs());

        let exec_dir = exec_fs
            .create_exec_dir("op-1", tree.digest(), &tree.index(), &[], &[], &source)
            .await
            .unwrap();
        let cats = exec_dir.join("cats");
        let metadata = tokio::fs::symlink_metadata(&cats).await.unwrap();
        assert!(metadata.file_type().is_symlink());
        // The content is reachable through the link.
        assert_eq!(
            tokio::fs::read(cats.join("roland")).await.unwrap(),
            TestData::roland().bytes()
        );
    }

    #[tokio::test]
    async fn output_holding_directories_are_real() {
        let dir = TempDir::new().unwrap();
        let exec_fs = new_fixture(&dir, true).await;
        let tree = TestDirectory::nested();
        let source = LocalBlobSource::new(tree.file_blobs());

        let exec_dir = exec_fs
            .create_exec_dir(
                "op-1",
                tree.digest(),
                &tree.index(),
                &["cats/out.txt".to_owned()],
                &[],
                &source,
            )
            .await
            .unwrap();
        let metadata = tokio::fs::symlink_metadata(exec_dir.join("cats")).await.unwrap();
        assert!(metadata.file_type().is_dir());
    }

    #[tokio::test]
    async fn link_input_directories_off_makes_everything_real() {
        let dir = TempDir::new().unwrap();
        let exec_fs = new_fixture(&dir, false).await;
        let tree = TestDirectory::nested();
        let source = LocalBlobSource::new(tree.file_blobs());

        let exec_dir = exec_fs
            .create_exec_dir("op-1", tree.digest(), &tree.index(), &[], &[], &source)
            .await
            .unwrap();
        let metadata = tokio::fs::symlink_metadata(exec_dir.join("cats")).await.unwrap();
        assert!(metadata.file_type().is_dir());
    }

    #[tokio::test]
    async fn output_parent_dirs_are_pre_created() {
        let dir = TempDir::new().unwrap();
        let exec_fs = new_fixture(&dir, true).await;
        let tree = TestDirectory::empty();
        let source = LocalBlobSource::new(tree.file_blobs());

        let exec_dir = exec_fs
            .create_exec_dir(
                "op-1",
                tree.digest(),
                &tree.index(),
                &["deeply/nested/out.txt".to_owned()],
                &["results".to_owned()],
                &source,
            )
            .await
            .unwrap();
        assert!(exec_dir.join("deeply/nested").is_dir());
        assert!(exec_dir.join("results").is_dir());
    }

    #[tokio::test]
    async fn destroy_releases_references_and_tree() {
        let dir = TempDir::new().unwrap();
        let exec_fs = new_fixture(&dir, true).await;
        let tree = TestDirectory::recursive();
        let source = LocalBlobSource::new(tree.file_blobs());

        let exec_dir = exec_fs
            .create_exec_dir("op-1", tree.digest(), &tree.index(), &[], &[], &source)
            .await
            .unwrap();
        let size_with_refs = cache_of(&exec_fs).size();
        exec_fs.destroy_exec_dir("op-1").await.unwrap();

        assert!(tokio::fs::metadata(&exec_dir).await.is_err());
        // The cache still holds the blobs, but every reference is released.
        assert_eq!(cache_of(&exec_fs).size(), size_with_refs);
        cache_of(&exec_fs)
            .read_blob(TestData::roland().digest(), 0, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_staging_cleans_up() {
        let dir = TempDir::new().unwrap();
        let exec_fs = new_fixture(&dir, true).await;
        let tree = TestDirectory::recursive();
        // A source that is missing the nested file's content.
        let source = LocalBlobSource::new(
            [(TestData::robin().digest(), TestData::robin().bytes())]
                .into_iter()
                .collect(),
        );

        exec_fs
            .create_exec_dir("op-1", tree.digest(), &tree.index(), &[], &[], &source)
            .await
            .unwrap_err();
        // The partial exec dir is gone.
        assert!(tokio::fs::metadata(exec_fs.exec_dir_path("op-1")).await.is_err());
        // And the reference taken on robin was released.
        exec_fs
            .destroy_exec_dir("op-1")
            .await
            .unwrap();
    }

    #[test]
    fn output_ancestors_cover_files_and_directories() {
        let ancestors = output_ancestor_dirs(
            &["a/b/out.txt".to_owned()],
            &["c/results".to_owned()],
        );
        assert_eq!(
            ancestors,
            hashset![
                PathBuf::from("a"),
                PathBuf::from("a/b"),
                PathBuf::from("c"),
                PathBuf::from("c/results"),
            ]
        );
    }
}
