// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;

use hashing::Digest;
use remexec::{
    Command, Directory, DirectoryNode, FileNode, OutputDirectory, OutputFile, Status, Tree,
};

///
/// What came out of the child process.
///
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

///
/// Runs the command in the exec dir under the action timeout. The environment is exactly the
/// command's; no PATH lookup or shell expansion happens beyond what the command itself invokes.
///
pub async fn execute_command(
    exec_dir: &Path,
    command: &Command,
    timeout: Duration,
) -> Result<ExecutionOutcome, Status> {
    let argv = &command.arguments;
    if argv.is_empty() {
        return Err(Status::invalid_argument("Command has no arguments"));
    }

    let working_directory = if command.working_directory.is_empty() {
        exec_dir.to_owned()
    } else {
        exec_dir.join(&command.working_directory)
    };

    let mut child_command = tokio::process::Command::new(&argv[0]);
    child_command
        .args(&argv[1..])
        .env_clear()
        .envs(&command.environment_variables)
        .current_dir(&working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Losing interest in the child (timeout, cancellation) must not leak it.
        .kill_on_drop(true);

    let child = child_command
        .spawn()
        .map_err(|e| Status::invalid_argument(format!("Failed to spawn {:?}: {e}", argv[0])))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| Status::internal(format!("Failed to wait for {:?}: {e}", argv[0])))?
        }
        Err(_) => {
            return Err(Status::deadline_exceeded(format!(
                "Execution of {:?} exceeded its timeout of {timeout:?}",
                argv[0]
            )))
        }
    };

    Ok(ExecutionOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: Bytes::from(output.stdout),
        stderr: Bytes::from(output.stderr),
    })
}

///
/// Outputs gathered from the exec dir after execution: the ActionResult entries plus every blob
/// (file contents and encoded Trees) that must reach the CAS for them to be resolvable.
///
#[derive(Default)]
pub struct CollectedOutputs {
    pub output_files: Vec<OutputFile>,
    pub output_directories: Vec<OutputDirectory>,
    pub blobs: Vec<(Digest, Bytes)>,
}

///
/// Reads the command's declared outputs back from the exec dir. Declared outputs that the
/// command did not produce are skipped, matching the permissive contract of the API.
///
pub fn collect_outputs(exec_dir: &Path, command: &Command) -> Result<CollectedOutputs, Status> {
    use std::os::unix::fs::PermissionsExt;

    let mut collected = CollectedOutputs::default();

    for output_path in &command.output_files {
        let path = exec_dir.join(output_path);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(Status::internal(format!("Failed to stat {path:?}: {e}")));
            }
        };
        let bytes = Bytes::from(
            std::fs::read(&path)
                .map_err(|e| Status::internal(format!("Failed to read {path:?}: {e}")))?,
        );
        let digest = Digest::of_bytes(&bytes);
        collected.output_files.push(OutputFile {
            path: output_path.clone(),
            digest,
            is_executable: metadata.permissions().mode() & 0o111 != 0,
        });
        collected.blobs.push((digest, bytes));
    }

    for output_path in &command.output_directories {
        let path = exec_dir.join(output_path);
        if !path.is_dir() {
            continue;
        }
        let (root, children) = read_directory_tree(&path, &mut collected.blobs)?;
        let tree = Tree {
            root,
            children,
        };
        let (tree_digest, tree_bytes) = remexec::encode_with_digest(&tree)?;
        collected.blobs.push((tree_digest, tree_bytes));
        collected.output_directories.push(OutputDirectory {
            path: output_path.clone(),
            tree_digest,
        });
    }

    Ok(collected)
}

///
/// Walks one produced output directory bottom-up into canonical Directory messages.
///
fn read_directory_tree(
    path: &Path,
    blobs: &mut Vec<(Digest, Bytes)>,
) -> Result<(Directory, Vec<Directory>), Status> {
    use std::os::unix::fs::PermissionsExt;

    let mut directory = Directory::default();
    let mut children = Vec::new();

    let entries = std::fs::read_dir(path)
        .map_err(|e| Status::internal(format!("Failed to read {path:?}: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| Status::internal(format!("Failed to read {path:?}: {e}")))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_path = entry.path();
        let metadata = entry
            .metadata()
            .map_err(|e| Status::internal(format!("Failed to stat {entry_path:?}: {e}")))?;
        if metadata.is_dir() {
            let (child, grandchildren) = read_directory_tree(&entry_path, blobs)?;
            let child_digest = child.digest()?;
            directory.directories.push(DirectoryNode {
                name,
                digest: child_digest,
            });
            children.push(child.clone());
            children.extend(grandchildren);
            // The child Directory is itself a blob referenced by digest.
            let (digest, bytes) = remexec::encode_with_digest(&child)?;
            blobs.push((digest, bytes));
        } else {
            let bytes = Bytes::from(
                std::fs::read(&entry_path)
                    .map_err(|e| Status::internal(format!("Failed to read {entry_path:?}: {e}")))?,
            );
            let digest = Digest::of_bytes(&bytes);
            directory.files.push(FileNode {
                name,
                digest,
                is_executable: metadata.permissions().mode() & 0o111 != 0,
            });
            blobs.push((digest, bytes));
        }
    }
    directory.canonicalize();
    Ok((directory, children))
}
