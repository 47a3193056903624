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

//! The farm-side data model of the Remote Execution API: content-addressed descriptions of work
//! (Actions, Commands, input Directories), their outcomes (ActionResults), and the scheduling
//! envelopes the farm moves between its queues.
//!
//! Messages are canonically encoded with bincode; a message's Digest is the SHA-256 of its
//! canonical encoding. The RPC transport that would carry these messages between machines is out
//! of scope here: only the semantics matter.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use hashing::Digest;

mod bytestream;
mod operation;
mod resource;
mod status;

pub use crate::bytestream::WriteSession;
pub use crate::operation::{
    DispatchedOperation, ExecuteEntry, ExecuteResponse, Operation, QueueEntry, QueuedOperation,
    RequestMetadata, Stage,
};
pub use crate::resource::{Resource, StreamKind};
pub use crate::status::{Code, PreconditionViolation, Status};

///
/// Encode a message with the canonical encoding.
///
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, Status> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(|e| Status::internal(format!("Failed to encode message: {e}")))
}

///
/// Decode a message from its canonical encoding. A decode failure is INTERNAL: the bytes were
/// addressed by digest, so they cannot be a caller mistake.
///
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Status> {
    bincode::deserialize(bytes)
        .map_err(|e| Status::internal(format!("Failed to decode message: {e}")))
}

///
/// Encode a message and compute its content address in one pass.
///
pub fn encode_with_digest<T: Serialize>(message: &T) -> Result<(Digest, Bytes), Status> {
    let bytes = encode(message)?;
    Ok((Digest::of_bytes(&bytes), bytes))
}

///
/// A single file within a Directory.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

///
/// A subdirectory within a Directory, referenced by the digest of its own Directory message.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

///
/// One level of an input tree. An input root is the Digest of a Directory; the transitive
/// closure of its DirectoryNodes forms the full tree.
///
/// Children are kept sorted by name so that equal trees encode to equal bytes, and therefore to
/// equal digests.
///
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    pub files: Vec<FileNode>,
    pub directories: Vec<DirectoryNode>,
}

impl Directory {
    ///
    /// Sorts children by name, making the encoding canonical.
    ///
    pub fn canonicalize(&mut self) {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.directories.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn digest(&self) -> Result<Digest, Status> {
        Ok(encode_with_digest(self)?.0)
    }
}

///
/// A Directory bundled with the transitive closure of its children, used to report output
/// directories in a single blob.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub root: Directory,
    pub children: Vec<Directory>,
}

///
/// Worker-matching requirements of an Action.
///
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub properties: BTreeMap<String, String>,
}

///
/// The runnable half of an Action.
///
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub arguments: Vec<String>,
    pub environment_variables: BTreeMap<String, String>,
    pub output_files: Vec<String>,
    pub output_directories: Vec<String>,
    pub working_directory: String,
    pub platform: Platform,
}

///
/// A unit of work: a Command to run against an input tree, under constraints. The Digest of the
/// encoded Action is the ActionKey used by the action cache.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub command_digest: Digest,
    pub input_root_digest: Digest,
    pub timeout: Option<Duration>,
    pub do_not_cache: bool,
    pub platform: Platform,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub digest: Digest,
    pub is_executable: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutputDirectory {
    pub path: String,
    pub tree_digest: Digest,
}

///
/// Timings recorded by the worker that ran an Action. All timestamps are milliseconds since the
/// unix epoch.
///
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutedActionMetadata {
    pub worker: String,
    pub queued_timestamp_ms: u64,
    pub worker_start_timestamp_ms: u64,
    pub worker_completed_timestamp_ms: u64,
    pub input_fetch_start_timestamp_ms: u64,
    pub input_fetch_completed_timestamp_ms: u64,
    pub execution_start_timestamp_ms: u64,
    pub execution_completed_timestamp_ms: u64,
}

///
/// The outcome of running an Action. Small stdout/stderr are carried inline; large ones are
/// uploaded to the CAS and referenced by digest.
///
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub output_files: Vec<OutputFile>,
    pub output_directories: Vec<OutputDirectory>,
    pub exit_code: i32,
    pub stdout_raw: Vec<u8>,
    pub stdout_digest: Option<Digest>,
    pub stderr_raw: Vec<u8>,
    pub stderr_digest: Option<Digest>,
    pub execution_metadata: ExecutedActionMetadata,
}

#[cfg(test)]
mod tests;
