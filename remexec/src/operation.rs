// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;

use serde_derive::{Deserialize, Serialize};

use hashing::Digest;

use crate::status::Status;
use crate::{Action, ActionResult, Command, Directory, Platform};

///
/// The coarse state of an Operation. Stages only ever advance: the derived `Ord` gives the
/// total order UNKNOWN < CACHE_CHECK < QUEUED < EXECUTING < COMPLETED that watchers observe.
///
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub enum Stage {
    #[default]
    Unknown,
    CacheCheck,
    Queued,
    Executing,
    Completed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Unknown => "UNKNOWN",
            Stage::CacheCheck => "CACHE_CHECK",
            Stage::Queued => "QUEUED",
            Stage::Executing => "EXECUTING",
            Stage::Completed => "COMPLETED",
        };
        write!(f, "{name}")
    }
}

///
/// Client-supplied identifiers carried through the lifetime of an execute request. The farm
/// treats this as an opaque retry key: an identical resubmission within the retry-cache TTL is
/// forced to skip the action cache.
///
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub tool_name: String,
    pub tool_version: String,
    pub action_id: String,
    pub correlated_invocations_id: String,
}

///
/// The envelope a client's execute request travels in until it is promoted to the ready queue.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecuteEntry {
    pub operation_name: String,
    pub action_digest: Digest,
    pub skip_cache_lookup: bool,
    pub request_metadata: RequestMetadata,
    pub stdout_stream_name: String,
    pub stderr_stream_name: String,
    pub queued_at_ms: u64,
}

///
/// A fully resolved execution bundle: the Action, its Command, and every Directory of the input
/// tree. Content-addressed as a single blob so a worker can fetch it atomically.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub action: Action,
    pub command: Command,
    pub directories: Vec<(Digest, Directory)>,
}

///
/// What workers dequeue: the original ExecuteEntry plus the address of its QueuedOperation.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub execute_entry: ExecuteEntry,
    pub queued_operation_digest: Digest,
    pub platform: Platform,
}

///
/// A QueueEntry claimed by a worker, with the deadline after which the DispatchedMonitor may
/// hand it back to the queue.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DispatchedOperation {
    pub name: String,
    pub requeue_at_ms: u64,
    pub queue_entry: QueueEntry,
}

///
/// The payload of a completed Operation.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub result: ActionResult,
    pub cached_result: bool,
    pub status: Status,
}

///
/// The external-facing handle for a submitted Action. Watchers observe a stream of these; the
/// stripped form (no response payload) is what the operation channel carries.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub stage: Stage,
    pub done: bool,
    pub cached_result: bool,
    pub response: Option<ExecuteResponse>,
    pub error: Option<Status>,
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Operation {
        Operation {
            name: name.into(),
            stage: Stage::Unknown,
            done: false,
            cached_result: false,
            response: None,
            error: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Operation {
        self.stage = stage;
        self
    }

    ///
    /// The metadata-only form published on the operation channel. The response payload can be
    /// large (inline stdout, output listings); subscribers that need it read the operations
    /// hash instead.
    ///
    pub fn stripped(&self) -> Operation {
        Operation {
            name: self.name.clone(),
            stage: self.stage,
            done: self.done,
            cached_result: self.cached_result,
            response: None,
            error: self.error.clone(),
        }
    }

    ///
    /// A terminal Operation carrying a successful (or cache-served) response.
    ///
    pub fn completed(name: impl Into<String>, response: ExecuteResponse) -> Operation {
        Operation {
            name: name.into(),
            stage: Stage::Completed,
            done: true,
            cached_result: response.cached_result,
            response: Some(response),
            error: None,
        }
    }

    ///
    /// A terminal Operation carrying an error Status.
    ///
    pub fn completed_with_error(name: impl Into<String>, error: Status) -> Operation {
        Operation {
            name: name.into(),
            stage: Stage::Completed,
            done: true,
            cached_result: false,
            response: None,
            error: Some(error),
        }
    }
}
