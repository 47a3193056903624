// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;

use serde_derive::{Deserialize, Serialize};

use hashing::Digest;

///
/// The canonical RPC status codes. Every user-visible failure in the farm maps onto one of
/// these.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl Code {
    ///
    /// Whether a failure with this code may be resolved by trying again against the same
    /// backend.
    ///
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::Aborted
                | Code::Internal
                | Code::ResourceExhausted
                | Code::Unavailable
                | Code::Unknown
        )
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
        };
        write!(f, "{name}")
    }
}

///
/// One violated precondition, attached to a FAILED_PRECONDITION Status. A missing blob is
/// reported as `{type: "MISSING", subject: "blobs/<digest>"}`.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PreconditionViolation {
    pub violation_type: String,
    pub subject: String,
    pub description: String,
}

impl PreconditionViolation {
    pub fn missing_blob(digest: Digest) -> PreconditionViolation {
        PreconditionViolation {
            violation_type: "MISSING".to_owned(),
            subject: format!("blobs/{digest}"),
            description: format!("Blob {digest} is not present in the CAS"),
        }
    }

    pub fn invalid(subject: impl Into<String>, description: impl Into<String>) -> PreconditionViolation {
        PreconditionViolation {
            violation_type: "INVALID".to_owned(),
            subject: subject.into(),
            description: description.into(),
        }
    }
}

///
/// A canonical status: code, message, and any precondition violations. This is the error type
/// used across the farm's seams, and the payload written into a terminal Operation.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
    pub violations: Vec<PreconditionViolation>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            violations: vec![],
        }
    }

    pub fn ok() -> Status {
        Status::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Status {
        Status::new(Code::NotFound, message)
    }

    pub fn failed_precondition(
        message: impl Into<String>,
        violations: Vec<PreconditionViolation>,
    ) -> Status {
        Status {
            code: Code::FailedPrecondition,
            message: message.into(),
            violations,
        }
    }

    ///
    /// The standard shape for "these inputs are not in the CAS": one MISSING violation per
    /// digest.
    ///
    pub fn missing_blobs(digests: impl IntoIterator<Item = Digest>) -> Status {
        let violations = digests
            .into_iter()
            .map(PreconditionViolation::missing_blob)
            .collect::<Vec<_>>();
        Status {
            code: Code::FailedPrecondition,
            message: format!("{} input(s) missing from the CAS", violations.len()),
            violations,
        }
    }

    pub fn out_of_range(message: impl Into<String>) -> Status {
        Status::new(Code::OutOfRange, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for violation in &self.violations {
            write!(f, "; {} {}", violation.violation_type, violation.subject)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}
