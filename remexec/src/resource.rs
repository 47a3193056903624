// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;

use hashing::Digest;
use uuid::Uuid;

use crate::status::Status;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

///
/// A parsed ByteStream resource name. Three shapes exist:
///   - `blobs/<hash>_<size>` for downloads,
///   - `uploads/<uuid>/blobs/<hash>_<size>` for uploads,
///   - `<operation_name>/streams/{stdout,stderr}` for live operation output.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resource {
    Blob { digest: Digest },
    Upload { upload_id: Uuid, digest: Digest },
    OperationStream { operation_name: String, kind: StreamKind },
}

impl Resource {
    pub fn parse(name: &str) -> Result<Resource, Status> {
        let segments = name.split('/').collect::<Vec<_>>();
        match segments.as_slice() {
            ["blobs", entry] => Ok(Resource::Blob {
                digest: parse_digest_segment(name, entry)?,
            }),
            ["uploads", uuid, "blobs", entry] => {
                let upload_id = Uuid::parse_str(uuid).map_err(|e| {
                    Status::invalid_argument(format!("Invalid upload id in {name:?}: {e}"))
                })?;
                Ok(Resource::Upload {
                    upload_id,
                    digest: parse_digest_segment(name, entry)?,
                })
            }
            [operation_name, "streams", stream] => {
                let kind = match *stream {
                    "stdout" => StreamKind::Stdout,
                    "stderr" => StreamKind::Stderr,
                    other => {
                        return Err(Status::invalid_argument(format!(
                            "Unknown stream {other:?} in resource {name:?}"
                        )))
                    }
                };
                Ok(Resource::OperationStream {
                    operation_name: (*operation_name).to_owned(),
                    kind,
                })
            }
            _ => Err(Status::invalid_argument(format!(
                "Unrecognized resource name: {name:?}"
            ))),
        }
    }

    pub fn blob(digest: Digest) -> Resource {
        Resource::Blob { digest }
    }

    pub fn upload(digest: Digest) -> Resource {
        Resource::Upload {
            upload_id: Uuid::new_v4(),
            digest,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Blob { digest } => write!(f, "blobs/{digest}"),
            Resource::Upload { upload_id, digest } => {
                write!(f, "uploads/{upload_id}/blobs/{digest}")
            }
            Resource::OperationStream {
                operation_name,
                kind,
            } => write!(f, "{operation_name}/streams/{kind}"),
        }
    }
}

fn parse_digest_segment(name: &str, entry: &str) -> Result<Digest, Status> {
    Digest::from_entry_name(entry)
        .map_err(|e| Status::invalid_argument(format!("Invalid digest in resource {name:?}: {e}")))
}
