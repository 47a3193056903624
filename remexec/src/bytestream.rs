// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use bytes::Bytes;

use hashing::Hasher;

use crate::resource::Resource;
use crate::status::Status;

///
/// An in-progress ByteStream upload.
///
/// The protocol: the first chunk carries the resource name; later chunks may repeat it (it must
/// match) or omit it; each chunk's offset must equal the bytes committed so far; a chunk with
/// `finish_write` closes the session, at which point the received content must match the digest
/// named by the resource.
///
#[derive(Debug)]
pub struct WriteSession {
    resource_name: String,
    expected: hashing::Digest,
    buffer: Vec<u8>,
    hasher: Option<Hasher>,
    finished: bool,
}

impl WriteSession {
    pub fn new(resource_name: &str) -> Result<WriteSession, Status> {
        let expected = match Resource::parse(resource_name)? {
            Resource::Upload { digest, .. } => digest,
            other => {
                return Err(Status::invalid_argument(format!(
                    "Resource {other} is not writable"
                )))
            }
        };
        Ok(WriteSession {
            resource_name: resource_name.to_owned(),
            expected: expected,
            buffer: Vec::with_capacity(expected.size_bytes),
            hasher: Some(Hasher::new()),
            finished: false,
        })
    }

    pub fn expected_digest(&self) -> hashing::Digest {
        self.expected
    }

    pub fn committed_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    ///
    /// Accept one write chunk, returning the new committed size.
    ///
    pub fn write(
        &mut self,
        resource_name: Option<&str>,
        write_offset: usize,
        data: &[u8],
        finish_write: bool,
    ) -> Result<usize, Status> {
        if self.finished {
            return Err(Status::invalid_argument(format!(
                "Write to {} after finish_write",
                self.resource_name
            )));
        }
        if let Some(name) = resource_name {
            if name != self.resource_name {
                return Err(Status::invalid_argument(format!(
                    "Resource name changed mid-stream: {} -> {}",
                    self.resource_name, name
                )));
            }
        }
        if write_offset != self.buffer.len() {
            return Err(Status::invalid_argument(format!(
                "Write offset {} does not match committed size {} for {}",
                write_offset,
                self.buffer.len(),
                self.resource_name
            )));
        }

        self.buffer.extend_from_slice(data);
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(data);
        }

        if finish_write {
            let digest = self
                .hasher
                .take()
                .expect("hasher present until finish")
                .finish();
            if digest != self.expected {
                return Err(Status::invalid_argument(format!(
                    "Uploaded content hashed to {digest}, but resource named {}",
                    self.expected
                )));
            }
            self.finished = true;
        }
        Ok(self.buffer.len())
    }

    ///
    /// Consume a finished session, yielding the verified content.
    ///
    pub fn into_bytes(self) -> Result<(hashing::Digest, Bytes), Status> {
        if !self.finished {
            return Err(Status::invalid_argument(format!(
                "Upload {} was not finished",
                self.resource_name
            )));
        }
        Ok((self.expected, Bytes::from(self.buffer)))
    }
}
