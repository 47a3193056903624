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

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use sha2::{Digest as Sha256Digest, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

///
/// The SHA-256 of some content. Together with the content's length it forms a `Digest`, the
/// universal address of every blob in the farm.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Result<Fingerprint, String> {
        if bytes.len() != FINGERPRINT_SIZE {
            return Err(format!(
                "Expected {} bytes for a fingerprint, got {}",
                FINGERPRINT_SIZE,
                bytes.len()
            ));
        }
        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.copy_from_slice(bytes);
        Ok(Fingerprint(fingerprint))
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| format!("{e:?}"))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_string = String::deserialize(deserializer)?;
        Fingerprint::from_hex_string(&hex_string).map_err(serde::de::Error::custom)
    }
}

///
/// A Fingerprint, plus the size in bytes of the content it was computed from.
///
/// It is equivalent to a Remote Execution API Digest, and is rendered on the wire and on disk as
/// `<hex hash>_<size>`.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::default();
        hasher.update(bytes);
        Digest::new(Fingerprint(hasher.finalize().into()), bytes.len())
    }

    ///
    /// Renders the `<hash>_<size>` form used in resource names and the CAS cache's on-disk
    /// layout.
    ///
    pub fn to_entry_name(&self) -> String {
        format!("{}_{}", self.hash.to_hex(), self.size_bytes)
    }

    ///
    /// Parses the `<hash>_<size>` form. The inverse of `to_entry_name`.
    ///
    pub fn from_entry_name(entry_name: &str) -> Result<Digest, String> {
        let (hash, size) = entry_name
            .split_once('_')
            .ok_or_else(|| format!("Invalid digest entry (expected <hash>_<size>): {entry_name}"))?;
        let hash = Fingerprint::from_hex_string(hash)
            .map_err(|e| format!("Invalid fingerprint in {entry_name}: {e}"))?;
        let size_bytes = size
            .parse::<usize>()
            .map_err(|e| format!("Invalid size in {entry_name}: {e}"))?;
        Ok(Digest { hash, size_bytes })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_entry_name())
    }
}

///
/// An incremental content hasher: feed it bytes, then `finish` it into the Digest of everything
/// fed so far.
///
#[derive(Debug)]
pub struct Hasher {
    hasher: Sha256,
    byte_count: usize,
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher {
            hasher: Sha256::default(),
            byte_count: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.byte_count += bytes.len();
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn finish(self) -> Digest {
        Digest::new(Fingerprint(self.hasher.finalize().into()), self.byte_count)
    }
}

///
/// A Write adapter that fingerprints all data that passes through it.
///
pub struct WriterHasher<T> {
    hasher: Hasher,
    inner: T,
}

impl<T> WriterHasher<T> {
    pub fn new(inner: T) -> WriterHasher<T> {
        WriterHasher {
            hasher: Hasher::new(),
            inner,
        }
    }

    ///
    /// Returns the result of fingerprinting this stream, and Drops the stream.
    ///
    pub fn finish(self) -> (Digest, T) {
        (self.hasher.finish(), self.inner)
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        // Hash only the bytes that were successfully written.
        self.hasher.update(&buf[0..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
