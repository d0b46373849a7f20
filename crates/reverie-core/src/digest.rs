//! Content digests
//!
//! Every cache key and dedup key in the engine is a SHA-256 digest over a
//! length-prefixed encoding of its parts, so `["ab", "c"]` and `["a", "bc"]`
//! never collide. Digests depend only on their input: the same logical input
//! yields the same digest in any process.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Hex-encoded SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Digest an ordered sequence of parts
    pub fn of_parts<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut builder = DigestBuilder::new();
        for part in parts {
            builder.push(part);
        }
        builder.finish()
    }

    /// Digest a single string
    pub fn of_str(s: &str) -> Self {
        Self::of_parts([s])
    }

    /// Hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for logs
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental digest over length-prefixed parts
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Append one part
    pub fn push<P: AsRef<[u8]>>(&mut self, part: P) -> &mut Self {
        let bytes = part.as_ref();
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn finish(self) -> Digest {
        Digest(format!("{:x}", self.hasher.finalize()))
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
