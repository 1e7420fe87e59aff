//! Content hashing with cascading algorithm selection
//!
//! Candidates are tried in preference order; the first that succeeds wins. When
//! no candidate is available, or every candidate fails, a 32-bit rolling hash is
//! used so hashing never fails.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{algorithm} digest failed: {reason}")]
pub struct HashError {
    pub algorithm: String,
    pub reason: String,
}

/// Digest over file content
pub trait ContentDigest: Send + Sync {
    fn digest(&self, content: &str) -> Result<String, HashError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Blake3,
    Sha256,
    Sha1,
}

impl HashAlgorithm {
    /// Algorithms compiled into this build
    pub const ALL: [HashAlgorithm; 3] = [Self::Blake3, Self::Sha256, Self::Sha1];

    pub fn default_preference() -> Vec<HashAlgorithm> {
        Self::ALL.to_vec()
    }

    fn digest_fn(self) -> DigestFn {
        match self {
            Self::Blake3 => blake3_hex,
            Self::Sha256 => sha256_hex,
            Self::Sha1 => sha1_hex,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blake3 => write!(f, "blake3"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha1 => write!(f, "sha1"),
        }
    }
}

pub type DigestFn = fn(&[u8]) -> Result<String, HashError>;

fn blake3_hex(bytes: &[u8]) -> Result<String, HashError> {
    Ok(blake3::hash(bytes).to_hex().to_string())
}

fn sha256_hex(bytes: &[u8]) -> Result<String, HashError> {
    Ok(hex::encode(Sha256::digest(bytes)))
}

fn sha1_hex(bytes: &[u8]) -> Result<String, HashError> {
    Ok(hex::encode(Sha1::digest(bytes)))
}

#[derive(Clone)]
struct Candidate {
    name: String,
    digest: DigestFn,
}

/// Ordered digest candidates with a guaranteed terminal fallback
#[derive(Clone)]
pub struct HashEngine {
    candidates: Vec<Candidate>,
}

impl HashEngine {
    /// Engine over every compiled-in algorithm, in `preference` order
    pub fn new(preference: &[HashAlgorithm]) -> Self {
        Self::with_available(preference, &HashAlgorithm::ALL)
    }

    /// Engine over the intersection of `preference` and `available`,
    /// keeping preference order
    pub fn with_available(preference: &[HashAlgorithm], available: &[HashAlgorithm]) -> Self {
        let mut seen = Vec::new();
        let candidates = preference
            .iter()
            .filter(|algo| available.contains(*algo))
            .filter(|algo| {
                if seen.contains(*algo) {
                    false
                } else {
                    seen.push(**algo);
                    true
                }
            })
            .map(|algo| Candidate {
                name: algo.to_string(),
                digest: algo.digest_fn(),
            })
            .collect();
        Self { candidates }
    }

    /// Engine that only ever uses the rolling hash
    pub fn fallback_only() -> Self {
        Self { candidates: Vec::new() }
    }

    /// Append a custom candidate after the configured ones
    pub fn with_candidate(mut self, name: impl Into<String>, digest: DigestFn) -> Self {
        self.candidates.push(Candidate {
            name: name.into(),
            digest,
        });
        self
    }

    /// Name of the first configured candidate, `None` when only the fallback is left
    pub fn preferred(&self) -> Option<&str> {
        self.candidates.first().map(|c| c.name.as_str())
    }

    /// Hash content. Never fails.
    pub fn hash(&self, content: &str) -> String {
        for candidate in &self.candidates {
            match (candidate.digest)(content.as_bytes()) {
                Ok(hex) => return hex,
                Err(e) => debug!(algorithm = %candidate.name, error = %e, "Digest candidate failed, trying next"),
            }
        }
        rolling_hash(content)
    }
}

impl Default for HashEngine {
    fn default() -> Self {
        Self::new(&HashAlgorithm::default_preference())
    }
}

impl fmt::Debug for HashEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.candidates.iter().map(|c| c.name.as_str()).collect();
        f.debug_struct("HashEngine").field("candidates", &names).finish()
    }
}

impl ContentDigest for HashEngine {
    fn digest(&self, content: &str) -> Result<String, HashError> {
        Ok(self.hash(content))
    }
}

/// `hash = hash * 31 + code_unit` over UTF-16 code units, 32-bit, 8 hex chars
pub fn rolling_hash(content: &str) -> String {
    let hash = content
        .encode_utf16()
        .fold(0u32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as u32));
    format!("{:08x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_preferred_algorithm_is_used() {
        let engine = HashEngine::new(&[HashAlgorithm::Sha256, HashAlgorithm::Blake3]);
        assert_eq!(engine.preferred(), Some("sha256"));
        assert_eq!(
            engine.hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_unavailable_algorithms_are_skipped() {
        let engine = HashEngine::with_available(
            &[HashAlgorithm::Blake3, HashAlgorithm::Sha256, HashAlgorithm::Sha1],
            &[HashAlgorithm::Sha1],
        );
        assert_eq!(engine.preferred(), Some("sha1"));
        assert_eq!(engine.hash("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_fallback_when_nothing_available() {
        let engine = HashEngine::with_available(&[HashAlgorithm::Blake3], &[]);
        assert_eq!(engine.preferred(), None);
        assert_eq!(engine.hash(""), "00000000");
        // 'a' = 97
        assert_eq!(engine.hash("a"), "00000061");
        // 97 * 31 + 98
        assert_eq!(engine.hash("ab"), format!("{:08x}", 97 * 31 + 98));
    }

    #[test]
    fn test_failing_candidates_fall_through() {
        let engine = HashEngine::fallback_only()
            .with_candidate("broken", |_| {
                Err(HashError {
                    algorithm: "broken".into(),
                    reason: "unavailable".into(),
                })
            });
        assert_eq!(engine.hash("a"), rolling_hash("a"));

        let engine = engine.with_candidate("blake3", HashAlgorithm::Blake3.digest_fn());
        assert_eq!(engine.hash("a"), blake3::hash(b"a").to_hex().to_string());
    }

    #[test]
    fn test_rolling_hash_wraps() {
        let long = "z".repeat(10_000);
        assert_eq!(rolling_hash(&long).len(), 8);
    }

    proptest! {
        #[test]
        fn prop_hash_is_deterministic(s in ".*") {
            let engine = HashEngine::default();
            prop_assert_eq!(engine.hash(&s), engine.hash(&s));
            prop_assert_eq!(rolling_hash(&s), rolling_hash(&s));
        }

        #[test]
        fn prop_crypto_hash_changes_with_content(s in ".*") {
            let engine = HashEngine::default();
            let extended = format!("{}x", s);
            prop_assert_ne!(engine.hash(&s), engine.hash(&extended));
        }
    }
}
