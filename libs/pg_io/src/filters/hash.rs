//! Hash filter: a transparent pass-through that accumulates a digest.
//!
//! Used to compute the SHA-1 block checksums that back the block map
//! (spec §3 "Block map") and the content hash attached to WAL pushes
//! (spec §2 dataflow: "a filter chain (C3: SHA1 + ...)").

use pg_util::CoreError;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::buffer::Buffer;
use crate::filter::{Filter, FilterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

pub struct HashFilter {
    hasher: Hasher,
    digest: Option<Vec<u8>>,
}

impl HashFilter {
    pub fn new(algo: HashAlgorithm) -> Self {
        Self {
            hasher: match algo {
                HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
                HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            },
            digest: None,
        }
    }
}

impl Filter for HashFilter {
    fn feed(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<usize, CoreError> {
        match input {
            Some(bytes) => {
                match &mut self.hasher {
                    Hasher::Sha1(h) => h.update(bytes),
                    Hasher::Sha256(h) => h.update(bytes),
                }
                output.cat(bytes)?;
                Ok(bytes.len())
            }
            None => {
                if self.digest.is_none() {
                    let digest = match std::mem::replace(&mut self.hasher, Hasher::Sha1(Sha1::new())) {
                        Hasher::Sha1(h) => h.finalize().to_vec(),
                        Hasher::Sha256(h) => h.finalize().to_vec(),
                    };
                    self.digest = Some(digest);
                }
                Ok(0)
            }
        }
    }

    fn done(&self) -> bool {
        self.digest.is_some()
    }

    fn result(&self) -> Option<FilterResult> {
        self.digest.clone().map(FilterResult::Digest)
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}

/// One-shot SHA-1 over a full byte slice, used by the block map/delta
/// codec where the whole block is already in memory and a filter
/// pipeline would be overkill.
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_one_shot_across_chunked_feeds() {
        let mut filter = HashFilter::new(HashAlgorithm::Sha1);
        let mut out = Buffer::new(64);
        filter.feed(Some(b"hello "), &mut out).unwrap();
        filter.feed(Some(b"world"), &mut out).unwrap();
        filter.feed(None, &mut out).unwrap();

        let expected = sha1_digest(b"hello world");
        match filter.result() {
            Some(FilterResult::Digest(d)) => assert_eq!(d, expected.to_vec()),
            _ => panic!("expected digest"),
        }
        assert_eq!(out.as_slice(), b"hello world");
    }
}
