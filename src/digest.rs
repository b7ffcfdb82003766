use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::tpm::types::CommandCode;

/// A raw digest value. Length is determined by the algorithm that produced it.
pub type Digest = Vec<u8>;

#[derive(Error, Debug, PartialEq)]
pub enum DigestError {
    #[error("unsupported hash algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error("unsupported hash algorithm id {0:#06x}")]
    UnsupportedAlgorithmId(u16),
}

/// A PCR bank / policy hash algorithm.
///
/// Variants are declared in TPM_ALG_ID order, so the derived `Ord` gives the
/// canonical bank order used in PCR selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    /// TPM_ALG_ID of this algorithm
    pub fn id(self) -> u16 {
        match self {
            HashAlgorithm::Sha1 => 0x0004,
            HashAlgorithm::Sha256 => 0x000b,
            HashAlgorithm::Sha384 => 0x000c,
            HashAlgorithm::Sha512 => 0x000d,
        }
    }

    pub fn from_id(id: u16) -> Result<Self, DigestError> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.id() == id)
            .ok_or(DigestError::UnsupportedAlgorithmId(id))
    }

    /// Digest length in bytes
    pub fn size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn zero(self) -> Digest {
        vec![0; self.size()]
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    /// Hashes the concatenation of `parts`
    pub fn hash(self, parts: &[&[u8]]) -> Digest {
        let mut hasher = self.hasher();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize()
    }

    /// The PCR extend operation, `H(prev || data)`.
    pub fn extend(self, prev: &[u8], data: &[u8]) -> Digest {
        self.hash(&[prev, data])
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(DigestError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Incremental hasher over any supported bank.
pub enum Hasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// TPM PolicyUpdate:
/// `digest = H(digest || cc || arg2)` followed by `digest = H(digest || arg3)`.
///
/// The second hash is applied even when `arg3` (a policyRef) is empty.
pub fn policy_update(
    alg: HashAlgorithm,
    digest: &[u8],
    command_code: CommandCode,
    arg2: &[u8],
    arg3: &[u8],
) -> Digest {
    let digest = alg.hash(&[digest, &command_code.to_be_bytes(), arg2]);
    alg.hash(&[&digest, arg3])
}

/// The digest TPM2_PolicyOR leaves in a session:
/// `H(0...0 || TPM_CC_PolicyOR || d1 || ... || dn)`.
pub fn policy_or_digest(alg: HashAlgorithm, digests: &[Digest]) -> Digest {
    let mut hasher = alg.hasher();
    hasher.update(&alg.zero());
    hasher.update(&CommandCode::PolicyOR.to_be_bytes());
    for digest in digests {
        hasher.update(digest);
    }
    hasher.finalize()
}

/// Hash of the concatenated PCR values of a selection, as PolicyPCR expects
/// for its `pcrDigest` argument.
pub fn pcr_composite_digest<'a>(
    alg: HashAlgorithm,
    values: impl IntoIterator<Item = &'a Digest>,
) -> Digest {
    let mut hasher = alg.hasher();
    for value in values {
        hasher.update(value);
    }
    hasher.finalize()
}
