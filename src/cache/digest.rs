//! Content hashing
//!
//! A file's digest is the cache's identity key. Two files with the same
//! bytes always produce the same digest, whatever their name or location.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Files are streamed through the hasher in chunks of this size
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256 (256-bit digest)
    #[default]
    Sha256,
    /// SHA-512 (512-bit digest)
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(CacheError::User(format!(
                "Unknown hash algorithm: {}. Use sha256 or sha512",
                other
            ))),
        }
    }
}

/// Digest of a file's exact bytes, tagged with the algorithm that made it
///
/// Renders as `<algorithm>:<hex>`. Digests from different algorithms never
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileDigest {
    algorithm: HashAlgorithm,
    bytes: Vec<u8>,
}

impl FileDigest {
    /// Wrap raw digest bytes, checking the length matches the algorithm
    pub fn from_bytes(algorithm: HashAlgorithm, bytes: Vec<u8>) -> CacheResult<Self> {
        if bytes.len() != algorithm.digest_len() {
            return Err(CacheError::InvalidDigest(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.digest_len(),
                bytes.len()
            )));
        }
        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// First 12 hex characters, for logs and tables
    pub fn short(&self) -> String {
        hex::encode(&self.bytes[..6])
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

impl FromStr for FileDigest {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex_part) = s
            .split_once(':')
            .ok_or_else(|| CacheError::InvalidDigest(format!("missing algorithm prefix: {s}")))?;
        let algorithm: HashAlgorithm = algo
            .parse()
            .map_err(|_| CacheError::InvalidDigest(format!("unknown algorithm in {s}")))?;
        let bytes = hex::decode(hex_part)
            .map_err(|e| CacheError::InvalidDigest(format!("{s}: {e}")))?;
        Self::from_bytes(algorithm, bytes)
    }
}

impl TryFrom<String> for FileDigest {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FileDigest> for String {
    fn from(digest: FileDigest) -> Self {
        digest.to_string()
    }
}

/// Computes digests of local files
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher {
    algorithm: HashAlgorithm,
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash a file's full contents
    ///
    /// The file is read exactly once, in `CHUNK_SIZE` pieces, so its size is
    /// not bounded by memory.
    pub async fn digest(&self, path: &Path) -> CacheResult<FileDigest> {
        let mut file = File::open(path)
            .await
            .map_err(|e| CacheError::hash_failure(path, e))?;

        let bytes = match self.algorithm {
            HashAlgorithm::Sha256 => stream_into::<Sha256>(&mut file, path).await?,
            HashAlgorithm::Sha512 => stream_into::<Sha512>(&mut file, path).await?,
        };

        let digest = FileDigest::from_bytes(self.algorithm, bytes)?;
        debug!("Hashed {} -> {}", path.display(), digest.short());
        Ok(digest)
    }

    /// Hash an in-memory buffer
    pub fn digest_bytes(&self, data: &[u8]) -> FileDigest {
        let bytes = match self.algorithm {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        };
        FileDigest {
            algorithm: self.algorithm,
            bytes,
        }
    }
}

async fn stream_into<D: Digest>(file: &mut File, path: &Path) -> CacheResult<Vec<u8>> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| CacheError::hash_failure(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}
