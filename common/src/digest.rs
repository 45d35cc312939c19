//! Content digests used for verification
//!
//! Two hashes are involved in a transfer:
//! - a fast hash (MD5) computed over every chunk, right after it is read from the source and
//!   again after it is read back from the destination
//! - a strong hash (SHA-256) computed once over the whole source and the whole destination
//!
//! Collision resistance of the fast hash does not matter here: it only has to catch corruption
//! within a single run.

use async_trait::async_trait;
use md5::Md5;
use sha2::Digest as _;
use sha2::Sha256;
use tokio::io::AsyncReadExt;

use crate::fs::FileStream;

const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// Opaque, comparable digest value. Displayed as lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashing capability used by the transfer engine.
#[async_trait]
pub trait DigestProvider: Send + Sync {
    /// Fast hash over exactly the bytes of `buffer`.
    fn hash_bytes(&self, buffer: &[u8]) -> Digest;

    /// Strong hash over everything readable from the current position of `stream` to its end.
    async fn hash_stream(&self, stream: &mut dyn FileStream) -> std::io::Result<Digest>;
}

/// MD5 for chunks, SHA-256 for whole files.
#[derive(Copy, Clone, Debug, Default)]
pub struct StandardDigests;

#[async_trait]
impl DigestProvider for StandardDigests {
    fn hash_bytes(&self, buffer: &[u8]) -> Digest {
        Digest::from_bytes(&Md5::digest(buffer))
    }

    async fn hash_stream(&self, stream: &mut dyn FileStream) -> std::io::Result<Digest> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
        loop {
            let n = stream.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(Digest::from_bytes(&hasher.finalize()))
    }
}
