use std::fmt;
use std::io::{copy, Read};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha512_256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("digest must be {expected} hex characters, got {found}")]
    BadLength { expected: usize, found: usize },
    #[error("digest is not valid hex")]
    BadHex(#[from] hex::FromHexError),
}

/// SHA-512/256 digest. Every hash inside an archive is this function,
/// rendered as 64 lowercase hex characters.
#[derive(PartialEq, Eq, Clone, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hash: &str) -> Result<Hash, HashError> {
        if hash.len() != 64 {
            return Err(HashError::BadLength {
                expected: 64,
                found: hash.len(),
            });
        }
        let bytes = hex::decode(hash)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

/// Streaming hasher seeded with the archive prefix. The prefix is mixed
/// in as its base64 string, not the raw 8 bytes.
pub struct Hasher(Sha512_256);

impl Hasher {
    pub fn with_prefix(prefix_b64: &str) -> Hasher {
        let mut inner = Sha512_256::new();
        inner.update(prefix_b64.as_bytes());
        Hasher(inner)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Hash {
        let digest = self.0.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Hash(out)
    }
}

/// Hash a whole stream under the archive prefix.
pub fn hash_reader<R: Read>(prefix_b64: &str, data: &mut R) -> Result<Hash, std::io::Error> {
    let mut hasher = Hasher::with_prefix(prefix_b64);
    copy(data, &mut hasher.0)?;
    Ok(hasher.finalize())
}

/// Member-name hash of one escaped path, as it appears between the quotes
/// of its index line. The escaped bytes are hashed as-is.
pub fn name_hash(prefix_b64: &str, raw_path: &[u8]) -> Hash {
    let mut hasher = Hasher::with_prefix(prefix_b64);
    hasher.update(raw_path);
    hasher.finalize()
}

/// Materialize the 8 random prefix bytes as the base64 string that seeds
/// every hash in the archive. No trailing newline.
pub fn prefix_b64(prefix: &[u8; 8]) -> String {
    STANDARD.encode(prefix)
}
