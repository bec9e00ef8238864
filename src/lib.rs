//! Immutable, deduplicated, compressed and encrypted archives.
//!
//! An archive is one plain uncompressed tar file. Inside it a small set
//! of well-known members describe a set of filesystem paths and carry a
//! content-addressed store of file bodies that coalesces duplicates.
//!
//! # Members
//!
//! | Member | Payload | Notes |
//! | ------ | ------- | ----- |
//! | `magic.zst` | zstd of `arkiv001` | unencrypted, identifies the format and version |
//! | `prefix.zst.aes` | 8 random bytes | the hash prefix; base64 of these bytes seeds every hash |
//! | `meta/<name_hash>.tar.zst.aes` | one-member tar | type + mode/uid/gid/mtime/linkname of one path, zero payload |
//! | `data/<data_hash>.zst.aes` | file body | one per distinct content, shared by duplicates |
//! | `index.zst.aes` | textual index | canonical listing, always the last member |
//!
//! `magic.zst` aside, every payload is compressed with zstd and then
//! encrypted with the OpenSSL `enc` scheme: the literal tag `Salted__`,
//! 8 salt bytes, then AES-256-CBC ciphertext under a key and IV derived
//! by PBKDF2-HMAC-SHA256 (10 000 iterations), padded with PKCS#7.
//!
//! # Hashes
//!
//! All member-name hashes are SHA-512/256 in lowercase hex. With
//! `prefix_b64` the base64 string of the archive's 8 prefix bytes:
//!
//! | Hash | Input |
//! | ---- | ----- |
//! | name hash | `prefix_b64 \|\| escaped_path` |
//! | data hash | `prefix_b64 \|\| file_bytes` |
//!
//! The escaped path is the byte sequence between the quotes of the
//! path's index line: backslashes doubled, double-quotes preceded by a
//! backslash. It is hashed as stored, never unescaped.
//!
//! # Index
//!
//! One line per path, `"escaped_path"` followed by `=<data_hash_hex>`
//! for regular files. Lines are unique and byte-sorted, joined with a
//! single line feed and no trailing newline.
//!
//! # Sessions
//!
//! [`ArchiveWriter`] builds a whole archive in one pass; there is no
//! mutation of existing archives. [`ArchiveReader`] loads the prefix and
//! index lazily, then lists or selectively extracts in one forward pass
//! over the outer tar, opening only the members its plan names.

use std::path::PathBuf;

use thiserror::Error;

pub mod cli;
pub mod container;
pub mod crypto;
pub mod hash;
pub mod index;
pub mod reader;
pub mod writer;

pub use reader::ArchiveReader;
pub use writer::ArchiveWriter;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
    #[error(transparent)]
    Format(#[from] container::FormatError),
    #[error(transparent)]
    Index(#[from] index::IndexError),
    #[error(transparent)]
    Walk(#[from] ignore::Error),
    #[error("unsupported special file: {}", .0.display())]
    UnsupportedType(PathBuf),
    #[error("creating fifo {}: {source}", .path.display())]
    Fifo {
        path: PathBuf,
        source: nix::Error,
    },
    #[error("missing file metadata for {0}")]
    MissingMeta(String),
    #[error("missing file content for {0}")]
    MissingData(String),
    #[error("{0} must be set")]
    MissingPassword(&'static str),
}
