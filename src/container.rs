use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tar::{Builder, EntryType, Header};
use thiserror::Error;

use crate::crypto::{self, CryptoError};
use crate::hash::{self, Hash};

/// Plaintext behind `magic.zst`; the trailing digits version the format.
pub const MAGIC: &[u8] = b"arkiv001";

pub const MAGIC_MEMBER: &str = "magic.zst";
pub const PREFIX_MEMBER: &str = "prefix.zst.aes";
pub const INDEX_MEMBER: &str = "index.zst.aes";

pub fn meta_member_name(name_hash: &Hash) -> String {
    format!("meta/{}.tar.zst.aes", name_hash.to_hex())
}

pub fn data_member_name(data_hash: &Hash) -> String {
    format!("data/{}.zst.aes", data_hash.to_hex())
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("expected member {expected}, found {found}")]
    UnexpectedMember { expected: &'static str, found: String },
    #[error("bad magic")]
    BadMagic,
    #[error("prefix payload must be 8 bytes, got {0}")]
    BadPrefixLength(usize),
    #[error("archive has no {0} member")]
    MissingMember(&'static str),
    #[error("unsupported entry type in file metadata")]
    BadMetaType,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Compress then encrypt a payload, the storage form of every member
/// except `magic.zst`.
pub fn seal(plain: &[u8], password: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let enc = crypto::encrypt(Vec::new(), password)?;
    let mut zenc = zstd::stream::write::Encoder::new(enc, zstd::DEFAULT_COMPRESSION_LEVEL)?;
    zenc.write_all(plain)?;
    let enc = zenc.finish()?;
    enc.finish()
}

/// Decrypt then decompress one member payload into memory.
pub fn open<R: Read>(source: R, password: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let dec = crypto::decrypt(source, password)?;
    let mut plain = Vec::new();
    zstd::stream::read::Decoder::new(dec)?.read_to_end(&mut plain)?;
    Ok(plain)
}

/// Commit one member to the outer container: a header carrying only
/// name, mode and size, then the payload.
pub fn append_member<W: Write>(
    builder: &mut Builder<W>,
    name: &str,
    mode: u32,
    payload: &[u8],
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_size(payload.len() as u64);
    builder.append_data(&mut header, name, payload)
}

pub fn write_magic<W: Write>(builder: &mut Builder<W>) -> Result<(), FormatError> {
    let payload = zstd::encode_all(MAGIC, zstd::DEFAULT_COMPRESSION_LEVEL)?;
    append_member(builder, MAGIC_MEMBER, 0o644, &payload)?;
    Ok(())
}

pub fn write_prefix<W: Write>(
    builder: &mut Builder<W>,
    prefix: &[u8; 8],
    password: &[u8],
) -> Result<(), FormatError> {
    let payload = seal(prefix, password)?;
    append_member(builder, PREFIX_MEMBER, 0o600, &payload)?;
    Ok(())
}

fn expect_member<'a, R: Read>(
    entries: &mut tar::Entries<'a, R>,
    name: &'static str,
) -> Result<tar::Entry<'a, R>, FormatError> {
    let entry = entries.next().ok_or(FormatError::MissingMember(name))??;
    if entry.path_bytes().as_ref() != name.as_bytes() {
        return Err(FormatError::UnexpectedMember {
            expected: name,
            found: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
        });
    }
    Ok(entry)
}

/// Validate the two fixed leading members and recover the base64 prefix
/// string that seeds all hashing.
pub fn read_magic_and_prefix<R: Read>(
    entries: &mut tar::Entries<R>,
    password: &[u8],
) -> Result<String, FormatError> {
    let entry = expect_member(entries, MAGIC_MEMBER)?;
    let payload = zstd::decode_all(entry)?;
    if payload != MAGIC {
        return Err(FormatError::BadMagic);
    }

    let entry = expect_member(entries, PREFIX_MEMBER)?;
    let raw = open(entry, password)?;
    let prefix: [u8; 8] = raw[..]
        .try_into()
        .map_err(|_| FormatError::BadPrefixLength(raw.len()))?;
    Ok(hash::prefix_b64(&prefix))
}

/// File type of one archived path. A closed four-variant sum; anything
/// else on disk is rejected before it gets here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
}

/// Metadata stub carried by a `meta/*` member. The body of a regular
/// file lives separately under `data/`, so size is always zero here.
#[derive(Debug, Clone)]
pub struct PathMeta {
    pub kind: PathKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub linkname: Option<Vec<u8>>,
}

/// Build the one-member inner tar for a path. The member name is the
/// escaped path byte-for-byte; only the header carries information.
pub fn build_meta_tar(raw_path: &[u8], meta: &PathMeta) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    let mut header = Header::new_gnu();
    header.set_mode(meta.mode);
    header.set_uid(meta.uid);
    header.set_gid(meta.gid);
    header.set_mtime(meta.mtime);
    header.set_size(0);

    let name = Path::new(OsStr::from_bytes(raw_path));
    match meta.kind {
        PathKind::Symlink => {
            header.set_entry_type(EntryType::Symlink);
            let target = meta.linkname.as_deref().unwrap_or(b"");
            builder.append_link(&mut header, name, Path::new(OsStr::from_bytes(target)))?;
        }
        PathKind::Regular | PathKind::Directory | PathKind::Fifo => {
            header.set_entry_type(match meta.kind {
                PathKind::Directory => EntryType::Directory,
                PathKind::Fifo => EntryType::Fifo,
                _ => EntryType::Regular,
            });
            builder.append_data(&mut header, name, io::empty())?;
        }
    }

    builder.into_inner()
}

/// Read back the single header of an inner meta tar. Returns the stored
/// name bytes and the decoded metadata; any payload is ignored.
pub fn read_meta_tar<R: Read>(source: R) -> Result<(Vec<u8>, PathMeta), FormatError> {
    let mut archive = tar::Archive::new(source);
    let mut entries = archive.entries()?;
    let entry = entries
        .next()
        .ok_or(FormatError::MissingMember("file metadata"))??;

    let kind = match entry.header().entry_type() {
        EntryType::Regular => PathKind::Regular,
        EntryType::Directory => PathKind::Directory,
        EntryType::Symlink => PathKind::Symlink,
        EntryType::Fifo => PathKind::Fifo,
        _ => return Err(FormatError::BadMetaType),
    };

    let raw_path = entry.path_bytes().into_owned();
    let linkname = entry
        .link_name()?
        .map(|target| target.as_os_str().as_bytes().to_vec());
    let header = entry.header();

    Ok((
        raw_path,
        PathMeta {
            kind,
            mode: header.mode()?,
            uid: header.uid()?,
            gid: header.gid()?,
            mtime: header.mtime()?,
            linkname,
        },
    ))
}


#[cfg(test)]
mod test_seal_open {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn seal_then_open_roundtrip() {
        let sealed = seal(b"payload bytes", b"pw").unwrap();
        assert_eq!(&sealed[..8], b"Salted__");
        assert_eq!(open(Cursor::new(sealed), b"pw").unwrap(), b"payload bytes");
    }

    #[test]
    fn open_rejects_wrong_password() {
        let sealed = seal(b"payload bytes", b"pw").unwrap();
        assert!(open(Cursor::new(sealed), b"other").is_err());
    }
}

#[cfg(test)]
mod test_outer_members {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn append_then_read_back() {
        let mut builder = Builder::new(Vec::new());
        append_member(&mut builder, "data/abc.zst.aes", 0o600, b"12345").unwrap();
        let archive = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path_bytes().as_ref(), b"data/abc.zst.aes");
        assert_eq!(entry.header().size().unwrap(), 5);

        let mut payload = Vec::new();
        entry.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"12345");
    }

    #[test]
    fn magic_and_prefix_roundtrip() {
        let mut builder = Builder::new(Vec::new());
        write_magic(&mut builder).unwrap();
        write_prefix(&mut builder, b"\x01\x02\x03\x04\x05\x06\x07\x08", b"pw").unwrap();
        let archive = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let mut entries = archive.entries().unwrap();
        let prefix_b64 = read_magic_and_prefix(&mut entries, b"pw").unwrap();
        assert_eq!(prefix_b64, hash::prefix_b64(b"\x01\x02\x03\x04\x05\x06\x07\x08"));
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let mut builder = Builder::new(Vec::new());
        let payload = zstd::encode_all(&b"arkiv999"[..], 0).unwrap();
        append_member(&mut builder, MAGIC_MEMBER, 0o644, &payload).unwrap();
        let archive = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let mut entries = archive.entries().unwrap();
        assert!(matches!(
            read_magic_and_prefix(&mut entries, b"pw"),
            Err(FormatError::BadMagic)
        ));
    }

    #[test]
    fn misordered_members_are_rejected() {
        let mut builder = Builder::new(Vec::new());
        write_prefix(&mut builder, &[0u8; 8], b"pw").unwrap();
        let archive = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let mut entries = archive.entries().unwrap();
        assert!(matches!(
            read_magic_and_prefix(&mut entries, b"pw"),
            Err(FormatError::UnexpectedMember { .. })
        ));
    }

    #[test]
    fn short_prefix_payload_is_rejected() {
        let mut builder = Builder::new(Vec::new());
        write_magic(&mut builder).unwrap();
        let payload = seal(b"1234", b"pw").unwrap();
        append_member(&mut builder, PREFIX_MEMBER, 0o600, &payload).unwrap();
        let archive = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let mut entries = archive.entries().unwrap();
        assert!(matches!(
            read_magic_and_prefix(&mut entries, b"pw"),
            Err(FormatError::BadPrefixLength(4))
        ));
    }
}
