use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use log::{debug, info};
use zeroize::Zeroizing;

use crate::container::{self, PathKind, PathMeta};
use crate::crypto;
use crate::hash::{self, Hash};
use crate::index::{self, Entry, Index};
use crate::ArchiveError;

/// A write session. Holds the destination path and the password; the
/// archive comes into existence in one `create` pass and is never
/// touched again.
pub struct ArchiveWriter {
    path: PathBuf,
    password: Zeroizing<Vec<u8>>,
}

impl ArchiveWriter {
    pub fn new<P: Into<PathBuf>>(path: P, password: Vec<u8>) -> Self {
        ArchiveWriter {
            path: path.into(),
            password: Zeroizing::new(password),
        }
    }

    /// Build the archive from the given input paths. Members go out in a
    /// fixed order: magic, prefix, then meta/data in walk order, index
    /// last. On error the partial file is left in place for inspection.
    pub fn create(&self, inputs: &[PathBuf]) -> Result<(), ArchiveError> {
        let file = File::create(&self.path)?;
        let mut builder = tar::Builder::new(file);

        container::write_magic(&mut builder)?;

        let prefix = crypto::gen_salt()?;
        container::write_prefix(&mut builder, &prefix, &self.password)?;
        let prefix_b64 = hash::prefix_b64(&prefix);

        let paths = collect_paths(inputs)?;
        info!("storing {} paths into {}", paths.len(), self.path.display());

        let mut idx = Index::default();
        let mut data_written: HashSet<Hash> = HashSet::new();

        for path in &paths {
            let meta = stat_path(path)?;
            let raw_path = index::escape_path(path.as_os_str().as_bytes());
            let name_hash = hash::name_hash(&prefix_b64, &raw_path);

            let meta_tar = container::build_meta_tar(&raw_path, &meta)?;
            let sealed = container::seal(&meta_tar, &self.password)?;
            container::append_member(
                &mut builder,
                &container::meta_member_name(&name_hash),
                0o600,
                &sealed,
            )?;

            let mut entry = Entry {
                raw_path,
                data_hash: None,
            };

            if meta.kind == PathKind::Regular {
                info!("data: {}", path.display());
                let (data_hash, sealed) = seal_file(path, &prefix_b64, &self.password)?;
                if data_written.insert(data_hash.clone()) {
                    container::append_member(
                        &mut builder,
                        &container::data_member_name(&data_hash),
                        0o600,
                        &sealed,
                    )?;
                } else {
                    debug!("dedup: {}", path.display());
                }
                entry.data_hash = Some(data_hash);
            } else {
                info!("meta: {}", path.display());
            }

            idx.push(entry);
        }

        let sealed = container::seal(&idx.serialize(), &self.password)?;
        container::append_member(&mut builder, container::INDEX_MEMBER, 0o600, &sealed)?;

        let mut file = builder.into_inner()?;
        file.flush()?;
        Ok(())
    }
}

/// Enumerate every path under the inputs without following symlinks,
/// including each input itself, byte-sorted and deduplicated.
fn collect_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut paths = Vec::new();
    for input in inputs {
        // Lexical clean so "dir/" and "./dir" store as "dir"
        let input: PathBuf = input.components().collect();
        let walker = WalkBuilder::new(&input)
            .follow_links(false)
            .standard_filters(false)
            .build();
        for entry in walker {
            paths.push(entry?.into_path());
        }
    }
    paths.sort_by(|a, b| a.as_os_str().as_bytes().cmp(b.as_os_str().as_bytes()));
    paths.dedup();
    Ok(paths)
}

/// lstat one path into the metadata stub stored in its meta member.
/// Anything outside the four supported types is fatal.
fn stat_path(path: &Path) -> Result<PathMeta, ArchiveError> {
    let meta = std::fs::symlink_metadata(path)?;
    let file_type = meta.file_type();

    let kind = if file_type.is_file() {
        PathKind::Regular
    } else if file_type.is_dir() {
        PathKind::Directory
    } else if file_type.is_symlink() {
        PathKind::Symlink
    } else if file_type.is_fifo() {
        PathKind::Fifo
    } else {
        return Err(ArchiveError::UnsupportedType(path.to_path_buf()));
    };

    let linkname = if kind == PathKind::Symlink {
        Some(std::fs::read_link(path)?.into_os_string().into_vec())
    } else {
        None
    };

    Ok(PathMeta {
        kind,
        mode: meta.mode() & 0o7777,
        uid: meta.uid() as u64,
        gid: meta.gid() as u64,
        mtime: meta.mtime().max(0) as u64,
        linkname,
    })
}

/// Stream one regular file through the salted hash and the
/// compress-then-encrypt pipeline in a single read pass. The ciphertext
/// is buffered because the outer tar header needs its final length.
fn seal_file(
    path: &Path,
    prefix_b64: &str,
    password: &[u8],
) -> Result<(Hash, Vec<u8>), ArchiveError> {
    let mut file = File::open(path)?;
    let mut hasher = hash::Hasher::with_prefix(prefix_b64);

    let enc = crypto::encrypt(Vec::new(), password)?;
    let mut zenc = zstd::stream::write::Encoder::new(enc, zstd::DEFAULT_COMPRESSION_LEVEL)?;

    let mut buf = [0u8; 64 * 1024];
    loop {
        let len = file.read(&mut buf)?;
        if len == 0 {
            break;
        }
        hasher.update(&buf[..len]);
        zenc.write_all(&buf[..len])?;
    }

    let enc = zenc.finish()?;
    let sealed = enc.finish()?;
    Ok((hasher.finalize(), sealed))
}
