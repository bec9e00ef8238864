use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use filetime::FileTime;
use log::{debug, info};
use nix::unistd::{Gid, Group, Uid, User};
use zeroize::Zeroizing;

use crate::container::{self, PathKind, PathMeta};
use crate::crypto;
use crate::hash;
use crate::index::{self, Entry, Index};
use crate::ArchiveError;

struct Loaded {
    prefix_b64: String,
    index: Index,
}

/// A read session. Opening records the path and password only; the
/// archive is first touched when a query needs the prefix and index.
pub struct ArchiveReader {
    path: PathBuf,
    password: Zeroizing<Vec<u8>>,
    loaded: Option<Loaded>,
}

impl ArchiveReader {
    pub fn new<P: Into<PathBuf>>(path: P, password: Vec<u8>) -> Self {
        ArchiveReader {
            path: path.into(),
            password: Zeroizing::new(password),
            loaded: None,
        }
    }

    // First query: validate the magic, recover the prefix, then scan
    // forward to the index member without reading anything in between.
    fn ensure_loaded(&mut self) -> Result<&Loaded, ArchiveError> {
        let loaded = match self.loaded.take() {
            Some(loaded) => loaded,
            None => {
                let file = File::open(&self.path)?;
                let mut archive = tar::Archive::new(file);
                let mut entries = archive.entries()?;

                let prefix_b64 = container::read_magic_and_prefix(&mut entries, &self.password)?;

                let mut index = None;
                for entry in entries {
                    let entry = entry?;
                    if entry.path_bytes().as_ref() == container::INDEX_MEMBER.as_bytes() {
                        let text = container::open(entry, &self.password)?;
                        index = Some(Index::parse(&text)?);
                        break;
                    }
                }
                let index = index
                    .ok_or(container::FormatError::MissingMember(container::INDEX_MEMBER))?;

                debug!("loaded index: {} entries", index.entries.len());
                Loaded { prefix_b64, index }
            }
        };
        Ok(self.loaded.insert(loaded))
    }

    fn select(&mut self, prefixes: &[String]) -> Result<(String, Vec<Entry>), ArchiveError> {
        let wanted: Vec<Vec<u8>> = prefixes
            .iter()
            .map(|prefix| prefix.as_bytes().to_vec())
            .collect();
        let loaded = self.ensure_loaded()?;
        let selected = loaded
            .index
            .entries
            .iter()
            .filter(|entry| index::matches_prefix(&entry.raw_path, &wanted))
            .cloned()
            .collect();
        Ok((loaded.prefix_b64.clone(), selected))
    }

    /// Restore the selected entries under `dest` in one forward pass over
    /// the outer tar. Only members named by the selection are opened.
    pub fn extract(&mut self, dest: &Path, prefixes: &[String]) -> Result<(), ArchiveError> {
        let (prefix_b64, selected) = self.select(prefixes)?;
        if selected.is_empty() {
            return Ok(());
        }
        info!("extracting {} entries to {}", selected.len(), dest.display());

        // Member-name plans for the single pass
        let mut meta_by_name: HashMap<Vec<u8>, Entry> = HashMap::new();
        let mut data_by_name: HashMap<Vec<u8>, Vec<Entry>> = HashMap::new();
        for entry in &selected {
            let name_hash = hash::name_hash(&prefix_b64, &entry.raw_path);
            meta_by_name.insert(
                container::meta_member_name(&name_hash).into_bytes(),
                entry.clone(),
            );
            if let Some(ref data_hash) = entry.data_hash {
                data_by_name
                    .entry(container::data_member_name(data_hash).into_bytes())
                    .or_default()
                    .push(entry.clone());
            }
        }

        fs::create_dir_all(dest)?;

        let file = File::open(&self.path)?;
        let mut archive = tar::Archive::new(file);
        let mut entries = archive.entries()?;
        for name in [container::MAGIC_MEMBER, container::PREFIX_MEMBER] {
            entries
                .next()
                .ok_or(container::FormatError::MissingMember(name))??;
        }

        // Regular-file state: meta seen but data still to come, and the
        // reverse when a data member arrives first
        let mut deferred_meta: HashMap<Vec<u8>, PathMeta> = HashMap::new();
        let mut content_written: HashMap<Vec<u8>, PathBuf> = HashMap::new();

        for entry in entries {
            let entry = entry?;
            let name = entry.path_bytes().into_owned();

            if let Some(target) = meta_by_name.get(&name) {
                let payload = container::open(entry, &self.password)?;
                let (_, meta) = container::read_meta_tar(payload.as_slice())?;
                let out = out_path(dest, &target.raw_path);

                match meta.kind {
                    PathKind::Directory => {
                        fs::create_dir_all(&out)?;
                        fs::set_permissions(&out, Permissions::from_mode(meta.mode))?;
                        chown_best_effort(&out, &meta);
                        mtime_best_effort(&out, &meta);
                    }
                    PathKind::Symlink => {
                        ensure_parents(&out)?;
                        let target_path = meta.linkname.as_deref().unwrap_or(b"");
                        symlink(OsStr::from_bytes(target_path), &out)?;
                        chown_best_effort(&out, &meta);
                    }
                    PathKind::Fifo => {
                        ensure_parents(&out)?;
                        nix::unistd::mkfifo(
                            &out,
                            nix::sys::stat::Mode::from_bits_truncate(meta.mode),
                        )
                        .map_err(|source| ArchiveError::Fifo {
                            path: out.clone(),
                            source,
                        })?;
                        chown_best_effort(&out, &meta);
                        mtime_best_effort(&out, &meta);
                    }
                    PathKind::Regular => {
                        // Content may already be on disk if the data
                        // member came through first
                        if content_written.remove(&target.raw_path).is_some() {
                            apply_file_meta(&out, &meta)?;
                        } else {
                            deferred_meta.insert(target.raw_path.clone(), meta);
                        }
                    }
                }
            } else if let Some(targets) = data_by_name.remove(&name) {
                let dec = crypto::decrypt(entry, &self.password)?;
                let mut body = zstd::stream::read::Decoder::new(dec)?;

                // The stream is written once; further targets of the same
                // content copy from the first restored file
                let mut first: Option<PathBuf> = None;
                for target in &targets {
                    let out = out_path(dest, &target.raw_path);
                    ensure_parents(&out)?;

                    let meta = deferred_meta.remove(&target.raw_path);
                    let mode = meta.as_ref().map(|m| m.mode).unwrap_or(0o600);
                    let mut file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .mode(mode)
                        .open(&out)?;
                    match first {
                        None => {
                            io::copy(&mut body, &mut file)?;
                            first = Some(out.clone());
                        }
                        Some(ref path) => {
                            io::copy(&mut File::open(path)?, &mut file)?;
                        }
                    }
                    drop(file);

                    match meta {
                        Some(meta) => apply_file_meta(&out, &meta)?,
                        None => {
                            content_written.insert(target.raw_path.clone(), out);
                        }
                    }
                }
            }
            // Everything else is skipped unread
        }

        if let Some(raw_path) = content_written.keys().next() {
            return Err(ArchiveError::MissingMeta(
                String::from_utf8_lossy(raw_path).into_owned(),
            ));
        }
        if let Some(targets) = data_by_name.values().next() {
            if let Some(target) = targets.first() {
                return Err(ArchiveError::MissingData(
                    String::from_utf8_lossy(&target.raw_path).into_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Produce one `ls`-style line per selected entry, in index order:
    /// type, mode, owner, local mtime, escaped path.
    pub fn list(&mut self, prefixes: &[String]) -> Result<Vec<String>, ArchiveError> {
        let (prefix_b64, selected) = self.select(prefixes)?;
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let mut needed: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        for entry in &selected {
            let name_hash = hash::name_hash(&prefix_b64, &entry.raw_path);
            needed.insert(
                container::meta_member_name(&name_hash).into_bytes(),
                entry.raw_path.clone(),
            );
        }

        let file = File::open(&self.path)?;
        let mut archive = tar::Archive::new(file);
        let mut entries = archive.entries()?;
        for name in [container::MAGIC_MEMBER, container::PREFIX_MEMBER] {
            entries
                .next()
                .ok_or(container::FormatError::MissingMember(name))??;
        }

        let mut metas: HashMap<Vec<u8>, PathMeta> = HashMap::new();
        for entry in entries {
            if metas.len() == needed.len() {
                break;
            }
            let entry = entry?;
            let name = entry.path_bytes().into_owned();
            if let Some(raw_path) = needed.get(&name) {
                let payload = container::open(entry, &self.password)?;
                let (_, meta) = container::read_meta_tar(payload.as_slice())?;
                metas.insert(raw_path.clone(), meta);
            }
        }

        let mut lines = Vec::with_capacity(selected.len());
        for entry in &selected {
            let meta = metas.get(&entry.raw_path).ok_or_else(|| {
                ArchiveError::MissingMeta(String::from_utf8_lossy(&entry.raw_path).into_owned())
            })?;
            lines.push(format!(
                "{} {:04o} {} {} {}",
                type_char(meta.kind),
                meta.mode,
                owner_string(meta.uid, meta.gid),
                local_time(meta.mtime),
                String::from_utf8_lossy(&entry.raw_path),
            ));
        }
        Ok(lines)
    }
}

fn type_char(kind: PathKind) -> char {
    match kind {
        PathKind::Regular => '-',
        PathKind::Directory => 'd',
        PathKind::Symlink => 'l',
        PathKind::Fifo => 'p',
    }
}

// user:group with numeric fallback for ids the local system cannot name
fn owner_string(uid: u64, gid: u64) -> String {
    let user = User::from_uid(Uid::from_raw(uid as u32))
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| uid.to_string());
    let group = Group::from_gid(Gid::from_raw(gid as u32))
        .ok()
        .flatten()
        .map(|group| group.name)
        .unwrap_or_else(|| gid.to_string());
    format!("{}:{}", user, group)
}

fn local_time(mtime: u64) -> String {
    Local
        .timestamp_opt(mtime as i64, 0)
        .single()
        .map(|when| when.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| mtime.to_string())
}

/// Join the destination with the unescaped on-disk name. A stored
/// absolute path re-roots under `dest`, like `tar -C` would.
fn out_path(dest: &Path, raw_path: &[u8]) -> PathBuf {
    let path = index::unescape_path(raw_path);
    let mut rel = &path[..];
    while let Some((b'/', rest)) = rel.split_first() {
        rel = rest;
    }
    dest.join(Path::new(OsStr::from_bytes(rel)))
}

fn ensure_parents(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

// Ownership needs privilege; failure is not an error
fn chown_best_effort(path: &Path, meta: &PathMeta) {
    let _ = nix::unistd::fchownat(
        None,
        path,
        Some(Uid::from_raw(meta.uid as u32)),
        Some(Gid::from_raw(meta.gid as u32)),
        nix::unistd::FchownatFlags::NoFollowSymlink,
    );
}

fn mtime_best_effort(path: &Path, meta: &PathMeta) {
    let _ = filetime::set_file_mtime(path, FileTime::from_unix_time(meta.mtime as i64, 0));
}

fn apply_file_meta(path: &Path, meta: &PathMeta) -> Result<(), ArchiveError> {
    fs::set_permissions(path, Permissions::from_mode(meta.mode))?;
    chown_best_effort(path, meta);
    mtime_best_effort(path, meta);
    Ok(())
}

#[cfg(test)]
mod test_out_path {
    use super::*;

    #[test]
    fn relative_paths_join_under_dest() {
        assert_eq!(
            out_path(Path::new("/restore"), b"src-01/a.txt"),
            PathBuf::from("/restore/src-01/a.txt")
        );
    }

    #[test]
    fn absolute_paths_reroot_under_dest() {
        assert_eq!(
            out_path(Path::new("/restore"), b"/etc/ssh/config"),
            PathBuf::from("/restore/etc/ssh/config")
        );
    }

    #[test]
    fn escapes_are_undone_for_the_filesystem() {
        assert_eq!(
            out_path(Path::new("/restore"), b"weird\\\"\\\\name.txt"),
            PathBuf::from("/restore").join(OsStr::from_bytes(b"weird\"\\name.txt"))
        );
    }
}
