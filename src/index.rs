use std::collections::BTreeSet;

use thiserror::Error;

use crate::hash::{Hash, HashError};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index line must start with a quote: {0}")]
    MissingOpenQuote(String),
    #[error("unterminated path on index line: {0}")]
    UnterminatedPath(String),
    #[error("expected '=' after the quoted path: {0}")]
    BadSeparator(String),
    #[error("bad content digest on index line {line}: {source}")]
    BadDigest {
        line: String,
        #[source]
        source: HashError,
    },
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

/// Escape a path for the index: backslash doubles, double-quote gains a
/// backslash. The result is the exact byte sequence stored between the
/// surrounding quotes, and the exact byte sequence fed to the name hash.
pub fn escape_path(path: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(path.len());
    for &byte in path {
        match byte {
            b'\\' => raw.extend_from_slice(b"\\\\"),
            b'"' => raw.extend_from_slice(b"\\\""),
            _ => raw.push(byte),
        }
    }
    raw
}

/// Undo `escape_path` to recover the on-disk name.
pub fn unescape_path(raw: &[u8]) -> Vec<u8> {
    let mut path = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 1 < raw.len() && matches!(raw[i + 1], b'\\' | b'"') {
            path.push(raw[i + 1]);
            i += 2;
        } else {
            path.push(raw[i]);
            i += 1;
        }
    }
    path
}

/// One logical archive member: the escaped path and, for regular files,
/// the content digest keying its data member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub raw_path: Vec<u8>,
    pub data_hash: Option<Hash>,
}

impl Entry {
    fn line(&self) -> Vec<u8> {
        let mut line = Vec::with_capacity(self.raw_path.len() + 2);
        line.push(b'"');
        line.extend_from_slice(&self.raw_path);
        line.push(b'"');
        if let Some(ref hash) = self.data_hash {
            line.push(b'=');
            line.extend_from_slice(hash.to_hex().as_bytes());
        }
        line
    }
}

/// The textual path index carried as the archive's final member.
#[derive(Debug, Default)]
pub struct Index {
    pub entries: Vec<Entry>,
}

impl Index {
    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Canonical serialization: unique lines in unsigned byte order,
    /// joined with a single line feed, no trailing newline.
    pub fn serialize(&self) -> Vec<u8> {
        let lines: BTreeSet<Vec<u8>> = self.entries.iter().map(Entry::line).collect();

        let mut out = Vec::new();
        for line in &lines {
            if !out.is_empty() {
                out.push(b'\n');
            }
            out.extend_from_slice(line);
        }
        out
    }

    /// Parse index text one line at a time. Blank lines are skipped; the
    /// quoted path is never unescaped.
    pub fn parse(data: &[u8]) -> Result<Index, IndexError> {
        let mut index = Index::default();
        for line in data.split(|&byte| byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            index.push(parse_line(line)?);
        }
        Ok(index)
    }
}

fn parse_line(line: &[u8]) -> Result<Entry, IndexError> {
    if line.first() != Some(&b'"') {
        return Err(IndexError::MissingOpenQuote(lossy(line)));
    }

    // The first unescaped quote after the opener closes the path; a
    // backslash shields whatever byte follows it
    let mut at = 1;
    let mut close = None;
    while at < line.len() {
        match line[at] {
            b'\\' if at + 1 < line.len() => at += 2,
            b'"' => {
                close = Some(at);
                break;
            }
            _ => at += 1,
        }
    }
    let close = close.ok_or_else(|| IndexError::UnterminatedPath(lossy(line)))?;
    let raw_path = line[1..close].to_vec();

    if close + 1 == line.len() {
        return Ok(Entry {
            raw_path,
            data_hash: None,
        });
    }

    if line[close + 1] != b'=' {
        return Err(IndexError::BadSeparator(lossy(line)));
    }

    let digest = std::str::from_utf8(&line[close + 2..]).map_err(|_| IndexError::BadDigest {
        line: lossy(line),
        source: HashError::BadLength {
            expected: 64,
            found: line.len() - close - 2,
        },
    })?;
    let data_hash = Hash::from_hex(digest).map_err(|source| IndexError::BadDigest {
        line: lossy(line),
        source,
    })?;

    Ok(Entry {
        raw_path,
        data_hash: Some(data_hash),
    })
}

/// Prefix selection over escaped paths. An empty set selects everything.
pub fn matches_prefix(raw_path: &[u8], prefixes: &[Vec<u8>]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|prefix| raw_path.starts_with(prefix))
}


#[cfg(test)]
mod test_serialize {
    use super::*;
    use crate::hash::name_hash;

    fn entry(path: &[u8], hashed: bool) -> Entry {
        Entry {
            raw_path: escape_path(path),
            data_hash: hashed.then(|| name_hash("", path)),
        }
    }

    #[test]
    fn lines_sort_in_byte_order() {
        let mut index = Index::default();
        index.push(entry(b"zeta", false));
        index.push(entry(b"Alpha", false));
        index.push(entry(b"alpha", false));

        // Uppercase sorts before lowercase in unsigned byte order
        assert_eq!(index.serialize(), b"\"Alpha\"\n\"alpha\"\n\"zeta\"");
    }

    #[test]
    fn duplicate_lines_collapse() {
        let mut index = Index::default();
        index.push(entry(b"same", true));
        index.push(entry(b"same", true));
        assert_eq!(index.serialize().split(|&b| b == b'\n').count(), 1);
    }

    #[test]
    fn no_trailing_newline() {
        let mut index = Index::default();
        index.push(entry(b"only", false));
        assert!(!index.serialize().ends_with(b"\n"));
    }

    #[test]
    fn empty_index_is_empty_bytes() {
        assert_eq!(Index::default().serialize(), b"");
    }

    #[test]
    fn hash_renders_after_equals() {
        let mut index = Index::default();
        let one = entry(b"file", true);
        let hex = one.data_hash.clone().unwrap().to_hex();
        index.push(one);
        assert_eq!(index.serialize(), format!("\"file\"={}", hex).into_bytes());
    }
}
