//! Reader and writer for the `packed-refs` file consulted when advertising refs.
//!
//! The format is line oriented:
//!
//! ```text
//! # pack-refs with: peeled fully-peeled sorted
//! 1d2c5f0a... refs/heads/main
//! 9fceb02d... refs/tags/v1.0
//! ^8a3b1c2d...
//! ```
//!
//! A `^` line carries the peeled object id of the tag on the line before it and is exposed in the
//! mapping under `<ref>^{}`, the name used on the wire.

use std::collections::HashMap;
use std::fmt;

use crate::errors::GitError;

const PEELED_SUFFIX: &str = "^{}";
const HEADER_PREFIX: &str = "# pack-refs with:";

/// One line of a packed-refs file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackedRefsEntry {
    /// Comment line, kept verbatim.
    Comment(String),
    Ref { name: String, oid: String },
    /// Peeled id of the annotated tag `name`.
    Peeled { name: String, oid: String },
}

/// A parsed packed-refs file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedRefs {
    entries: Vec<PackedRefsEntry>,
    refs: HashMap<String, String>,
}

impl PackedRefs {
    pub fn parse(text: &str) -> Result<Self, GitError> {
        let mut packed = PackedRefs::default();
        // Name of the ref a following `^` line peels.
        let mut last_ref: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.strip_suffix('\r').unwrap_or(raw);

            if line.trim().is_empty() {
                continue;
            }

            if line.trim_start().starts_with('#') {
                packed.entries.push(PackedRefsEntry::Comment(line.to_string()));
                continue;
            }

            if let Some(oid) = line.strip_prefix('^') {
                let name = last_ref.clone().ok_or_else(|| {
                    GitError::packed_refs(line_no, line, "peeled id without a preceding ref")
                })?;
                check_oid(line_no, line, oid)?;
                packed
                    .refs
                    .insert(format!("{name}{PEELED_SUFFIX}"), oid.to_string());
                packed.entries.push(PackedRefsEntry::Peeled {
                    name,
                    oid: oid.to_string(),
                });
                continue;
            }

            let Some(space) = memchr::memchr(b' ', line.as_bytes()) else {
                return Err(GitError::packed_refs(line_no, line, "missing ref name"));
            };
            let (oid, name) = (&line[..space], &line[space + 1..]);
            check_oid(line_no, line, oid)?;
            if name.is_empty() {
                return Err(GitError::packed_refs(line_no, line, "missing ref name"));
            }

            if packed.refs.insert(name.to_string(), oid.to_string()).is_some() {
                tracing::debug!("packed-refs: duplicate entry for {}, keeping the later one", name);
                // The earlier peeled id belonged to the replaced object.
                packed.refs.remove(&format!("{name}{PEELED_SUFFIX}"));
            }
            packed.entries.push(PackedRefsEntry::Ref {
                name: name.to_string(),
                oid: oid.to_string(),
            });
            last_ref = Some(name.to_string());
        }

        Ok(packed)
    }

    /// Parse raw file contents, rejecting anything that is not UTF-8.
    pub fn parse_bytes(data: &[u8]) -> Result<Self, GitError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| GitError::ConversionError(format!("packed-refs: {e}")))?;
        Self::parse(text)
    }

    pub fn entries(&self) -> &[PackedRefsEntry] {
        &self.entries
    }

    /// Ref name to object id, peeled tags included as `<name>^{}`.
    pub fn refs(&self) -> &HashMap<String, String> {
        &self.refs
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.refs.get(name).map(String::as_str)
    }

    /// Object id an annotated tag ultimately points to, if recorded.
    pub fn peeled(&self, name: &str) -> Option<&str> {
        self.refs
            .get(&format!("{name}{PEELED_SUFFIX}"))
            .map(String::as_str)
    }

    /// Traits announced by the `# pack-refs with:` header, e.g. `peeled` or `sorted`.
    pub fn traits(&self) -> Vec<&str> {
        self.entries
            .iter()
            .find_map(|entry| match entry {
                PackedRefsEntry::Comment(line) => line.trim_start().strip_prefix(HEADER_PREFIX),
                _ => None,
            })
            .map(|rest| rest.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// `(oid, name)` pairs sorted by name, each peeled tag directly after its tag.
    pub fn advertised(&self) -> Vec<(String, String)> {
        let mut names: Vec<&String> = self
            .refs
            .keys()
            .filter(|name| !name.ends_with(PEELED_SUFFIX))
            .collect();
        names.sort();

        let mut out = Vec::with_capacity(self.refs.len());
        for name in names {
            out.push((self.refs[name].clone(), name.clone()));
            let peeled = format!("{name}{PEELED_SUFFIX}");
            if let Some(oid) = self.refs.get(&peeled) {
                out.push((oid.clone(), peeled));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

fn check_oid(line_no: usize, line: &str, oid: &str) -> Result<(), GitError> {
    if oid.is_empty() || !oid.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(GitError::packed_refs(line_no, line, "object id is not hexadecimal"));
    }
    Ok(())
}

/// Writes the entries back in packed-refs format.
impl fmt::Display for PackedRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            match entry {
                PackedRefsEntry::Comment(line) => writeln!(f, "{line}")?,
                PackedRefsEntry::Ref { name, oid } => writeln!(f, "{oid} {name}")?,
                PackedRefsEntry::Peeled { oid, .. } => writeln!(f, "^{oid}")?,
            }
        }
        Ok(())
    }
}
