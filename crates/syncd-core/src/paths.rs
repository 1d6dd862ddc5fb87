//! Virtual realm paths.
//!
//! A virtual path is the client-visible name of a realm, e.g. `/foo/bar`.
//! It maps 1:1 to a real on-disk path under the server root:
//! `<root>/foo/bar.realm` plus an adjacent lock file. Parsing is strict;
//! anything that could escape the root or collide with the `.realm`
//! suffix scheme is rejected.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Reasons a virtual path is rejected. All map to the `illegal_realm_path`
/// protocol error at the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("virtual path must start with '/'")]
    NoLeadingSlash,
    #[error("virtual path has an empty segment")]
    EmptySegment,
    #[error("virtual path segment starts with '.'")]
    DotSegment,
    #[error("virtual path contains an illegal character")]
    IllegalCharacter,
    #[error("virtual path is too long")]
    TooLong,
}

/// Maximum accepted virtual path length, matching the wire limit.
pub const MAX_VIRTUAL_PATH_SIZE: usize = 1024;

const REALM_SUFFIX: &str = ".realm";
const LOCK_SUFFIX: &str = ".realm.lock";

/// A validated, normalized virtual realm path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(String);

impl VirtualPath {
    /// Parse and validate a client-supplied path.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.len() > MAX_VIRTUAL_PATH_SIZE {
            return Err(PathError::TooLong);
        }
        let rest = raw.strip_prefix('/').ok_or(PathError::NoLeadingSlash)?;
        if rest.is_empty() {
            return Err(PathError::EmptySegment);
        }
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(PathError::EmptySegment);
            }
            if segment.starts_with('.') {
                return Err(PathError::DotSegment);
            }
            if !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
            {
                return Err(PathError::IllegalCharacter);
            }
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segments of the path, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// The realm file backing this path under `root`.
    pub fn real_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        let mut segments = self.segments().peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{segment}{REALM_SUFFIX}"));
            }
        }
        path
    }

    /// The lock file adjacent to the realm file.
    pub fn lock_path(&self, root: &Path) -> PathBuf {
        let mut path = self.real_path(root);
        path.set_extension("");
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(LOCK_SUFFIX);
        path.set_file_name(name);
        path
    }
}

impl std::fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remove now-empty ancestor directories of `real_path`, up to but not
/// including `root`. Stops at the first non-empty directory.
pub fn prune_empty_parents(root: &Path, real_path: &Path) -> std::io::Result<()> {
    let mut dir = real_path.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        match std::fs::remove_dir(current) {
            Ok(()) => {}
            // Non-empty or already gone: stop pruning.
            Err(_) => break,
        }
        dir = current.parent();
    }
    Ok(())
}
