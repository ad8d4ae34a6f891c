//! Symlink-aware canonicalization of container paths.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::path::{self, MAX_PATH};
use crate::{Error, Result};

/// Symlinks followed before resolution fails with [`Error::SymlinkLoop`].
pub const MAX_LINKS: usize = 40;

/// Reads symlinks in container space.
pub trait ReadLink {
    /// Returns the container-view target of `path`, or `None` if it is not a
    /// symlink or cannot be read.
    fn read_link(&self, path: &Path) -> Option<PathBuf>;
}

/// Resolves every symlink in an absolute container path.
///
/// Components are walked left to right against a resolved prefix that
/// starts at `/`. An absolute link target restarts from `/`; a relative one
/// replaces the link's own component. `.` and `..` are applied as they are
/// reached, so `..` after a link climbs from the link's target.
///
/// With `follow_last == false` the final component is left unresolved.
/// Relative input is returned unchanged, as is any path whose walk would
/// exceed [`MAX_PATH`].
pub fn canonicalize(path: &Path, follow_last: bool, links: &impl ReadLink) -> Result<PathBuf> {
    if !path::is_absolute(path) || path.as_os_str().len() >= MAX_PATH {
        return Ok(path.to_path_buf());
    }

    let mut pending: VecDeque<Vec<u8>> = components(path.as_os_str().as_bytes()).collect();
    let mut resolved: Vec<Vec<u8>> = Vec::new();
    let mut followed = 0;

    while let Some(part) = pending.pop_front() {
        match part.as_slice() {
            b"." => continue,
            b".." => {
                resolved.pop();
                continue;
            }
            _ => resolved.push(part),
        }
        if pending.is_empty() && !follow_last {
            break;
        }

        let current = join(&resolved);
        if current.as_os_str().len() >= MAX_PATH {
            return Ok(path.to_path_buf());
        }
        let Some(target) = links.read_link(&current) else {
            continue;
        };
        let target = target.as_os_str().as_bytes();
        if target.is_empty() {
            continue;
        }

        followed += 1;
        if followed > MAX_LINKS {
            return Err(Error::SymlinkLoop {
                path: path.to_path_buf(),
            });
        }
        tracing::trace!(link = %current.display(), target = %String::from_utf8_lossy(target), "following symlink");

        resolved.pop();
        if target.first() == Some(&b'/') {
            resolved.clear();
        }
        for part in components(target).rev() {
            pending.push_front(part);
        }
        if pending.iter().map(|p| p.len() + 1).sum::<usize>() >= MAX_PATH {
            return Ok(path.to_path_buf());
        }
    }

    Ok(join(&resolved))
}

/// Non-empty components of a path.
fn components(path: &[u8]) -> impl DoubleEndedIterator<Item = Vec<u8>> + '_ {
    path.split(|&b| b == b'/')
        .filter(|p| !p.is_empty())
        .map(<[u8]>::to_vec)
}

/// Joins resolved components into an absolute path.
fn join(parts: &[Vec<u8>]) -> PathBuf {
    if parts.is_empty() {
        return PathBuf::from("/");
    }
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        out.push(b'/');
        out.extend_from_slice(part);
    }
    PathBuf::from(OsStr::from_bytes(&out))
}
