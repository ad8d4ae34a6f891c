//! Bounded path primitives shared by every layer of the engine.
//!
//! Prefix tests here are component-aware: `/foobar` is not under `/foo`.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Maximum length of any path the engine produces, in bytes.
pub const MAX_PATH: usize = libc::PATH_MAX as usize;

/// Fails with [`Error::PathTooLong`] if `path` does not fit in [`MAX_PATH`].
pub fn check_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_PATH {
        return Err(Error::PathTooLong { len, max: MAX_PATH });
    }
    Ok(())
}

/// Lexically normalizes a path.
///
/// Collapses repeated slashes, drops `.` components and resolves `..`
/// against the preceding component. A `..` at the root is dropped; a
/// leading `..` in a relative path is kept. An empty result becomes `/` for
/// absolute input and `.` otherwise.
pub fn normalize(path: &Path) -> PathBuf {
    let bytes = path.as_os_str().as_bytes();
    let absolute = bytes.first() == Some(&b'/');

    let mut stack: Vec<&[u8]> = Vec::new();
    for part in bytes.split(|&b| b == b'/') {
        match part {
            b"" | b"." => {}
            b".." => match stack.last() {
                Some(&top) if top != b".." => {
                    stack.pop();
                }
                _ if absolute => {}
                _ => stack.push(part),
            },
            _ => stack.push(part),
        }
    }

    let mut out = Vec::with_capacity(bytes.len());
    if absolute {
        out.push(b'/');
    }
    for (i, part) in stack.iter().enumerate() {
        if i > 0 {
            out.push(b'/');
        }
        out.extend_from_slice(part);
    }
    if out.is_empty() {
        out.push(b'.');
    }
    PathBuf::from(OsStr::from_bytes(&out))
}

/// Returns `true` if `path` equals `prefix` or lies beneath it.
pub fn is_under(path: &Path, prefix: &Path) -> bool {
    suffix_after(path, prefix).is_some()
}

/// Returns the part of `path` after `prefix`, including its leading `/`.
///
/// The suffix is empty on an exact match. `None` if `path` is not under
/// `prefix`.
pub fn suffix_after<'p>(path: &'p Path, prefix: &Path) -> Option<&'p [u8]> {
    let path = path.as_os_str().as_bytes();
    let prefix = prefix.as_os_str().as_bytes();
    if prefix == b"/" {
        return path.first().is_some_and(|&b| b == b'/').then_some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    match rest.first() {
        None | Some(b'/') => Some(rest),
        Some(_) => None,
    }
}

/// Replaces `from` at the start of `path` with `to`.
///
/// `None` if `path` is not under `from`. Replacing onto `/` keeps the suffix
/// absolute; an empty result collapses to `/`.
pub fn rebase(path: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
    let suffix = suffix_after(path, from)?;
    Some(concat(to, suffix))
}

/// Appends an absolute container path to a host prefix (`/` maps to the prefix itself).
pub fn prefixed(prefix: &Path, absolute: &Path) -> PathBuf {
    let suffix = absolute.as_os_str().as_bytes();
    if suffix == b"/" {
        return prefix.to_path_buf();
    }
    concat(prefix, suffix)
}

/// Joins a prefix and a suffix that is either empty or starts with `/`.
fn concat(prefix: &Path, suffix: &[u8]) -> PathBuf {
    let head = prefix.as_os_str().as_bytes();
    let head = if head == b"/" && !suffix.is_empty() {
        &[][..]
    } else {
        head
    };
    let mut out = Vec::with_capacity(head.len() + suffix.len());
    out.extend_from_slice(head);
    out.extend_from_slice(suffix);
    if out.is_empty() {
        out.push(b'/');
    }
    PathBuf::from(OsStr::from_bytes(&out))
}

/// Strips trailing slashes and spaces, leaving a lone `/` intact.
pub fn trim_trailing(raw: &str) -> &str {
    let trimmed = raw.trim_end_matches(['/', ' ']);
    if trimmed.is_empty() && raw.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Returns `true` if the path starts with `/`.
pub fn is_absolute(path: &Path) -> bool {
    path.as_os_str().as_bytes().first() == Some(&b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(s: &str) -> String {
        normalize(Path::new(s)).to_string_lossy().into_owned()
    }

    #[test]
    fn normalize_collapses_dots_and_slashes() {
        assert_eq!(norm("/a//b/../c/./"), "/a/c");
        assert_eq!(norm("///../home//u/tmp/aa/0/../X/"), "/home/u/tmp/aa/X");
        assert_eq!(norm("/.."), "/");
        assert_eq!(norm("/a/b/.."), "/a");
    }

    #[test]
    fn normalize_keeps_unresolvable_dotdot() {
        assert_eq!(norm("../x"), "../x");
        assert_eq!(norm("a/../../x"), "../x");
        assert_eq!(norm("./y"), "y");
    }

    #[test]
    fn normalize_empty() {
        assert_eq!(norm(""), ".");
        assert_eq!(norm("/"), "/");
        assert_eq!(norm("a/.."), ".");
    }

    #[test]
    fn prefix_requires_component_boundary() {
        assert!(is_under(Path::new("/foo"), Path::new("/foo")));
        assert!(is_under(Path::new("/foo/bar"), Path::new("/foo")));
        assert!(!is_under(Path::new("/foobar"), Path::new("/foo")));
        assert!(is_under(Path::new("/anything"), Path::new("/")));
        assert!(!is_under(Path::new("rel"), Path::new("/")));
    }

    #[test]
    fn rebase_swaps_prefixes() {
        let out = rebase(Path::new("/data/x/y"), Path::new("/data"), Path::new("/mnt/vol"));
        assert_eq!(out.as_deref(), Some(Path::new("/mnt/vol/x/y")));

        let exact = rebase(Path::new("/data"), Path::new("/data"), Path::new("/mnt/vol"));
        assert_eq!(exact.as_deref(), Some(Path::new("/mnt/vol")));

        let to_root = rebase(Path::new("/base"), Path::new("/base"), Path::new("/"));
        assert_eq!(to_root.as_deref(), Some(Path::new("/")));

        let from_root = rebase(Path::new("/etc"), Path::new("/"), Path::new("/srv"));
        assert_eq!(from_root.as_deref(), Some(Path::new("/srv/etc")));

        assert!(rebase(Path::new("/database"), Path::new("/data"), Path::new("/m")).is_none());
    }

    #[test]
    fn prefixed_collapses_root() {
        assert_eq!(prefixed(Path::new("/base"), Path::new("/")), Path::new("/base"));
        assert_eq!(
            prefixed(Path::new("/base"), Path::new("/etc/passwd")),
            Path::new("/base/etc/passwd")
        );
    }

    #[test]
    fn trim_trailing_slashes() {
        assert_eq!(trim_trailing("/srv/root// "), "/srv/root");
        assert_eq!(trim_trailing("///"), "/");
        assert_eq!(trim_trailing("/srv"), "/srv");
    }

    #[test]
    fn check_len_bounds() {
        assert!(check_len(Path::new("/short")).is_ok());
        let long = PathBuf::from(format!("/{}", "a".repeat(MAX_PATH)));
        assert!(matches!(check_len(&long), Err(Error::PathTooLong { .. })));
    }
}
