//! Descriptors opened for writing on files that look like shared libraries.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{Error, Result};

/// Returns `true` if the first `.so` in `path` is followed by end-of-string
/// or `.`.
///
/// Matches `libfoo.so` and `libfoo.so.1.2`, not `libfoo.sock`. Only the
/// first occurrence counts, so `/x.sox/libbar.so` is not a library.
pub fn looks_like_library(path: &Path) -> bool {
    let bytes = std::os::unix::ffi::OsStrExt::as_bytes(path.as_os_str());
    bytes
        .windows(3)
        .position(|w| w == b".so")
        .is_some_and(|i| matches!(bytes.get(i + 3), None | Some(b'.')))
}

/// Thread-safe `fd → library path` table.
///
/// Keyed by descriptor number, so a close racing with an open that reuses
/// the same number only ever touches that number's entry.
#[derive(Debug, Default)]
pub struct LibraryRegistry {
    /// Tracked descriptors.
    entries: Mutex<HashMap<RawFd, PathBuf>>,
    /// Optional ceiling on tracked descriptors.
    capacity: Option<usize>,
}

impl LibraryRegistry {
    /// Creates an unbounded registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that refuses new descriptors past `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::default(),
            capacity: Some(capacity),
        }
    }

    /// Tracks `fd` if `path` looks like a shared library.
    ///
    /// Returns `Ok(false)` when the path is not library-shaped. Registering
    /// an fd that is already tracked replaces its path.
    pub fn register(&self, fd: RawFd, path: &Path) -> Result<bool> {
        if fd < 0 || !looks_like_library(path) {
            return Ok(false);
        }
        let mut entries = self.lock();
        if let Some(capacity) = self.capacity
            && entries.len() >= capacity
            && !entries.contains_key(&fd)
        {
            return Err(Error::RegistryFull { capacity });
        }
        entries.insert(fd, path.to_path_buf());
        drop(entries);
        tracing::debug!(fd, path = %path.display(), "tracking writable library");
        Ok(true)
    }

    /// Removes and returns the path tracked for `fd`.
    pub fn consume(&self, fd: RawFd) -> Option<PathBuf> {
        self.lock().remove(&fd)
    }

    /// Number of tracked descriptors.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the table, recovering from a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, HashMap<RawFd, PathBuf>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn library_shapes() {
        assert!(looks_like_library(Path::new("/lib/libfoo.so")));
        assert!(looks_like_library(Path::new("/lib/libfoo.so.6")));
        assert!(looks_like_library(Path::new("/lib/libfoo.so.1.2.3")));
        assert!(!looks_like_library(Path::new("/run/app.sock")));
        assert!(!looks_like_library(Path::new("/lib/libfoo.a")));
    }

    #[test]
    fn only_first_so_counts() {
        assert!(!looks_like_library(Path::new("/x.sox/libbar.so")));
        assert!(!looks_like_library(Path::new("/srv/app.sock.d/libbar.so.1")));
        assert!(looks_like_library(Path::new("/opt/lib.so.d/plugin.sock")));
        let registry = LibraryRegistry::new();
        assert!(!registry.register(5, Path::new("/x.sox/libbar.so")).unwrap());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn register_then_consume_once() {
        let reg = LibraryRegistry::new();
        assert!(reg.register(5, Path::new("/lib/libfoo.so")).unwrap());
        assert_eq!(reg.consume(5).as_deref(), Some(Path::new("/lib/libfoo.so")));
        assert_eq!(reg.consume(5), None);
    }

    #[test]
    fn ignores_non_libraries() {
        let reg = LibraryRegistry::new();
        assert!(!reg.register(3, Path::new("/etc/passwd")).unwrap());
        assert!(!reg.register(-1, Path::new("/lib/libfoo.so")).unwrap());
        assert!(reg.is_empty());
    }

    #[test]
    fn duplicate_fd_overwrites() {
        let reg = LibraryRegistry::new();
        reg.register(4, Path::new("/a.so")).unwrap();
        reg.register(4, Path::new("/b.so")).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.consume(4).as_deref(), Some(Path::new("/b.so")));
    }

    #[test]
    fn capacity_is_enforced() {
        let reg = LibraryRegistry::with_capacity(2);
        reg.register(1, Path::new("/1.so")).unwrap();
        reg.register(2, Path::new("/2.so")).unwrap();
        reg.register(2, Path::new("/2b.so")).unwrap();
        let err = reg.register(3, Path::new("/3.so")).unwrap_err();
        assert!(matches!(err, Error::RegistryFull { capacity: 2 }));
        assert_eq!(err.errno(), libc::EMFILE);
    }

    #[test]
    fn concurrent_registration_keeps_every_entry() {
        const THREADS: i32 = 8;
        const FDS: i32 = 1000;
        let reg = Arc::new(LibraryRegistry::new());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for fd in (t..FDS).step_by(THREADS as usize) {
                        reg.register(fd, Path::new(&format!("/lib/lib{fd}.so"))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), FDS as usize);

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    (t..FDS)
                        .step_by(THREADS as usize)
                        .filter(|&fd| {
                            reg.consume(fd).as_deref()
                                == Some(Path::new(&format!("/lib/lib{fd}.so")))
                        })
                        .count()
                })
            })
            .collect();
        let consumed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(consumed, FDS as usize);
        assert!(reg.is_empty());
    }
}
