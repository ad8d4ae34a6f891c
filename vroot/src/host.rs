//! Access to the real host the engine runs on.
//!
//! Everything the engine needs from the operating system goes through
//! [`Host`], so translation and spawn planning can be tested against an
//! in-memory fake.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Host primitives used by the engine.
///
/// All paths passed in are host paths.
pub trait Host: Send + Sync {
    /// Returns the target of the symlink at `path`.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Returns the host working directory.
    fn current_dir(&self) -> io::Result<PathBuf>;

    /// Returns the host path an open descriptor refers to.
    fn fd_path(&self, fd: RawFd) -> io::Result<PathBuf>;

    /// Reads at most `max` leading bytes of a file.
    fn read_header(&self, path: &Path, max: usize) -> io::Result<Vec<u8>>;

    /// Returns the modification time of a file.
    fn modified(&self, path: &Path) -> io::Result<SystemTime>;

    /// Resolves a host path to its canonical form.
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Reads a variable from the live environment.
    fn var(&self, key: &str) -> Option<String>;
}

/// The real operating system.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct OsHost;

impl Host for OsHost {
    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn current_dir(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn fd_path(&self, fd: RawFd) -> io::Result<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{fd}"))
    }

    fn read_header(&self, path: &Path, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(max.min(crate::path::MAX_PATH));
        File::open(path)?.take(max as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        std::fs::metadata(path)?.modified()
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}
