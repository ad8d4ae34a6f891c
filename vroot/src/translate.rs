//! Container ⇄ host path translation.
//!
//! A container path becomes a host path by one of three routes, checked in
//! order: excluded prefixes pass through untouched, paths under a mapped
//! container prefix are rebased onto the mapped host directory, and
//! everything else is prefixed with the base. [`Translator::to_container`]
//! inverts the last two.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use crate::canonical::{self, ReadLink};
use crate::config::Config;
use crate::host::Host;
use crate::path;
use crate::{Error, Result};

/// Path that never resolves as a link, to keep allocators from recursing
/// into the engine while it initializes.
const MALLOC_CONF: &str = "/etc/malloc.conf";

/// Translates paths for one configuration on one host.
#[derive(Debug)]
pub struct Translator<'a, H> {
    /// Active configuration.
    config: &'a Config,
    /// Host primitives.
    host: &'a H,
}

impl<H> Clone for Translator<'_, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for Translator<'_, H> {}

impl<'a, H: Host> Translator<'a, H> {
    /// Creates a translator borrowing `config` and `host`.
    pub const fn new(config: &'a Config, host: &'a H) -> Self {
        Self { config, host }
    }

    /// Returns the configuration this translator applies.
    pub const fn config(&self) -> &'a Config {
        self.config
    }

    /// Translates a container path to the host path to operate on.
    ///
    /// Relative paths resolve against the working directory. With
    /// `follow == false` a symlink in the final component is not expanded.
    pub fn to_host(&self, path: &Path, follow: bool) -> Result<PathBuf> {
        self.to_host_at(path, None, follow)
    }

    /// Like [`to_host`](Self::to_host), resolving relative paths against the
    /// directory open at `dirfd` (`None` or `AT_FDCWD` use the working
    /// directory).
    pub fn to_host_at(&self, path: &Path, dirfd: Option<RawFd>, follow: bool) -> Result<PathBuf> {
        if !self.config.is_active() || path.as_os_str().is_empty() {
            return Ok(path.to_path_buf());
        }
        let absolute = self.absolute(path, dirfd)?;
        if self.is_excluded(&absolute) {
            return Ok(absolute);
        }

        let resolved = if self.config.expand_symlinks {
            canonical::canonicalize(&absolute, follow, self)?
        } else {
            absolute
        };
        path::check_len(&resolved)?;
        if self.is_excluded(&resolved) {
            return Ok(resolved);
        }

        let host = self.rebase_to_host(&resolved);
        path::check_len(&host)?;
        tracing::trace!(path = %path.display(), host = %host.display(), "to_host");
        Ok(host)
    }

    /// Translates like [`to_host`](Self::to_host) but falls back to the
    /// untranslated path on any error.
    pub fn to_host_lossy(&self, path: &Path, follow: bool) -> PathBuf {
        self.to_host(path, follow).unwrap_or_else(|e| {
            tracing::debug!(path = %path.display(), error = %e, "translation failed, passing through");
            path.to_path_buf()
        })
    }

    /// Translates a host path back to the container view.
    ///
    /// Mapped host directories are checked first, in order, so a mapping
    /// whose host side lies inside the base still narrows to its container
    /// side. Otherwise paths under the base lose the base and anything else
    /// is returned unchanged.
    pub fn to_container(&self, host: &Path) -> PathBuf {
        let Some(base) = &self.config.base else {
            return host.to_path_buf();
        };
        for entry in &self.config.dir_map {
            if let Some(container) = path::rebase(host, &entry.host, &entry.container) {
                return container;
            }
        }
        path::rebase(host, base, Path::new("/")).unwrap_or_else(|| host.to_path_buf())
    }

    /// Returns `true` if the absolute container path is under an excluded
    /// prefix.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.config.exclude.iter().any(|p| path::is_under(path, p))
    }

    /// Reads a symlink and reports its target in container view.
    ///
    /// The link itself is located without symlink expansion. An absolute
    /// target under the base loses the base prefix.
    pub fn read_link(&self, path: &Path) -> Result<PathBuf> {
        if path == Path::new(MALLOC_CONF) {
            return Err(Error::NotFound {
                path: path.to_path_buf(),
            });
        }
        let host = self.to_host_plain(path)?;
        let target = self.host.read_link(&host)?;
        Ok(match &self.config.base {
            Some(base) if path::is_absolute(&target) => {
                path::rebase(&target, base, Path::new("/")).unwrap_or(target)
            }
            _ => target,
        })
    }

    /// Returns the working directory in container view.
    pub fn current_dir(&self) -> Result<PathBuf> {
        Ok(self.to_container(&self.host.current_dir()?))
    }

    /// Translates without symlink expansion.
    fn to_host_plain(&self, path: &Path) -> Result<PathBuf> {
        if !self.config.is_active() {
            return Ok(path.to_path_buf());
        }
        let absolute = self.absolute(path, None)?;
        if self.is_excluded(&absolute) {
            return Ok(absolute);
        }
        let host = self.rebase_to_host(&absolute);
        path::check_len(&host)?;
        Ok(host)
    }

    /// Applies the mapping table or the base prefix to an absolute path.
    fn rebase_to_host(&self, container: &Path) -> PathBuf {
        for entry in &self.config.dir_map {
            if let Some(host) = path::rebase(container, &entry.container, &entry.host) {
                return host;
            }
        }
        match &self.config.base {
            Some(base) if !path::is_under(container, base) => path::prefixed(base, container),
            _ => container.to_path_buf(),
        }
    }

    /// Makes `path` absolute in container space and normalizes it.
    fn absolute(&self, path: &Path, dirfd: Option<RawFd>) -> Result<PathBuf> {
        if path::is_absolute(path) {
            return Ok(path::normalize(path));
        }
        let dir = match dirfd {
            Some(fd) if fd != libc::AT_FDCWD => self.host.fd_path(fd)?,
            _ => self.host.current_dir()?,
        };
        let joined = self.to_container(&dir).join(path);
        path::check_len(&joined)?;
        Ok(path::normalize(&joined))
    }
}

impl<H: Host> ReadLink for Translator<'_, H> {
    fn read_link(&self, path: &Path) -> Option<PathBuf> {
        Self::read_link(self, path).ok()
    }
}
