//! The engine context shared by every interposed call.

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::host::{Host, OsHost};
use crate::patch::{ElfPatcher, PatchOutcome, PatchReport};
use crate::registry::LibraryRegistry;
use crate::spawn::{SpawnPlan, SpawnRewriter};
use crate::tool::{ProcessRunner, ToolRunner};
use crate::translate::Translator;
use crate::Result;

/// Configuration, host access, library tracking and patching in one place.
///
/// Construct one per process and share it by reference.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use vroot::{Config, Engine};
///
/// let engine = Engine::new(Config::builder().base("/srv/rootfs").build().unwrap());
/// let host = engine.translate_path(Path::new("/etc/hosts"), None, true).unwrap();
/// assert_eq!(host, Path::new("/srv/rootfs/etc/hosts"));
/// assert_eq!(engine.to_container(&host), Path::new("/etc/hosts"));
/// ```
#[derive(Debug)]
pub struct Engine<H = OsHost, R = ProcessRunner> {
    /// Immutable configuration.
    config: Config,
    /// Host primitives.
    host: H,
    /// Writable libraries awaiting close.
    registry: LibraryRegistry,
    /// Interpreter patching.
    patcher: ElfPatcher<R>,
}

impl Engine {
    /// Creates an engine on the real host.
    pub fn new(config: Config) -> Self {
        Self::with_parts(config, OsHost, ProcessRunner::default())
    }

    /// Creates an engine configured from the process environment.
    pub fn from_env() -> Result<Self> {
        Config::from_env().map(Self::new)
    }
}

impl<H: Host, R: ToolRunner> Engine<H, R> {
    /// Creates an engine from explicit parts.
    pub fn with_parts(config: Config, host: H, runner: R) -> Self {
        let patcher = ElfPatcher::new(&config, runner);
        Self {
            config,
            host,
            registry: LibraryRegistry::new(),
            patcher,
        }
    }

    /// Returns the configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the host.
    pub const fn host(&self) -> &H {
        &self.host
    }

    /// Returns the writable-library registry.
    pub const fn registry(&self) -> &LibraryRegistry {
        &self.registry
    }

    /// Returns the patcher.
    pub const fn patcher(&self) -> &ElfPatcher<R> {
        &self.patcher
    }

    /// Returns a translator over this engine's configuration.
    pub const fn translator(&self) -> Translator<'_, H> {
        Translator::new(&self.config, &self.host)
    }

    /// Translates a path argument of an intercepted call.
    ///
    /// `dirfd` is the directory descriptor of an `*at` call.
    pub fn translate_path(&self, path: &Path, dirfd: Option<RawFd>, follow: bool) -> Result<PathBuf> {
        self.translator().to_host_at(path, dirfd, follow)
    }

    /// Translates a host path back to the container view.
    pub fn to_container(&self, host: &Path) -> PathBuf {
        self.translator().to_container(host)
    }

    /// Rewrites a process-creation request.
    pub fn rewrite_spawn(
        &self,
        filename: &Path,
        argv: &[OsString],
        envp: &[OsString],
    ) -> Result<SpawnPlan> {
        SpawnRewriter::new(self.translator(), &self.host, &self.patcher).rewrite(filename, argv, envp)
    }

    /// Records a descriptor just opened for writing.
    ///
    /// `path` is the host path opened; when `None` it is discovered from
    /// the descriptor. Returns `true` if the descriptor is now tracked.
    pub fn on_descriptor_opened_for_write(&self, fd: RawFd, path: Option<&Path>) -> bool {
        let discovered;
        let path = match path {
            Some(path) => path,
            None => match self.host.fd_path(fd) {
                Ok(found) => {
                    discovered = found;
                    &discovered
                }
                Err(e) => {
                    tracing::trace!(fd, error = %e, "cannot name descriptor");
                    return false;
                }
            },
        };
        self.registry.register(fd, path).unwrap_or_else(|e| {
            tracing::warn!(fd, path = %path.display(), error = %e, "not tracking writable library");
            false
        })
    }

    /// Handles a successful close: if `fd` was a tracked library, patches
    /// its interpreter and then its root prefix.
    pub fn on_descriptor_closed(&self, fd: RawFd) -> Option<PatchReport> {
        let path = self.registry.consume(fd)?;
        let report = self.patcher.patch_file(&self.host, &path);
        tracing::debug!(fd, path = %path.display(), %report, "closed writable library");
        Some(report)
    }

    /// Prefixes the absolute paths recorded in a host ELF file with the base.
    pub fn patch_root_prefix(&self, file: &Path) -> PatchOutcome {
        self.patcher.patch_root_prefix(&self.host, file)
    }
}
