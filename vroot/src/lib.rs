//! Path virtualization for running programs inside a fake root.
//!
//! `vroot` is the engine behind an `LD_PRELOAD` fake chroot: it turns the
//! paths a hosted program uses into host paths under a base directory
//! (honouring excluded prefixes and volume mappings), resolves symlinks
//! without leaving the container, rewrites process creation so scripts,
//! ELF binaries and external loaders start correctly, and patches ELF
//! interpreters through an external tool.
//!
//! # Quick start
//!
//! ```
//! use std::path::Path;
//! use vroot::{Config, Engine};
//!
//! let config = Config::builder()
//!     .base("/srv/rootfs")
//!     .exclude("/proc")
//!     .map("/home/me/project", "/work")
//!     .build()
//!     .unwrap();
//! let engine = Engine::new(config);
//!
//! let translate = |p: &str| engine.translate_path(Path::new(p), None, true).unwrap();
//! assert_eq!(translate("/etc/os-release"), Path::new("/srv/rootfs/etc/os-release"));
//! assert_eq!(translate("/proc/cpuinfo"), Path::new("/proc/cpuinfo"));
//! assert_eq!(translate("/work/src"), Path::new("/home/me/project/src"));
//! ```
//!
//! The crate holds no process-wide state; the preload library owns the
//! single [`Engine`] of a process.

mod canonical;
pub mod config;
mod engine;
pub mod environ;
mod error;
mod host;
pub mod logging;
pub mod path;
mod patch;
mod registry;
mod spawn;
mod subst;
mod tool;
mod translate;

pub use canonical::{MAX_LINKS, ReadLink, canonicalize};
pub use config::{Config, ConfigBuilder, MapEntry, PatchSettings};
pub use engine::Engine;
pub use error::{Error, Result};
pub use host::{Host, OsHost};
pub use patch::{ElfPatcher, PatchOutcome, PatchReport, SkipReason};
pub use registry::{LibraryRegistry, looks_like_library};
pub use spawn::{SpawnKind, SpawnPlan, SpawnRewriter, parse_shebang};
pub use subst::{CmdSubstTable, Substitution};
pub use tool::{DEFAULT_TIMEOUT, ProcessRunner, ToolCommand, ToolRunner};
pub use translate::Translator;

/// Version reported by the detection handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
