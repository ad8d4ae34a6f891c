//! Best-effort ELF interpreter patching through an external tool.
//!
//! Patching never fails the caller: every operation reports a
//! [`PatchOutcome`] and the hosted program carries on regardless.

use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::{Config, PatchSettings};
use crate::host::Host;
use crate::path::{self, MAX_PATH};
use crate::tool::{ToolCommand, ToolRunner};
use crate::Error;

/// Why a patch operation did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SkipReason {
    /// Tool, loader or base is not configured.
    Disabled,
    /// The calling thread is already inside a patch operation.
    Reentrant,
    /// The file has not been modified since the configured cutoff.
    Unmodified,
    /// The file records no absolute interpreter.
    NoInterpreter,
    /// The recorded interpreter is already the configured loader.
    AlreadyPatched,
}

/// Result of a patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
#[non_exhaustive]
pub enum PatchOutcome {
    /// The file was rewritten.
    Patched,
    /// Nothing needed doing.
    Skipped(SkipReason),
    /// The tool failed; the file is left as it was.
    Failed(String),
    /// The tool hung and was killed.
    TimedOut,
}

impl From<Error> for PatchOutcome {
    fn from(err: Error) -> Self {
        match err {
            Error::ToolTimedOut { .. } => Self::TimedOut,
            other => Self::Failed(other.to_string()),
        }
    }
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patched => f.write_str("patched"),
            Self::Skipped(reason) => write!(f, "skipped ({reason:?})"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Outcomes of both passes run on a file written or launched in the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct PatchReport {
    /// [`ElfPatcher::patch_interpreter`].
    pub interpreter: PatchOutcome,
    /// [`ElfPatcher::patch_root_prefix`].
    pub root_prefix: PatchOutcome,
}

impl fmt::Display for PatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interpreter {}, root prefix {}", self.interpreter, self.root_prefix)
    }
}

/// Patch settings resolved on first use.
#[derive(Debug)]
struct Resolved {
    /// Patch tool binary.
    tool: PathBuf,
    /// Canonical loader if absolute, otherwise as configured.
    loader: PathBuf,
    /// Container base.
    base: PathBuf,
    /// Optional rpath.
    rpath: Option<String>,
    /// Modification cutoff.
    not_before: Option<SystemTime>,
}

thread_local! {
    /// Set while this thread runs a patch operation.
    static PATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as patching until dropped.
struct ReentryGuard;

impl ReentryGuard {
    /// Returns `None` if the thread is already patching.
    fn enter() -> Option<Self> {
        PATCHING.with(|p| (!p.replace(true)).then_some(Self))
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        PATCHING.with(|p| p.set(false));
    }
}

/// Rewrites ELF interpreters and rpaths.
#[derive(Debug)]
pub struct ElfPatcher<R> {
    /// Settings as configured.
    settings: PatchSettings,
    /// Container base.
    base: Option<PathBuf>,
    /// Pass `-q` to the tool.
    quiet: bool,
    /// Runs the tool.
    runner: R,
    /// Settings resolved against the host on first use.
    resolved: OnceLock<Option<Resolved>>,
}

impl<R: ToolRunner> ElfPatcher<R> {
    /// Creates a patcher for `config`. Nothing touches the host until the
    /// first patch operation.
    pub fn new(config: &Config, runner: R) -> Self {
        Self {
            settings: config.patch.clone(),
            base: config.base.clone(),
            quiet: !config.debug,
            runner,
            resolved: OnceLock::new(),
        }
    }

    /// Returns the tool runner.
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Returns `true` if patching is configured and the loader resolves.
    pub fn is_enabled(&self, host: &impl Host) -> bool {
        self.resolve(host).is_some()
    }

    /// Points the interpreter of `file` (a host path) at the configured
    /// loader, then sets the configured rpath.
    ///
    /// An absolute loader replaces any different interpreter. A base-relative
    /// loader leaves interpreters already under the base alone and rewrites
    /// the rest to their canonical location under the base.
    pub fn patch_interpreter(&self, host: &impl Host, file: &Path) -> PatchOutcome {
        let Some(_guard) = ReentryGuard::enter() else {
            return PatchOutcome::Skipped(SkipReason::Reentrant);
        };
        let Some(cfg) = self.resolve(host) else {
            return PatchOutcome::Skipped(SkipReason::Disabled);
        };
        if !modified_since(host, file, cfg.not_before) {
            return PatchOutcome::Skipped(SkipReason::Unmodified);
        }

        let print = ToolCommand::new(&cfg.tool)
            .arg("--print-interpreter")
            .path_arg(file);
        let current = match self.runner.run(&print) {
            Ok(current) => PathBuf::from(current),
            Err(e) => return e.into(),
        };
        if !path::is_absolute(&current) {
            return PatchOutcome::Skipped(SkipReason::NoInterpreter);
        }

        let target = if path::is_absolute(&cfg.loader) {
            if current == cfg.loader {
                return PatchOutcome::Skipped(SkipReason::AlreadyPatched);
            }
            cfg.loader.clone()
        } else {
            if path::is_under(&current, &cfg.base) {
                return PatchOutcome::Skipped(SkipReason::AlreadyPatched);
            }
            match host.canonicalize(&path::prefixed(&cfg.base, &current)) {
                Ok(target) => target,
                Err(e) => return PatchOutcome::Failed(format!("{}: {e}", current.display())),
            }
        };

        let set = ToolCommand::new(&cfg.tool)
            .arg("--set-interpreter")
            .path_arg(&target)
            .path_arg(file);
        if let Err(e) = self.runner.run(&set) {
            return e.into();
        }
        if let Some(rpath) = &cfg.rpath {
            let set = ToolCommand::new(&cfg.tool)
                .arg("--set-rpath")
                .arg(rpath.as_str())
                .path_arg(file);
            if let Err(e) = self.runner.run(&set) {
                return e.into();
            }
        }
        tracing::debug!(file = %file.display(), interpreter = %target.display(), "patched interpreter");
        PatchOutcome::Patched
    }

    /// Asks the tool to prefix every absolute path recorded in `file` (a host
    /// path) with the base.
    pub fn patch_root_prefix(&self, host: &impl Host, file: &Path) -> PatchOutcome {
        let Some(_guard) = ReentryGuard::enter() else {
            return PatchOutcome::Skipped(SkipReason::Reentrant);
        };
        let Some(cfg) = self.resolve(host) else {
            return PatchOutcome::Skipped(SkipReason::Disabled);
        };
        if !modified_since(host, file, cfg.not_before) {
            return PatchOutcome::Skipped(SkipReason::Unmodified);
        }

        let mut cmd = ToolCommand::new(&cfg.tool);
        if self.quiet {
            cmd = cmd.arg("-q");
        }
        let cmd = cmd.arg("--set-root-prefix").path_arg(&cfg.base).path_arg(file);
        match self.runner.run(&cmd) {
            Ok(_) => {
                tracing::debug!(file = %file.display(), "patched root prefix");
                PatchOutcome::Patched
            }
            Err(e) => e.into(),
        }
    }

    /// Runs both passes on `file`: the interpreter first, then the root
    /// prefix. Each pass reports on its own.
    pub fn patch_file(&self, host: &impl Host, file: &Path) -> PatchReport {
        PatchReport {
            interpreter: self.patch_interpreter(host, file),
            root_prefix: self.patch_root_prefix(host, file),
        }
    }

    /// Resolves settings once; `None` disables patching for good.
    fn resolve(&self, host: &impl Host) -> Option<&Resolved> {
        self.resolved
            .get_or_init(|| {
                let resolved = self.try_resolve(host);
                if resolved.is_none() {
                    tracing::debug!("elf patching disabled");
                }
                resolved
            })
            .as_ref()
    }

    /// Builds [`Resolved`] from the configured settings.
    fn try_resolve(&self, host: &impl Host) -> Option<Resolved> {
        let tool = self.settings.tool.clone()?;
        let base = self.base.clone()?;
        let loader = self.settings.loader.clone()?;
        let loader = if path::is_absolute(&loader) {
            host.canonicalize(&loader).ok()?
        } else {
            loader
        };
        let too_long = [tool.as_os_str(), base.as_os_str(), loader.as_os_str()]
            .iter()
            .any(|s| s.len() >= MAX_PATH)
            || self.settings.rpath.as_ref().is_some_and(|r| r.len() >= MAX_PATH);
        if too_long {
            return None;
        }
        Some(Resolved {
            tool,
            loader,
            base,
            rpath: self.settings.rpath.clone(),
            not_before: self
                .settings
                .not_before
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        })
    }
}

/// Returns `false` if `file` predates `cutoff` or cannot be stat'ed.
fn modified_since(host: &impl Host, file: &Path, cutoff: Option<SystemTime>) -> bool {
    let Some(cutoff) = cutoff else {
        return true;
    };
    host.modified(file).is_ok_and(|mtime| mtime >= cutoff)
}
