//! Process-wide configuration, read once from `FAKECHROOT_*` variables.
//!
//! A [`Config`] is an immutable snapshot: every component borrows it and
//! nothing mutates it after construction. Use [`Config::from_env`] inside a
//! preloaded process and [`Config::builder`] everywhere else.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::path;
use crate::subst::CmdSubstTable;
use crate::{Error, Result};

/// Names of the environment variables the engine understands.
pub mod vars {
    /// Host directory acting as the container root.
    pub const BASE: &str = "FAKECHROOT_BASE";
    /// Base of the parent process after a command substitution.
    pub const BASE_ORIG: &str = "FAKECHROOT_BASE_ORIG";
    /// Colon-separated prefixes passed through untranslated.
    pub const EXCLUDE_PATH: &str = "FAKECHROOT_EXCLUDE_PATH";
    /// Colon-separated `host!container` volume mappings.
    pub const DIR_MAP: &str = "FAKECHROOT_DIR_MAP";
    /// Colon-separated `command=replacement` pairs.
    pub const CMD_SUBST: &str = "FAKECHROOT_CMD_SUBST";
    /// Set in the child of a substituted command.
    pub const CMD_ORIG: &str = "FAKECHROOT_CMD_ORIG";
    /// Enables symlink-aware canonicalization.
    pub const EXPAND_SYMLINKS: &str = "FAKECHROOT_EXPAND_SYMLINKS";
    /// External dynamic loader used as the process entry point.
    pub const ELFLOADER: &str = "FAKECHROOT_ELFLOADER";
    /// Option the elfloader takes to override `argv[0]`.
    pub const ELFLOADER_OPT_ARGV0: &str = "FAKECHROOT_ELFLOADER_OPT_ARGV0";
    /// Freezes preserved variables against caller overrides.
    pub const DISALLOW_ENV_CHANGES: &str = "FAKECHROOT_DISALLOW_ENV_CHANGES";
    /// Untranslated library search path appended to `LD_LIBRARY_REAL`.
    pub const LIBRARY_ORIG: &str = "FAKECHROOT_LIBRARY_ORIG";
    /// Path of the `patchelf` binary.
    pub const PATCH_PATCHELF: &str = "FAKECHROOT_PATCH_PATCHELF";
    /// Loader written into patched binaries.
    pub const PATCH_ELFLOADER: &str = "FAKECHROOT_PATCH_ELFLOADER";
    /// Rpath written into patched binaries.
    pub const PATCH_RPATH: &str = "FAKECHROOT_PATCH_RPATH";
    /// Epoch seconds; files not modified since are left alone.
    pub const PATCH_LAST_TIME: &str = "FAKECHROOT_PATCH_LAST_TIME";
    /// Enables debug logging.
    pub const DEBUG: &str = "FAKECHROOT_DEBUG";
    /// Makes the preload library announce itself and exit.
    pub const DETECT: &str = "FAKECHROOT_DETECT";
    /// Always `true` in spawned children.
    pub const FAKECHROOT: &str = "FAKECHROOT";
    /// Library search path of the dynamic loader.
    pub const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";
    /// Base-prefixed copy of `LD_LIBRARY_PATH`.
    pub const LD_LIBRARY_REAL: &str = "LD_LIBRARY_REAL";
    /// Libraries the dynamic loader injects.
    pub const LD_PRELOAD: &str = "LD_PRELOAD";
}

/// Variables carried from the initial environment into every spawned child.
pub const PRESERVED_VARS: &[&str] = &[
    vars::BASE,
    vars::CMD_SUBST,
    vars::DEBUG,
    vars::DETECT,
    vars::ELFLOADER,
    vars::ELFLOADER_OPT_ARGV0,
    vars::EXCLUDE_PATH,
    "FAKECHROOT_VERSION",
    "FAKEROOTKEY",
    "FAKED_MODE",
    vars::LD_PRELOAD,
    vars::LD_LIBRARY_REAL,
    "LD_DEBUG",
    vars::LIBRARY_ORIG,
    vars::PATCH_PATCHELF,
    vars::PATCH_ELFLOADER,
    vars::PATCH_RPATH,
    vars::DIR_MAP,
    vars::DISALLOW_ENV_CHANGES,
    vars::PATCH_LAST_TIME,
    vars::EXPAND_SYMLINKS,
];

/// A volume mapping between a host prefix and a container prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct MapEntry {
    /// Absolute host directory.
    pub host: PathBuf,
    /// Absolute directory the container sees.
    pub container: PathBuf,
}

impl MapEntry {
    /// Creates a mapping; both sides must be absolute.
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Result<Self> {
        let host = absolute_prefix(&host.into(), vars::DIR_MAP)?;
        let container = absolute_prefix(&container.into(), vars::DIR_MAP)?;
        Ok(Self { host, container })
    }

    /// Parses `host!container`, or a bare `dir` mapping to itself.
    pub fn parse(entry: &str) -> Result<Self> {
        match entry.split_once('!') {
            Some((host, container)) => Self::new(host, container),
            None => Self::new(entry, entry),
        }
    }
}

/// Settings for the external ELF patch tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct PatchSettings {
    /// Path of the patch tool binary.
    pub tool: Option<PathBuf>,
    /// Loader to record as interpreter; absolute, or relative to the base.
    pub loader: Option<PathBuf>,
    /// Rpath to record after the interpreter.
    pub rpath: Option<String>,
    /// Epoch seconds; files last modified earlier are skipped.
    pub not_before: Option<u64>,
}

/// Immutable engine configuration.
#[derive(Debug, Clone, Default, Serialize)]
#[non_exhaustive]
pub struct Config {
    /// Host directory acting as `/`. `None` disables translation.
    pub base: Option<PathBuf>,
    /// Prefixes accessed as literal host paths.
    pub exclude: Vec<PathBuf>,
    /// Volume mappings, first match wins.
    pub dir_map: Vec<MapEntry>,
    /// Resolve symlinks component by component before prefixing.
    pub expand_symlinks: bool,
    /// Command substitutions applied before spawning.
    pub cmd_subst: CmdSubstTable,
    /// Snapshot of [`PRESERVED_VARS`] taken at load time.
    pub preserved_env: BTreeMap<String, String>,
    /// When set, preserved variables override caller values.
    pub disallow_env_changes: bool,
    /// External loader to run binaries through.
    pub elfloader: Option<PathBuf>,
    /// Elfloader option that sets `argv[0]`, e.g. `--argv0`.
    pub elfloader_argv0: Option<String>,
    /// Library path appended to the derived `LD_LIBRARY_REAL`.
    pub library_orig: Option<String>,
    /// ELF patching settings.
    pub patch: PatchSettings,
    /// Debug logging requested.
    pub debug: bool,
}

impl Config {
    /// Returns a builder with translation disabled and nothing configured.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reads the configuration from the live process environment.
    ///
    /// Variables that are not valid UTF-8 are ignored.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Reads the configuration from `(name, value)` pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| env.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let mut b = Self::builder();
        if let Some(base) = get(vars::BASE) {
            b = b.base(path::trim_trailing(base));
        }
        for entry in list(get(vars::EXCLUDE_PATH)) {
            b = b.exclude(entry);
        }
        for entry in list(get(vars::DIR_MAP)) {
            b.dir_map.push(MapEntry::parse(entry)?);
        }
        if let Some(table) = get(vars::CMD_SUBST) {
            b.cmd_subst = CmdSubstTable::parse(table)?;
        }
        b.expand_symlinks = env
            .get(vars::EXPAND_SYMLINKS)
            .is_some_and(|v| !v.starts_with("false"));
        b.disallow_env_changes = get(vars::DISALLOW_ENV_CHANGES).is_some();
        b.elfloader = get(vars::ELFLOADER).map(PathBuf::from);
        b.elfloader_argv0 = get(vars::ELFLOADER_OPT_ARGV0).map(str::to_owned);
        b.library_orig = get(vars::LIBRARY_ORIG).map(str::to_owned);
        b.patch.tool = get(vars::PATCH_PATCHELF).map(PathBuf::from);
        b.patch.loader = get(vars::PATCH_ELFLOADER).map(PathBuf::from);
        b.patch.rpath = get(vars::PATCH_RPATH).map(str::to_owned);
        if let Some(secs) = get(vars::PATCH_LAST_TIME) {
            let secs = secs.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{}: not a timestamp: {secs}", vars::PATCH_LAST_TIME))
            })?;
            b.patch.not_before = Some(secs);
        }
        b.debug = get(vars::DEBUG).is_some();
        for &key in PRESERVED_VARS {
            if let Some(value) = env.get(key) {
                b.preserved_env.insert(key.to_owned(), value.clone());
            }
        }
        b.build()
    }

    /// Returns `true` when a base is configured and paths are rewritten.
    pub const fn is_active(&self) -> bool {
        self.base.is_some()
    }

    /// Renders the configuration back into `FAKECHROOT_*` variables.
    ///
    /// Only variables with a value are emitted; feeding the result to
    /// [`Config::from_vars`] reproduces an equivalent configuration.
    pub fn to_vars(&self) -> Vec<(String, String)> {
        fn join<'a>(items: impl Iterator<Item = std::borrow::Cow<'a, str>>) -> String {
            items.collect::<Vec<_>>().join(":")
        }
        let mut out = Vec::new();
        let mut put = |key: &str, value: String| {
            if !value.is_empty() {
                out.push((key.to_owned(), value));
            }
        };

        if let Some(base) = &self.base {
            put(vars::BASE, base.to_string_lossy().into_owned());
        }
        put(vars::EXCLUDE_PATH, join(self.exclude.iter().map(|p| p.to_string_lossy())));
        put(
            vars::DIR_MAP,
            join(self.dir_map.iter().map(|m| {
                format!("{}!{}", m.host.display(), m.container.display()).into()
            })),
        );
        put(vars::CMD_SUBST, self.cmd_subst.to_string());
        if self.expand_symlinks {
            put(vars::EXPAND_SYMLINKS, "true".to_owned());
        }
        if self.disallow_env_changes {
            put(vars::DISALLOW_ENV_CHANGES, "1".to_owned());
        }
        if let Some(loader) = &self.elfloader {
            put(vars::ELFLOADER, loader.to_string_lossy().into_owned());
        }
        put(vars::ELFLOADER_OPT_ARGV0, self.elfloader_argv0.clone().unwrap_or_default());
        put(vars::LIBRARY_ORIG, self.library_orig.clone().unwrap_or_default());
        if let Some(tool) = &self.patch.tool {
            put(vars::PATCH_PATCHELF, tool.to_string_lossy().into_owned());
        }
        if let Some(loader) = &self.patch.loader {
            put(vars::PATCH_ELFLOADER, loader.to_string_lossy().into_owned());
        }
        put(vars::PATCH_RPATH, self.patch.rpath.clone().unwrap_or_default());
        if let Some(secs) = self.patch.not_before {
            put(vars::PATCH_LAST_TIME, secs.to_string());
        }
        if self.debug {
            put(vars::DEBUG, "1".to_owned());
        }
        out
    }
}

/// Builder for [`Config`].
///
/// # Example
///
/// ```
/// use vroot::Config;
///
/// let config = Config::builder()
///     .base("/srv/rootfs")
///     .exclude("/proc")
///     .map("/home/user/data", "/data")
///     .expand_symlinks(true)
///     .build()
///     .unwrap();
/// assert!(config.is_active());
/// ```
#[derive(Debug, Default)]
#[must_use = "a ConfigBuilder does nothing until .build() is called"]
pub struct ConfigBuilder {
    /// Container root on the host.
    base: Option<PathBuf>,
    /// Untranslated prefixes.
    exclude: Vec<PathBuf>,
    /// Volume mappings.
    dir_map: Vec<MapEntry>,
    /// Symlink expansion toggle.
    expand_symlinks: bool,
    /// Command substitutions.
    cmd_subst: CmdSubstTable,
    /// Preserved variable snapshot.
    preserved_env: BTreeMap<String, String>,
    /// Environment lock.
    disallow_env_changes: bool,
    /// Elfloader path.
    elfloader: Option<PathBuf>,
    /// Elfloader argv0 option.
    elfloader_argv0: Option<String>,
    /// Original library path.
    library_orig: Option<String>,
    /// Patch tool settings.
    patch: PatchSettings,
    /// Debug logging.
    debug: bool,
}

impl ConfigBuilder {
    /// Sets the host directory that acts as the container root.
    pub fn base(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Adds a prefix accessed without translation.
    pub fn exclude(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.exclude.push(prefix.into());
        self
    }

    /// Adds a volume mapping; earlier mappings win on overlap.
    pub fn map(mut self, host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        self.dir_map.push(MapEntry {
            host: host.into(),
            container: container.into(),
        });
        self
    }

    /// Adds a command substitution.
    pub fn subst(mut self, command: impl Into<PathBuf>, replacement: impl Into<PathBuf>) -> Self {
        self.cmd_subst.push(command, replacement);
        self
    }

    /// Enables symlink-aware canonicalization (default: off).
    pub const fn expand_symlinks(mut self, on: bool) -> Self {
        self.expand_symlinks = on;
        self
    }

    /// Records a preserved variable as if it were in the initial environment.
    pub fn preserve(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.preserved_env.insert(key.into(), value.into());
        self
    }

    /// Lets preserved variables override caller-supplied values.
    pub const fn disallow_env_changes(mut self, on: bool) -> Self {
        self.disallow_env_changes = on;
        self
    }

    /// Runs every spawned binary through `loader`.
    pub fn elfloader(mut self, loader: impl Into<PathBuf>) -> Self {
        self.elfloader = Some(loader.into());
        self
    }

    /// Sets the elfloader option that overrides `argv[0]`.
    pub fn elfloader_argv0(mut self, option: impl Into<String>) -> Self {
        self.elfloader_argv0 = Some(option.into());
        self
    }

    /// Sets the library path appended to the derived `LD_LIBRARY_REAL`.
    pub fn library_orig(mut self, paths: impl Into<String>) -> Self {
        self.library_orig = Some(paths.into());
        self
    }

    /// Sets the patch tool binary.
    pub fn patchelf(mut self, tool: impl Into<PathBuf>) -> Self {
        self.patch.tool = Some(tool.into());
        self
    }

    /// Sets the loader recorded into patched binaries.
    pub fn patch_loader(mut self, loader: impl Into<PathBuf>) -> Self {
        self.patch.loader = Some(loader.into());
        self
    }

    /// Sets the rpath recorded into patched binaries.
    pub fn patch_rpath(mut self, rpath: impl Into<String>) -> Self {
        self.patch.rpath = Some(rpath.into());
        self
    }

    /// Skips patching files not modified since `secs` (epoch seconds).
    pub const fn patch_not_before(mut self, secs: u64) -> Self {
        self.patch.not_before = Some(secs);
        self
    }

    /// Enables debug logging.
    pub const fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    /// Validates and freezes the configuration.
    pub fn build(self) -> Result<Config> {
        let base = match self.base {
            Some(base) => {
                let trimmed = path::trim_trailing(&base.to_string_lossy()).to_owned();
                Some(absolute_prefix(Path::new(&trimmed), vars::BASE)?)
            }
            None => None,
        };
        let exclude = self
            .exclude
            .iter()
            .map(|p| absolute_prefix(p, vars::EXCLUDE_PATH))
            .collect::<Result<Vec<_>>>()?;
        let dir_map = self
            .dir_map
            .into_iter()
            .map(|m| MapEntry::new(m.host, m.container))
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            base,
            exclude,
            dir_map,
            expand_symlinks: self.expand_symlinks,
            cmd_subst: self.cmd_subst,
            preserved_env: self.preserved_env,
            disallow_env_changes: self.disallow_env_changes,
            elfloader: self.elfloader,
            elfloader_argv0: self.elfloader_argv0,
            library_orig: self.library_orig,
            patch: self.patch,
            debug: self.debug,
        })
    }
}

/// Splits a colon-separated list, dropping empty entries.
fn list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default().split(':').filter(|s| !s.is_empty())
}

/// Normalizes a configured prefix and rejects relative ones.
fn absolute_prefix(prefix: &Path, var: &str) -> Result<PathBuf> {
    if !path::is_absolute(prefix) {
        return Err(Error::InvalidConfig(format!(
            "{var}: {} is not an absolute path",
            prefix.display()
        )));
    }
    Ok(path::normalize(prefix))
}
