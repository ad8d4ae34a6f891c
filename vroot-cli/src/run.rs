//! `vroot run`: execute a command inside a fake root.
//!
//! Usage: `vroot run [OPTIONS] -- CMD [ARG...]`

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use vroot::config::vars;
use vroot::environ;
use vroot::{Config, Engine};

/// Environment variable naming the preload library.
const PRELOAD_VAR: &str = "VROOT_PRELOAD";

/// File name of the preload library next to the `vroot` binary.
const PRELOAD_NAME: &str = "libvroot_preload.so";

/// Fake-root options shared by every subcommand.
///
/// Flags are layered over the `FAKECHROOT_*` variables already present in
/// the environment; list flags append to the inherited lists.
#[derive(clap::Args, Debug, Default)]
pub struct RootArgs {
    /// Host directory that becomes `/`.
    #[arg(long)]
    base: Option<PathBuf>,

    /// Prefix accessed as a literal host path.
    #[arg(long, value_name = "PREFIX")]
    exclude: Vec<String>,

    /// Volume mapping (format: hostDir!containerDir).
    #[arg(long, value_name = "HOST!CONTAINER")]
    map: Vec<String>,

    /// Command substitution (format: command=replacement).
    #[arg(long, value_name = "CMD=REPLACEMENT")]
    subst: Vec<String>,

    /// Resolve symlinks inside the root before prefixing.
    #[arg(long)]
    expand_symlinks: bool,

    /// Run every binary through this loader.
    #[arg(long)]
    elfloader: Option<PathBuf>,

    /// Patch tool invoked on written libraries.
    #[arg(long)]
    patchelf: Option<PathBuf>,

    /// Interpreter written into patched binaries.
    #[arg(long)]
    patch_loader: Option<PathBuf>,

    /// Log engine decisions to stderr.
    #[arg(long)]
    debug: bool,
}

impl RootArgs {
    /// Builds the configuration from `env` with the flags layered on top.
    pub fn config_from<I>(&self, env: I) -> Result<Config>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = env.into_iter().collect();
        let mut set = |key: &str, value: String| {
            env.insert(key.to_owned(), value);
        };
        if let Some(base) = &self.base {
            set(vars::BASE, path_str(base)?);
        }
        if let Some(loader) = &self.elfloader {
            set(vars::ELFLOADER, path_str(loader)?);
        }
        if let Some(tool) = &self.patchelf {
            set(vars::PATCH_PATCHELF, path_str(tool)?);
        }
        if let Some(loader) = &self.patch_loader {
            set(vars::PATCH_ELFLOADER, path_str(loader)?);
        }
        if self.expand_symlinks {
            set(vars::EXPAND_SYMLINKS, "true".to_owned());
        }
        if self.debug {
            set(vars::DEBUG, "1".to_owned());
        }
        append(&mut env, vars::EXCLUDE_PATH, &self.exclude);
        append(&mut env, vars::DIR_MAP, &self.map);
        append(&mut env, vars::CMD_SUBST, &self.subst);

        Config::from_vars(env).context("invalid fake-root configuration")
    }

    /// Builds the configuration from the process environment.
    pub fn config(&self) -> Result<Config> {
        self.config_from(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }
}

/// Appends colon-separated entries to a list variable.
fn append(env: &mut BTreeMap<String, String>, key: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let entry = env.entry(key.to_owned()).or_default();
    for item in items {
        if !entry.is_empty() {
            entry.push(':');
        }
        entry.push_str(item);
    }
}

/// Renders a path for an environment variable.
fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_owned)
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

/// Arguments for `vroot run`.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    root: RootArgs,

    /// Preload library to inject (default: $VROOT_PRELOAD, then the file
    /// next to this binary).
    #[arg(long)]
    preload: Option<PathBuf>,

    /// Command to run, as a path inside the root, followed by its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

impl RunArgs {
    /// Replaces the current process with the command. Only returns on error.
    pub fn run(self) -> Result<()> {
        let config = self.root.config()?;
        if !config.is_active() {
            bail!("no base directory: pass --base or set {}", vars::BASE);
        }
        vroot::logging::init(config.debug);
        let preload = find_preload(self.preload.as_deref())?;

        let env = launch_env(std::env::vars_os(), &config, &preload);

        let engine = Engine::new(config);
        let filename = PathBuf::from(&self.command[0]);
        let plan = engine
            .rewrite_spawn(&filename, &self.command, &env)
            .with_context(|| format!("cannot run {}", filename.display()))?;
        tracing::debug!(exec = %plan.exec_path.display(), kind = ?plan.kind, "exec");

        let mut cmd = Command::new(&plan.exec_path);
        if let Some((argv0, rest)) = plan.argv.split_first() {
            cmd.arg0(argv0).args(rest);
        }
        cmd.env_clear();
        for item in &plan.envp {
            if let Some((k, v)) = split_entry(item) {
                cmd.env(k, v);
            }
        }
        let err = cmd.exec();
        Err(err).with_context(|| format!("exec {}", plan.exec_path.display()))
    }
}

/// Locates the preload library.
fn find_preload(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return absolute(path);
    }
    if let Some(path) = std::env::var_os(PRELOAD_VAR).filter(|p| !p.is_empty()) {
        return absolute(Path::new(&path));
    }
    let exe = std::env::current_exe().context("cannot locate the vroot binary")?;
    let sibling = exe.with_file_name(PRELOAD_NAME);
    if sibling.is_file() {
        return Ok(sibling);
    }
    bail!(
        "{PRELOAD_NAME} not found next to {}; pass --preload or set {PRELOAD_VAR}",
        exe.display()
    )
}

/// Makes `path` absolute against the working directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("bad preload path {}", path.display()))
}

/// Builds the environment handed to the command.
///
/// Inherited variables the configuration sets are replaced, not shadowed,
/// so the preload library sees the flag values. `lib` goes in front of any
/// inherited `LD_PRELOAD` entries.
fn launch_env<I>(inherited: I, config: &Config, lib: &Path) -> Vec<OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let configured = config.to_vars();
    let mut preload = lib.as_os_str().to_owned();
    let mut env = Vec::new();
    for (key, value) in inherited {
        if key == vars::LD_PRELOAD {
            if !value.is_empty() {
                preload.push(":");
                preload.push(value);
            }
        } else if !configured.iter().any(|(k, _)| key == k.as_str()) {
            env.push(join(key, &value));
        }
    }
    env.extend(configured.iter().map(|(k, v)| environ::entry(k, v)));
    env.push(environ::entry(vars::LD_PRELOAD, preload));
    env
}

/// Joins an inherited variable back into `key=value`.
fn join(key: OsString, value: &OsStr) -> OsString {
    let mut out = key;
    out.push("=");
    out.push(value);
    out
}

/// Splits `key=value` at the first `=`.
fn split_entry(item: &OsString) -> Option<(OsString, OsString)> {
    let bytes = item.as_bytes();
    let eq = bytes.iter().position(|&b| b == b'=')?;
    let (k, v) = bytes.split_at(eq);
    Some((OsString::from_vec(k.to_vec()), OsString::from_vec(v[1..].to_vec())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn flags_override_environment() {
        let args = RootArgs {
            base: Some("/srv/new".into()),
            debug: true,
            ..RootArgs::default()
        };
        let config = args
            .config_from(env(&[("FAKECHROOT_BASE", "/srv/old"), ("FAKECHROOT_EXCLUDE_PATH", "/proc")]))
            .unwrap();
        assert_eq!(config.base.as_deref(), Some(Path::new("/srv/new")));
        assert_eq!(config.exclude, vec![PathBuf::from("/proc")]);
        assert!(config.debug);
    }

    #[test]
    fn list_flags_append() {
        let args = RootArgs {
            base: Some("/srv/root".into()),
            exclude: vec!["/sys".into()],
            map: vec!["/home/u!/data".into()],
            subst: vec!["/bin/id=/usr/bin/id".into()],
            ..RootArgs::default()
        };
        let config = args
            .config_from(env(&[("FAKECHROOT_EXCLUDE_PATH", "/proc")]))
            .unwrap();
        assert_eq!(config.exclude, vec![PathBuf::from("/proc"), PathBuf::from("/sys")]);
        assert_eq!(config.dir_map[0].container, Path::new("/data"));
        assert_eq!(
            config.cmd_subst.lookup(Path::new("/bin/id")),
            Some(Path::new("/usr/bin/id"))
        );
    }

    #[test]
    fn bad_map_is_reported() {
        let args = RootArgs {
            map: vec!["relative!/data".into()],
            ..RootArgs::default()
        };
        assert!(args.config_from(Vec::new()).is_err());
    }

    #[test]
    fn explicit_preload_wins() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib.so");
        assert_eq!(find_preload(Some(&lib)).unwrap(), lib);
    }

    fn os_env(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect()
    }

    fn values<'a>(env: &'a [OsString], key: &str) -> Vec<&'a OsStr> {
        env.iter()
            .filter_map(|item| {
                let bytes = item.as_bytes();
                let rest = bytes.strip_prefix(key.as_bytes())?.strip_prefix(b"=")?;
                Some(OsStr::from_bytes(rest))
            })
            .collect()
    }

    #[test]
    fn launch_env_replaces_inherited_settings() {
        let inherited = os_env(&[
            ("FAKECHROOT_BASE", "/srv/old"),
            ("FAKECHROOT_EXCLUDE_PATH", "/proc"),
            ("HOME", "/home/u"),
            ("LD_PRELOAD", "/usr/lib/libtrace.so"),
        ]);
        let args = RootArgs {
            base: Some("/srv/new".into()),
            exclude: vec!["/sys".into()],
            ..RootArgs::default()
        };
        let config = args
            .config_from(inherited.iter().map(|(k, v)| {
                (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned())
            }))
            .unwrap();
        let env = launch_env(inherited, &config, Path::new("/opt/vroot/libvroot_preload.so"));

        assert_eq!(values(&env, "FAKECHROOT_BASE"), [OsStr::new("/srv/new")]);
        assert_eq!(values(&env, "FAKECHROOT_EXCLUDE_PATH"), [OsStr::new("/proc:/sys")]);
        assert_eq!(values(&env, "HOME"), [OsStr::new("/home/u")]);
        assert_eq!(
            values(&env, "LD_PRELOAD"),
            [OsStr::new("/opt/vroot/libvroot_preload.so:/usr/lib/libtrace.so")]
        );
    }

    #[test]
    fn entries_split_at_first_equals() {
        let (k, v) = split_entry(&OsString::from("A=b=c")).unwrap();
        assert_eq!(k, "A");
        assert_eq!(v, "b=c");
        assert!(split_entry(&OsString::from("novalue")).is_none());
    }
}
