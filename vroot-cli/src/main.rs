//! CLI for the vroot fake-root engine.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use vroot::{Engine, PatchOutcome};

use crate::run::RootArgs;

#[derive(Parser)]
#[command(name = "vroot", version, about = "Run programs inside a directory as if it were /")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command inside the fake root.
    Run(Box<run::RunArgs>),

    /// Print the host path a container path resolves to.
    Translate {
        #[command(flatten)]
        root: RootArgs,
        /// Container path.
        path: PathBuf,
        /// Do not follow a symlink in the last component.
        #[arg(long)]
        no_follow: bool,
    },

    /// Print the container view of a host path.
    Narrow {
        #[command(flatten)]
        root: RootArgs,
        /// Host path.
        path: PathBuf,
    },

    /// Print how a command would be launched, as JSON.
    Spawn {
        #[command(flatten)]
        root: RootArgs,
        /// Command and arguments, as seen inside the root.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },

    /// Print the effective configuration as JSON.
    Config {
        #[command(flatten)]
        root: RootArgs,
    },

    /// Patch an ELF file for the fake root.
    Patch {
        #[command(flatten)]
        root: RootArgs,
        /// Host path of the file.
        file: PathBuf,
        /// Prefix recorded absolute paths with the base instead of
        /// replacing the interpreter.
        #[arg(long)]
        root_prefix: bool,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("vroot: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Run(args) => args.run(),
            Command::Translate {
                root,
                path,
                no_follow,
            } => {
                let engine = engine(&root)?;
                let host = engine.translate_path(&path, None, !no_follow)?;
                println!("{}", host.display());
                Ok(())
            }
            Command::Narrow { root, path } => {
                println!("{}", engine(&root)?.to_container(&path).display());
                Ok(())
            }
            Command::Spawn { root, command } => {
                let engine = engine(&root)?;
                let envp: Vec<OsString> = std::env::vars_os()
                    .map(|(k, v)| {
                        let mut entry = k;
                        entry.push("=");
                        entry.push(v);
                        entry
                    })
                    .collect();
                let plan = engine.rewrite_spawn(&PathBuf::from(&command[0]), &command, &envp)?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
                Ok(())
            }
            Command::Config { root } => {
                println!("{}", serde_json::to_string_pretty(&root.config()?)?);
                Ok(())
            }
            Command::Patch {
                root,
                file,
                root_prefix,
            } => patch(&root, &file, root_prefix),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "vroot", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// Builds an engine from the environment and flags.
fn engine(root: &RootArgs) -> Result<Engine> {
    let config = root.config()?;
    vroot::logging::init(config.debug);
    if !config.is_active() {
        bail!("no base directory: pass --base or set {}", vroot::config::vars::BASE);
    }
    Ok(Engine::new(config))
}

fn patch(root: &RootArgs, file: &std::path::Path, root_prefix: bool) -> Result<()> {
    let engine = engine(root)?;
    if !engine.patcher().is_enabled(engine.host()) {
        bail!("patching is disabled: pass --patchelf and --patch-loader");
    }
    let outcome = if root_prefix {
        engine.patch_root_prefix(file)
    } else {
        engine.patcher().patch_interpreter(engine.host(), file)
    };
    println!("{outcome}");
    match outcome {
        PatchOutcome::Failed(reason) => bail!("{}: {reason}", file.display()),
        PatchOutcome::TimedOut => bail!("{}: patch tool timed out", file.display()),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_trailing_command() {
        let cli = Cli::try_parse_from(["vroot", "run", "--base", "/srv/root", "--", "/bin/sh", "-c", "true"])
            .unwrap();
        assert!(matches!(cli.command, Command::Run(_)));
    }

    #[test]
    fn translate_flags_parse() {
        let cli = Cli::try_parse_from(["vroot", "translate", "--base", "/srv/root", "--no-follow", "/etc/passwd"])
            .unwrap();
        let Command::Translate { path, no_follow, .. } = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(path, PathBuf::from("/etc/passwd"));
        assert!(no_follow);
    }

    #[test]
    fn spawn_requires_a_command() {
        assert!(Cli::try_parse_from(["vroot", "spawn"]).is_err());
    }
}
