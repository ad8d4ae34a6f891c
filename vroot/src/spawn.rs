//! Rewriting process creation so the child runs inside the container view.
//!
//! Given the `(filename, argv, envp)` a hosted program passes to `execve`
//! or `posix_spawn`, [`SpawnRewriter::rewrite`] produces the host
//! executable, argument vector and environment to actually launch.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};

use crate::config::vars;
use crate::environ::{self, child_env};
use crate::host::Host;
use crate::patch::{ElfPatcher, PatchReport};
use crate::path::MAX_PATH;
use crate::tool::ToolRunner;
use crate::translate::Translator;
use crate::{Error, Result};

/// First four bytes of every ELF file.
const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Interpreter for files with neither ELF magic nor a `#!` line.
const DEFAULT_SHELL: &str = "/bin/sh";

/// Leading spaces tolerated before `#!`.
const MAX_SHEBANG_INDENT: usize = 16;

/// How the target was recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SpawnKind {
    /// Replaced through the command substitution table.
    Substituted,
    /// A native ELF executable.
    Elf,
    /// A script run through the given container interpreter.
    Script {
        /// Interpreter named by the `#!` line, or the default shell.
        interpreter: PathBuf,
    },
}

/// The rewritten process-creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct SpawnPlan {
    /// Host executable to launch.
    pub exec_path: PathBuf,
    /// Argument vector, including `argv[0]`.
    #[serde(serialize_with = "lossy")]
    pub argv: Vec<OsString>,
    /// Environment as `NAME=value` entries.
    #[serde(serialize_with = "lossy")]
    pub envp: Vec<OsString>,
    /// What the original filename turned out to be.
    pub kind: SpawnKind,
    /// Results of both patch passes on the launched binary.
    pub patch: PatchReport,
}

/// Serializes OS strings as (lossy) UTF-8.
fn lossy<S: Serializer>(items: &[OsString], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(items.iter().map(|i| i.to_string_lossy()))
}

/// Plans process creation for one engine.
#[derive(Debug)]
pub struct SpawnRewriter<'a, H, R> {
    /// Path translation.
    translator: Translator<'a, H>,
    /// Host primitives.
    host: &'a H,
    /// Interpreter patching.
    patcher: &'a ElfPatcher<R>,
}

impl<'a, H: Host, R: ToolRunner> SpawnRewriter<'a, H, R> {
    /// Creates a rewriter.
    pub const fn new(translator: Translator<'a, H>, host: &'a H, patcher: &'a ElfPatcher<R>) -> Self {
        Self {
            translator,
            host,
            patcher,
        }
    }

    /// Builds the executable, argv and envp to launch for `filename`.
    ///
    /// Fails with [`Error::NotFound`] if the translated file cannot be read.
    /// The launched binary gets its interpreter and then its root prefix
    /// patched. Patch failures never fail the rewrite; they are reported in
    /// [`SpawnPlan::patch`].
    pub fn rewrite(&self, filename: &Path, argv: &[OsString], envp: &[OsString]) -> Result<SpawnPlan> {
        let config = self.translator.config();

        if let Some(replacement) = self.substitution(filename) {
            let patch = self.patcher.patch_file(self.host, replacement);
            let mut envp = child_env(config, self.host, envp, true)?;
            envp.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
            envp.push(environ::entry(vars::CMD_ORIG, filename));
            tracing::debug!(command = %filename.display(), replacement = %replacement.display(), "substituted command");
            return Ok(SpawnPlan {
                exec_path: replacement.to_path_buf(),
                argv: argv.to_vec(),
                envp,
                kind: SpawnKind::Substituted,
                patch,
            });
        }

        let envp = child_env(config, self.host, envp, false)?;
        let host_file = self.translator.to_host(filename, true)?;
        let header = self
            .host
            .read_header(&host_file, MAX_PATH)
            .map_err(|_| Error::NotFound {
                path: host_file.clone(),
            })?;
        let rest = argv.get(1..).unwrap_or_default();

        let (target, mut args, kind) = if header.starts_with(ELF_MAGIC) {
            (host_file, Vec::new(), SpawnKind::Elf)
        } else {
            let (interpreter, arg) = parse_shebang(&header)
                .unwrap_or_else(|| (PathBuf::from(DEFAULT_SHELL), None));
            let host_interp = self.translator.to_host(&interpreter, true)?;
            let mut args = Vec::new();
            args.extend(arg);
            args.push(filename.as_os_str().to_owned());
            (host_interp, args, SpawnKind::Script { interpreter })
        };
        args.extend_from_slice(rest);

        let patch = self.patcher.patch_file(self.host, &target);

        let argv = if kind == SpawnKind::Elf && config.elfloader.is_none() {
            argv.to_vec()
        } else {
            let mut out = self.loader_prefix(filename, argv);
            out.push(target.as_os_str().to_owned());
            out.append(&mut args);
            out
        };
        let exec_path = config.elfloader.clone().unwrap_or(target);
        tracing::debug!(file = %filename.display(), exec = %exec_path.display(), ?kind, "rewrote spawn");
        Ok(SpawnPlan {
            exec_path,
            argv,
            envp,
            kind,
            patch,
        })
    }

    /// Looks up `filename` in the substitution table unless this process is
    /// itself the product of a substitution.
    fn substitution(&self, filename: &Path) -> Option<&'a Path> {
        let table = &self.translator.config().cmd_subst;
        if table.is_empty() {
            return None;
        }
        if self.host.var(vars::CMD_ORIG).is_some_and(|v| !v.is_empty()) {
            return None;
        }
        table.lookup(filename)
    }

    /// Leading arguments that route the launch through the elfloader.
    fn loader_prefix(&self, filename: &Path, argv: &[OsString]) -> Vec<OsString> {
        let config = self.translator.config();
        let mut out = Vec::with_capacity(argv.len() + 5);
        if let Some(loader) = &config.elfloader {
            out.push(loader.as_os_str().to_owned());
            if let Some(opt) = &config.elfloader_argv0 {
                out.push(OsString::from(opt));
                out.push(argv.first().cloned().unwrap_or_else(|| filename.as_os_str().to_owned()));
            }
        }
        out
    }
}

/// Parses a `#!` line into the interpreter and its optional argument.
///
/// Up to 16 leading spaces are skipped. Everything after the interpreter
/// up to the end of the line forms a single argument.
pub fn parse_shebang(header: &[u8]) -> Option<(PathBuf, Option<OsString>)> {
    let indent = header
        .iter()
        .take(MAX_SHEBANG_INDENT)
        .take_while(|&&b| b == b' ')
        .count();
    let line = header[indent..].strip_prefix(b"#!")?;
    let line = line.split(|&b| b == b'\n').next().unwrap_or_default();
    let line = trim(line);

    let split = line
        .iter()
        .position(|&b| b == b' ' || b == b'\t')
        .unwrap_or(line.len());
    let (interpreter, arg) = line.split_at(split);
    if interpreter.is_empty() {
        return None;
    }
    let arg = trim(arg);
    Some((
        PathBuf::from(OsStr::from_bytes(interpreter)),
        (!arg.is_empty()).then(|| OsStr::from_bytes(arg).to_owned()),
    ))
}

/// Trims spaces, tabs and carriage returns.
fn trim(bytes: &[u8]) -> &[u8] {
    let blank = |b: &u8| matches!(b, b' ' | b'\t' | b'\r');
    let start = bytes.iter().position(|b| !blank(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !blank(b)).map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::patch::{PatchOutcome, SkipReason};
    use crate::patch::tests::ScriptedRunner;
    use crate::translate::tests::FakeHost;

    fn os(items: &[&str]) -> Vec<OsString> {
        items.iter().map(OsString::from).collect()
    }

    fn rewrite(cfg: &Config, host: &FakeHost, file: &str, argv: &[&str]) -> Result<SpawnPlan> {
        let patcher = ElfPatcher::new(cfg, ScriptedRunner::default());
        let rewriter = SpawnRewriter::new(Translator::new(cfg, host), host, &patcher);
        rewriter.rewrite(Path::new(file), &os(argv), &[])
    }

    fn base() -> Config {
        Config::builder().base("/srv/root").build().unwrap()
    }

    #[test]
    fn shebang_forms() {
        let (interp, arg) = parse_shebang(b"#!/usr/bin/env python3\nprint()").unwrap();
        assert_eq!(interp, Path::new("/usr/bin/env"));
        assert_eq!(arg.as_deref(), Some(OsStr::new("python3")));

        let (interp, arg) = parse_shebang(b"   #! /bin/sh -e -x \r\n").unwrap();
        assert_eq!(interp, Path::new("/bin/sh"));
        assert_eq!(arg.as_deref(), Some(OsStr::new("-e -x")));

        let (interp, arg) = parse_shebang(b"#!/bin/bash").unwrap();
        assert_eq!(interp, Path::new("/bin/bash"));
        assert_eq!(arg, None);

        assert!(parse_shebang(b"echo hi\n").is_none());
        assert!(parse_shebang(b"#!\n").is_none());
        let deep = format!("{}#!/bin/sh", " ".repeat(17));
        assert!(parse_shebang(deep.as_bytes()).is_none());
    }

    #[test]
    fn elf_runs_directly() {
        let host = FakeHost::new("/srv/root").file("/srv/root/bin/ls", b"\x7fELF\x02\x01");
        let plan = rewrite(&base(), &host, "/bin/ls", &["ls", "-l"]).unwrap();

        assert_eq!(plan.exec_path, Path::new("/srv/root/bin/ls"));
        assert_eq!(plan.argv, os(&["ls", "-l"]));
        assert_eq!(plan.kind, SpawnKind::Elf);
        assert_eq!(plan.envp[0], "FAKECHROOT=true");
    }

    #[test]
    fn elf_attempts_patch() {
        let cfg = Config::builder()
            .base("/srv/root")
            .patchelf("/opt/patchelf")
            .patch_loader("/opt/ld.so")
            .build()
            .unwrap();
        let host = FakeHost::new("/")
            .file("/srv/root/bin/ls", b"\x7fELF")
            .file("/opt/ld.so", b"\x7fELF");
        let patcher = ElfPatcher::new(&cfg, ScriptedRunner::default());
        let rewriter = SpawnRewriter::new(Translator::new(&cfg, &host), &host, &patcher);
        let plan = rewriter.rewrite(Path::new("/bin/ls"), &os(&["ls"]), &[]).unwrap();

        assert_eq!(plan.exec_path, Path::new("/srv/root/bin/ls"));
        assert_eq!(plan.argv, os(&["ls"]));
        assert_eq!(plan.patch.interpreter, PatchOutcome::Skipped(SkipReason::NoInterpreter));
        assert_eq!(plan.patch.root_prefix, PatchOutcome::Patched);
        assert_eq!(
            patcher.runner().calls(),
            [
                vec!["--print-interpreter", "/srv/root/bin/ls"],
                vec!["-q", "--set-root-prefix", "/srv/root", "/srv/root/bin/ls"],
            ]
        );
    }

    #[test]
    fn substituted_command_is_patched() {
        let cfg = Config::builder()
            .base("/srv/root")
            .subst("/usr/bin/id", "/opt/tools/id")
            .patchelf("/opt/patchelf")
            .patch_loader("/opt/ld.so")
            .build()
            .unwrap();
        let host = FakeHost::new("/").file("/opt/ld.so", b"\x7fELF");
        let patcher = ElfPatcher::new(&cfg, ScriptedRunner::replying([Ok("/lib/ld.so".to_owned())]));
        let rewriter = SpawnRewriter::new(Translator::new(&cfg, &host), &host, &patcher);
        let plan = rewriter.rewrite(Path::new("/usr/bin/id"), &os(&["id"]), &[]).unwrap();

        assert_eq!(plan.kind, SpawnKind::Substituted);
        assert_eq!(plan.patch.interpreter, PatchOutcome::Patched);
        assert_eq!(plan.patch.root_prefix, PatchOutcome::Patched);
        assert_eq!(
            patcher.runner().calls(),
            [
                vec!["--print-interpreter", "/opt/tools/id"],
                vec!["--set-interpreter", "/opt/ld.so", "/opt/tools/id"],
                vec!["-q", "--set-root-prefix", "/srv/root", "/opt/tools/id"],
            ]
        );
    }

    #[test]
    fn script_uses_translated_interpreter() {
        let host = FakeHost::new("/srv/root").file(
            "/srv/root/usr/local/bin/tool",
            b"#!/usr/bin/env python3\nimport sys\n",
        );
        let plan = rewrite(
            &base(),
            &host,
            "/usr/local/bin/tool",
            &["/usr/local/bin/tool", "--flag", "x"],
        )
        .unwrap();

        assert_eq!(plan.exec_path, Path::new("/srv/root/usr/bin/env"));
        assert_eq!(
            plan.argv,
            os(&["/srv/root/usr/bin/env", "python3", "/usr/local/bin/tool", "--flag", "x"])
        );
        assert_eq!(
            plan.kind,
            SpawnKind::Script {
                interpreter: PathBuf::from("/usr/bin/env")
            }
        );
    }

    #[test]
    fn plain_text_defaults_to_shell() {
        let host = FakeHost::new("/srv/root").file("/srv/root/run.sh", b"echo hi\n");
        let plan = rewrite(&base(), &host, "/run.sh", &["run.sh", "a"]).unwrap();
        assert_eq!(plan.exec_path, Path::new("/srv/root/bin/sh"));
        assert_eq!(plan.argv, os(&["/srv/root/bin/sh", "/run.sh", "a"]));
    }

    #[test]
    fn missing_file_is_not_found() {
        let host = FakeHost::new("/srv/root");
        let err = rewrite(&base(), &host, "/bin/nope", &["nope"]).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(err.to_string().contains("/srv/root/bin/nope"));
    }

    #[test]
    fn elfloader_wraps_binaries() {
        let cfg = Config::builder()
            .base("/srv/root")
            .elfloader("/opt/ld.so")
            .elfloader_argv0("--argv0")
            .build()
            .unwrap();
        let host = FakeHost::new("/srv/root")
            .file("/srv/root/bin/ls", b"\x7fELF")
            .file("/srv/root/bin/s", b"#!/bin/sh -e\n");

        let plan = rewrite(&cfg, &host, "/bin/ls", &["ls", "-a"]).unwrap();
        assert_eq!(plan.exec_path, Path::new("/opt/ld.so"));
        assert_eq!(
            plan.argv,
            os(&["/opt/ld.so", "--argv0", "ls", "/srv/root/bin/ls", "-a"])
        );

        let plan = rewrite(&cfg, &host, "/bin/s", &["s", "1"]).unwrap();
        assert_eq!(plan.exec_path, Path::new("/opt/ld.so"));
        assert_eq!(
            plan.argv,
            os(&["/opt/ld.so", "--argv0", "s", "/srv/root/bin/sh", "-e", "/bin/s", "1"])
        );
    }

    #[test]
    fn elfloader_without_argv0_option() {
        let cfg = Config::builder()
            .base("/srv/root")
            .elfloader("/opt/ld.so")
            .build()
            .unwrap();
        let host = FakeHost::new("/").file("/srv/root/bin/ls", b"\x7fELF");
        let plan = rewrite(&cfg, &host, "/bin/ls", &[]).unwrap();
        assert_eq!(plan.argv, os(&["/opt/ld.so", "/srv/root/bin/ls"]));
    }

    #[test]
    fn substitution_skips_translation() {
        let cfg = Config::builder()
            .base("/srv/root")
            .subst("/usr/bin/nvidia-smi", "/usr/bin/nvidia-smi")
            .build()
            .unwrap();
        let host = FakeHost::new("/");
        let patcher = ElfPatcher::new(&cfg, ScriptedRunner::default());
        let rewriter = SpawnRewriter::new(Translator::new(&cfg, &host), &host, &patcher);
        let plan = rewriter
            .rewrite(
                Path::new("/usr/bin/nvidia-smi"),
                &os(&["nvidia-smi"]),
                &os(&["FAKECHROOT_BASE=/srv/root"]),
            )
            .unwrap();

        assert_eq!(plan.exec_path, Path::new("/usr/bin/nvidia-smi"));
        assert_eq!(plan.kind, SpawnKind::Substituted);
        assert_eq!(
            plan.envp,
            os(&["FAKECHROOT=true", "FAKECHROOT_CMD_ORIG=/usr/bin/nvidia-smi"])
        );
        assert!(host.reads.lock().unwrap().is_empty());
    }

    #[test]
    fn substitution_disabled_in_substituted_child() {
        let cfg = Config::builder()
            .base("/srv/root")
            .subst("/bin/ls", "/usr/bin/ls")
            .build()
            .unwrap();
        let mut host = FakeHost::new("/").file("/srv/root/bin/ls", b"\x7fELF");
        host.env.insert(vars::CMD_ORIG.to_owned(), "/bin/ls".to_owned());
        let plan = rewrite(&cfg, &host, "/bin/ls", &["ls"]).unwrap();
        assert_eq!(plan.kind, SpawnKind::Elf);
        assert_eq!(plan.exec_path, Path::new("/srv/root/bin/ls"));
    }

    #[test]
    fn plan_serializes_as_text() {
        let host = FakeHost::new("/").file("/srv/root/bin/ls", b"\x7fELF");
        let plan = rewrite(&base(), &host, "/bin/ls", &["ls"]).unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["argv"][0], "ls");
        assert_eq!(json["kind"], "elf");
        assert_eq!(json["patch"]["interpreter"]["outcome"], "skipped");
        assert_eq!(json["patch"]["root_prefix"]["detail"], "disabled");
    }
}
