#![allow(missing_docs, clippy::unwrap_used)]

//! Translation and spawn planning against a real directory tree.

use std::ffi::OsString;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use vroot::{Config, Engine, Error, SpawnKind};

struct Root {
    _dir: tempfile::TempDir,
    base: PathBuf,
}

impl Root {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        for d in ["usr/bin", "usr/lib", "usr/local/bin", "etc/alternatives", "tmp"] {
            std::fs::create_dir_all(base.join(d)).unwrap();
        }
        symlink("usr/lib", base.join("lib")).unwrap();
        symlink("/usr/bin", base.join("bin")).unwrap();
        symlink("/usr/bin/python3.11", base.join("etc/alternatives/python")).unwrap();
        symlink("/loop-b", base.join("loop-a")).unwrap();
        symlink("loop-a", base.join("loop-b")).unwrap();
        std::fs::write(base.join("usr/bin/env"), b"\x7fELF\x02\x01\x01").unwrap();
        std::fs::write(base.join("usr/bin/python3.11"), b"\x7fELF\x02\x01\x01").unwrap();
        std::fs::write(
            base.join("usr/local/bin/tool"),
            b"#!/usr/bin/env python3\nprint('hi')\n",
        )
        .unwrap();
        Self { _dir: dir, base }
    }

    fn engine(&self, expand: bool) -> Engine {
        let config = Config::builder()
            .base(&self.base)
            .exclude("/proc")
            .expand_symlinks(expand)
            .build()
            .unwrap();
        Engine::new(config)
    }

    fn host(&self, container: &str) -> PathBuf {
        self.base.join(container.trim_start_matches('/'))
    }
}

fn os(items: &[&str]) -> Vec<OsString> {
    items.iter().map(OsString::from).collect()
}

#[test]
fn relative_symlinks_stay_inside_root() {
    let root = Root::new();
    let engine = root.engine(true);
    let out = engine.translate_path(Path::new("/lib/libc.so.6"), None, true).unwrap();
    assert_eq!(out, root.host("/usr/lib/libc.so.6"));
}

#[test]
fn absolute_symlinks_are_reinterpreted_in_container() {
    let root = Root::new();
    let engine = root.engine(true);

    let out = engine.translate_path(Path::new("/bin/env"), None, true).unwrap();
    assert_eq!(out, root.host("/usr/bin/env"));

    let out = engine
        .translate_path(Path::new("/etc/alternatives/python"), None, true)
        .unwrap();
    assert_eq!(out, root.host("/usr/bin/python3.11"));

    let link = engine
        .translate_path(Path::new("/etc/alternatives/python"), None, false)
        .unwrap();
    assert_eq!(link, root.host("/etc/alternatives/python"));
}

#[test]
fn without_expansion_links_are_left_to_the_kernel() {
    let root = Root::new();
    let engine = root.engine(false);
    let out = engine.translate_path(Path::new("/bin/env"), None, true).unwrap();
    assert_eq!(out, root.host("/bin/env"));
}

#[test]
fn symlink_cycles_fail() {
    let root = Root::new();
    let engine = root.engine(true);
    let err = engine
        .translate_path(Path::new("/loop-a/x"), None, true)
        .unwrap_err();
    assert!(matches!(err, Error::SymlinkLoop { .. }));
    assert_eq!(err.errno(), libc::ELOOP);
}

#[test]
fn read_link_hides_the_base() {
    let root = Root::new();
    let engine = root.engine(true);
    let target = engine
        .translator()
        .read_link(Path::new("/etc/alternatives/python"))
        .unwrap();
    assert_eq!(target, Path::new("/usr/bin/python3.11"));
}

#[test]
fn excluded_prefixes_are_untouched() {
    let root = Root::new();
    let engine = root.engine(true);
    let out = engine.translate_path(Path::new("/proc/self/status"), None, true).unwrap();
    assert_eq!(out, Path::new("/proc/self/status"));
}

#[test]
fn round_trip_through_container_view() {
    let root = Root::new();
    let engine = root.engine(false);
    for p in ["/usr/bin/env", "/", "/etc//alternatives/./python", "/a/../tmp"] {
        let host = engine.translate_path(Path::new(p), None, true).unwrap();
        assert_eq!(engine.to_container(&host), vroot::path::normalize(Path::new(p)));
    }
}

#[test]
fn script_spawn_goes_through_interpreter() {
    let root = Root::new();
    let engine = root.engine(true);
    let plan = engine
        .rewrite_spawn(
            Path::new("/usr/local/bin/tool"),
            &os(&["/usr/local/bin/tool", "-v"]),
            &os(&["HOME=/root"]),
        )
        .unwrap();

    let env = root.host("/usr/bin/env");
    assert_eq!(plan.exec_path, env);
    assert_eq!(
        plan.argv,
        vec![
            env.into_os_string(),
            "python3".into(),
            "/usr/local/bin/tool".into(),
            "-v".into()
        ]
    );
    assert!(matches!(plan.kind, SpawnKind::Script { .. }));
    assert!(plan.envp.contains(&OsString::from("HOME=/root")));
    assert_eq!(plan.envp[0], "FAKECHROOT=true");
}

#[test]
fn elf_spawn_keeps_argv() {
    let root = Root::new();
    let engine = root.engine(true);
    let plan = engine
        .rewrite_spawn(Path::new("/bin/env"), &os(&["env", "-i"]), &[])
        .unwrap();
    assert_eq!(plan.exec_path, root.host("/usr/bin/env"));
    assert_eq!(plan.argv, os(&["env", "-i"]));
    assert_eq!(plan.kind, SpawnKind::Elf);
}

#[test]
fn missing_target_is_enoent() {
    let root = Root::new();
    let engine = root.engine(true);
    let err = engine
        .rewrite_spawn(Path::new("/usr/bin/missing"), &os(&["missing"]), &[])
        .unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}
