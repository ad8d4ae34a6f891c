//! Process creation.

#![allow(unsafe_code, clippy::missing_safety_doc)]

use std::ffi::{CStr, OsStr};
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::{pid_t, posix_spawn_file_actions_t, posix_spawnattr_t};
use vroot::SpawnPlan;

use super::{CVec, active, from_c_array, set_errno, to_cstring};
use crate::real;

unsafe extern "C" {
    static environ: *const *const c_char;
}

/// The rewritten request in C form.
struct Prepared {
    /// Host executable.
    path: std::ffi::CString,
    /// Argument vector.
    argv: CVec,
    /// Environment.
    envp: CVec,
}

impl Prepared {
    /// Converts a plan to C strings.
    fn new(plan: SpawnPlan) -> Result<Self, c_int> {
        Ok(Self {
            argv: CVec::new(&plan.argv)?,
            envp: CVec::new(&plan.envp)?,
            path: to_cstring(plan.exec_path)?,
        })
    }
}

/// Rewrites a spawn request, or returns `Ok(None)` when it should pass
/// through unchanged.
///
/// # Safety
///
/// Same contract as `execve` for the three arguments.
unsafe fn prepare(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> Result<Option<Prepared>, c_int> {
    if path.is_null() {
        return Ok(None);
    }
    let Some(active) = active() else {
        return Ok(None);
    };
    // SAFETY: execve contract.
    let (filename, argv, envp) = unsafe {
        (
            Path::new(OsStr::from_bytes(CStr::from_ptr(path).to_bytes())),
            from_c_array(argv),
            from_c_array(envp),
        )
    };
    let plan = active.engine.rewrite_spawn(filename, &argv, &envp).map_err(|e| {
        tracing::debug!(path = %filename.display(), error = %e, "spawn rewrite failed");
        e.errno()
    })?;
    tracing::debug!(exec = %plan.exec_path.display(), kind = ?plan.kind, "spawn rewritten");
    Prepared::new(plan).map(Some)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let Some(real) = real::execve() else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    // SAFETY: arguments come from the caller of `execve`.
    match unsafe { prepare(path, argv, envp) } {
        Ok(None) => unsafe { real(path, argv, envp) },
        Ok(Some(p)) => unsafe { real(p.path.as_ptr(), p.argv.as_ptr(), p.envp.as_ptr()) },
        Err(code) => {
            set_errno(code);
            -1
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    // SAFETY: `environ` is the process environment maintained by libc.
    unsafe { execve(path, argv, environ) }
}

/// Returns an error number rather than setting `errno`, like the real one.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_spawn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    let Some(real) = real::posix_spawn() else {
        return libc::ENOSYS;
    };
    // SAFETY: arguments come from the caller of `posix_spawn`.
    match unsafe { prepare(path, argv.cast(), envp.cast()) } {
        Ok(None) => unsafe { real(pid, path, file_actions, attrp, argv, envp) },
        Ok(Some(p)) => unsafe {
            real(
                pid,
                p.path.as_ptr(),
                file_actions,
                attrp,
                p.argv.as_ptr().cast(),
                p.envp.as_ptr().cast(),
            )
        },
        Err(code) => code,
    }
}
