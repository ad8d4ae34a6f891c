//! Exported libc replacements.
//!
//! Each shim enters the per-thread guard, translates its path arguments
//! through the engine and calls the real function. When the guard is
//! already held, or no engine is configured, the arguments pass through
//! untouched.

#![allow(unsafe_code)]

mod exec;
mod fd;
mod fs;

use std::ffi::{CStr, CString, OsString};
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use vroot::Engine;

use crate::guard::{self, Guard};

/// An engine together with the guard that keeps shims out of it.
pub(crate) struct Active {
    /// Released when the shim returns.
    _guard: Guard,
    /// The process engine.
    pub(crate) engine: &'static Engine,
}

/// Enters the engine for one intercepted call.
pub(crate) fn active() -> Option<Active> {
    let guard = guard::enter()?;
    let engine = crate::engine()?;
    Some(Active {
        _guard: guard,
        engine,
    })
}

/// Where a translated path argument ends up.
pub(crate) enum Arg {
    /// Pass the caller's pointer through.
    Original,
    /// Pass this host path instead.
    Host(CString),
}

impl Arg {
    /// The pointer to hand to the real function.
    pub(crate) fn as_ptr(&self, original: *const c_char) -> *const c_char {
        match self {
            Self::Original => original,
            Self::Host(c) => c.as_ptr(),
        }
    }
}

/// Translates a C path argument to the host.
///
/// `Err` carries the errno the call must fail with.
///
/// # Safety
///
/// `path` must be NULL or a valid NUL-terminated string.
pub(crate) unsafe fn host_path(
    active: &Active,
    path: *const c_char,
    dirfd: Option<RawFd>,
    follow: bool,
) -> Result<Arg, c_int> {
    if path.is_null() {
        return Ok(Arg::Original);
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
    let host = active
        .engine
        .translate_path(Path::new(std::ffi::OsStr::from_bytes(bytes)), dirfd, follow)
        .map_err(|e| {
            tracing::debug!(path = %String::from_utf8_lossy(bytes), error = %e, "translation failed");
            e.errno()
        })?;
    to_cstring(host).map(Arg::Host)
}

/// Like [`host_path`], but a failed translation falls back to the
/// untranslated path.
///
/// # Safety
///
/// `path` must be NULL or a valid NUL-terminated string.
pub(crate) unsafe fn host_path_lossy(active: &Active, path: *const c_char, follow: bool) -> Arg {
    // SAFETY: forwarded caller contract.
    unsafe { host_path(active, path, None, follow) }.unwrap_or(Arg::Original)
}

/// Converts a host path into an owned C string.
pub(crate) fn to_cstring(path: PathBuf) -> Result<CString, c_int> {
    CString::new(path.into_os_string().into_vec()).map_err(|_| libc::EINVAL)
}

/// Sets `errno` for the calling thread.
pub(crate) fn set_errno(code: c_int) {
    // SAFETY: __errno_location always returns the calling thread's errno.
    unsafe { *libc::__errno_location() = code };
}

/// Reads the `errno` of the calling thread.
pub(crate) fn errno() -> c_int {
    // SAFETY: as above.
    unsafe { *libc::__errno_location() }
}

/// Copies a NULL-terminated C string array.
///
/// # Safety
///
/// `array` must be NULL or point to a NULL-terminated array of valid
/// NUL-terminated strings.
pub(crate) unsafe fn from_c_array(array: *const *const c_char) -> Vec<OsString> {
    let mut out = Vec::new();
    if array.is_null() {
        return out;
    }
    let mut i = 0;
    loop {
        // SAFETY: the array is NULL-terminated, so every index up to and
        // including the terminator is in bounds.
        let item = unsafe { *array.add(i) };
        if item.is_null() {
            return out;
        }
        // SAFETY: each element is a valid C string.
        let bytes = unsafe { CStr::from_ptr(item) }.to_bytes();
        out.push(OsString::from_vec(bytes.to_vec()));
        i += 1;
    }
}

/// An owned NULL-terminated array of C strings.
pub(crate) struct CVec {
    /// Owned storage.
    _items: Vec<CString>,
    /// Pointers into `_items` followed by NULL.
    ptrs: Vec<*const c_char>,
}

impl CVec {
    /// Builds the array; fails with `EINVAL` on interior NUL bytes.
    pub(crate) fn new(items: &[OsString]) -> Result<Self, c_int> {
        let items = items
            .iter()
            .map(|s| CString::new(s.as_bytes()).map_err(|_| libc::EINVAL))
            .collect::<Result<Vec<_>, _>>()?;
        let mut ptrs = Vec::new();
        ptrs.try_reserve_exact(items.len() + 1).map_err(|_| libc::ENOMEM)?;
        ptrs.extend(items.iter().map(|c| c.as_ptr()));
        ptrs.push(std::ptr::null());
        Ok(Self { _items: items, ptrs })
    }

    /// The array pointer.
    pub(crate) const fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }
}
