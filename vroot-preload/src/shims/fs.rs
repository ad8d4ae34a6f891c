//! Path-taking file system calls.

#![allow(unsafe_code, clippy::missing_safety_doc)]

use std::ffi::{CStr, OsStr};
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::{mode_t, size_t, ssize_t};

use super::{Active, Arg, active, errno, host_path, host_path_lossy, set_errno, to_cstring};
use crate::real;

/// Flags that make an opened descriptor a patch candidate.
const WRITE_FLAGS: c_int = libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT;

/// Fails the call with `ENOSYS` when the real symbol is missing.
fn missing<T: From<i8>>() -> T {
    set_errno(libc::ENOSYS);
    T::from(-1)
}

/// Borrows a C path as a [`Path`].
///
/// # Safety
///
/// `path` must be a valid NUL-terminated string.
unsafe fn as_path<'a>(path: *const c_char) -> &'a Path {
    // SAFETY: caller contract.
    Path::new(OsStr::from_bytes(unsafe { CStr::from_ptr(path) }.to_bytes()))
}

/// `AT_FDCWD` means "relative to the working directory".
const fn dirfd_of(dirfd: c_int) -> Option<RawFd> {
    if dirfd == libc::AT_FDCWD { None } else { Some(dirfd) }
}

/// Shared body of the `open` family.
///
/// # Safety
///
/// `path` must be NULL or a valid NUL-terminated string.
unsafe fn open_with(
    dirfd: Option<RawFd>,
    path: *const c_char,
    flags: c_int,
    call: impl FnOnce(*const c_char) -> c_int,
) -> c_int {
    let Some(active) = active() else {
        return call(path);
    };
    let follow = flags & libc::O_NOFOLLOW == 0;
    // SAFETY: forwarded caller contract.
    let arg = match unsafe { host_path(&active, path, dirfd, follow) } {
        Ok(arg) => arg,
        Err(code) => {
            set_errno(code);
            return -1;
        }
    };
    let fd = call(arg.as_ptr(path));
    if fd >= 0 && flags & WRITE_FLAGS != 0 {
        let saved = errno();
        let host = match &arg {
            Arg::Host(c) => Some(Path::new(OsStr::from_bytes(c.to_bytes()))),
            Arg::Original => None,
        };
        active.engine.on_descriptor_opened_for_write(fd, host);
        set_errno(saved);
    }
    fd
}

/// Runs `call` on a translated path, failing with the translation errno.
///
/// # Safety
///
/// `path` must be NULL or a valid NUL-terminated string.
unsafe fn with_host(path: *const c_char, follow: bool, call: impl FnOnce(*const c_char) -> c_int) -> c_int {
    let Some(active) = active() else {
        return call(path);
    };
    // SAFETY: forwarded caller contract.
    match unsafe { host_path(&active, path, None, follow) } {
        Ok(arg) => call(arg.as_ptr(path)),
        Err(code) => {
            set_errno(code);
            -1
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let Some(real) = real::open() else { return missing() };
    // SAFETY: arguments come from the caller of `open`.
    unsafe { open_with(None, path, flags, |p| real(p, flags, mode)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let Some(real) = real::open64() else { return missing() };
    // SAFETY: as above.
    unsafe { open_with(None, path, flags, |p| real(p, flags, mode)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let Some(real) = real::openat() else { return missing() };
    // SAFETY: as above.
    unsafe { open_with(dirfd_of(dirfd), path, flags, |p| real(dirfd, p, flags, mode)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn openat64(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let Some(real) = real::openat64() else { return missing() };
    // SAFETY: as above.
    unsafe { open_with(dirfd_of(dirfd), path, flags, |p| real(dirfd, p, flags, mode)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    let Some(real) = real::creat() else { return missing() };
    let flags = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC;
    // SAFETY: as above.
    unsafe { open_with(None, path, flags, |p| real(p, mode)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn creat64(path: *const c_char, mode: mode_t) -> c_int {
    let Some(real) = real::creat64() else { return missing() };
    let flags = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC;
    // SAFETY: as above.
    unsafe { open_with(None, path, flags, |p| real(p, mode)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn stat(path: *const c_char, buf: *mut libc::stat) -> c_int {
    let Some(real) = real::stat() else { return missing() };
    // SAFETY: as above.
    unsafe { with_host(path, true, |p| real(p, buf)) }
}

/// Reports symlinks with the length of their container-view target, the
/// value `readlink` will return.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lstat(path: *const c_char, buf: *mut libc::stat) -> c_int {
    let Some(real) = real::lstat() else { return missing() };
    let Some(active) = active() else {
        // SAFETY: pass-through.
        return unsafe { real(path, buf) };
    };
    // SAFETY: arguments come from the caller of `lstat`.
    let ret = match unsafe { host_path(&active, path, None, false) } {
        Ok(arg) => unsafe { real(arg.as_ptr(path), buf) },
        Err(code) => {
            set_errno(code);
            return -1;
        }
    };
    // SAFETY: on success the kernel filled `buf`, and `path` is non-null.
    if ret == 0 && !path.is_null() && unsafe { (*buf).st_mode } & libc::S_IFMT == libc::S_IFLNK {
        fix_link_size(&active, unsafe { as_path(path) }, buf);
    }
    ret
}

/// Rewrites `st_size` of a symlink to its container-view target length.
fn fix_link_size(active: &Active, path: &Path, buf: *mut libc::stat) {
    let saved = errno();
    if let Ok(target) = active.engine.translator().read_link(path)
        && let Ok(len) = libc::off_t::try_from(target.as_os_str().len())
    {
        // SAFETY: `buf` was just filled by a successful lstat.
        unsafe { (*buf).st_size = len };
    }
    set_errno(saved);
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn access(path: *const c_char, mode: c_int) -> c_int {
    let Some(real) = real::access() else { return missing() };
    let Some(active) = active() else {
        // SAFETY: pass-through.
        return unsafe { real(path, mode) };
    };
    // SAFETY: arguments come from the caller of `access`.
    unsafe {
        let arg = host_path_lossy(&active, path, true);
        real(arg.as_ptr(path), mode)
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mkdir(path: *const c_char, mode: mode_t) -> c_int {
    let Some(real) = real::mkdir() else { return missing() };
    // SAFETY: as above.
    unsafe { with_host(path, false, |p| real(p, mode)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rmdir(path: *const c_char) -> c_int {
    let Some(real) = real::rmdir() else { return missing() };
    // SAFETY: as above.
    unsafe { with_host(path, false, |p| real(p)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn unlink(path: *const c_char) -> c_int {
    let Some(real) = real::unlink() else { return missing() };
    // SAFETY: as above.
    unsafe { with_host(path, false, |p| real(p)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn chdir(path: *const c_char) -> c_int {
    let Some(real) = real::chdir() else { return missing() };
    // SAFETY: as above.
    unsafe { with_host(path, true, |p| real(p)) }
}

/// Reports the working directory in container view.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn getcwd(buf: *mut c_char, size: size_t) -> *mut c_char {
    let Some(real) = real::getcwd() else {
        set_errno(libc::ENOSYS);
        return std::ptr::null_mut();
    };
    let Some(active) = active() else {
        // SAFETY: pass-through.
        return unsafe { real(buf, size) };
    };
    let cwd = match active.engine.translator().current_dir().map_err(|e| e.errno()) {
        Ok(cwd) => cwd,
        Err(code) => {
            set_errno(code);
            return std::ptr::null_mut();
        }
    };
    let cwd = match to_cstring(cwd) {
        Ok(c) => c,
        Err(code) => {
            set_errno(code);
            return std::ptr::null_mut();
        }
    };
    let bytes = cwd.as_bytes_with_nul();

    let out = if buf.is_null() {
        // SAFETY: plain allocation, freed by the caller with free(3).
        let out = unsafe { libc::malloc(size.max(bytes.len())) }.cast::<c_char>();
        if out.is_null() {
            set_errno(libc::ENOMEM);
            return out;
        }
        if size != 0 && size < bytes.len() {
            // SAFETY: allocated above.
            unsafe { libc::free(out.cast()) };
            set_errno(libc::ERANGE);
            return std::ptr::null_mut();
        }
        out
    } else if size == 0 {
        set_errno(libc::EINVAL);
        return std::ptr::null_mut();
    } else if size < bytes.len() {
        set_errno(libc::ERANGE);
        return std::ptr::null_mut();
    } else {
        buf
    };
    // SAFETY: `out` holds at least `bytes.len()` bytes, checked above.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), out, bytes.len()) };
    out
}

/// Returns symlink targets in container view, truncated to `bufsiz`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn readlink(path: *const c_char, buf: *mut c_char, bufsiz: size_t) -> ssize_t {
    let Some(real) = real::readlink() else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let Some(active) = active() else {
        // SAFETY: pass-through.
        return unsafe { real(path, buf, bufsiz) };
    };
    if path.is_null() || buf.is_null() {
        set_errno(libc::EFAULT);
        return -1;
    }
    // SAFETY: non-null and NUL-terminated per the readlink contract.
    let target = match active.engine.translator().read_link(unsafe { as_path(path) }) {
        Ok(target) => target,
        Err(e) => {
            set_errno(e.errno());
            return -1;
        }
    };
    let bytes = target.as_os_str().as_bytes();
    let n = bytes.len().min(bufsiz);
    // SAFETY: the caller provides `bufsiz` writable bytes at `buf`.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), buf, n) };
    ssize_t::try_from(n).unwrap_or(ssize_t::MAX)
}
