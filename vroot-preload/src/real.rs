//! The libc functions the shims stand in front of, resolved lazily with
//! `dlsym(RTLD_NEXT)`.

use std::ffi::CStr;

use libc::{c_char, c_int, mode_t, pid_t, posix_spawn_file_actions_t, posix_spawnattr_t, size_t, ssize_t};

/// Looks up the next definition of `name` after this library.
fn next<F: Copy>(name: &CStr) -> Option<F> {
    // SAFETY: `name` is NUL-terminated and RTLD_NEXT is a valid handle.
    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: callers instantiate `F` with the C signature of `name`, a
    // function pointer of the same size as `*mut c_void`.
    Some(unsafe { std::mem::transmute_copy(&ptr) })
}

/// Declares one accessor per real function, each caching its lookup.
macro_rules! real {
    ($($name:ident($($arg:ty),*) -> $ret:ty;)*) => {
        $(
            pub(crate) fn $name() -> Option<unsafe extern "C" fn($($arg),*) -> $ret> {
                static SLOT: std::sync::OnceLock<Option<unsafe extern "C" fn($($arg),*) -> $ret>> =
                    std::sync::OnceLock::new();
                *SLOT.get_or_init(|| {
                    let name = concat!(stringify!($name), "\0");
                    CStr::from_bytes_with_nul(name.as_bytes()).ok().and_then(next)
                })
            }
        )*
    };
}

real! {
    open(*const c_char, c_int, mode_t) -> c_int;
    open64(*const c_char, c_int, mode_t) -> c_int;
    openat(c_int, *const c_char, c_int, mode_t) -> c_int;
    openat64(c_int, *const c_char, c_int, mode_t) -> c_int;
    creat(*const c_char, mode_t) -> c_int;
    creat64(*const c_char, mode_t) -> c_int;
    stat(*const c_char, *mut libc::stat) -> c_int;
    lstat(*const c_char, *mut libc::stat) -> c_int;
    access(*const c_char, c_int) -> c_int;
    mkdir(*const c_char, mode_t) -> c_int;
    rmdir(*const c_char) -> c_int;
    unlink(*const c_char) -> c_int;
    chdir(*const c_char) -> c_int;
    getcwd(*mut c_char, size_t) -> *mut c_char;
    readlink(*const c_char, *mut c_char, size_t) -> ssize_t;
    close(c_int) -> c_int;
    execve(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
    posix_spawn(
        *mut pid_t,
        *const c_char,
        *const posix_spawn_file_actions_t,
        *const posix_spawnattr_t,
        *const *mut c_char,
        *const *mut c_char
    ) -> c_int;
}
