//! Descriptor lifecycle.

#![allow(unsafe_code, clippy::missing_safety_doc)]

use std::os::raw::c_int;

use super::{active, errno, set_errno};
use crate::real;

/// Closes `fd`; a successful close of a tracked library patches it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let Some(real) = real::close() else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    // SAFETY: plain forwarding of the caller's descriptor.
    let ret = unsafe { real(fd) };
    if ret == 0
        && let Some(active) = active()
    {
        let saved = errno();
        active.engine.on_descriptor_closed(fd);
        set_errno(saved);
    }
    ret
}
