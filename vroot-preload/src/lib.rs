//! `LD_PRELOAD` library that runs a program inside a vroot fake root.
//!
//! Loading `libvroot_preload.so` interposes the libc calls that take paths,
//! create processes or close descriptors, and routes them through a single
//! process-wide [`vroot::Engine`] configured from `FAKECHROOT_*` variables.
//! With no `FAKECHROOT_BASE` set every call passes straight through.

#![allow(unsafe_code)]

mod guard;
mod real;
mod shims;

use std::io::Write;
use std::sync::OnceLock;

use vroot::Engine;
use vroot::config::vars;

/// The engine of this process; `None` when translation is inactive.
static ENGINE: OnceLock<Option<Engine>> = OnceLock::new();

/// Returns the process engine, building it on first use.
///
/// A malformed configuration is fatal: the process exits with status 1.
pub(crate) fn engine() -> Option<&'static Engine> {
    ENGINE
        .get_or_init(|| match Engine::from_env() {
            Ok(engine) => {
                vroot::logging::init(engine.config().debug);
                tracing::debug!(base = ?engine.config().base, "vroot engine ready");
                engine.config().is_active().then_some(engine)
            }
            Err(e) => {
                let _ = writeln!(std::io::stderr(), "vroot: {e}");
                // SAFETY: _exit terminates the process without running
                // destructors, which is all that is safe mid-interposition.
                unsafe { libc::_exit(1) }
            }
        })
        .as_ref()
}

/// Runs when the library is loaded.
extern "C" fn on_load() {
    if let Some(code) = std::env::var_os(vars::DETECT) {
        let code = code.to_str().and_then(|c| c.trim().parse().ok()).unwrap_or(0);
        let mut out = std::io::stdout();
        let _ = writeln!(out, "vroot {}", vroot::VERSION);
        let _ = out.flush();
        // SAFETY: exiting from the loader constructor, nothing else runs yet.
        unsafe { libc::_exit(code) }
    }

    let _guard = guard::enter();
    if engine().is_some() {
        // SAFETY: constructors run before `main`, while the process is still
        // single-threaded.
        unsafe {
            std::env::set_var(vars::FAKECHROOT, "true");
            std::env::set_var("FAKECHROOT_VERSION", vroot::VERSION);
        }
    }
}

#[used]
#[unsafe(link_section = ".init_array")]
static ON_LOAD: extern "C" fn() = on_load;
