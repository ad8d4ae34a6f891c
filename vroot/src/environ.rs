//! Environment blocks for spawned children.

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

use crate::config::{Config, PRESERVED_VARS, vars};
use crate::host::Host;
use crate::{Error, Result};

/// Returns the name part of a `NAME=value` entry, or `None` if there is no `=`.
pub fn entry_key(entry: &OsStr) -> Option<&[u8]> {
    let bytes = entry.as_bytes();
    bytes.iter().position(|&b| b == b'=').map(|i| &bytes[..i])
}

/// Joins a name and value into a `NAME=value` entry.
pub fn entry(key: &str, value: impl AsRef<OsStr>) -> OsString {
    let value = value.as_ref().as_bytes();
    let mut out = Vec::with_capacity(key.len() + 1 + value.len());
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value);
    OsString::from_vec(out)
}

/// Builds the environment of a spawned child.
///
/// The block starts with `FAKECHROOT=true`, followed by the preserved
/// variables and then the caller's own entries. A caller entry overrides a
/// preserved variable of the same name unless environment changes are
/// disallowed, in which case the preserved value wins and the caller's
/// entry is dropped. When `substituted` is set the base is handed to the
/// child as `FAKECHROOT_BASE_ORIG` instead of `FAKECHROOT_BASE`.
pub fn child_env(
    config: &Config,
    host: &impl Host,
    caller: &[OsString],
    substituted: bool,
) -> Result<Vec<OsString>> {
    let mut out: Vec<OsString> = Vec::new();
    out.try_reserve(caller.len() + PRESERVED_VARS.len() + 2)
        .map_err(|_| Error::OutOfMemory)?;
    let caller_keys: HashSet<&[u8]> = caller.iter().filter_map(|e| entry_key(e)).collect();
    let mut present: HashSet<Vec<u8>> = HashSet::new();

    out.push(entry(vars::FAKECHROOT, "true"));
    present.insert(vars::FAKECHROOT.as_bytes().to_vec());

    for &key in PRESERVED_VARS {
        let value = if config.disallow_env_changes {
            config.preserved_env.get(key).cloned()
        } else {
            host.var(key)
        };
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        let key = if substituted && key == vars::BASE {
            vars::BASE_ORIG
        } else {
            key
        };
        if !config.disallow_env_changes && caller_keys.contains(key.as_bytes()) {
            continue;
        }
        out.push(entry(key, value));
        present.insert(key.as_bytes().to_vec());
    }

    for e in caller {
        if let Some(key) = entry_key(e) {
            if present.contains(key) || (substituted && key == vars::BASE.as_bytes()) {
                continue;
            }
            present.insert(key.to_vec());
        }
        out.push(e.clone());
    }

    if let Some(real) = library_real(config, caller) {
        let real = entry(vars::LD_LIBRARY_REAL, real);
        match out
            .iter()
            .position(|e| entry_key(e) == Some(vars::LD_LIBRARY_REAL.as_bytes()))
        {
            Some(i) => out[i] = real,
            None => out.push(real),
        }
    }
    Ok(out)
}

/// Derives `LD_LIBRARY_REAL` from the caller's `LD_LIBRARY_PATH`.
///
/// Each entry gets the base in front (`/` inserted for relative entries)
/// and the configured original library path is appended.
fn library_real(config: &Config, caller: &[OsString]) -> Option<OsString> {
    let orig = config.library_orig.as_deref()?;
    let base = config.base.as_deref()?.as_os_str().as_bytes();
    let paths = caller.iter().find_map(|e| {
        let key = entry_key(e)?;
        (key == vars::LD_LIBRARY_PATH.as_bytes()).then(|| &e.as_bytes()[key.len() + 1..])
    })?;
    if paths.is_empty() {
        return None;
    }

    let mut out = Vec::new();
    for dir in paths.split(|&b| b == b':').filter(|d| !d.is_empty()) {
        out.extend_from_slice(base);
        if !crate::path::is_absolute(Path::new(OsStr::from_bytes(dir))) {
            out.push(b'/');
        }
        out.extend_from_slice(dir);
        out.push(b':');
    }
    out.extend_from_slice(orig.as_bytes());
    Some(OsString::from_vec(out))
}
