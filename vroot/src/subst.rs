//! Literal command substitution applied before a process is spawned.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::path;
use crate::{Error, Result};

/// One `command=replacement` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct Substitution {
    /// Container path the hosted program asks to execute.
    pub command: PathBuf,
    /// Host executable run instead.
    pub replacement: PathBuf,
}

/// Ordered command substitution table.
///
/// Serialized form is `cmd=replacement` pairs separated by `:`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CmdSubstTable {
    /// Entries in configuration order.
    entries: Vec<Substitution>,
}

impl CmdSubstTable {
    /// Parses a serialized table.
    ///
    /// Empty entries are ignored. An entry without `=` or with an empty
    /// command is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut table = Self::default();
        for entry in raw.split(':').filter(|e| !e.is_empty()) {
            let Some((command, replacement)) = entry.split_once('=') else {
                return Err(Error::InvalidConfig(format!(
                    "command substitution without '=': {entry}"
                )));
            };
            if command.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "command substitution with empty command: {entry}"
                )));
            }
            table.push(command, replacement);
        }
        Ok(table)
    }

    /// Appends an entry; earlier entries win on lookup.
    pub fn push(&mut self, command: impl Into<PathBuf>, replacement: impl Into<PathBuf>) {
        self.entries.push(Substitution {
            command: command.into(),
            replacement: replacement.into(),
        });
    }

    /// Returns the replacement for `command`, if any.
    ///
    /// `command` is normalized first; keys must then match exactly, so
    /// `/bin/lsx` does not hit an entry for `/bin/ls`.
    pub fn lookup(&self, command: &Path) -> Option<&Path> {
        if self.entries.is_empty() {
            return None;
        }
        let command = path::normalize(command);
        self.entries
            .iter()
            .find(|e| e.command == command)
            .map(|e| e.replacement.as_path())
    }

    /// Returns `true` if the table has no entries.
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in lookup order.
    pub fn iter(&self) -> impl Iterator<Item = &Substitution> {
        self.entries.iter()
    }
}

impl fmt::Display for CmdSubstTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{}={}", e.command.display(), e.replacement.display())?;
        }
        Ok(())
    }
}
