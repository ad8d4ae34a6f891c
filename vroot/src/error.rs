//! Error types for vroot operations.

use std::ffi::NulError;
use std::path::PathBuf;
use std::time::Duration;

/// Alias for `Result<T, vroot::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the path-virtualization engine.
///
/// Shims never expose these to the hosted program; they convert them with
/// [`Error::errno`] and report the conventional failure of the intercepted
/// call instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A translated or intermediate path exceeded the maximum path length.
    #[error("path of {len} bytes exceeds the {max}-byte limit")]
    PathTooLong {
        /// Length of the offending path in bytes.
        len: usize,
        /// The configured maximum.
        max: usize,
    },

    /// Too many symbolic links were followed while resolving a path.
    #[error("too many levels of symbolic links resolving {}", path.display())]
    SymlinkLoop {
        /// The container path being resolved.
        path: PathBuf,
    },

    /// The file a translated path points to does not exist or is unreadable.
    #[error("{} not found", path.display())]
    NotFound {
        /// The host path that could not be opened.
        path: PathBuf,
    },

    /// Allocation failed while building an environment or argument block.
    #[error("out of memory")]
    OutOfMemory,

    /// The external patch tool could not be run or exited unsuccessfully.
    #[error("{}: {reason}", tool.display())]
    ExternalToolFailed {
        /// Path of the tool that failed.
        tool: PathBuf,
        /// Human-readable failure description.
        reason: String,
    },

    /// The external patch tool did not finish in time and was killed.
    #[error("{} timed out after {timeout:?}", tool.display())]
    ToolTimedOut {
        /// Path of the tool that hung.
        tool: PathBuf,
        /// The wait bound that expired.
        timeout: Duration,
    },

    /// An environment-supplied table or value was malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The writable-library registry reached its configured capacity.
    #[error("writable library registry is full ({capacity} entries)")]
    RegistryFull {
        /// The configured ceiling.
        capacity: usize,
    },

    /// A string argument contained an interior NUL byte.
    #[error("interior NUL byte in string argument")]
    Nul(#[from] NulError),

    /// An I/O error from the host.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the errno a libc shim should report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::PathTooLong { .. } => libc::ENAMETOOLONG,
            Self::SymlinkLoop { .. } => libc::ELOOP,
            Self::NotFound { .. } => libc::ENOENT,
            Self::OutOfMemory => libc::ENOMEM,
            Self::InvalidConfig(_) | Self::Nul(_) => libc::EINVAL,
            Self::RegistryFull { .. } => libc::EMFILE,
            Self::ExternalToolFailed { .. } | Self::ToolTimedOut { .. } => libc::EIO,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let long = Error::PathTooLong { len: 5000, max: 4096 };
        assert_eq!(long.errno(), libc::ENAMETOOLONG);

        let looped = Error::SymlinkLoop {
            path: PathBuf::from("/a"),
        };
        assert_eq!(looped.errno(), libc::ELOOP);

        let io = Error::from(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(io.errno(), libc::EACCES);

        let synthetic = Error::from(std::io::Error::other("boom"));
        assert_eq!(synthetic.errno(), libc::EIO);
    }

    #[test]
    fn display_names_the_path() {
        let err = Error::NotFound {
            path: PathBuf::from("/base/bin/ls"),
        };
        assert_eq!(err.to_string(), "/base/bin/ls not found");
    }
}
