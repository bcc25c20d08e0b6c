//! Classified errors for journaled file operations.
//!
//! Every fallible operation in this crate returns [`Error`], never a bare
//! `io::Error`. Underlying OS failures are classified by errno so that
//! callers can react to the condition (out of space, permission, missing
//! file) instead of string-matching messages.

use std::io;

use thiserror::Error;

/// Result type for all journal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified error returned by every fallible operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad offsets, a closed handle, or mutation in the wrong state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target already exists with incompatible contents.
    #[error("already exists: {0}")]
    Exists(String),

    /// The operation was denied by file permissions.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The filesystem ran out of space.
    #[error("no space left on device: {0}")]
    NoSpace(String),

    /// The data file has no journal directory beside it.
    #[error("no journal directory")]
    NoJournal,

    /// A journal record failed structural or checksum validation.
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    /// The handle cannot be closed or reconfigured right now.
    #[error("busy: {0}")]
    Busy(String),

    /// A blocking call was interrupted by a signal.
    ///
    /// Interrupted syscalls are restarted internally; this variant only
    /// escapes from paths that cannot retry.
    #[error("interrupted")]
    Interrupted,

    /// An unclassified underlying I/O failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Classify an `io::Error` into one of the error kinds above.
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        match source.raw_os_error() {
            Some(libc::ENOSPC) => Error::NoSpace(context),
            Some(libc::EACCES) | Some(libc::EPERM) => Error::Permission(context),
            Some(libc::ENOENT) => Error::NotFound(context),
            Some(libc::EINVAL) => Error::InvalidArgument(context),
            Some(libc::EINTR) => Error::Interrupted,
            _ => match source.kind() {
                io::ErrorKind::NotFound => Error::NotFound(context),
                io::ErrorKind::PermissionDenied => Error::Permission(context),
                io::ErrorKind::AlreadyExists => Error::Exists(context),
                io::ErrorKind::InvalidInput => Error::InvalidArgument(context),
                _ => Error::Io { context, source },
            },
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }
}
