use std::io;

/// Errors surfaced by [`crate::Ring`] construction, teardown-adjacent
/// syscalls and cancellation. Submission back-pressure is *not* an error:
/// operation methods return `None` and the caller reaps before retrying.
#[derive(thiserror::Error, Debug)]
pub enum RingError {
    /// The ring needs at least one submission entry.
    #[error("queue depth must be positive")]
    InvalidQueueDepth,

    /// Paths cross the kernel boundary NUL-terminated, so an interior NUL
    /// byte cannot be represented.
    #[error("path contains an interior NUL byte")]
    InvalidPath(#[from] std::ffi::NulError),

    /// The job handle refers to an operation whose slot has already been
    /// released (and possibly recycled). Caught before anything is pushed
    /// to the kernel.
    #[error("job refers to an operation that has already completed")]
    StaleJob,

    /// A ring syscall failed for a non-transient reason.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RingError {
    pub(crate) fn sys(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}

/// Maps an errno (negative completion results included) to the host's
/// symbolic error via its absolute value.
///
/// Completion results below zero carry `-errno`; this is the intended
/// decoder for them.
pub fn error_of_errno(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno.abs())
}
