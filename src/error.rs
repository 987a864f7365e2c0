use std::{io, path::PathBuf};

use nix::errno::Errno;
use thiserror::Error;

/// An error returned by the watch engine.
#[derive(Debug, Error)]
pub enum WatchError {
    /// A caller-supplied argument is unusable (non-directory root path,
    /// non-numeric limit, wait on a detached context, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A caller-supplied path could not be canonicalized.
    #[error("could not resolve {path:?}")]
    PathResolution {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The kernel refused to allocate: an inotify limit was reached or
    /// memory ran out.
    #[error("kernel notifier resources exhausted")]
    ResourceExhausted(#[source] Errno),

    /// Reading, registering or replacing the kernel notifier failed.
    #[error("I/O error on the kernel notifier")]
    KernelIo(#[source] io::Error),

    /// The handle is unknown, or the path carries no watch.
    #[error("unknown handle or unwatched path")]
    NotFound,

    /// No context has ever been created, or this one is mid-teardown.
    #[error("not initialized or already torn down")]
    NotInitialized,

    /// The event sink requested termination of the context.
    #[error("event sink requested termination")]
    SinkTerminated,

    /// An index lookup failed where the invariants require a hit.
    #[error("internal index inconsistency: {0}")]
    InternalConsistency(&'static str),
}

impl WatchError {
    /// Maps an errno from a notifier call to the matching error kind.
    pub(crate) fn from_notifier_errno(errno: Errno) -> Self {
        match errno {
            Errno::ENOSPC | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE => {
                WatchError::ResourceExhausted(errno)
            }
            other => WatchError::KernelIo(io::Error::from(other)),
        }
    }
}
