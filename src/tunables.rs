//! Helpers that adjust the kernel's inotify limits.
//!
//! The limits live under `/proc/sys/fs/inotify` and hold until the next
//! reboot; writing them usually requires privileges. A running context
//! picks up `max_queued_events` only when its notifier is created, so a
//! [`reinitiate`](crate::reinitiate) may be needed for the new value to
//! take effect.

use std::{fs, path::Path};

use crate::error::WatchError;

const MAX_QUEUED_EVENTS: &str = "/proc/sys/fs/inotify/max_queued_events";
const MAX_USER_INSTANCES: &str = "/proc/sys/fs/inotify/max_user_instances";
const MAX_USER_WATCHES: &str = "/proc/sys/fs/inotify/max_user_watches";

/// Sets the upper bound on queued-but-unread events per notifier. The
/// kernel reports a queue overflow when it is hit.
pub fn set_max_queued_events(value: &str) -> Result<(), WatchError> {
    write_limit(MAX_QUEUED_EVENTS.as_ref(), value)
}

/// Sets the upper bound on notifier instances per real user id.
pub fn set_max_user_instances(value: &str) -> Result<(), WatchError> {
    write_limit(MAX_USER_INSTANCES.as_ref(), value)
}

/// Sets the upper bound on watches per real user id.
pub fn set_max_user_watches(value: &str) -> Result<(), WatchError> {
    write_limit(MAX_USER_WATCHES.as_ref(), value)
}

fn write_limit(pseudo_file: &Path, value: &str) -> Result<(), WatchError> {
    if value.is_empty() || value.parse::<u64>().is_err() {
        return Err(WatchError::InvalidArgument("limit must be a numeric string"));
    }
    fs::write(pseudo_file, value).map_err(WatchError::KernelIo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_must_be_numeric() {
        assert!(matches!(
            set_max_user_watches("not-a-number"),
            Err(WatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            set_max_queued_events(""),
            Err(WatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            set_max_user_instances("-3"),
            Err(WatchError::InvalidArgument(_))
        ));
    }
}
