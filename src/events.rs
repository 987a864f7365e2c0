//! User-facing events and the sink that receives them.

use std::{fmt, ops::ControlFlow, path::PathBuf};

use bitflags::bitflags;

bitflags! {
    /// Bitfield describing what happened at an event path.
    ///
    /// The natural bits are numerically identical to the kernel's inotify
    /// mask bits, so a mask can be compared against values read from other
    /// inotify consumers. The synthetic bits occupy high bits the kernel
    /// leaves unused.
    ///
    /// More than one bit can be set on a single event; test with
    /// [`contains`](EventMask::contains) or
    /// [`intersects`](EventMask::intersects), never with equality.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        /// File was accessed.
        const ACCESS = 0x0000_0001;
        /// File was modified.
        const MODIFY = 0x0000_0002;
        /// Metadata changed.
        const ATTRIB = 0x0000_0004;
        /// A writable file was closed.
        const CLOSE_WRITE = 0x0000_0008;
        /// An unwritable file was closed.
        const CLOSE_NOWRITE = 0x0000_0010;
        /// File was opened.
        const OPEN = 0x0000_0020;
        /// File was moved out of a watched directory.
        const MOVED_FROM = 0x0000_0040;
        /// File was moved into a watched directory.
        const MOVED_TO = 0x0000_0080;
        /// File or directory was created.
        const CREATE = 0x0000_0100;
        /// File or directory was deleted.
        const DELETE = 0x0000_0200;
        /// A watched directory was itself deleted.
        const ROOT_DELETE = 0x0000_0400;
        /// A watched directory was itself moved.
        const ROOT_MOVE = 0x0000_0800;
        /// The filesystem backing the watch was unmounted.
        const UNMOUNT = 0x0000_2000;
        /// The kernel event queue overflowed; events were lost.
        const QUEUE_OVERFLOW = 0x0000_4000;
        /// A watch was removed, by the kernel or by an explicit removal.
        const IGNORED = 0x0000_8000;
        /// A root path's watch was torn down.
        const ROOT_IGNORED = 0x0001_0000;
        /// After this event, no root paths remain in the context.
        const WATCH_EMPTY = 0x0002_0000;
        /// The event subject is a directory.
        const ISDIR = 0x4000_0000;
    }
}

impl fmt::Display for EventMask {
    /// Renders the set bits as a comma-separated name list.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// A user-visible filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub mask: EventMask,
    /// Absolute path the event refers to; `None` only for queue overflows.
    pub path: Option<PathBuf>,
}

/// Receives the events of one context.
///
/// The sink is invoked synchronously on the context's worker thread, in the
/// order the kernel delivered the events. A slow sink raises the odds of a
/// kernel queue overflow.
pub trait EventSink: Send {
    /// Called for every delivered event.
    ///
    /// Return [`ControlFlow::Continue`] to keep the context running, or
    /// [`ControlFlow::Break`] to terminate it, which is equivalent to
    /// calling [`destroy`](crate::destroy) on its handle.
    fn on_event(&mut self, event: &Event) -> ControlFlow<()>;
}

impl<F: FnMut(&Event) -> ControlFlow<()> + Send> EventSink for F {
    fn on_event(&mut self, event: &Event) -> ControlFlow<()> {
        self(event)
    }
}

/// Helper to build a sink from a closure.
pub fn sink(f: impl FnMut(&Event) -> ControlFlow<()> + Send) -> impl EventSink {
    f
}

#[cfg(test)]
mod tests {
    use nix::sys::inotify::AddWatchFlags;

    use super::*;

    #[test]
    fn natural_bits_match_the_kernel() {
        for (ours, kernel) in [
            (EventMask::ACCESS, AddWatchFlags::IN_ACCESS),
            (EventMask::MODIFY, AddWatchFlags::IN_MODIFY),
            (EventMask::ATTRIB, AddWatchFlags::IN_ATTRIB),
            (EventMask::CLOSE_WRITE, AddWatchFlags::IN_CLOSE_WRITE),
            (EventMask::CLOSE_NOWRITE, AddWatchFlags::IN_CLOSE_NOWRITE),
            (EventMask::OPEN, AddWatchFlags::IN_OPEN),
            (EventMask::MOVED_FROM, AddWatchFlags::IN_MOVED_FROM),
            (EventMask::MOVED_TO, AddWatchFlags::IN_MOVED_TO),
            (EventMask::CREATE, AddWatchFlags::IN_CREATE),
            (EventMask::DELETE, AddWatchFlags::IN_DELETE),
            (EventMask::ROOT_DELETE, AddWatchFlags::IN_DELETE_SELF),
            (EventMask::ROOT_MOVE, AddWatchFlags::IN_MOVE_SELF),
            (EventMask::UNMOUNT, AddWatchFlags::IN_UNMOUNT),
            (EventMask::QUEUE_OVERFLOW, AddWatchFlags::IN_Q_OVERFLOW),
            (EventMask::IGNORED, AddWatchFlags::IN_IGNORED),
            (EventMask::ISDIR, AddWatchFlags::IN_ISDIR),
        ] {
            assert_eq!(ours.bits(), kernel.bits());
        }
    }

    #[test]
    fn synthetic_bits_stay_clear_of_kernel_bits() {
        let synthetic = EventMask::ROOT_IGNORED | EventMask::WATCH_EMPTY;
        assert_eq!(AddWatchFlags::all().bits() & synthetic.bits(), 0);
    }

    #[test]
    fn masks_render_as_name_lists() {
        let mask = EventMask::CREATE | EventMask::ISDIR;
        assert_eq!(mask.to_string(), "CREATE, ISDIR");
        assert_eq!(EventMask::empty().to_string(), "");
    }
}
