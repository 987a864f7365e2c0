//! Recursive directory watching on top of Linux's flat inotify primitive.
//!
//! inotify reports events only for directories explicitly subscribed to.
//! This crate extends it to whole trees: callers name root directories, and
//! a per-context worker thread keeps kernel watches installed on every
//! directory beneath them as subdirectories are created, renamed in,
//! renamed out, or deleted. Raw kernel events are translated into
//! path-qualified [`Event`]s and handed to a caller-supplied [`EventSink`],
//! in kernel order.
//!
//! Contexts are independent: each one owns its notifier, its watch indices
//! and its worker thread, and many can coexist in one process. They are
//! addressed through [`ContextHandle`]s minted by [`init`].
//!
//! # Example
//!
//! ```no_run
//! use std::ops::ControlFlow;
//!
//! let handle = tree_watcher::init(tree_watcher::sink(|event| {
//!     println!("{}\t{:?}", event.mask, event.path);
//!     ControlFlow::Continue(())
//! }))?;
//! tree_watcher::add_root(handle, "/tmp/data")?;
//! tree_watcher::wait_until_done(handle)?;
//! # Ok::<(), tree_watcher::WatchError>(())
//! ```
//!
//! A kernel queue overflow is reported as an [`EventMask::QUEUE_OVERFLOW`]
//! event with no path, after which the context rebuilds every watch from
//! its recorded roots. Events the kernel dropped stay dropped.

// inotify and epoll are Linux mechanisms.
#[cfg(not(target_os = "linux"))]
compile_error!("only Linux is supported");

mod context;
mod error;
mod events;
mod registry;
mod watch;
mod worker;

pub mod tunables;

pub use context::ContextHandle;
pub use error::WatchError;
pub use events::{sink, Event, EventMask, EventSink};
pub use registry::{destroy, detach, init, reinitiate, reinitiate_all, wait_until_done};
pub use watch::{add_root, remove_root, root_paths, watched_paths};
