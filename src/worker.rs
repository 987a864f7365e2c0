//! The per-context event loop: waits for notifier readiness, drains the raw
//! kernel stream, and turns it into user-visible events and index updates.

use std::{
    io::ErrorKind,
    ops::ControlFlow,
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use mio::{unix::SourceFd, Events, Interest, Poll, Registry};
use nix::{
    errno::Errno,
    sys::inotify::{InitFlags, Inotify, InotifyEvent},
};

use crate::{
    context::{Context, CONTROL_TOKEN, NOTIFIER_TOKEN},
    error::WatchError,
    events::{Event, EventMask, EventSink},
    registry,
    watch::walk_and_subscribe,
};

const POLL_CAPACITY: usize = 20;

/// What one raw event means for the rest of the drain.
enum Outcome {
    Continue,
    /// The notifier was replaced; anything still queued refers to the old one.
    Reinitiated,
    SinkStop,
}

/// Thread body of a context's worker. Cleans up whatever the loop leaves
/// behind, clean exit or not, and takes the context out of the registry.
pub(crate) fn run(ctx: Arc<Context>, mut poll: Poll, mut sink: Box<dyn EventSink>) -> Result<(), WatchError> {
    let outcome = event_loop(&ctx, &mut poll, sink.as_mut());
    if let Err(e) = &outcome {
        log::error!("context {} terminated: {e}", ctx.handle);
    }
    teardown(&ctx, &poll);
    log::debug!("context {} stopped", ctx.handle);
    outcome
}

fn event_loop(ctx: &Arc<Context>, poll: &mut Poll, sink: &mut dyn EventSink) -> Result<(), WatchError> {
    let mut events = Events::with_capacity(POLL_CAPACITY);
    loop {
        log::trace!("context {}: polling", ctx.handle);
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(WatchError::KernelIo(e));
        }

        for event in events.iter() {
            if event.token() == CONTROL_TOKEN {
                let (stop, reinit) = {
                    let mut state = ctx.state.lock().unwrap();
                    let flags = (state.stop_requested, state.reinit_requested);
                    state.reinit_requested = false;
                    flags
                };
                if stop {
                    return Ok(());
                }
                if reinit {
                    reinitiate(ctx, poll.registry())?;
                }
                continue;
            }

            match drain_notifier(ctx, poll.registry(), sink)? {
                ControlFlow::Continue(()) => {}
                ControlFlow::Break(()) => return Err(WatchError::SinkTerminated),
            }
        }
    }
}

/// Reads raw events until the notifier runs dry.
///
/// The notifier is registered edge-triggered, so the stream must be drained
/// to `EAGAIN` before the next readiness wait.
fn drain_notifier(
    ctx: &Arc<Context>,
    registry: &Registry,
    sink: &mut dyn EventSink,
) -> Result<ControlFlow<()>, WatchError> {
    loop {
        let batch = {
            let state = ctx.state.lock().unwrap();
            match state.notifier()?.read_events() {
                Ok(batch) => batch,
                Err(Errno::EAGAIN) => return Ok(ControlFlow::Continue(())),
                Err(e) => return Err(WatchError::KernelIo(std::io::Error::from(e))),
            }
        };
        for raw in batch {
            log::trace!("context {}: event {raw:?}", ctx.handle);
            match handle_raw_event(ctx, registry, sink, raw)? {
                Outcome::Continue => {}
                Outcome::Reinitiated => return Ok(ControlFlow::Continue(())),
                Outcome::SinkStop => return Ok(ControlFlow::Break(())),
            }
        }
    }
}

/// Processes one raw kernel event: hand it off to the sink when the rules
/// say so, then apply whatever subscription changes it implies.
fn handle_raw_event(
    ctx: &Arc<Context>,
    registry: &Registry,
    sink: &mut dyn EventSink,
    raw: InotifyEvent,
) -> Result<Outcome, WatchError> {
    let raw_mask = EventMask::from_bits_retain(raw.mask.bits());

    if raw_mask.contains(EventMask::QUEUE_OVERFLOW) {
        // Events were lost; tell the sink, then rebuild from the roots.
        let event = Event {
            mask: raw_mask,
            path: None,
        };
        if sink.on_event(&event).is_break() {
            return Ok(Outcome::SinkStop);
        }
        log::warn!(
            "context {}: kernel queue overflowed, rebuilding all watches",
            ctx.handle
        );
        reinitiate(ctx, registry)?;
        return Ok(Outcome::Reinitiated);
    }

    // Decide what to deliver while the indices still describe the moment
    // the kernel saw.
    let (decision, watched_path, event_path, is_root) = {
        let state = ctx.state.lock().unwrap();
        let Some(entry) = state.wd_by_id.get(&raw.wd) else {
            // The descriptor was torn down before this event was read.
            log::debug!(
                "context {}: dropping an event for a descriptor no longer indexed",
                ctx.handle
            );
            return Ok(Outcome::Continue);
        };
        let watched_path = entry.path.clone();
        let event_path = match &raw.name {
            Some(name) => watched_path.join(name),
            None => watched_path.clone(),
        };
        let is_root = state.roots.contains(&watched_path);
        let decision = decide_handoff(
            raw_mask,
            is_root,
            raw.name.is_some(),
            state.wd_by_path.contains_key(&event_path),
            state.roots.len(),
        );
        (decision, watched_path, event_path, is_root)
    };

    // The sink runs without the context lock, so it may call back into the
    // public API freely.
    if let Some(mask) = decision {
        let event = Event {
            mask,
            path: Some(event_path.clone()),
        };
        if sink.on_event(&event).is_break() {
            return Ok(Outcome::SinkStop);
        }
    }

    apply_transitions(ctx, &raw, raw_mask, &watched_path, &event_path, is_root)?;
    Ok(Outcome::Continue)
}

/// Handoff rules: which events reach the sink, and with which mask.
///
/// A self-move or self-delete below a root is suppressed, because the
/// parent watch reports the same change on the child name. An event on a
/// child directory that carries its own watch is suppressed too, except
/// for the modify and move masks, which only the parent reports with the
/// child name. An ignored root gains `ROOT_IGNORED`, plus `WATCH_EMPTY`
/// when it was the last root standing.
fn decide_handoff(
    mask: EventMask,
    is_root: bool,
    has_name: bool,
    child_indexed: bool,
    roots_len: usize,
) -> Option<EventMask> {
    if !is_root && mask.intersects(EventMask::ROOT_MOVE | EventMask::ROOT_DELETE) {
        return None;
    }

    let mut handoff = mask;
    if is_root && mask.contains(EventMask::IGNORED) {
        handoff |= EventMask::ROOT_IGNORED;
        if roots_len == 1 {
            handoff |= EventMask::WATCH_EMPTY;
        }
    }

    if mask.contains(EventMask::ISDIR)
        && has_name
        && child_indexed
        && !mask.intersects(EventMask::MODIFY | EventMask::MOVED_FROM | EventMask::MOVED_TO)
    {
        return None;
    }

    Some(handoff)
}

/// Applies the subscription changes a raw event implies.
fn apply_transitions(
    ctx: &Arc<Context>,
    raw: &InotifyEvent,
    mask: EventMask,
    watched_path: &Path,
    event_path: &Path,
    is_root: bool,
) -> Result<(), WatchError> {
    let is_dir = mask.contains(EventMask::ISDIR);

    if is_dir && mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        // A directory appeared below a watched one: cover its subtree. The
        // path is derived from an indexed entry, hence already canonical.
        walk_and_subscribe(ctx, event_path)?;
    } else if is_dir && mask.contains(EventMask::MOVED_FROM) {
        // A directory left the tree; its watches point at the wrong place.
        let mut state = ctx.state.lock().unwrap();
        if let Err(e) = state.remove_subtree(event_path) {
            log::warn!("could not tear down the subtree at {event_path:?}: {e}");
        }
    }

    if mask.contains(EventMask::ROOT_MOVE) && is_root {
        // A root moved away. Descendant self-moves need nothing here: the
        // parent watch reports them as a move-from and the branch above
        // tears them down.
        let mut state = ctx.state.lock().unwrap();
        if let Err(e) = state.remove_subtree(watched_path) {
            log::warn!("could not tear down the moved root {watched_path:?}: {e}");
        }
    }

    if mask.contains(EventMask::IGNORED) {
        let mut state = ctx.state.lock().unwrap();
        state.forget_watch(&raw.wd, watched_path);
    }

    Ok(())
}

/// Closes and reopens the notifier, then rebuilds every watch from the
/// recorded roots.
///
/// Events dropped before the rebuild stay dropped; the overflow delivery
/// that usually precedes this call is the caller's only notice.
fn reinitiate(ctx: &Arc<Context>, registry: &Registry) -> Result<(), WatchError> {
    let roots = {
        let mut state = ctx.state.lock().unwrap();
        if let Some(old) = state.take_notifier() {
            let fd = old.as_fd().as_raw_fd();
            if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                log::warn!("could not deregister the stale notifier: {e}");
            }
            // Dropping the handle closes the descriptor and all its watches.
        }
        state.clear_watches();

        let notifier = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(WatchError::from_notifier_errno)?;
        let fd = notifier.as_fd().as_raw_fd();
        registry
            .register(&mut SourceFd(&fd), NOTIFIER_TOKEN, Interest::READABLE)
            .map_err(WatchError::KernelIo)?;
        state.replace_notifier(notifier);

        let mut roots: Vec<PathBuf> = state.roots.iter().cloned().collect();
        roots.sort();
        roots
    };

    for root in roots {
        walk_and_subscribe(ctx, &root)?;
    }
    Ok(())
}

/// Releases every resource of the context and leaves the registry.
fn teardown(ctx: &Arc<Context>, poll: &Poll) {
    {
        let mut state = ctx.state.lock().unwrap();
        if let Some(notifier) = state.take_notifier() {
            let fd = notifier.as_fd().as_raw_fd();
            if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
                log::debug!("could not deregister the notifier during teardown: {e}");
            }
        }
        state.clear_watches();
        state.roots.clear();
    }
    registry::forget(ctx.handle);
}

#[cfg(test)]
mod tests {
    use super::decide_handoff;
    use crate::events::EventMask;

    #[test]
    fn self_events_below_roots_are_suppressed() {
        assert_eq!(decide_handoff(EventMask::ROOT_DELETE, false, false, false, 1), None);
        assert_eq!(decide_handoff(EventMask::ROOT_MOVE, false, false, false, 1), None);
        // On a root they pass through.
        assert_eq!(
            decide_handoff(EventMask::ROOT_DELETE, true, false, false, 1),
            Some(EventMask::ROOT_DELETE)
        );
    }

    #[test]
    fn ignored_roots_gain_the_synthetic_bits() {
        assert_eq!(
            decide_handoff(EventMask::IGNORED, true, false, false, 2),
            Some(EventMask::IGNORED | EventMask::ROOT_IGNORED)
        );
        assert_eq!(
            decide_handoff(EventMask::IGNORED, true, false, false, 1),
            Some(EventMask::IGNORED | EventMask::ROOT_IGNORED | EventMask::WATCH_EMPTY)
        );
        // A descendant's ignore stays plain.
        assert_eq!(
            decide_handoff(EventMask::IGNORED, false, false, false, 1),
            Some(EventMask::IGNORED)
        );
    }

    #[test]
    fn watched_children_do_not_double_report() {
        let attrib = EventMask::ATTRIB | EventMask::ISDIR;
        // The deeper watch reports it without the name.
        assert_eq!(decide_handoff(attrib, false, true, true, 1), None);
        // No deeper watch yet: the parent's report is the only one.
        assert_eq!(decide_handoff(attrib, false, true, false, 1), Some(attrib));
        // Moves are only visible to the parent, never suppressed.
        let moved = EventMask::MOVED_TO | EventMask::ISDIR;
        assert_eq!(decide_handoff(moved, false, true, true, 1), Some(moved));
    }
}
