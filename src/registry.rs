//! The process-wide registry of contexts and their lifecycle operations.

use std::{
    os::fd::{AsFd, AsRawFd},
    sync::{Arc, Mutex, OnceLock},
    thread,
};

use mio::{unix::SourceFd, Interest, Poll, Waker};
use nix::sys::inotify::{InitFlags, Inotify};
use rustc_hash::FxHashMap;

use crate::{
    context::{Context, ContextHandle, ContextState, CONTROL_TOKEN, NOTIFIER_TOKEN},
    error::WatchError,
    events::EventSink,
    worker,
};

/// Handle → context map, plus the counter that mints fresh handles.
struct Registry {
    next_handle: u32,
    contexts: FxHashMap<ContextHandle, Arc<Context>>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            next_handle: 1,
            contexts: FxHashMap::default(),
        })
    })
}

/// Fetches a live context.
///
/// `NotFound` for unknown or already-terminated handles, `NotInitialized`
/// before the first `init` of the process.
pub(crate) fn lookup(handle: ContextHandle) -> Result<Arc<Context>, WatchError> {
    let registry = REGISTRY.get().ok_or(WatchError::NotInitialized)?;
    let registry = registry.lock().unwrap();
    registry.contexts.get(&handle).cloned().ok_or(WatchError::NotFound)
}

/// Drops the registry entry of a terminated context.
pub(crate) fn forget(handle: ContextHandle) {
    if let Some(registry) = REGISTRY.get() {
        registry.lock().unwrap().contexts.remove(&handle);
    }
}

/// Creates a context and starts its worker thread.
///
/// Every delivered event of the context is handed to `sink` on the worker
/// thread, in kernel order. The returned handle stays valid until the
/// context terminates: through [`destroy`], through a sink that breaks,
/// or through an unrecoverable notifier error.
pub fn init(sink: impl EventSink + 'static) -> Result<ContextHandle, WatchError> {
    // The poller and its waker must exist before the notifier registers.
    let poll = Poll::new().map_err(WatchError::KernelIo)?;
    let waker = Waker::new(poll.registry(), CONTROL_TOKEN).map_err(WatchError::KernelIo)?;

    let notifier = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
        .map_err(WatchError::from_notifier_errno)?;
    let notifier_fd = notifier.as_fd().as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&notifier_fd), NOTIFIER_TOKEN, Interest::READABLE)
        .map_err(WatchError::KernelIo)?;

    let ctx;
    let handle;
    {
        let mut registry = registry().lock().unwrap();
        handle = ContextHandle(registry.next_handle);
        registry.next_handle += 1;
        ctx = Arc::new(Context {
            handle,
            state: Mutex::new(ContextState::new(notifier)),
            waker,
            worker: Mutex::new(None),
        });
        registry.contexts.insert(handle, Arc::clone(&ctx));
    }

    let thread_ctx = Arc::clone(&ctx);
    let spawned = thread::Builder::new()
        .name(format!("tree-watcher-{handle}"))
        .spawn(move || worker::run(thread_ctx, poll, Box::new(sink)));
    match spawned {
        Ok(join) => {
            *ctx.worker.lock().unwrap() = Some(join);
            Ok(handle)
        }
        Err(e) => {
            forget(handle);
            Err(WatchError::KernelIo(e))
        }
    }
}

/// Blocks until the context's worker thread terminates.
///
/// Returns `Ok(())` when the worker exited cleanly (an explicit [`destroy`]
/// included), and the worker's error when it terminated on one. Mutually
/// exclusive with [`detach`].
pub fn wait_until_done(handle: ContextHandle) -> Result<(), WatchError> {
    let ctx = lookup(handle)?;
    let join = ctx
        .worker
        .lock()
        .unwrap()
        .take()
        .ok_or(WatchError::InvalidArgument(
            "context is detached or already being waited on",
        ))?;
    match join.join() {
        Ok(outcome) => outcome,
        Err(_) => Err(WatchError::InternalConsistency("worker thread panicked")),
    }
}

/// Declares that the context will not be waited on.
///
/// Its resources are reclaimed when the worker terminates on its own.
/// Mutually exclusive with [`wait_until_done`].
pub fn detach(handle: ContextHandle) -> Result<(), WatchError> {
    let ctx = lookup(handle)?;
    ctx.worker
        .lock()
        .unwrap()
        .take()
        .ok_or(WatchError::InvalidArgument(
            "context is detached or already being waited on",
        ))?;
    Ok(())
}

/// Requests termination of the context.
///
/// The worker observes the request at its next wakeup, tears every index
/// and descriptor down and leaves the registry. Termination through
/// `destroy` counts as a clean exit for [`wait_until_done`]. A handle whose
/// context has already terminated reports `NotFound`.
pub fn destroy(handle: ContextHandle) -> Result<(), WatchError> {
    let ctx = lookup(handle)?;
    ctx.state.lock().unwrap().stop_requested = true;
    ctx.waker.wake().map_err(WatchError::KernelIo)
}

/// Requests that the context drop and rebuild every watch from its recorded
/// roots.
///
/// Expensive: the whole tree is re-walked. The engine performs the same
/// rebuild on its own when the kernel reports a queue overflow.
pub fn reinitiate(handle: ContextHandle) -> Result<(), WatchError> {
    let ctx = lookup(handle)?;
    ctx.state.lock().unwrap().reinit_requested = true;
    ctx.waker.wake().map_err(WatchError::KernelIo)
}

/// Requests re-initiation of every live context. Very expensive.
pub fn reinitiate_all() -> Result<(), WatchError> {
    let registry = REGISTRY.get().ok_or(WatchError::NotInitialized)?;
    let contexts: Vec<Arc<Context>> = registry.lock().unwrap().contexts.values().cloned().collect();
    for ctx in contexts {
        ctx.state.lock().unwrap().reinit_requested = true;
        if let Err(e) = ctx.waker.wake() {
            log::warn!("could not wake context {} for re-initiation: {e}", ctx.handle);
        }
    }
    Ok(())
}
