//! Subscription management: walking directory trees and installing or
//! removing kernel watches for a context.

use std::{
    fs,
    path::{Path, PathBuf},
};

use nix::errno::Errno;
use walkdir::WalkDir;

use crate::{
    context::{standard_mask, Context, ContextHandle},
    error::WatchError,
    registry,
};

/// Watches `path` and everything beneath it, recording `path` as a root.
///
/// The path is canonicalized first (symlinks resolved, made absolute).
/// Adding a path that is already covered by an existing watch extends
/// coverage without creating a second root; adding an ancestor of an
/// existing root demotes the inner root, because the new one covers it.
///
/// # Errors
/// `PathResolution` if the path cannot be canonicalized, `InvalidArgument`
/// if it is not a directory, `ResourceExhausted` if the kernel runs out of
/// watches mid-walk.
pub fn add_root(handle: ContextHandle, path: impl AsRef<Path>) -> Result<(), WatchError> {
    let ctx = registry::lookup(handle)?;
    let canonical = fs::canonicalize(path.as_ref()).map_err(|source| WatchError::PathResolution {
        path: path.as_ref().to_path_buf(),
        source,
    })?;
    let metadata = fs::metadata(&canonical).map_err(|source| WatchError::PathResolution {
        path: canonical.clone(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(WatchError::InvalidArgument("only directories can be watched"));
    }

    {
        let mut state = ctx.state.lock().unwrap();
        // A path that is already watched is a descendant of another root;
        // it must not become a root of its own.
        if !state.wd_by_path.contains_key(&canonical) {
            state.roots.insert(canonical.clone());
        }
    }
    walk_and_subscribe(&ctx, &canonical)
}

/// Removes the watch on `path` and on every watched descendant.
///
/// `path` is matched against the indices as given; the indexed keys are the
/// canonical absolute paths recorded when the watches were installed. Any
/// watched path qualifies, root or not.
///
/// The kernel confirms each removal with an [`IGNORED`] event through the
/// context's sink; the root set is pruned when those arrive.
///
/// [`IGNORED`]: crate::EventMask::IGNORED
pub fn remove_root(handle: ContextHandle, path: impl AsRef<Path>) -> Result<(), WatchError> {
    let ctx = registry::lookup(handle)?;
    let mut state = ctx.state.lock().unwrap();
    state.remove_subtree(path.as_ref())
}

/// Snapshot of the paths added through [`add_root`] and still standing.
pub fn root_paths(handle: ContextHandle) -> Result<Vec<PathBuf>, WatchError> {
    let ctx = registry::lookup(handle)?;
    let state = ctx.state.lock().unwrap();
    let mut paths: Vec<PathBuf> = state.roots.iter().cloned().collect();
    paths.sort();
    Ok(paths)
}

/// Snapshot of every directory currently carrying a kernel watch, in path
/// order.
pub fn watched_paths(handle: ContextHandle) -> Result<Vec<PathBuf>, WatchError> {
    let ctx = registry::lookup(handle)?;
    let state = ctx.state.lock().unwrap();
    Ok(state.path_order.keys().cloned().collect())
}

/// Walks `root` depth-first and installs a kernel watch on every directory
/// found, including `root` itself.
///
/// The walk stays on one filesystem and never follows symlinks. Coverage is
/// best-effort: directories that cannot be watched are logged and skipped,
/// and only resource exhaustion aborts the walk. Descendant directories
/// that were roots of their own are demoted along the way.
///
/// The context lock is taken once per directory, so the worker keeps
/// draining events while a large tree is being walked.
pub(crate) fn walk_and_subscribe(ctx: &Context, root: &Path) -> Result<(), WatchError> {
    log::trace!("walk_and_subscribe {root:?}");
    for entry in WalkDir::new(root).follow_links(false).same_file_system(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("skipping unreadable entry under {root:?}: {e}");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let depth = entry.depth();
        let path = entry.into_path();

        let mut state = ctx.state.lock().unwrap();
        if depth > 0 && state.roots.remove(&path) {
            log::debug!("{path:?} is covered by {root:?} now, dropping its root status");
        }
        match state.notifier()?.add_watch(&path, standard_mask()) {
            Ok(wd) => state.index_watch(wd, standard_mask(), path),
            Err(Errno::ENOENT) => {
                // Removed between the directory listing and the watch call.
                log::debug!("{path:?} vanished before it could be watched");
            }
            Err(errno @ (Errno::ENOSPC | Errno::ENOMEM)) => {
                return Err(WatchError::ResourceExhausted(errno));
            }
            Err(e) => {
                log::warn!("could not watch {path:?}: {e}");
            }
        }
    }
    Ok(())
}
