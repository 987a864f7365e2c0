//! Per-context state: the watch indices and the operations that keep them
//! mutually consistent.

use std::{
    collections::BTreeMap,
    fmt,
    ops::Bound,
    path::{Path, PathBuf},
    sync::Mutex,
    thread::JoinHandle,
};

use mio::{Token, Waker};
use nix::sys::inotify::{AddWatchFlags, Inotify, WatchDescriptor};
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

use crate::error::WatchError;

/// Identifies one context in the process-wide registry.
///
/// Handles are positive integers, minted by [`init`](crate::init) and never
/// reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub(crate) u32);

impl ContextHandle {
    /// The raw integer behind the handle.
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Rebuilds a handle from its raw integer, e.g. one carried over IPC.
    /// Only meaningful in the process that minted it.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tokens the worker distinguishes on its readiness poller.
pub(crate) const NOTIFIER_TOKEN: Token = Token(0);
pub(crate) const CONTROL_TOKEN: Token = Token(1);

/// Sized for trees with many directories.
const INDEX_CAPACITY: usize = 512;

// AddWatchFlags ops are not const
pub(crate) fn standard_mask() -> AddWatchFlags {
    AddWatchFlags::IN_ALL_EVENTS
        | AddWatchFlags::from_bits_retain(nix::libc::IN_EXCL_UNLINK)
        | AddWatchFlags::IN_DONT_FOLLOW
        | AddWatchFlags::IN_ONLYDIR
}

/// One kernel subscription to one directory.
#[derive(Debug)]
pub(crate) struct WatchEntry {
    pub(crate) mask: AddWatchFlags,
    pub(crate) path: PathBuf,
}

/// A context, shared between its worker thread and the public API.
pub(crate) struct Context {
    pub(crate) handle: ContextHandle,
    pub(crate) state: Mutex<ContextState>,
    /// Wakes the worker out of its readiness wait for stop and re-initiation
    /// requests.
    pub(crate) waker: Waker,
    /// Consumed by `wait_until_done` (joined) or `detach` (dropped).
    pub(crate) worker: Mutex<Option<JoinHandle<Result<(), WatchError>>>>,
}

/// Everything protected by the per-context lock.
pub(crate) struct ContextState {
    /// `None` only while the context is being torn down or while its
    /// notifier is being replaced.
    notifier: Option<Inotify>,
    /// Owns the entries; the other indices hold keys into this one.
    pub(crate) wd_by_id: FxHashMap<WatchDescriptor, WatchEntry>,
    pub(crate) wd_by_path: FxHashMap<PathBuf, WatchDescriptor>,
    /// Ordered by path so that a subtree is a contiguous key range.
    pub(crate) path_order: BTreeMap<PathBuf, WatchDescriptor>,
    /// Paths added through the public add operation, minus demotions.
    pub(crate) roots: FxHashSet<PathBuf>,
    /// Count of live watches; kept equal to `wd_by_id.len()`.
    pub(crate) nwd: usize,
    pub(crate) stop_requested: bool,
    pub(crate) reinit_requested: bool,
}

impl ContextState {
    pub(crate) fn new(notifier: Inotify) -> Self {
        Self {
            notifier: Some(notifier),
            wd_by_id: FxHashMap::with_capacity_and_hasher(INDEX_CAPACITY, FxBuildHasher),
            wd_by_path: FxHashMap::with_capacity_and_hasher(INDEX_CAPACITY, FxBuildHasher),
            path_order: BTreeMap::new(),
            roots: FxHashSet::default(),
            nwd: 0,
            stop_requested: false,
            reinit_requested: false,
        }
    }

    /// The live notifier, or `NotInitialized` once teardown has begun.
    pub(crate) fn notifier(&self) -> Result<&Inotify, WatchError> {
        self.notifier.as_ref().ok_or(WatchError::NotInitialized)
    }

    /// Installs a fresh notifier during re-initiation.
    pub(crate) fn replace_notifier(&mut self, notifier: Inotify) {
        self.notifier = Some(notifier);
    }

    /// Removes the notifier; dropping it closes the descriptor and every
    /// watch with it.
    pub(crate) fn take_notifier(&mut self) -> Option<Inotify> {
        self.notifier.take()
    }

    /// Records a kernel watch in all three indices.
    ///
    /// An already-known descriptor refreshes the existing entry; if the
    /// kernel handed the descriptor out for a different path, the
    /// path-keyed indices are repaired to match.
    pub(crate) fn index_watch(&mut self, wd: WatchDescriptor, mask: AddWatchFlags, path: PathBuf) {
        if let Some(entry) = self.wd_by_id.get_mut(&wd) {
            log::trace!("refreshing the watch on {:?} (mask {:?})", entry.path, entry.mask);
            entry.mask = mask;
            if entry.path != path {
                self.wd_by_path.remove(&entry.path);
                self.path_order.remove(&entry.path);
                entry.path = path.clone();
                self.wd_by_path.insert(path.clone(), wd.clone());
                self.path_order.insert(path, wd);
            }
            return;
        }
        self.wd_by_id.insert(wd.clone(), WatchEntry { mask, path: path.clone() });
        self.wd_by_path.insert(path.clone(), wd.clone());
        self.path_order.insert(path, wd);
        self.nwd += 1;
    }

    /// Drops every record of a watch the kernel has reported gone.
    pub(crate) fn forget_watch(&mut self, wd: &WatchDescriptor, path: &Path) {
        if self.wd_by_id.remove(wd).is_none() {
            log::warn!("no descriptor entry for {path:?} while reconciling its removal");
        }
        if self.wd_by_path.remove(path).is_none() {
            log::warn!("no path entry for {path:?} while reconciling its removal");
        }
        self.path_order.remove(path);
        self.roots.remove(path);
        match self.nwd.checked_sub(1) {
            Some(n) => self.nwd = n,
            None => log::warn!("watch count underflow while removing {path:?}"),
        }
    }

    /// Removes the watch on `path` and on every indexed descendant.
    ///
    /// Only `path_order` is updated here. The kernel acknowledges each
    /// removal with an ignore event, and the event loop reconciles the
    /// remaining indices when it arrives.
    pub(crate) fn remove_subtree(&mut self, path: &Path) -> Result<(), WatchError> {
        let wd = self.wd_by_path.get(path).cloned().ok_or(WatchError::NotFound)?;
        self.path_order.remove(path);
        self.notifier()?
            .rm_watch(wd)
            .map_err(WatchError::from_notifier_errno)?;

        // The descendants of `path` form a contiguous key run right after
        // it in the ordered index, so scan until the prefix stops matching.
        loop {
            let next = self
                .path_order
                .range::<Path, _>((Bound::Excluded(path), Bound::Unbounded))
                .next()
                .filter(|(candidate, _)| candidate.starts_with(path))
                .map(|(candidate, wd)| (candidate.clone(), wd.clone()));
            let Some((descendant, wd)) = next else {
                break;
            };
            self.path_order.remove(&descendant);
            if let Err(e) = self.notifier()?.rm_watch(wd) {
                log::warn!("could not remove the watch on {descendant:?}: {e}");
            }
        }
        Ok(())
    }

    /// Clears every index except `roots`.
    pub(crate) fn clear_watches(&mut self) {
        self.wd_by_id.clear();
        self.wd_by_path.clear();
        self.path_order.clear();
        self.nwd = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use nix::sys::inotify::InitFlags;
    use pretty_assertions::assert_eq;

    use super::*;

    fn fresh_state() -> ContextState {
        let notifier = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).unwrap();
        ContextState::new(notifier)
    }

    fn watch(state: &mut ContextState, path: &Path) -> WatchDescriptor {
        let wd = state.notifier().unwrap().add_watch(path, standard_mask()).unwrap();
        state.index_watch(wd.clone(), standard_mask(), path.to_path_buf());
        wd
    }

    #[test]
    fn subtree_scan_spares_lookalike_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        // "a!b" and "a.bak" sort around "a/..." byte-wise but are not
        // descendants of "a".
        let dirs = ["a", "a!b", "a.bak", "ab", "a/b", "a/b/c"];
        for dir in dirs {
            fs::create_dir_all(base.join(dir)).unwrap();
        }
        let mut state = fresh_state();
        for dir in dirs {
            watch(&mut state, &base.join(dir));
        }

        state.remove_subtree(&base.join("a")).unwrap();

        let left: Vec<PathBuf> = state.path_order.keys().cloned().collect();
        assert_eq!(left, vec![base.join("a!b"), base.join("a.bak"), base.join("ab")]);
    }

    #[test]
    fn remove_subtree_on_an_unwatched_path_is_not_found() {
        let mut state = fresh_state();
        let missing = state.remove_subtree(Path::new("/nowhere/at/all"));
        assert!(matches!(missing, Err(WatchError::NotFound)));
    }

    #[test]
    fn refreshing_a_reused_descriptor_repairs_the_path_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::create_dir(base.join("old")).unwrap();
        let mut state = fresh_state();
        let wd = watch(&mut state, &base.join("old"));

        // The kernel may hand the same descriptor back for another path
        // after the old watch died; the refresh must not leave stale keys.
        state.index_watch(wd, standard_mask(), base.join("new"));

        assert_eq!(state.nwd, 1);
        assert!(!state.wd_by_path.contains_key(&base.join("old")));
        assert!(state.wd_by_path.contains_key(&base.join("new")));
        let ordered: Vec<PathBuf> = state.path_order.keys().cloned().collect();
        assert_eq!(ordered, vec![base.join("new")]);
    }

    #[test]
    fn forget_watch_clears_all_records() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::create_dir(base.join("r")).unwrap();
        let mut state = fresh_state();
        let wd = watch(&mut state, &base.join("r"));
        state.roots.insert(base.join("r"));

        state.forget_watch(&wd, &base.join("r"));

        assert_eq!(state.nwd, 0);
        assert!(state.wd_by_id.is_empty());
        assert!(state.wd_by_path.is_empty());
        assert!(state.path_order.is_empty());
        assert!(state.roots.is_empty());
    }
}
