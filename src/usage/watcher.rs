//! Change tracking for the flat-file backend
//!
//! Two cooperating layers:
//! - notify watches on the sessions root and every project directory record
//!   changed session files into a dirty-path set drained by each parse.
//! - a reconciliation timer periodically raises a one-shot flag that forces
//!   the next parse to re-stat every session file, covering notifications the
//!   platform coalesced or dropped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::usage::error::StoreError;

#[derive(Default)]
/// Live watch handles; dropping a watcher unregisters it
struct WatchState {
    started: bool,
    /// Non-recursive watch on the sessions root, registers new project dirs
    root_watcher: Option<RecommendedWatcher>,
    /// One non-recursive watch per project directory
    project_watchers: HashMap<PathBuf, RecommendedWatcher>,
    reconciliation_task: Option<JoinHandle<()>>,
}

/// State shared with the notify callbacks, which only hold a `Weak` to it
struct TrackerShared {
    sessions_dir: PathBuf,
    reconciliation_interval: Duration,
    state: Mutex<WatchState>,
    /// Session files changed since the last `drain_dirty`
    dirty_paths: Mutex<HashSet<PathBuf>>,
    /// Raised by the reconciliation timer, consumed by the next parse
    force_full: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn is_session_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "json").unwrap_or(false)
}

/// Dirty-path tracker over the session tree
#[derive(Clone)]
pub struct ChangeTracker {
    shared: Arc<TrackerShared>,
}

impl ChangeTracker {
    pub fn new(sessions_dir: PathBuf, reconciliation_interval: Duration) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                sessions_dir,
                reconciliation_interval,
                state: Mutex::new(WatchState::default()),
                dirty_paths: Mutex::new(HashSet::new()),
                force_full: AtomicBool::new(false),
            }),
        }
    }

    /// Start watching the sessions root and its project directories, and arm
    /// the reconciliation timer. A second call is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.started {
                return;
            }
            state.started = true;

            match root_watcher(Arc::downgrade(&self.shared)) {
                Ok(mut watcher) => {
                    match watcher.watch(&self.shared.sessions_dir, RecursiveMode::NonRecursive) {
                        Ok(()) => state.root_watcher = Some(watcher),
                        Err(e) => debug!(
                            "Failed to watch sessions root {}: {}",
                            self.shared.sessions_dir.display(),
                            e
                        ),
                    }
                }
                Err(e) => warn!("Failed to create sessions root watcher: {}", e),
            }

            let force_full = Arc::downgrade(&self.shared);
            let period = self.shared.reconciliation_interval;
            state.reconciliation_task = Some(tokio::spawn(async move {
                let mut ticker = interval(period);
                // Skip the first tick (immediate)
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match force_full.upgrade() {
                        Some(shared) => shared.force_full.store(true, Ordering::SeqCst),
                        None => break,
                    }
                }
            }));
        }

        if let Ok(entries) = std::fs::read_dir(&self.shared.sessions_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    self.watch_project_dir(&path);
                }
            }
        }
    }

    /// Tear down every watch, clear the dirty set, cancel the timer and
    /// reset so a later `start` re-initializes fully.
    pub fn stop(&self) {
        let (root, projects, task) = {
            let mut state = lock(&self.shared.state);
            state.started = false;
            (
                state.root_watcher.take(),
                std::mem::take(&mut state.project_watchers),
                state.reconciliation_task.take(),
            )
        };

        if let Some(task) = task {
            task.abort();
        }
        // Dropped outside the state lock: watcher callbacks take that lock
        drop(root);
        drop(projects);

        lock(&self.shared.dirty_paths).clear();
    }

    pub fn is_started(&self) -> bool {
        lock(&self.shared.state).started
    }

    /// Register a watch on a project directory (idempotent)
    pub fn watch_project_dir(&self, dir: &Path) {
        watch_project_dir(&self.shared, dir);
    }

    pub fn watched_project_count(&self) -> usize {
        lock(&self.shared.state).project_watchers.len()
    }

    /// Capture and clear the dirty-path set
    pub fn drain_dirty(&self) -> HashSet<PathBuf> {
        std::mem::take(&mut *lock(&self.shared.dirty_paths))
    }

    pub fn mark_dirty(&self, path: PathBuf) {
        lock(&self.shared.dirty_paths).insert(path);
    }

    /// Raise the one-shot full reconciliation flag
    pub fn request_full_reconciliation(&self) {
        self.shared.force_full.store(true, Ordering::SeqCst);
    }

    /// Read and clear the full reconciliation flag
    pub fn consume_full_reconciliation(&self) -> bool {
        self.shared.force_full.swap(false, Ordering::SeqCst)
    }
}

fn root_watcher(shared: Weak<TrackerShared>) -> Result<RecommendedWatcher, StoreError> {
    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                debug!("Sessions root watch error: {}", e);
                return;
            }
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };
        for path in event.paths {
            if path.is_dir() {
                watch_project_dir(&shared, &path);
            }
        }
    })?;
    Ok(watcher)
}

fn watch_project_dir(shared: &Arc<TrackerShared>, dir: &Path) {
    let mut state = lock(&shared.state);
    if state.project_watchers.contains_key(dir) {
        return;
    }

    let weak = Arc::downgrade(shared);
    let created = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else {
            return;
        };
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut dirty = lock(&shared.dirty_paths);
        for path in event.paths {
            if is_session_file(&path) {
                dirty.insert(path);
            }
        }
    });

    let mut watcher = match created {
        Ok(w) => w,
        Err(e) => {
            debug!("Failed to create watcher for {}: {}", dir.display(), e);
            return;
        }
    };

    match watcher.watch(dir, RecursiveMode::NonRecursive) {
        Ok(()) => {
            state.project_watchers.insert(dir.to_path_buf(), watcher);
        }
        Err(e) => debug!("Failed to watch project dir {}: {}", dir.display(), e),
    }
}
