//! Near-real-time activity streaming
//!
//! Two sources of per-part token deltas:
//! - [`FileActivityWatcher`] watches `storage/part/` for new message
//!   directories and each of those for new part files.
//! - [`DbActivityPoller`] polls the `part` table past a moving watermark.
//!
//! Delivery is best-effort. Both stream into a single registered callback.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use glob::glob;
use log::{debug, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::usage::cache::now_millis;
use crate::usage::database::{DatabaseBackend, PartRow};
use crate::usage::error::StoreError;
use crate::usage::models::{parse_activity, ActivityUpdate, Parsed};
use crate::usage::reader::is_json_file;

/// Message directories under the part root carry this prefix
const MESSAGE_DIR_PREFIX: &str = "msg_";

/// Receiver of activity updates
pub type ActivityCallback = Arc<dyn Fn(ActivityUpdate) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Raw filesystem signals forwarded from notify callbacks to the async consumer
#[derive(Debug, Clone)]
enum PartEvent {
    MessageDir(PathBuf),
    PartFile(PathBuf),
}

/// Watches and tasks owned by one start/stop cycle
#[derive(Default)]
struct StreamState {
    running: bool,
    /// Watch on the part root for new message directories
    root_watcher: Option<RecommendedWatcher>,
    message_watchers: HashMap<PathBuf, RecommendedWatcher>,
    consumer: Option<JoinHandle<()>>,
    /// Debounced part reads not yet finished
    pending: Vec<JoinHandle<()>>,
    tx: Option<mpsc::UnboundedSender<PartEvent>>,
}

/// Shared between the handle, the event consumer and debounced reads
struct StreamShared {
    parts_dir: PathBuf,
    debounce: Duration,
    state: Mutex<StreamState>,
    callback: Mutex<Option<ActivityCallback>>,
    /// Part files already processed, keyed by full path
    seen: Mutex<HashSet<PathBuf>>,
}

/// Watch-driven streamer over the part tree
#[derive(Clone)]
pub struct FileActivityWatcher {
    shared: Arc<StreamShared>,
}

impl FileActivityWatcher {
    pub fn new(parts_dir: PathBuf, debounce: Duration) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                parts_dir,
                debounce,
                state: Mutex::new(StreamState::default()),
                callback: Mutex::new(None),
                seen: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Begin streaming. While already running, only the callback is replaced.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, callback: ActivityCallback) {
        *lock(&self.shared.callback) = Some(callback);

        let mut state = lock(&self.shared.state);
        if state.running {
            return;
        }
        state.running = true;
        lock(&self.shared.seen).clear();

        let (tx, rx) = mpsc::unbounded_channel();

        match parts_root_watcher(tx.clone()) {
            Ok(mut watcher) => match watcher.watch(&self.shared.parts_dir, RecursiveMode::NonRecursive) {
                Ok(()) => state.root_watcher = Some(watcher),
                Err(e) => debug!(
                    "Failed to watch parts root {}: {}",
                    self.shared.parts_dir.display(),
                    e
                ),
            },
            Err(e) => warn!("Failed to create parts root watcher: {}", e),
        }

        state.tx = Some(tx);
        state.consumer = Some(tokio::spawn(consume_events(Arc::downgrade(&self.shared), rx)));
    }

    /// Stop streaming: cancels pending debounced reads and clears the
    /// callback and the seen-set
    pub fn stop(&self) {
        let (root, messages, consumer, pending, tx) = {
            let mut state = lock(&self.shared.state);
            state.running = false;
            (
                state.root_watcher.take(),
                std::mem::take(&mut state.message_watchers),
                state.consumer.take(),
                std::mem::take(&mut state.pending),
                state.tx.take(),
            )
        };

        if let Some(consumer) = consumer {
            consumer.abort();
        }
        for task in pending {
            task.abort();
        }
        drop(tx);
        drop(root);
        drop(messages);

        *lock(&self.shared.callback) = None;
        lock(&self.shared.seen).clear();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).running
    }

    /// Number of message directories currently watched
    pub fn watched_message_dirs(&self) -> usize {
        lock(&self.shared.state).message_watchers.len()
    }

    /// Watch one message directory and scan the part files already in it
    pub async fn watch_message_dir(&self, dir: &Path) {
        watch_message_dir(&self.shared, dir);
        scan_message_dir(&self.shared, dir).await;
    }

    /// Process one part file at most once; returns whether an update was emitted
    pub async fn process_part_file(&self, path: &Path) -> bool {
        process_part_file(&self.shared, path).await
    }
}

fn parts_root_watcher(tx: mpsc::UnboundedSender<PartEvent>) -> Result<RecommendedWatcher, StoreError> {
    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                debug!("Parts root watch error: {}", e);
                return;
            }
        };
        if !matches!(event.kind, EventKind::Create(_)) {
            return;
        }
        for path in event.paths {
            if is_message_dir_name(&path) && path.is_dir() {
                // Receiver gone means the streamer stopped
                let _ = tx.send(PartEvent::MessageDir(path));
            }
        }
    })?;
    Ok(watcher)
}

fn is_message_dir_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(MESSAGE_DIR_PREFIX))
        .unwrap_or(false)
}

fn watch_message_dir(shared: &Arc<StreamShared>, dir: &Path) {
    let mut state = lock(&shared.state);
    if !state.running || state.message_watchers.contains_key(dir) {
        return;
    }
    let Some(tx) = state.tx.clone() else {
        return;
    };

    let created = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else {
            return;
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in event.paths {
            if is_json_file(&path) {
                let _ = tx.send(PartEvent::PartFile(path));
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
            state.message_watchers.insert(dir.to_path_buf(), watcher);
        }
        Err(e) => debug!("Failed to watch message dir {}: {}", dir.display(), e),
    }
}

async fn scan_message_dir(shared: &Arc<StreamShared>, dir: &Path) {
    let pattern = dir.join("*.json");
    let part_files: Vec<PathBuf> = match glob(pattern.to_string_lossy().as_ref()) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            debug!("Invalid part scan pattern {}: {}", pattern.display(), e);
            return;
        }
    };

    for path in part_files {
        process_part_file(shared, &path).await;
    }
}

async fn process_part_file(shared: &Arc<StreamShared>, path: &Path) -> bool {
    if !lock(&shared.seen).insert(path.to_path_buf()) {
        return false;
    }

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            debug!("Failed to read part file {}: {}", path.display(), e);
            return false;
        }
    };

    let update = match parse_activity(&content, now_millis()) {
        Parsed::Usable(update) => update,
        Parsed::Skipped(reason) => {
            debug!("Skipping part {}: {}", path.display(), reason);
            return false;
        }
    };

    let callback = lock(&shared.callback).clone();
    match callback {
        Some(callback) => {
            callback(update);
            true
        }
        None => false,
    }
}

async fn consume_events(shared: Weak<StreamShared>, mut rx: mpsc::UnboundedReceiver<PartEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            PartEvent::MessageDir(dir) => {
                watch_message_dir(&shared, &dir);
                scan_message_dir(&shared, &dir).await;
            }
            PartEvent::PartFile(path) => {
                if lock(&shared.seen).contains(&path) {
                    continue;
                }
                let debounce = shared.debounce;
                let task_shared = shared.clone();
                let task = tokio::spawn(async move {
                    // Lets the writer finish the file
                    sleep(debounce).await;
                    process_part_file(&task_shared, &path).await;
                });

                let mut state = lock(&shared.state);
                state.pending.retain(|t| !t.is_finished());
                if state.running {
                    state.pending.push(task);
                } else {
                    task.abort();
                }
            }
        }
    }
}

/// Shared between the handle and the polling task
struct PollerShared {
    backend: Arc<DatabaseBackend>,
    poll_interval: Duration,
    callback: Mutex<Option<ActivityCallback>>,
    /// Latest `part.time_created` delivered (epoch ms)
    watermark: AtomicI64,
    /// Interval task; its presence means the poller is running
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Poll-driven streamer over the `part` table
#[derive(Clone)]
pub struct DbActivityPoller {
    shared: Arc<PollerShared>,
}

impl DbActivityPoller {
    pub fn new(backend: Arc<DatabaseBackend>, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                backend,
                poll_interval,
                callback: Mutex::new(None),
                watermark: AtomicI64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    /// Begin polling from now. A running poller keeps its timer and
    /// watermark and only takes the new callback.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, callback: ActivityCallback) {
        *lock(&self.shared.callback) = Some(callback);

        let mut task = lock(&self.shared.task);
        if task.is_some() {
            return;
        }

        self.shared.watermark.store(now_millis(), Ordering::SeqCst);
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.poll_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                poll_once(&shared);
            }
        }));
    }

    /// Stop polling; clears the callback and resets the watermark
    pub fn stop(&self) {
        if let Some(task) = lock(&self.shared.task).take() {
            task.abort();
        }
        *lock(&self.shared.callback) = None;
        self.shared.watermark.store(0, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.task).is_some()
    }

    pub fn watermark(&self) -> i64 {
        self.shared.watermark.load(Ordering::SeqCst)
    }

    /// Run one poll immediately; returns the number of updates delivered
    pub fn poll_now(&self) -> usize {
        poll_once(&self.shared)
    }
}

/// Map a `part` row; the row's own columns own the ids and the timestamp
fn activity_from_row(row: &PartRow) -> Parsed<ActivityUpdate> {
    match parse_activity(&row.data, row.time_created) {
        Parsed::Usable(mut update) => {
            update.session_id = row.session_id.clone();
            update.message_id = row.message_id.clone();
            Parsed::Usable(update)
        }
        skipped => skipped,
    }
}

fn poll_once(shared: &PollerShared) -> usize {
    let Some(callback) = lock(&shared.callback).clone() else {
        return 0;
    };

    let watermark = shared.watermark.load(Ordering::SeqCst);
    let rows = match shared.backend.recent_parts(watermark) {
        Ok(rows) => rows,
        Err(e) => {
            debug!("SQLite: activity poll failed: {}", e);
            return 0;
        }
    };

    let mut delivered = 0;
    for row in &rows {
        shared.watermark.fetch_max(row.time_created, Ordering::SeqCst);
        match activity_from_row(row) {
            Parsed::Usable(update) => {
                callback(update);
                delivered += 1;
            }
            Parsed::Skipped(reason) => debug!("SQLite: skipping part {}: {}", row.id, reason),
        }
    }

    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::database::tests::TestDb;

    fn collector() -> (ActivityCallback, Arc<Mutex<Vec<ActivityUpdate>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let callback: ActivityCallback = Arc::new(move |update| sink.lock().unwrap().push(update));
        (callback, received)
    }

    fn part_json(kind: &str, with_tokens: bool) -> String {
        let mut part = serde_json::json!({
            "id": "prt_1",
            "sessionID": "ses_1",
            "messageID": "msg_1",
            "type": kind,
        });
        if with_tokens {
            part["tokens"] = serde_json::json!({"input": 10, "output": 5, "reasoning": 0, "cache": {"read": 7}});
        }
        part.to_string()
    }

    #[tokio::test]
    async fn test_part_file_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let msg_dir = dir.path().join("msg_1");
        std::fs::create_dir(&msg_dir).unwrap();
        let part = msg_dir.join("prt_1.json");
        std::fs::write(&part, part_json("step-finish", true)).unwrap();

        let watcher = FileActivityWatcher::new(dir.path().to_path_buf(), Duration::from_millis(0));
        let (callback, received) = collector();
        watcher.start(callback);

        assert!(watcher.process_part_file(&part).await);
        assert!(!watcher.process_part_file(&part).await);

        let updates = received.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].session_id, "ses_1");
        assert_eq!(updates[0].message_id, "msg_1");
        assert_eq!(updates[0].tokens.input, 10);
        // Present counters are copied even when zero
        assert_eq!(updates[0].tokens.reasoning, Some(0));
        assert_eq!(updates[0].tokens.cache_read, Some(7));
        assert_eq!(updates[0].tokens.cache_write, None);
        drop(updates);
        watcher.stop();
    }

    #[tokio::test]
    async fn test_parts_without_tokens_or_kind_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let msg_dir = dir.path().join("msg_1");
        std::fs::create_dir(&msg_dir).unwrap();
        std::fs::write(msg_dir.join("a.json"), part_json("text", false)).unwrap();
        std::fs::write(msg_dir.join("b.json"), part_json("mystery", true)).unwrap();
        std::fs::write(msg_dir.join("c.json"), "{not json").unwrap();
        std::fs::write(msg_dir.join("d.json"), part_json("tool", true)).unwrap();

        let watcher = FileActivityWatcher::new(dir.path().to_path_buf(), Duration::from_millis(0));
        let (callback, received) = collector();
        watcher.start(callback);
        watcher.watch_message_dir(&msg_dir).await;

        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(watcher.watched_message_dirs(), 1);

        // Rescanning delivers nothing new
        watcher.watch_message_dir(&msg_dir).await;
        assert_eq!(received.lock().unwrap().len(), 1);
        watcher.stop();
    }

    #[tokio::test]
    async fn test_restart_swaps_callback_and_stop_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let msg_dir = dir.path().join("msg_1");
        std::fs::create_dir(&msg_dir).unwrap();
        std::fs::write(msg_dir.join("a.json"), part_json("tool", true)).unwrap();
        std::fs::write(msg_dir.join("b.json"), part_json("tool", true)).unwrap();

        let watcher = FileActivityWatcher::new(dir.path().to_path_buf(), Duration::from_millis(0));
        let (first, first_received) = collector();
        let (second, second_received) = collector();

        watcher.start(first);
        assert!(watcher.process_part_file(&msg_dir.join("a.json")).await);
        watcher.start(second);
        assert!(watcher.is_running());
        assert!(watcher.process_part_file(&msg_dir.join("b.json")).await);
        assert_eq!(first_received.lock().unwrap().len(), 1);
        assert_eq!(second_received.lock().unwrap().len(), 1);

        watcher.stop();
        assert!(!watcher.is_running());
        assert_eq!(watcher.watched_message_dirs(), 0);
        // Seen-set cleared, but no callback to deliver to
        assert!(!watcher.process_part_file(&msg_dir.join("a.json")).await);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_debounced_reads() {
        let dir = tempfile::tempdir().unwrap();
        let msg_dir = dir.path().join("msg_1");
        std::fs::create_dir(&msg_dir).unwrap();
        let part = msg_dir.join("prt_1.json");
        std::fs::write(&part, part_json("tool", true)).unwrap();

        let watcher = FileActivityWatcher::new(dir.path().to_path_buf(), Duration::from_millis(300));
        let (first, first_received) = collector();
        let (second, second_received) = collector();
        watcher.start(first);

        let tx = lock(&watcher.shared.state).tx.clone().unwrap();
        tx.send(PartEvent::PartFile(part.clone())).unwrap();
        for _ in 0..100 {
            if lock(&watcher.shared.state).pending.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(lock(&watcher.shared.state).pending.len(), 1);

        // Restart inside the debounce window
        watcher.stop();
        watcher.start(second);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(first_received.lock().unwrap().is_empty());
        assert!(second_received.lock().unwrap().is_empty());
        assert!(!lock(&watcher.shared.seen).contains(&part));
        watcher.stop();
    }

    #[tokio::test]
    async fn test_new_message_dir_streams_part_once() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileActivityWatcher::new(dir.path().to_path_buf(), Duration::from_millis(10));
        let (callback, received) = collector();
        watcher.start(callback);

        std::fs::create_dir(dir.path().join("snapshots")).unwrap();
        let msg_dir = dir.path().join("msg_x");
        std::fs::create_dir(&msg_dir).unwrap();
        let staged = msg_dir.join("prt_1.tmp");
        std::fs::write(&staged, part_json("step-finish", true)).unwrap();
        std::fs::rename(&staged, msg_dir.join("prt_1.json")).unwrap();

        for _ in 0..300 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Late duplicate events must not deliver again
        tokio::time::sleep(Duration::from_millis(200)).await;

        let updates = received.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].session_id, "ses_1");
        assert_eq!(watcher.watched_message_dirs(), 1);
        watcher.stop();
    }

    #[test]
    fn test_message_dir_name_requires_prefix() {
        assert!(is_message_dir_name(Path::new("/parts/msg_abc")));
        assert!(!is_message_dir_name(Path::new("/parts/snapshots")));
        assert!(!is_message_dir_name(Path::new("/parts/xmsg_abc")));
        assert!(!is_message_dir_name(Path::new("/")));
    }

    #[tokio::test]
    async fn test_db_poller_advances_watermark() {
        let db = TestDb::new();
        let backend = Arc::new(db.backend(10));
        let poller = DbActivityPoller::new(backend, Duration::from_secs(3600));
        let (callback, received) = collector();
        poller.start(callback);

        let start = poller.watermark();
        assert!(start > 0);

        db.add_part("ses_9", "msg_9", "p_old", start - 10, &part_json("tool", true));
        db.add_part("ses_9", "msg_9", "p_new", start + 10, &part_json("tool", true));
        db.add_part("ses_9", "msg_9", "p_quiet", start + 20, &part_json("text", false));

        assert_eq!(poller.poll_now(), 1);
        assert_eq!(poller.watermark(), start + 20);
        {
            let updates = received.lock().unwrap();
            assert_eq!(updates[0].session_id, "ses_9");
            assert_eq!(updates[0].message_id, "msg_9");
            assert_eq!(updates[0].timestamp, start + 10);
        }

        // Nothing new past the watermark
        assert_eq!(poller.poll_now(), 0);

        poller.stop();
        assert!(!poller.is_running());
        assert_eq!(poller.watermark(), 0);
        assert_eq!(poller.poll_now(), 0);
    }

    #[tokio::test]
    async fn test_db_poller_restart_keeps_timer() {
        let db = TestDb::new();
        let poller = DbActivityPoller::new(Arc::new(db.backend(10)), Duration::from_secs(3600));
        let (first, _) = collector();
        let (second, second_received) = collector();

        poller.start(first);
        let watermark = poller.watermark();
        poller.start(second);
        assert_eq!(poller.watermark(), watermark);

        db.add_part("s", "m", "p1", watermark + 1, &part_json("tool", true));
        assert_eq!(poller.poll_now(), 1);
        assert_eq!(second_received.lock().unwrap().len(), 1);
        poller.stop();
    }

    #[test]
    fn test_row_columns_override_payload_ids() {
        let row = PartRow {
            id: "p".to_string(),
            message_id: "msg_col".to_string(),
            session_id: "ses_col".to_string(),
            time_created: 42,
            data: r#"{"type": "tool", "tokens": {"input": 1, "output": 2}}"#.to_string(),
        };
        let update = activity_from_row(&row).usable().unwrap();
        assert_eq!(update.session_id, "ses_col");
        assert_eq!(update.message_id, "msg_col");
        assert_eq!(update.timestamp, 42);
    }
}
