//! Flat-file backend: session/message JSON document tree
//!
//! ```text
//! storage/
//! ├── session/{project}/{sessionId}.json
//! ├── message/{sessionId}/{messageId}.json
//! └── part/{messageId}/{partId}.json      (activity streaming only)
//! ```

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use log::debug;
use tokio::fs;

use crate::usage::cache::{now_millis, AggregateCache, InflightGuard, MetadataIndex};
use crate::usage::config::StoragePaths;
use crate::usage::error::StoreError;
use crate::usage::models::{
    parse_assistant_turn, parse_session, to_usage_event, BackendOutcome, ParseRequest, Parsed,
    Session, SessionContext, SkipReason, UsageEvent,
};
use crate::usage::watcher::ChangeTracker;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn is_json_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "json").unwrap_or(false)
}

/// Counters reported once per parse pass
#[derive(Debug, Default)]
struct WalkStats {
    stat_checks: usize,
    stat_skips: usize,
    json_parses: usize,
    dirty_hits: usize,
    pruned: usize,
    aggregate_hits: usize,
    aggregate_misses: usize,
}

/// Reader over the per-entity JSON document tree
pub struct FileBackend {
    paths: StoragePaths,
    tracker: ChangeTracker,
    index: Mutex<MetadataIndex>,
    aggregate: Arc<Mutex<AggregateCache>>,
    /// Serializes concurrent aggregate misses per session id
    inflight: InflightGuard,
    /// Message directories read since construction
    message_dir_loads: AtomicUsize,
}

impl FileBackend {
    pub fn new(
        paths: StoragePaths,
        aggregate: Arc<Mutex<AggregateCache>>,
        reconciliation_interval: Duration,
    ) -> Self {
        let tracker = ChangeTracker::new(paths.sessions_dir.clone(), reconciliation_interval);
        Self {
            paths,
            tracker,
            index: Mutex::new(MetadataIndex::new()),
            aggregate,
            inflight: InflightGuard::new(),
            message_dir_loads: AtomicUsize::new(0),
        }
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Number of message directories read so far (aggregate misses computed)
    pub fn message_dir_loads(&self) -> usize {
        self.message_dir_loads.load(Ordering::Relaxed)
    }

    /// Number of session files in the metadata index
    pub fn metadata_index_len(&self) -> usize {
        lock(&self.index).len()
    }

    pub fn is_indexed(&self, path: &Path) -> bool {
        lock(&self.index).contains(path)
    }

    /// Produce usage events for the request. Never fails: unreadable storage
    /// is `Unavailable`, everything else degrades to fewer rows.
    pub async fn parse(&self, request: &ParseRequest) -> BackendOutcome {
        if fs::metadata(&self.paths.storage_dir).await.is_err() {
            debug!("No OpenCode storage directory found at {}", self.paths.storage_dir.display());
            return BackendOutcome::Unavailable;
        }

        self.tracker.start();

        let now = now_millis();
        let mut stats = WalkStats::default();

        let mut sessions = match self.scan_sessions(&mut stats).await {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!("JSON: failed to read session directories: {}", e);
                return BackendOutcome::Unavailable;
            }
        };

        if let Some(since) = request.since {
            sessions.retain(|s| s.time.updated >= since);
        }
        if let Some(target) = request.session_id.as_deref() {
            sessions.retain(|s| s.id == target);
        }
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));

        let mut rows: Vec<UsageEvent> = Vec::new();
        for session in &sessions {
            let usage = self.session_usage(session, now, &mut stats).await;
            rows.extend(usage);
        }

        let evicted = lock(&self.aggregate).evict();

        debug!(
            "JSON: parsed {} usage rows from {} sessions (stat checks: {}, stat skips: {}, json parses: {}, dirty hits: {}, pruned: {}, aggregate hits: {}, misses: {}, evicted: {}, index size: {}, aggregate size: {})",
            rows.len(),
            sessions.len(),
            stats.stat_checks,
            stats.stat_skips,
            stats.json_parses,
            stats.dirty_hits,
            stats.pruned,
            stats.aggregate_hits,
            stats.aggregate_misses,
            evicted,
            self.metadata_index_len(),
            lock(&self.aggregate).len()
        );

        BackendOutcome::from_rows(rows)
    }

    /// Walk every project directory and resolve the session documents,
    /// consulting the metadata index before touching the filesystem.
    async fn scan_sessions(&self, stats: &mut WalkStats) -> Result<Vec<Session>, StoreError> {
        let dirty = self.tracker.drain_dirty();
        let needs_full_stat = self.tracker.consume_full_reconciliation();
        if needs_full_stat {
            debug!("JSON: full reconciliation sweep triggered");
        }

        let mut sessions = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        let mut project_dirs = match fs::read_dir(&self.paths.sessions_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::DirNotFound(
                    self.paths.sessions_dir.to_string_lossy().to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(project) = project_dirs.next_entry().await? {
            if !project.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let project_path = project.path();
            self.tracker.watch_project_dir(&project_path);

            let mut entries = match fs::read_dir(&project_path).await {
                Ok(rd) => rd,
                Err(e) => {
                    debug!("JSON: failed to read project dir {}: {}", project_path.display(), e);
                    continue;
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !is_json_file(&path) || !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                seen.insert(path.clone());

                let is_dirty = dirty.contains(&path);
                if is_dirty {
                    stats.dirty_hits += 1;
                }

                let cached = lock(&self.index).get(&path).cloned();

                if !is_dirty && !needs_full_stat {
                    if let Some(cached) = &cached {
                        stats.stat_skips += 1;
                        sessions.push(cached.session.clone());
                        continue;
                    }
                }

                stats.stat_checks += 1;
                let mtime = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                    Ok(t) => t,
                    Err(_) => {
                        lock(&self.index).remove(&path);
                        continue;
                    }
                };

                if let Some(cached) = cached {
                    if cached.mtime == mtime {
                        sessions.push(cached.session);
                        continue;
                    }
                }

                stats.json_parses += 1;
                match read_session_file(&path).await {
                    Parsed::Usable(session) => {
                        lock(&self.index).insert(path, mtime, session.clone());
                        sessions.push(session);
                    }
                    Parsed::Skipped(reason) => {
                        debug!("JSON: skipping session file {}: {}", path.display(), reason);
                        lock(&self.index).remove(&path);
                    }
                }
            }
        }

        stats.pruned = lock(&self.index).retain_seen(&seen);

        Ok(sessions)
    }

    /// Usage rows for one session, from the aggregate cache when the session
    /// is unchanged, otherwise recomputed from its message directory.
    async fn session_usage(&self, session: &Session, now: i64, stats: &mut WalkStats) -> Vec<UsageEvent> {
        let updated_at = session.time.updated;

        if let Some(rows) = lock(&self.aggregate).lookup(&session.id, updated_at, now) {
            stats.aggregate_hits += 1;
            return rows;
        }

        let _ticket = self.inflight.acquire(&session.id).await;

        // Another caller may have filled the entry while we waited
        if let Some(rows) = lock(&self.aggregate).lookup(&session.id, updated_at, now) {
            stats.aggregate_hits += 1;
            return rows;
        }

        stats.aggregate_misses += 1;
        let context = SessionContext::from(session);
        let rows = self.load_session_messages(&context).await;
        lock(&self.aggregate).store(&session.id, updated_at, rows.clone(), now);
        rows
    }

    /// Read every message file of a session, newest first by mtime
    async fn load_session_messages(&self, session: &SessionContext) -> Vec<UsageEvent> {
        let messages_dir = self.paths.messages_dir.join(&session.session_id);
        self.message_dir_loads.fetch_add(1, Ordering::Relaxed);

        let mut entries = match fs::read_dir(&messages_dir).await {
            Ok(rd) => rd,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    debug!("JSON: failed to list {}: {}", messages_dir.display(), e);
                }
                return Vec::new();
            }
        };

        let mut message_files: Vec<(PathBuf, SystemTime)> = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    debug!("JSON: failed to read entry in {}: {}", messages_dir.display(), e);
                    break;
                }
            };
            let path = entry.path();
            if !is_json_file(&path) {
                continue;
            }
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    message_files.push((path, mtime));
                }
                _ => continue,
            }
        }

        message_files.sort_by(|a, b| b.1.cmp(&a.1));

        let mut rows = Vec::new();
        for (path, _) in message_files {
            let raw = match fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("JSON: failed to read message {}: {}", path.display(), e);
                    continue;
                }
            };
            if let Parsed::Usable(turn) = parse_assistant_turn(&raw) {
                rows.push(to_usage_event(session, turn));
            }
        }

        rows
    }

    /// Stop the change tracker
    pub fn stop(&self) {
        self.tracker.stop();
    }
}

/// Read and parse one session document
pub async fn read_session_file(path: &Path) -> Parsed<Session> {
    match fs::read_to_string(path).await {
        Ok(raw) => parse_session(&raw),
        Err(e) => Parsed::Skipped(SkipReason::Malformed(e.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::usage::config::RECONCILIATION_INTERVAL_MS;
    use std::fs::File;

    /// Writes an OpenCode storage tree under a temp dir
    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub paths: StoragePaths,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = StoragePaths::new(dir.path().to_path_buf());
            std::fs::create_dir_all(&paths.sessions_dir).unwrap();
            std::fs::create_dir_all(&paths.messages_dir).unwrap();
            std::fs::create_dir_all(&paths.parts_dir).unwrap();
            Self { dir, paths }
        }

        pub fn session_path(&self, project: &str, id: &str) -> PathBuf {
            self.paths.sessions_dir.join(project).join(format!("{}.json", id))
        }

        pub fn write_session(&self, project: &str, id: &str, updated: i64) -> PathBuf {
            let path = self.session_path(project, id);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let doc = serde_json::json!({
                "id": id,
                "projectID": project,
                "directory": format!("/work/{}", project),
                "title": format!("Session {}", id),
                "time": {"created": 1, "updated": updated}
            });
            std::fs::write(&path, doc.to_string()).unwrap();
            path
        }

        pub fn write_message(&self, session_id: &str, message_id: &str, input: u64, created: i64) {
            let dir = self.paths.messages_dir.join(session_id);
            std::fs::create_dir_all(&dir).unwrap();
            let doc = serde_json::json!({
                "id": message_id,
                "sessionID": session_id,
                "role": "assistant",
                "time": {"created": created, "completed": created + 1},
                "providerID": "anthropic",
                "modelID": "claude-sonnet-4",
                "tokens": {"input": input, "output": 1, "cache": {"read": 0, "write": 0}}
            });
            let path = dir.join(format!("{}.json", message_id));
            std::fs::write(&path, doc.to_string()).unwrap();
            // Distinct mtimes keep newest-first ordering deterministic
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + created as u64);
            File::options().write(true).open(&path).unwrap().set_modified(mtime).unwrap();
        }

        pub fn write_raw(&self, path: &Path, contents: &str) {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }

        pub fn backend(&self) -> FileBackend {
            FileBackend::new(
                self.paths.clone(),
                Arc::new(Mutex::new(AggregateCache::new(100))),
                Duration::from_millis(RECONCILIATION_INTERVAL_MS),
            )
        }
    }

    fn bump_mtime(path: &Path) {
        let later = SystemTime::now() + Duration::from_secs(60);
        File::options().write(true).open(path).unwrap().set_modified(later).unwrap();
    }

    #[tokio::test]
    async fn test_missing_storage_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(
            StoragePaths::new(dir.path().join("absent")),
            Arc::new(Mutex::new(AggregateCache::new(10))),
            Duration::from_secs(600),
        );
        assert_eq!(backend.parse(&ParseRequest::new()).await, BackendOutcome::Unavailable);
        assert!(!backend.tracker().is_started());
    }

    #[tokio::test]
    async fn test_since_filter_and_ordering() {
        let fx = Fixture::new();
        for (id, updated) in [("ses_a", 5), ("ses_b", 20), ("ses_c", 15)] {
            fx.write_session("proj", id, updated);
            fx.write_message(id, &format!("msg_{}", id), 10, updated);
        }

        let backend = fx.backend();
        let rows = backend.parse(&ParseRequest::new().with_since(Some(10))).await.into_rows();

        let order: Vec<i64> = rows.iter().map(|r| r.session_updated_at).collect();
        assert_eq!(order, vec![20, 15]);
        assert_eq!(rows[0].session_id, "ses_b");
        assert_eq!(rows[0].session_name.as_deref(), Some("Session ses_b"));
        assert_eq!(rows[0].project_path.as_deref(), Some("/work/proj"));
        backend.stop();
    }

    #[tokio::test]
    async fn test_messages_newest_first_and_non_assistant_skipped() {
        let fx = Fixture::new();
        fx.write_session("proj", "ses_1", 100);
        fx.write_message("ses_1", "msg_old", 1, 10);
        fx.write_message("ses_1", "msg_new", 2, 20);
        fx.write_raw(
            &fx.paths.messages_dir.join("ses_1").join("msg_user.json"),
            r#"{"id": "msg_user", "role": "user", "time": {"created": 30}}"#,
        );
        fx.write_raw(&fx.paths.messages_dir.join("ses_1").join("msg_bad.json"), "{");

        let backend = fx.backend();
        let rows = backend.parse(&ParseRequest::new()).await.into_rows();

        let inputs: Vec<u64> = rows.iter().map(|r| r.tokens.input).collect();
        assert_eq!(inputs, vec![2, 1]);
        assert_eq!(rows[0].timestamp, 21);
        backend.stop();
    }

    #[tokio::test]
    async fn test_metadata_index_pruned_after_delete() {
        let fx = Fixture::new();
        let keep = fx.write_session("proj", "ses_keep", 10);
        let gone = fx.write_session("proj", "ses_gone", 20);

        let backend = fx.backend();
        backend.parse(&ParseRequest::new()).await;
        assert_eq!(backend.metadata_index_len(), 2);

        std::fs::remove_file(&gone).unwrap();
        backend.parse(&ParseRequest::new()).await;

        assert_eq!(backend.metadata_index_len(), 1);
        assert!(backend.is_indexed(&keep));
        assert!(!backend.is_indexed(&gone));
        backend.stop();
    }

    #[tokio::test]
    async fn test_aggregate_cache_tracks_session_update_time() {
        let fx = Fixture::new();
        let session_path = fx.write_session("proj", "ses_1", 100);
        fx.write_message("ses_1", "msg_1", 5, 10);

        let backend = fx.backend();
        assert_eq!(backend.parse(&ParseRequest::new()).await.into_rows().len(), 1);

        // New message without a session bump: cached rows are still valid
        fx.write_message("ses_1", "msg_2", 6, 20);
        assert_eq!(backend.parse(&ParseRequest::new()).await.into_rows().len(), 1);

        // Session bumped: cache miss, full recompute
        fx.write_session("proj", "ses_1", 200);
        bump_mtime(&session_path);
        backend.tracker().request_full_reconciliation();
        let rows = backend.parse(&ParseRequest::new()).await.into_rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.session_updated_at == 200));
        backend.stop();
    }

    #[tokio::test]
    async fn test_dirty_path_forces_restat() {
        let fx = Fixture::new();
        let session_path = fx.write_session("proj", "ses_1", 100);

        let backend = fx.backend();
        backend.parse(&ParseRequest::new()).await;

        fx.write_session("proj", "ses_1", 300);
        bump_mtime(&session_path);
        fx.write_message("ses_1", "msg_1", 5, 10);
        backend.tracker().mark_dirty(session_path.clone());

        let rows = backend.parse(&ParseRequest::new()).await.into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_updated_at, 300);
        backend.stop();
    }

    #[tokio::test]
    async fn test_missing_message_dir_caches_empty_entry() {
        let fx = Fixture::new();
        fx.write_session("proj", "ses_empty", 10);

        let backend = fx.backend();
        assert_eq!(backend.parse(&ParseRequest::new()).await, BackendOutcome::Empty);

        let cache = backend.aggregate.lock().unwrap();
        let entry = cache.get("ses_empty").unwrap();
        assert_eq!(entry.updated_at, 10);
        assert!(entry.usage_rows.is_empty());
        drop(cache);
        backend.stop();
    }

    #[tokio::test]
    async fn test_invalid_session_documents_are_skipped() {
        let fx = Fixture::new();
        fx.write_session("proj", "ses_ok", 10);
        fx.write_message("ses_ok", "msg_1", 1, 1);
        let broken = fx.session_path("proj", "broken");
        fx.write_raw(&broken, "not json");
        let anonymous = fx.session_path("proj", "anonymous");
        fx.write_raw(&anonymous, r#"{"time": {"created": 1, "updated": 2}}"#);

        let backend = fx.backend();
        let rows = backend.parse(&ParseRequest::new()).await.into_rows();

        assert_eq!(rows.len(), 1);
        assert_eq!(backend.metadata_index_len(), 1);
        assert!(!backend.is_indexed(&broken));
        assert!(!backend.is_indexed(&anonymous));
        backend.stop();
    }

    #[tokio::test]
    async fn test_single_session_filter() {
        let fx = Fixture::new();
        fx.write_session("proj_a", "ses_1", 10);
        fx.write_session("proj_b", "ses_2", 20);
        fx.write_message("ses_1", "msg_1", 1, 1);
        fx.write_message("ses_2", "msg_2", 2, 2);

        let backend = fx.backend();
        let rows = backend
            .parse(&ParseRequest::new().with_session(Some("ses_1".to_string())))
            .await
            .into_rows();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_id, "ses_1");
        assert_eq!(backend.tracker().watched_project_count(), 2);
        backend.stop();
    }

    #[tokio::test]
    async fn test_concurrent_cold_parses_load_messages_once() {
        let fx = Fixture::new();
        fx.write_session("proj", "ses_1", 10);
        for i in 0..20 {
            fx.write_message("ses_1", &format!("msg_{}", i), i as u64 + 1, i);
        }

        let backend = fx.backend();
        let request = ParseRequest::new();
        let (first, second) = tokio::join!(backend.parse(&request), backend.parse(&request));

        assert_eq!(first, second);
        assert_eq!(first.into_rows().len(), 20);
        assert_eq!(backend.message_dir_loads(), 1);
        backend.stop();
    }
}
