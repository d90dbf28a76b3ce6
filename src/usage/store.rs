//! Session store: the entry point tying both backends, the caches and the
//! activity streamers together behind one lifecycle object.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use crate::usage::activity::{ActivityCallback, DbActivityPoller, FileActivityWatcher};
use crate::usage::cache::{now_millis, AggregateCache, ResultCache};
use crate::usage::config::{FallbackPolicy, StoragePaths, StoreConfig};
use crate::usage::database::DatabaseBackend;
use crate::usage::models::{BackendOutcome, ParseRequest, UsageEvent};
use crate::usage::reader::FileBackend;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Return the primary rows, or run `fallback` once and return its rows
pub async fn resolve_with_fallback<F, Fut>(
    primary: BackendOutcome,
    policy: FallbackPolicy,
    fallback: F,
) -> Vec<UsageEvent>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = BackendOutcome>,
{
    if !policy.should_fall_back(&primary) {
        return primary.into_rows();
    }
    debug!("Database yielded {}, falling back to JSON storage", outcome_label(&primary));
    fallback().await.into_rows()
}

fn outcome_label(outcome: &BackendOutcome) -> &'static str {
    match outcome {
        BackendOutcome::Unavailable => "unavailable",
        BackendOutcome::Empty => "empty",
        BackendOutcome::Rows(_) => "rows",
    }
}

/// OpenCode usage store over one data directory
pub struct SessionStore {
    config: StoreConfig,
    paths: StoragePaths,
    aggregate: Arc<Mutex<AggregateCache>>,
    result_cache: Mutex<ResultCache>,
    database: Arc<DatabaseBackend>,
    files: FileBackend,
    file_activity: FileActivityWatcher,
    db_activity: DbActivityPoller,
}

impl SessionStore {
    pub fn new(config: StoreConfig) -> Self {
        let paths = config.paths();
        let aggregate = Arc::new(Mutex::new(AggregateCache::new(config.aggregate_cache_max)));

        let database = Arc::new(DatabaseBackend::new(
            paths.db_path.clone(),
            config.db_recycle_interval(),
            aggregate.clone(),
        ));
        let files = FileBackend::new(paths.clone(), aggregate.clone(), config.reconciliation_interval());
        let file_activity = FileActivityWatcher::new(paths.parts_dir.clone(), config.part_debounce());
        let db_activity = DbActivityPoller::new(database.clone(), config.activity_poll_interval());

        info!("OpenCode session store at {}", paths.data_dir.display());

        Self {
            config,
            paths,
            aggregate,
            result_cache: Mutex::new(ResultCache::new()),
            database,
            files,
            file_activity,
            db_activity,
        }
    }

    /// Resolved storage locations
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// The embedded-database backend
    pub fn database(&self) -> &DatabaseBackend {
        &self.database
    }

    /// Usage events grouped by session, most recently updated session first.
    ///
    /// Never fails; storage faults degrade to fewer rows.
    pub async fn parse_sessions(&self, request: &ParseRequest) -> Vec<UsageEvent> {
        let now = now_millis();
        let cached = lock(&self.result_cache).get(request, now, self.config.result_cache_ttl_ms);
        if let Some(rows) = cached {
            debug!("Result cache hit ({} rows)", rows.len());
            return rows;
        }

        let primary = self.database.parse(request);
        let rows = resolve_with_fallback(primary, self.config.fallback, || self.files.parse(request)).await;

        lock(&self.result_cache).update(request, &rows, now_millis());
        rows
    }

    /// Start streaming activity updates, from the database when it is
    /// present and from the part files otherwise.
    pub fn start_activity_watch(&self, callback: ActivityCallback) {
        if self.database.is_available() {
            debug!("Activity: polling {}", self.paths.db_path.display());
            self.db_activity.start(callback);
        } else {
            debug!("Activity: watching {}", self.paths.parts_dir.display());
            self.file_activity.start(callback);
        }
    }

    /// Stop both streamers, tear down the change tracker and close the database
    pub fn stop_activity_watch(&self) {
        self.db_activity.stop();
        self.file_activity.stop();
        self.files.stop();
        self.database.close();
    }

    pub fn is_watching_activity(&self) -> bool {
        self.db_activity.is_running() || self.file_activity.is_running()
    }

    /// Release every watch, timer and handle and drop cached state
    pub fn shutdown(&self) {
        self.stop_activity_watch();
        lock(&self.result_cache).clear();
        lock(&self.aggregate).clear();
        info!("OpenCode session store shut down");
    }

    pub fn aggregate_cache_len(&self) -> usize {
        lock(&self.aggregate).len()
    }

    pub fn metadata_index_len(&self) -> usize {
        self.files.metadata_index_len()
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.db_activity.stop();
        self.file_activity.stop();
        self.files.stop();
    }
}
