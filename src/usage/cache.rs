//! Cache layers for incremental session parsing
//!
//! - `AggregateCache`: per-session usage events, valid while the session's
//!   update time is unchanged, bounded with least-recently-accessed eviction.
//! - `ResultCache`: single slot holding the last "list sessions" result.
//! - `MetadataIndex`: per-file mtime cache of parsed session documents.
//! - `InflightGuard`: per-key async lock so one cache miss is computed once.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::usage::models::{ParseRequest, Session, UsageEvent};

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cached usage events for one session
#[derive(Debug, Clone)]
pub struct AggregateEntry {
    /// Session update time when the events were computed
    pub updated_at: i64,
    pub usage_rows: Vec<UsageEvent>,
    /// Epoch ms of the latest hit or store, drives eviction order
    pub last_accessed: i64,
}

/// Per-session aggregate cache shared by both backends
#[derive(Debug)]
pub struct AggregateCache {
    entries: HashMap<String, AggregateEntry>,
    max_entries: usize,
}

impl AggregateCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
        }
    }

    /// Number of cached sessions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry exists for the session, current or stale
    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    /// Raw entry access; does not touch `last_accessed`
    pub fn get(&self, session_id: &str) -> Option<&AggregateEntry> {
        self.entries.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut AggregateEntry> {
        self.entries.get_mut(session_id)
    }

    /// Return the cached events if the entry matches `updated_at`, refreshing
    /// its access time. A mismatch is a miss.
    pub fn lookup(&mut self, session_id: &str, updated_at: i64, now: i64) -> Option<Vec<UsageEvent>> {
        match self.entries.get_mut(session_id) {
            Some(entry) if entry.updated_at == updated_at => {
                entry.last_accessed = now;
                Some(entry.usage_rows.clone())
            }
            _ => None,
        }
    }

    /// Replace the entry for a session
    pub fn store(&mut self, session_id: &str, updated_at: i64, usage_rows: Vec<UsageEvent>, now: i64) {
        self.entries.insert(
            session_id.to_string(),
            AggregateEntry {
                updated_at,
                usage_rows,
                last_accessed: now,
            },
        );
    }

    /// Insert a prebuilt entry as is, without evicting
    pub fn insert(&mut self, session_id: impl Into<String>, entry: AggregateEntry) {
        self.entries.insert(session_id.into(), entry);
    }

    /// Drop the `len - max` entries with the smallest access time.
    /// Ties are broken by session id so eviction is deterministic.
    pub fn evict(&mut self) -> usize {
        if self.entries.len() <= self.max_entries {
            return 0;
        }

        let mut by_access: Vec<(i64, String)> = self
            .entries
            .iter()
            .map(|(id, entry)| (entry.last_accessed, id.clone()))
            .collect();
        by_access.sort();

        let to_evict = by_access.len() - self.max_entries;
        for (_, id) in by_access.into_iter().take(to_evict) {
            self.entries.remove(&id);
        }

        to_evict
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Single-slot cache for the unfiltered list query
#[derive(Debug, Default)]
pub struct ResultCache {
    last_check: i64,
    last_result: Vec<UsageEvent>,
    last_limit: usize,
    last_since: Option<i64>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for `request` if it is a list query with the same
    /// limit/since, computed less than `ttl_ms` ago. Empty results never hit.
    pub fn get(&self, request: &ParseRequest, now: i64, ttl_ms: u64) -> Option<Vec<UsageEvent>> {
        if !request.is_list() || self.last_result.is_empty() {
            return None;
        }
        if request.effective_limit() != self.last_limit || request.since != self.last_since {
            return None;
        }
        let age = now.saturating_sub(self.last_check);
        if age < 0 || age as u64 >= ttl_ms {
            return None;
        }
        Some(self.last_result.clone())
    }

    /// Record a list result. Single-session lookups never update the slot.
    pub fn update(&mut self, request: &ParseRequest, result: &[UsageEvent], now: i64) {
        if !request.is_list() {
            return;
        }
        self.last_check = now;
        self.last_result = result.to_vec();
        self.last_limit = request.effective_limit();
        self.last_since = request.since;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Metadata Index entry: parsed session document plus its mtime
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub mtime: SystemTime,
    pub session: Session,
}

/// Per-file metadata cache for the flat-file backend
#[derive(Debug, Default)]
pub struct MetadataIndex {
    entries: HashMap<PathBuf, MetadataEntry>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<&MetadataEntry> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: PathBuf, mtime: SystemTime, session: Session) {
        self.entries.insert(path, MetadataEntry { mtime, session });
    }

    pub fn remove(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Remove entries whose path was not observed by the latest walk
    pub fn retain_seen(&mut self, seen: &HashSet<PathBuf>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| seen.contains(path));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Per-key async lock. Holding the guard for a key makes concurrent callers
/// for the same key wait, after which they re-check the cache instead of
/// recomputing.
#[derive(Debug, Default)]
pub struct InflightGuard {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a key's computation is in progress
pub struct InflightTicket<'a> {
    key: String,
    owner: &'a InflightGuard,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InflightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> InflightTicket<'_> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(l) => l,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = lock.lock_owned().await;
        InflightTicket {
            key: key.to_string(),
            owner: self,
            guard: Some(guard),
        }
    }

    /// Number of keys with a live lock entry
    pub fn pending(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl Drop for InflightTicket<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = match self.owner.locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Only the map holds the lock once nobody else waits on it
        if let Some(lock) = locks.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}
