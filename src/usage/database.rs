//! Embedded-database backend over `opencode.db`
//!
//! One shared read-only connection, opened lazily and recycled after a fixed
//! age so a long-lived read snapshot never pins the writer's WAL. Statements
//! are prepared through the connection's statement cache, so recycling the
//! connection also discards every prepared statement.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::debug;
use rusqlite::{params, Connection, OpenFlags};

use crate::usage::cache::{now_millis, AggregateCache};
use crate::usage::error::StoreError;
use crate::usage::models::{
    parse_assistant_turn, to_usage_event, BackendOutcome, ParseRequest, Parsed, SessionContext,
    UsageEvent,
};

const SESSION_COLUMNS: &str = "id, project_id, title, directory, time_created, time_updated";

const ASSISTANT_FILTER: &str = "json_extract(m.data, '$.role') = 'assistant'
    AND json_extract(m.data, '$.tokens.input') IS NOT NULL";

/// Fixed query set
pub struct Queries;

impl Queries {
    pub fn all_sessions() -> String {
        format!("SELECT {} FROM session ORDER BY time_updated DESC", SESSION_COLUMNS)
    }

    pub fn sessions_since() -> String {
        format!(
            "SELECT {} FROM session WHERE time_updated > ?1 ORDER BY time_updated DESC",
            SESSION_COLUMNS
        )
    }

    pub fn one_session() -> String {
        format!("SELECT {} FROM session WHERE id = ?1", SESSION_COLUMNS)
    }

    pub fn session_messages() -> String {
        format!(
            "SELECT s.id AS sid, s.title, s.directory, s.time_updated, m.data
             FROM session s
             JOIN message m ON m.session_id = s.id
             WHERE s.id IN (SELECT value FROM json_each(?1))
               AND {}
             ORDER BY s.time_updated DESC, m.time_created DESC",
            ASSISTANT_FILTER
        )
    }

    pub fn uncached_messages() -> String {
        format!(
            "SELECT s.id AS sid, s.title, s.directory, s.time_updated, m.data
             FROM session s
             JOIN message m ON m.session_id = s.id
             WHERE {}
             ORDER BY s.time_updated DESC, m.time_created DESC",
            ASSISTANT_FILTER
        )
    }

    pub fn uncached_messages_since() -> String {
        format!(
            "SELECT s.id AS sid, s.title, s.directory, s.time_updated, m.data
             FROM session s
             JOIN message m ON m.session_id = s.id
             WHERE s.time_updated > ?1
               AND {}
             ORDER BY s.time_updated DESC, m.time_created DESC",
            ASSISTANT_FILTER
        )
    }

    pub fn recent_parts() -> &'static str {
        "SELECT id, message_id, session_id, time_created, data FROM part
         WHERE time_created > ?1 ORDER BY time_created ASC"
    }
}

/// Row of the `session` table
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub id: String,
    pub project_id: Option<String>,
    pub title: Option<String>,
    pub directory: Option<String>,
    pub time_created: i64,
    pub time_updated: i64,
}

impl From<&SessionRow> for SessionContext {
    fn from(row: &SessionRow) -> Self {
        Self {
            session_id: row.id.clone(),
            updated_at: row.time_updated,
            title: row.title.clone(),
            directory: row.directory.clone(),
        }
    }
}

/// Message joined to its session
#[derive(Debug, Clone)]
struct JoinedMessageRow {
    sid: String,
    data: String,
}

/// Row of the `part` table
#[derive(Debug, Clone, PartialEq)]
pub struct PartRow {
    pub id: String,
    pub message_id: String,
    pub session_id: String,
    pub time_created: i64,
    pub data: String,
}

#[derive(Default)]
struct DbHandle {
    conn: Option<Connection>,
    opened_at: Option<Instant>,
    /// Set once the file was found missing or failed to open
    checked_missing: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reader over the relational store
pub struct DatabaseBackend {
    db_path: PathBuf,
    recycle_interval: Duration,
    handle: Mutex<DbHandle>,
    aggregate: Arc<Mutex<AggregateCache>>,
}

impl DatabaseBackend {
    pub fn new(db_path: PathBuf, recycle_interval: Duration, aggregate: Arc<Mutex<AggregateCache>>) -> Self {
        Self {
            db_path,
            recycle_interval,
            handle: Mutex::new(DbHandle::default()),
            aggregate,
        }
    }

    /// Whether a usable connection exists or can be opened right now
    pub fn is_available(&self) -> bool {
        let mut handle = lock(&self.handle);
        self.connection(&mut handle).is_some()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.handle).conn.is_some()
    }

    /// Close the shared connection. The next access reopens it.
    pub fn close(&self) {
        let mut handle = lock(&self.handle);
        close_handle(&mut handle);
    }

    fn connection<'a>(&self, handle: &'a mut DbHandle) -> Option<&'a Connection> {
        if let Some(opened_at) = handle.opened_at {
            if handle.conn.is_some() && opened_at.elapsed() > self.recycle_interval {
                debug!("SQLite: recycling connection after {:?}", opened_at.elapsed());
                close_handle(handle);
            }
        }

        if handle.conn.is_none() {
            if handle.checked_missing {
                return None;
            }
            if !self.db_path.exists() {
                handle.checked_missing = true;
                return None;
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            match Connection::open_with_flags(&self.db_path, flags) {
                Ok(conn) => {
                    handle.conn = Some(conn);
                    handle.opened_at = Some(Instant::now());
                }
                Err(e) => {
                    debug!("SQLite: failed to open {}: {}", self.db_path.display(), e);
                    handle.checked_missing = true;
                    return None;
                }
            }
        }

        handle.conn.as_ref()
    }

    /// Produce usage events for the request. Never fails: a missing database
    /// or failing query is `Unavailable`.
    pub fn parse(&self, request: &ParseRequest) -> BackendOutcome {
        let mut handle = lock(&self.handle);
        let Some(conn) = self.connection(&mut handle) else {
            return BackendOutcome::Unavailable;
        };

        match self.query_usage(conn, request) {
            Ok(rows) => BackendOutcome::from_rows(rows),
            Err(e) => {
                debug!("SQLite: query failed, falling back to JSON: {}", e);
                close_handle(&mut handle);
                handle.checked_missing = false;
                BackendOutcome::Unavailable
            }
        }
    }

    fn query_usage(&self, conn: &Connection, request: &ParseRequest) -> Result<Vec<UsageEvent>, StoreError> {
        let now = now_millis();
        let session_rows = load_session_rows(conn, request)?;

        let mut cached_rows: HashMap<String, Vec<UsageEvent>> = HashMap::new();
        let mut uncached_ids: Vec<String> = Vec::new();
        {
            let mut cache = lock(&self.aggregate);
            for row in &session_rows {
                match cache.lookup(&row.id, row.time_updated, now) {
                    Some(rows) => {
                        cached_rows.insert(row.id.clone(), rows);
                    }
                    None => uncached_ids.push(row.id.clone()),
                }
            }
        }
        let aggregate_hits = cached_rows.len();
        let aggregate_misses = uncached_ids.len();

        let mut fresh_rows: HashMap<String, Vec<UsageEvent>> = HashMap::new();
        if !uncached_ids.is_empty() {
            let uncached: HashSet<&str> = uncached_ids.iter().map(String::as_str).collect();
            let contexts: HashMap<&str, SessionContext> = session_rows
                .iter()
                .filter(|row| uncached.contains(row.id.as_str()))
                .map(|row| (row.id.as_str(), SessionContext::from(row)))
                .collect();

            let full_scan = uncached_ids.len() == session_rows.len() && request.session_id.is_none();
            let message_rows = if full_scan {
                load_all_messages(conn, request.since)?
            } else {
                load_messages_for(conn, &uncached_ids)?
            };

            for message in message_rows {
                // The full join may reach sessions outside the candidate set
                let Some(context) = contexts.get(message.sid.as_str()) else {
                    continue;
                };
                match parse_assistant_turn(&message.data) {
                    Parsed::Usable(turn) => fresh_rows
                        .entry(message.sid.clone())
                        .or_default()
                        .push(to_usage_event(context, turn)),
                    Parsed::Skipped(reason) => {
                        debug!("SQLite: skipping message in {}: {}", message.sid, reason);
                    }
                }
            }

            let mut cache = lock(&self.aggregate);
            for id in &uncached_ids {
                let updated_at = contexts.get(id.as_str()).map(|c| c.updated_at).unwrap_or(0);
                let rows = fresh_rows.get(id).cloned().unwrap_or_default();
                cache.store(id, updated_at, rows, now);
            }
        }

        let evicted = lock(&self.aggregate).evict();

        let mut sessions = Vec::new();
        for row in &session_rows {
            if let Some(rows) = cached_rows.remove(&row.id) {
                sessions.extend(rows);
            } else if let Some(rows) = fresh_rows.remove(&row.id) {
                sessions.extend(rows);
            }
        }

        debug!(
            "SQLite: parsed {} usage rows from {} sessions (aggregate hits: {}, misses: {}, evicted: {}, aggregate size: {})",
            sessions.len(),
            session_rows.len(),
            aggregate_hits,
            aggregate_misses,
            evicted,
            lock(&self.aggregate).len()
        );

        Ok(sessions)
    }

    /// Parts created after `watermark`, oldest first
    pub fn recent_parts(&self, watermark: i64) -> Result<Vec<PartRow>, StoreError> {
        let mut handle = lock(&self.handle);
        let Some(conn) = self.connection(&mut handle) else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare_cached(Queries::recent_parts())?;
        let rows = stmt.query_map(params![watermark], |row| {
            Ok(PartRow {
                id: row.get(0)?,
                message_id: row.get(1)?,
                session_id: row.get(2)?,
                time_created: row.get(3)?,
                data: row.get(4)?,
            })
        })?;

        let mut parts = Vec::new();
        for row in rows {
            parts.push(row?);
        }

        Ok(parts)
    }
}

fn close_handle(handle: &mut DbHandle) {
    if let Some(conn) = handle.conn.take() {
        if let Err((_, e)) = conn.close() {
            debug!("SQLite: error closing connection: {}", e);
        }
    }
    handle.opened_at = None;
}

fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        directory: row.get(3)?,
        time_created: row.get(4)?,
        time_updated: row.get(5)?,
    })
}

fn load_session_rows(conn: &Connection, request: &ParseRequest) -> Result<Vec<SessionRow>, StoreError> {
    let mut sessions = Vec::new();

    if let Some(id) = request.session_id.as_deref() {
        let mut stmt = conn.prepare_cached(&Queries::one_session())?;
        for row in stmt.query_map(params![id], map_session_row)? {
            sessions.push(row?);
        }
    } else if let Some(since) = request.since {
        let mut stmt = conn.prepare_cached(&Queries::sessions_since())?;
        for row in stmt.query_map(params![since], map_session_row)? {
            sessions.push(row?);
        }
    } else {
        let mut stmt = conn.prepare_cached(&Queries::all_sessions())?;
        for row in stmt.query_map([], map_session_row)? {
            sessions.push(row?);
        }
    }

    Ok(sessions)
}

fn map_joined_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JoinedMessageRow> {
    Ok(JoinedMessageRow {
        sid: row.get("sid")?,
        data: row.get("data")?,
    })
}

fn load_all_messages(conn: &Connection, since: Option<i64>) -> Result<Vec<JoinedMessageRow>, StoreError> {
    let mut messages = Vec::new();

    if let Some(since) = since {
        let mut stmt = conn.prepare_cached(&Queries::uncached_messages_since())?;
        for row in stmt.query_map(params![since], map_joined_row)? {
            messages.push(row?);
        }
    } else {
        let mut stmt = conn.prepare_cached(&Queries::uncached_messages())?;
        for row in stmt.query_map([], map_joined_row)? {
            messages.push(row?);
        }
    }

    Ok(messages)
}

fn load_messages_for(conn: &Connection, session_ids: &[String]) -> Result<Vec<JoinedMessageRow>, StoreError> {
    let ids_json = serde_json::to_string(session_ids)?;
    let mut stmt = conn.prepare_cached(&Queries::session_messages())?;

    let mut messages = Vec::new();
    for row in stmt.query_map(params![ids_json], map_joined_row)? {
        messages.push(row?);
    }

    Ok(messages)
}
