//! Internal fault taxonomy. Nothing here crosses the public API; faults are
//! logged and degraded to empty or stale output at the backend boundary.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("Directory not found: {0}")]
    DirNotFound(String),
}
