//! OpenCode usage ingestion - caching, incremental reconciliation and dual-backend parsing

pub mod models;
pub mod config;
pub mod error;
pub mod cache;
pub mod watcher;
pub mod reader;
pub mod database;
pub mod activity;
pub mod store;

pub use models::*;
pub use config::*;
pub use error::StoreError;
pub use cache::{AggregateCache, MetadataIndex, ResultCache};
pub use watcher::ChangeTracker;
pub use reader::FileBackend;
pub use database::DatabaseBackend;
pub use activity::{ActivityCallback, DbActivityPoller, FileActivityWatcher};
pub use store::{resolve_with_fallback, SessionStore};
