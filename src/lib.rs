//! OpenCode Usage Tracker - token usage ingestion from OpenCode session storage
//!
//! Reads the embedded `opencode.db` when present and the per-entity JSON tree
//! otherwise, normalizing both into one stream of [`UsageEvent`]s.

pub mod usage;

pub use usage::{
    ActivityCallback, ActivityUpdate, FallbackPolicy, ParseRequest, SessionStore, StoreConfig,
    UsageEvent,
};
