//! Data models for OpenCode session storage and normalized usage output

use serde::{Deserialize, Serialize};

/// Provider/model identifier used when a message carries none
pub const UNKNOWN_ID: &str = "unknown";

/// Session document (`storage/session/<project>/<id>.json` or a `session` row)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: Option<String>,
    pub directory: Option<String>,
    pub title: Option<String>,
    pub time: SessionTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SessionTime {
    pub created: i64,
    pub updated: i64,
}

/// Token counts as stored on messages and parts
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TokenDoc {
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub reasoning: Option<u64>,
    pub cache: Option<CacheTokenDoc>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CacheTokenDoc {
    pub read: Option<u64>,
    pub write: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MessageTime {
    pub created: i64,
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID")]
    pub model_id: Option<String>,
}

/// Raw message document as written by the agent
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDoc {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    pub role: Role,
    pub time: MessageTime,
    #[serde(rename = "providerID")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID")]
    pub model_id: Option<String>,
    pub tokens: Option<TokenDoc>,
    pub model: Option<ModelRef>,
}

/// Closed view of a message after classification by role
#[derive(Debug, Clone, PartialEq)]
pub enum MessageRecord {
    Assistant(AssistantTurn),
    User,
    System,
}

/// An assistant turn that carries token data
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantTurn {
    pub provider_id: String,
    pub model_id: String,
    pub tokens: TokenCounts,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartKind {
    StepStart,
    StepFinish,
    Reasoning,
    Tool,
    Text,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PartTime {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

/// Part document (`storage/part/<messageID>/<id>.json` or a `part` row)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PartDoc {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: PartKind,
    pub tokens: Option<TokenDoc>,
    pub time: Option<PartTime>,
}

/// Why a document did not produce output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("document has no identifier")]
    MissingId,
    #[error("message role is not assistant")]
    NotAssistant,
    #[error("no token data")]
    NoTokens,
    #[error("unrecognized part kind")]
    UnrecognizedKind,
}

/// Outcome of turning a stored document into something usable
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Usable(T),
    Skipped(SkipReason),
}

impl<T> Parsed<T> {
    pub fn usable(self) -> Option<T> {
        match self {
            Parsed::Usable(value) => Some(value),
            Parsed::Skipped(_) => None,
        }
    }
}

/// Normalized token counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write: Option<u64>,
}

impl TokenCounts {
    /// Usage-event mapping: optional counters survive only when non-zero
    fn from_message(doc: &TokenDoc) -> Self {
        let nonzero = |v: Option<u64>| v.filter(|n| *n > 0);
        Self {
            input: doc.input.unwrap_or(0),
            output: doc.output.unwrap_or(0),
            reasoning: nonzero(doc.reasoning),
            cache_read: nonzero(doc.cache.as_ref().and_then(|c| c.read)),
            cache_write: nonzero(doc.cache.as_ref().and_then(|c| c.write)),
        }
    }

    /// Activity mapping: optional counters survive whenever present
    fn from_part(doc: &TokenDoc) -> Self {
        Self {
            input: doc.input.unwrap_or(0),
            output: doc.output.unwrap_or(0),
            reasoning: doc.reasoning,
            cache_read: doc.cache.as_ref().and_then(|c| c.read),
            cache_write: doc.cache.as_ref().and_then(|c| c.write),
        }
    }

    pub fn total(&self) -> u64 {
        self.input
            + self.output
            + self.reasoning.unwrap_or(0)
            + self.cache_read.unwrap_or(0)
            + self.cache_write.unwrap_or(0)
    }
}

/// Normalized, backend-agnostic usage record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub session_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub tokens: TokenCounts,
    pub timestamp: i64,
    pub session_updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

/// Near-real-time token delta for a single part
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityUpdate {
    pub session_id: String,
    pub message_id: String,
    pub tokens: TokenCounts,
    pub timestamp: i64,
}

/// Session columns carried onto every usage event of that session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session_id: String,
    pub updated_at: i64,
    pub title: Option<String>,
    pub directory: Option<String>,
}

impl From<&Session> for SessionContext {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            updated_at: session.time.updated,
            title: session.title.clone(),
            directory: session.directory.clone(),
        }
    }
}

/// Parse request shared by both backends
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseRequest {
    pub session_id: Option<String>,
    pub limit: Option<usize>,
    /// Lower bound on session update time (epoch ms)
    pub since: Option<i64>,
}

/// Limit recorded with a result when the caller gives none
pub const DEFAULT_LIMIT: usize = 100;

impl ParseRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_since(mut self, since: Option<i64>) -> Self {
        self.since = since;
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }

    /// Whether this is the unfiltered "list sessions" shape
    pub fn is_list(&self) -> bool {
        self.session_id.is_none()
    }
}

/// Result of one backend pass, distinguishing "could not look" from "looked, found nothing"
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOutcome {
    /// Storage absent, unreadable, or the query failed
    Unavailable,
    /// Storage readable but no usage rows matched
    Empty,
    Rows(Vec<UsageEvent>),
}

impl BackendOutcome {
    pub fn from_rows(rows: Vec<UsageEvent>) -> Self {
        if rows.is_empty() {
            BackendOutcome::Empty
        } else {
            BackendOutcome::Rows(rows)
        }
    }

    pub fn into_rows(self) -> Vec<UsageEvent> {
        match self {
            BackendOutcome::Rows(rows) => rows,
            BackendOutcome::Unavailable | BackendOutcome::Empty => Vec::new(),
        }
    }
}

/// Parse a session document; an empty identifier makes it unusable
pub fn parse_session(raw: &str) -> Parsed<Session> {
    match serde_json::from_str::<Session>(raw) {
        Ok(session) if session.id.is_empty() => Parsed::Skipped(SkipReason::MissingId),
        Ok(session) => Parsed::Usable(session),
        Err(e) => Parsed::Skipped(SkipReason::Malformed(e.to_string())),
    }
}

impl MessageDoc {
    /// Classify by role. Assistant turns without an input count are skipped.
    pub fn classify(self) -> Parsed<MessageRecord> {
        match self.role {
            Role::User => return Parsed::Usable(MessageRecord::User),
            Role::System => return Parsed::Usable(MessageRecord::System),
            Role::Unknown => return Parsed::Skipped(SkipReason::NotAssistant),
            Role::Assistant => {}
        }

        let tokens = match &self.tokens {
            Some(tokens) if tokens.input.is_some() => TokenCounts::from_message(tokens),
            _ => return Parsed::Skipped(SkipReason::NoTokens),
        };

        let nested = self.model.unwrap_or_default();
        let provider_id = self
            .provider_id
            .or(nested.provider_id)
            .unwrap_or_else(|| UNKNOWN_ID.to_string());
        let model_id = self
            .model_id
            .or(nested.model_id)
            .unwrap_or_else(|| UNKNOWN_ID.to_string());

        Parsed::Usable(MessageRecord::Assistant(AssistantTurn {
            provider_id,
            model_id,
            tokens,
            timestamp: self.time.completed.unwrap_or(self.time.created),
        }))
    }
}

/// Parse a message payload down to an assistant turn with token data
pub fn parse_assistant_turn(raw: &str) -> Parsed<AssistantTurn> {
    let doc = match serde_json::from_str::<MessageDoc>(raw) {
        Ok(doc) => doc,
        Err(e) => return Parsed::Skipped(SkipReason::Malformed(e.to_string())),
    };

    match doc.classify() {
        Parsed::Usable(MessageRecord::Assistant(turn)) => Parsed::Usable(turn),
        Parsed::Usable(_) => Parsed::Skipped(SkipReason::NotAssistant),
        Parsed::Skipped(reason) => Parsed::Skipped(reason),
    }
}

/// Build the usage event for one assistant turn within a session
pub fn to_usage_event(session: &SessionContext, turn: AssistantTurn) -> UsageEvent {
    UsageEvent {
        session_id: session.session_id.clone(),
        provider_id: turn.provider_id,
        model_id: turn.model_id,
        tokens: turn.tokens,
        timestamp: turn.timestamp,
        session_updated_at: session.updated_at,
        session_name: session.title.clone().filter(|t| !t.is_empty()),
        project_path: session.directory.clone().filter(|d| !d.is_empty()),
    }
}

/// Parse a part payload into an activity update stamped with `timestamp`
pub fn parse_activity(raw: &str, timestamp: i64) -> Parsed<ActivityUpdate> {
    let part = match serde_json::from_str::<PartDoc>(raw) {
        Ok(part) => part,
        Err(e) => return Parsed::Skipped(SkipReason::Malformed(e.to_string())),
    };

    if part.kind == PartKind::Unknown {
        return Parsed::Skipped(SkipReason::UnrecognizedKind);
    }

    let Some(tokens) = part.tokens.as_ref() else {
        return Parsed::Skipped(SkipReason::NoTokens);
    };

    Parsed::Usable(ActivityUpdate {
        session_id: part.session_id,
        message_id: part.message_id,
        tokens: TokenCounts::from_part(tokens),
        timestamp,
    })
}
