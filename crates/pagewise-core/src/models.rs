//! Core data models used throughout Pagewise.
//!
//! These types represent the users, documents, and chat messages that flow
//! between the ingestion pipeline, the record store, and the chat
//! synchronization engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AccessError;

/// Page size used by message history when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Upper bound on a single history page.
pub const MAX_PAGE_SIZE: usize = 100;

/// Local id reserved for the assistant reply while it is still streaming.
pub const ASSISTANT_SENTINEL: &str = "ai-response";

/// Ingestion state of a [`Document`].
///
/// Transitions are monotonic:
///
/// ```text
/// PENDING ──▶ PROCESSING ──▶ SUCCESS
///                  │
///                  └──────▶ FAILED ──(re-ingest)──▶ PROCESSING
/// ```
///
/// Re-applying the current terminal status is accepted so that a pipeline
/// invoked twice for the same document stays last-writer-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "PENDING",
            IngestionStatus::Processing => "PROCESSING",
            IngestionStatus::Success => "SUCCESS",
            IngestionStatus::Failed => "FAILED",
        }
    }

    /// Statuses a document may be in for a move to `self` to be accepted.
    pub fn allowed_predecessors(self) -> &'static [IngestionStatus] {
        use IngestionStatus::*;
        match self {
            Pending => &[],
            Processing => &[Pending, Processing, Failed],
            Success => &[Processing, Success],
            Failed => &[Processing, Failed],
        }
    }

    pub fn can_transition_to(self, next: IngestionStatus) -> bool {
        next.allowed_predecessors().contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IngestionStatus::Success | IngestionStatus::Failed)
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(IngestionStatus::Pending),
            "PROCESSING" => Ok(IngestionStatus::Processing),
            "SUCCESS" => Ok(IngestionStatus::Success),
            "FAILED" => Ok(IngestionStatus::Failed),
            other => Err(format!("unknown ingestion status: {}", other)),
        }
    }
}

/// Result of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    /// The write was applied; carries the status it replaced.
    Applied { from: IngestionStatus },
    /// The document exists but its current status does not permit the move.
    Rejected { current: IngestionStatus },
    /// No document with that id.
    Missing,
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// An uploaded file and its ingestion state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub user_id: String,
    /// Object-storage key the raw bytes live under.
    pub key: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "uploadStatus")]
    pub status: IngestionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A document whose bytes were just confirmed stored.
    pub fn new_processing(
        user_id: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            key: key.into(),
            name: name.into(),
            url: url.into(),
            status: IngestionStatus::Processing,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    /// Namespace the document's passages are indexed under.
    pub fn namespace(&self) -> &str {
        &self.id
    }
}

/// Identity of a chat message.
///
/// A message is either still local (`Pending`, carrying a client-generated id
/// or [`ASSISTANT_SENTINEL`]) or persisted (`Committed`, carrying the id the
/// record store assigned).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "lowercase")]
pub enum MessageId {
    Pending(String),
    Committed(String),
}

impl MessageId {
    /// Fresh client-side id for an optimistic insert.
    pub fn local() -> Self {
        MessageId::Pending(Uuid::new_v4().to_string())
    }

    pub fn assistant_placeholder() -> Self {
        MessageId::Pending(ASSISTANT_SENTINEL.to_string())
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, MessageId::Pending(id) if id == ASSISTANT_SENTINEL)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, MessageId::Committed(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Pending(id) | MessageId::Committed(id) => id,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Pending(id) => write!(f, "pending:{}", id),
            MessageId::Committed(id) => f.write_str(id),
        }
    }
}

/// A chat message on a document's timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub document_id: String,
    pub user_id: String,
    pub text: String,
    pub is_user_message: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Optimistic user message authored on the client.
    pub fn user(document_id: &str, user_id: &str, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::local(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            text: text.into(),
            is_user_message: true,
            created_at: Utc::now(),
        }
    }

    /// The streaming assistant reply, keyed by the sentinel id.
    pub fn assistant_placeholder(document_id: &str, user_id: &str, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::assistant_placeholder(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            text: text.into(),
            is_user_message: false,
            created_at: Utc::now(),
        }
    }

    /// An assistant message ready to be persisted.
    pub fn assistant(document_id: &str, user_id: &str, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::local(),
            ..Self::assistant_placeholder(document_id, user_id, text)
        }
    }
}

/// Wire shape of a persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub text: String,
    pub is_user_message: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageRecord {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.as_str().to_string(),
            text: m.text.clone(),
            is_user_message: m.is_user_message,
            created_at: m.created_at,
        }
    }
}

impl MessageRecord {
    /// Rehydrate a server record; records always carry committed identity.
    pub fn into_message(self, document_id: &str, user_id: &str) -> Message {
        Message {
            id: MessageId::Committed(self.id),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            text: self.text,
            is_user_message: self.is_user_message,
            created_at: self.created_at,
        }
    }
}

/// One page of history, newest message first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Id of the first message of the next (older) page, if any.
    pub next_cursor: Option<String>,
}

/// Validated pagination request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<String>,
}

impl PageRequest {
    /// Build a request, defaulting `limit` to [`DEFAULT_PAGE_SIZE`] and
    /// rejecting anything outside `1..=MAX_PAGE_SIZE`.
    pub fn new(limit: Option<usize>, cursor: Option<String>) -> Result<Self, AccessError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(AccessError::InvalidRequest(format!(
                "limit must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, limit
            )));
        }
        Ok(Self {
            limit,
            cursor: cursor.filter(|c| !c.is_empty()),
        })
    }

    pub fn first(limit: usize) -> Result<Self, AccessError> {
        Self::new(Some(limit), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_never_reopened() {
        assert!(!IngestionStatus::Success.can_transition_to(IngestionStatus::Processing));
        assert!(!IngestionStatus::Success.can_transition_to(IngestionStatus::Failed));
        assert!(IngestionStatus::Success.can_transition_to(IngestionStatus::Success));
    }

    #[test]
    fn failed_can_only_reopen_to_processing() {
        assert!(IngestionStatus::Failed.can_transition_to(IngestionStatus::Processing));
        assert!(!IngestionStatus::Failed.can_transition_to(IngestionStatus::Success));
        assert!(!IngestionStatus::Failed.can_transition_to(IngestionStatus::Pending));
    }

    #[test]
    fn processing_settles_either_way() {
        assert!(IngestionStatus::Processing.can_transition_to(IngestionStatus::Success));
        assert!(IngestionStatus::Processing.can_transition_to(IngestionStatus::Failed));
        assert!(!IngestionStatus::Processing.can_transition_to(IngestionStatus::Pending));
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [
            IngestionStatus::Pending,
            IngestionStatus::Processing,
            IngestionStatus::Success,
            IngestionStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<IngestionStatus>().unwrap(), s);
        }
        assert!("DONE".parse::<IngestionStatus>().is_err());
    }

    #[test]
    fn placeholder_identity_is_pending() {
        let id = MessageId::assistant_placeholder();
        assert!(id.is_placeholder());
        assert!(!id.is_committed());
        assert!(!MessageId::Committed(ASSISTANT_SENTINEL.into()).is_placeholder());
        assert!(!MessageId::local().is_placeholder());
    }

    #[test]
    fn page_request_bounds() {
        assert_eq!(PageRequest::new(None, None).unwrap().limit, DEFAULT_PAGE_SIZE);
        assert!(PageRequest::new(Some(0), None).is_err());
        assert!(PageRequest::new(Some(101), None).is_err());
        assert_eq!(PageRequest::new(Some(100), None).unwrap().limit, 100);
        assert_eq!(PageRequest::new(None, Some(String::new())).unwrap().cursor, None);
    }

    #[test]
    fn document_serializes_upload_status() {
        let doc = Document::new_processing("u1", "k1", "a.pdf", "https://files/k1");
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["uploadStatus"], "PROCESSING");
        assert_eq!(json["userId"], "u1");
    }
}
