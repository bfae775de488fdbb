//! Storage abstraction for Pagewise.
//!
//! Two contracts sit behind the core pipelines:
//!
//! | Trait | Holds | Written by |
//! |-------|-------|------------|
//! | [`RecordStore`] | users, documents, messages | ingestion (status), send path (messages) |
//! | [`VectorIndex`] | embedded passages, one namespace per document | ingestion |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! [`memory::InMemoryStore`] implements both for tests; the app crate
//! provides a SQLite backend.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{
    Document, IngestionStatus, Message, MessagePage, PageRequest, StatusTransition, User,
};

/// Typed access to persisted records. No business logic lives here beyond
/// the conditional status write, which must be atomic per document.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_user`](RecordStore::ensure_user) | Create a user record on first sign-in |
/// | [`insert_document`](RecordStore::insert_document) | Register an uploaded file |
/// | [`get_document`](RecordStore::get_document) | Look up by id (no ownership check) |
/// | [`find_document_by_key`](RecordStore::find_document_by_key) | Look up by storage key and owner |
/// | [`list_documents`](RecordStore::list_documents) | A user's documents |
/// | [`transition_status`](RecordStore::transition_status) | Conditional status write |
/// | [`delete_document`](RecordStore::delete_document) | Remove a document and its messages |
/// | [`insert_message`](RecordStore::insert_message) | Persist a message, assigning its id |
/// | [`list_messages`](RecordStore::list_messages) | Cursor-paginated history, newest first |
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Return the user, creating it if absent.
    async fn ensure_user(&self, id: &str, email: &str) -> Result<User>;

    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn find_document_by_key(&self, key: &str, user_id: &str) -> Result<Option<Document>>;

    async fn list_documents(&self, user_id: &str) -> Result<Vec<Document>>;

    /// Move a document to `next` if its current status is one of
    /// `next.allowed_predecessors()`. The check and write are atomic.
    async fn transition_status(&self, id: &str, next: IngestionStatus)
        -> Result<StatusTransition>;

    /// Delete a document and its messages. Returns `false` if it was absent.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Persist a message. The store assigns a committed id; the returned
    /// message carries it.
    async fn insert_message(&self, msg: &Message) -> Result<Message>;

    /// One page of a document's history ordered by `created_at` descending.
    ///
    /// The cursor is inclusive: it names the first message of the page.
    /// An unknown cursor yields an empty page.
    async fn list_messages(
        &self,
        document_id: &str,
        user_id: &str,
        page: &PageRequest,
    ) -> Result<MessagePage>;
}

/// One embedded page ready for the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Deterministic per `(namespace, page_number)`.
    pub id: String,
    pub page_number: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    pub vector: Vec<f32>,
}

impl IndexEntry {
    pub fn new(namespace: &str, page_number: usize, text: &str, vector: Vec<f32>) -> Self {
        let name = format!("{}:{}", namespace, page_number);
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
            page_number,
            text: text.to_string(),
            hash: hex::encode(Sha256::digest(text.as_bytes())),
            vector,
        }
    }
}

/// A retrieved passage.
#[derive(Debug, Clone, PartialEq)]
pub struct PassageHit {
    pub page_number: usize,
    pub text: String,
    pub score: f64,
}

/// Per-document vector namespaces.
///
/// `write_namespace` replaces the namespace wholesale in one atomic step:
/// a reader sees either the previous contents or all of `entries`, never a
/// mix, and writing the same entries twice leaves no duplicates.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn write_namespace(&self, namespace: &str, entries: &[IndexEntry]) -> Result<()>;

    /// Top-`k` passages of `namespace` by cosine similarity. Never reads
    /// outside the namespace.
    async fn query_namespace(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<PassageHit>>;

    async fn purge_namespace(&self, namespace: &str) -> Result<()>;

    async fn namespace_len(&self, namespace: &str) -> Result<usize>;
}

/// Turn a `limit + 1` fetch into a page: the extra row, if present, is
/// popped and its id becomes the next cursor.
pub fn split_page(mut rows: Vec<Message>, limit: usize) -> MessagePage {
    let next_cursor = if rows.len() > limit {
        rows.truncate(limit + 1);
        rows.pop().map(|m| m.id.as_str().to_string())
    } else {
        None
    };
    MessagePage {
        messages: rows,
        next_cursor,
    }
}
