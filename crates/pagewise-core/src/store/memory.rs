//! In-memory [`RecordStore`] and [`VectorIndex`] for tests and embedding
//! into other hosts.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over the requested namespace.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::models::{
    Document, IngestionStatus, Message, MessageId, MessagePage, PageRequest, StatusTransition,
    User,
};

use super::{split_page, IndexEntry, PassageHit, RecordStore, VectorIndex};

/// In-memory store.
pub struct InMemoryStore {
    users: RwLock<HashMap<String, User>>,
    docs: RwLock<HashMap<String, Document>>,
    messages: RwLock<Vec<Message>>,
    namespaces: RwLock<HashMap<String, Vec<IndexEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            docs: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a namespace exists at all (as opposed to existing empty).
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces
            .read()
            .map(|ns| ns.contains_key(namespace))
            .unwrap_or(false)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn ensure_user(&self, id: &str, email: &str) -> Result<User> {
        let mut users = self.users.write().map_err(poisoned)?;
        let user = users.entry(id.to_string()).or_insert_with(|| User {
            id: id.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        });
        Ok(user.clone())
    }

    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.docs.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn find_document_by_key(&self, key: &str, user_id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs
            .values()
            .find(|d| d.key == key && d.user_id == user_id)
            .cloned())
    }

    async fn list_documents(&self, user_id: &str) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut out: Vec<Document> = docs
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn transition_status(
        &self,
        id: &str,
        next: IngestionStatus,
    ) -> Result<StatusTransition> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        let Some(doc) = docs.get_mut(id) else {
            return Ok(StatusTransition::Missing);
        };
        let from = doc.status;
        if !from.can_transition_to(next) {
            return Ok(StatusTransition::Rejected { current: from });
        }
        doc.status = next;
        doc.updated_at = Utc::now();
        Ok(StatusTransition::Applied { from })
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let removed = self.docs.write().map_err(poisoned)?.remove(id).is_some();
        if removed {
            self.messages
                .write()
                .map_err(poisoned)?
                .retain(|m| m.document_id != id);
        }
        Ok(removed)
    }

    async fn insert_message(&self, msg: &Message) -> Result<Message> {
        let mut stored = msg.clone();
        stored.id = MessageId::Committed(Uuid::new_v4().to_string());
        self.messages.write().map_err(poisoned)?.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(
        &self,
        document_id: &str,
        user_id: &str,
        page: &PageRequest,
    ) -> Result<MessagePage> {
        let messages = self.messages.read().map_err(poisoned)?;
        let mut rows: Vec<&Message> = messages
            .iter()
            .filter(|m| m.document_id == document_id && m.user_id == user_id)
            .collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_str().cmp(a.id.as_str()))
        });

        let start = match &page.cursor {
            Some(cursor) => match rows.iter().position(|m| m.id.as_str() == cursor) {
                Some(pos) => pos,
                None => return Ok(MessagePage::default()),
            },
            None => 0,
        };

        let window = rows
            .into_iter()
            .skip(start)
            .take(page.limit + 1)
            .cloned()
            .collect();
        Ok(split_page(window, page.limit))
    }
}

#[async_trait]
impl VectorIndex for InMemoryStore {
    async fn write_namespace(&self, namespace: &str, entries: &[IndexEntry]) -> Result<()> {
        let mut ns = self.namespaces.write().map_err(poisoned)?;
        ns.insert(namespace.to_string(), entries.to_vec());
        Ok(())
    }

    async fn query_namespace(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<PassageHit>> {
        let ns = self.namespaces.read().map_err(poisoned)?;
        let Some(entries) = ns.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<PassageHit> = entries
            .iter()
            .map(|e| PassageHit {
                page_number: e.page_number,
                text: e.text.clone(),
                score: cosine_similarity(vector, &e.vector) as f64,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<()> {
        self.namespaces.write().map_err(poisoned)?.remove(namespace);
        Ok(())
    }

    async fn namespace_len(&self, namespace: &str) -> Result<usize> {
        Ok(self
            .namespaces
            .read()
            .map_err(poisoned)?
            .get(namespace)
            .map_or(0, Vec::len))
    }
}
