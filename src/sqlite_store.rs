//! SQLite-backed [`RecordStore`] and [`VectorIndex`].
//!
//! Timestamps are stored as INTEGER microseconds so that ordering by
//! `created_at` is exact. Passage vectors are little-endian `f32` BLOBs.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use pagewise_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use pagewise_core::models::{
    Document, IngestionStatus, Message, MessageId, MessagePage, PageRequest, StatusTransition,
    User,
};
use pagewise_core::store::{split_page, IndexEntry, PassageHit, RecordStore, VectorIndex};

/// Compare-and-swap attempts before a contended status write gives up.
const STATUS_CAS_ATTEMPTS: usize = 5;

/// SQLite implementation of both store traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.try_get("status")?;
    Ok(Document {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        key: row.try_get("storage_key")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        created_at: from_micros(row.try_get("created_at")?),
        updated_at: from_micros(row.try_get("updated_at")?),
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: MessageId::Committed(row.try_get("id")?),
        document_id: row.try_get("document_id")?,
        user_id: row.try_get("user_id")?,
        text: row.try_get("text")?,
        is_user_message: row.try_get::<i64, _>("is_user_message")? != 0,
        created_at: from_micros(row.try_get("created_at")?),
    })
}

const DOCUMENT_COLUMNS: &str =
    "id, user_id, storage_key, name, url, status, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, document_id, user_id, text, is_user_message, created_at";

#[async_trait]
impl RecordStore for SqliteStore {
    async fn ensure_user(&self, id: &str, email: &str) -> Result<User> {
        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(id)
            .bind(email)
            .bind(to_micros(Utc::now()))
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT id, email, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(User {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            created_at: from_micros(row.try_get("created_at")?),
        })
    }

    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, user_id, storage_key, name, url, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.user_id)
        .bind(&doc.key)
        .bind(&doc.name)
        .bind(&doc.url)
        .bind(doc.status.as_str())
        .bind(to_micros(doc.created_at))
        .bind(to_micros(doc.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_document_by_key(&self, key: &str, user_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE storage_key = ? AND user_id = ? LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(key)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, user_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE user_id = ? ORDER BY created_at DESC",
            DOCUMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn transition_status(
        &self,
        id: &str,
        next: IngestionStatus,
    ) -> Result<StatusTransition> {
        for _ in 0..STATUS_CAS_ATTEMPTS {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            let Some(current) = current else {
                return Ok(StatusTransition::Missing);
            };
            let from: IngestionStatus = current.parse().map_err(|e: String| anyhow!(e))?;
            if !from.can_transition_to(next) {
                return Ok(StatusTransition::Rejected { current: from });
            }

            let result = sqlx::query(
                "UPDATE documents SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(next.as_str())
            .bind(to_micros(Utc::now()))
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(StatusTransition::Applied { from });
            }
        }
        Err(anyhow!(
            "status of document {} kept changing during transition to {}",
            id,
            next
        ))
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_message(&self, msg: &Message) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO messages (id, document_id, user_id, text, is_user_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&msg.document_id)
        .bind(&msg.user_id)
        .bind(&msg.text)
        .bind(msg.is_user_message as i64)
        .bind(to_micros(msg.created_at))
        .execute(&self.pool)
        .await?;

        let mut stored = msg.clone();
        stored.id = MessageId::Committed(id);
        Ok(stored)
    }

    async fn list_messages(
        &self,
        document_id: &str,
        user_id: &str,
        page: &PageRequest,
    ) -> Result<MessagePage> {
        let fetch = (page.limit + 1) as i64;

        let rows = match &page.cursor {
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {} FROM messages
                    WHERE document_id = ? AND user_id = ?
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                    "#,
                    MESSAGE_COLUMNS
                ))
                .bind(document_id)
                .bind(user_id)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await?
            }
            Some(cursor) => {
                let anchor: Option<i64> = sqlx::query_scalar(
                    "SELECT created_at FROM messages WHERE id = ? AND document_id = ? AND user_id = ?",
                )
                .bind(cursor)
                .bind(document_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
                let Some(anchor) = anchor else {
                    return Ok(MessagePage::default());
                };

                sqlx::query(&format!(
                    r#"
                    SELECT {} FROM messages
                    WHERE document_id = ? AND user_id = ?
                      AND (created_at < ? OR (created_at = ? AND id <= ?))
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                    "#,
                    MESSAGE_COLUMNS
                ))
                .bind(document_id)
                .bind(user_id)
                .bind(anchor)
                .bind(anchor)
                .bind(cursor)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let messages = rows.iter().map(row_to_message).collect::<Result<Vec<_>>>()?;
        Ok(split_page(messages, page.limit))
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn write_namespace(&self, namespace: &str, entries: &[IndexEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM passages WHERE namespace = ?")
            .bind(namespace)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO passages (id, namespace, page_number, text, hash, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.id)
            .bind(namespace)
            .bind(entry.page_number as i64)
            .bind(&entry.text)
            .bind(&entry.hash)
            .bind(entry.vector.len() as i64)
            .bind(vec_to_blob(&entry.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_namespace(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<PassageHit>> {
        let rows = sqlx::query("SELECT page_number, text, embedding FROM passages WHERE namespace = ?")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let page_number: i64 = row.try_get("page_number")?;
            hits.push(PassageHit {
                page_number: page_number as usize,
                text: row.try_get("text")?,
                score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
            });
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<()> {
        sqlx::query("DELETE FROM passages WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn namespace_len(&self, namespace: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
