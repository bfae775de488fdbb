//! Ownership-checked reads and record operations.
//!
//! The status projection answers "how far has ingestion got" for a
//! polling caller. It never fails for a missing or foreign document: the
//! answer is `PENDING`, the same as a document whose record has not been
//! written yet.

use anyhow::Result;
use tracing::info;

use pagewise_core::error::AccessError;
use pagewise_core::models::{Document, IngestionStatus, User};
use pagewise_core::store::{RecordStore, VectorIndex};

/// Current ingestion status of `document_id` as seen by `user_id`.
pub async fn get_status(
    records: &dyn RecordStore,
    document_id: &str,
    user_id: &str,
) -> Result<IngestionStatus> {
    let doc = records.get_document(document_id).await?;
    Ok(doc
        .filter(|d| d.is_owned_by(user_id))
        .map(|d| d.status)
        .unwrap_or(IngestionStatus::Pending))
}

/// Load a document the caller owns, or `NotFound`.
pub async fn require_owned(
    records: &dyn RecordStore,
    document_id: &str,
    user_id: &str,
) -> Result<Document> {
    records
        .get_document(document_id)
        .await?
        .filter(|d| d.is_owned_by(user_id))
        .ok_or_else(|| AccessError::NotFound(format!("document {}", document_id)).into())
}

/// Load a document the caller owns that has finished ingestion.
pub async fn require_ready(
    records: &dyn RecordStore,
    document_id: &str,
    user_id: &str,
) -> Result<Document> {
    let doc = require_owned(records, document_id, user_id).await?;
    if doc.status != IngestionStatus::Success {
        return Err(AccessError::NotReady(format!(
            "document {} is {}",
            doc.id, doc.status
        ))
        .into());
    }
    Ok(doc)
}

/// Create the user on first sign-in. Both id and email are required.
pub async fn ensure_user(
    records: &dyn RecordStore,
    id: Option<&str>,
    email: Option<&str>,
) -> Result<User> {
    let (Some(id), Some(email)) = (
        id.filter(|s| !s.is_empty()),
        email.filter(|s| !s.is_empty()),
    ) else {
        return Err(AccessError::Unauthorized.into());
    };
    records.ensure_user(id, email).await
}

pub async fn find_by_key(records: &dyn RecordStore, key: &str, user_id: &str) -> Result<Document> {
    records
        .find_document_by_key(key, user_id)
        .await?
        .ok_or_else(|| AccessError::NotFound(format!("document with key {}", key)).into())
}

/// Delete an owned document, its messages, and its index namespace.
pub async fn delete_document(
    records: &dyn RecordStore,
    index: &dyn VectorIndex,
    document_id: &str,
    user_id: &str,
) -> Result<Document> {
    let doc = require_owned(records, document_id, user_id).await?;
    if !records.delete_document(&doc.id).await? {
        return Err(AccessError::NotFound(format!("document {}", document_id)).into());
    }
    index.purge_namespace(doc.namespace()).await?;
    info!(document_id = %doc.id, "document deleted");
    Ok(doc)
}
